//! Administrative control channel.
//!
//! A second endpoint, independent of the primary one, that answers two
//! commands: `daemon.status` (pool snapshot) and `daemon.stop` (delayed
//! shutdown). Frames are newline-delimited JSON, one request per line.
//!
//! ## Example
//!
//! ```rust,no_run
//! use daemon::admin::AdminClient;
//! use daemon::transport::Endpoint;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let endpoint: Endpoint = "tcp://127.0.0.1:2003".parse()?;
//!     let mut client = AdminClient::connect(&endpoint).await?;
//!
//!     let status = client.status().await?;
//!     println!("{} of {} workers free", status.available, status.poolsize);
//!     Ok(())
//! }
//! ```

mod client;
mod dispatch;
mod server;

pub use client::{AdminClient, StopAck};
pub use dispatch::CommandDispatcher;
pub use server::{serve, AdminConnection, AdminServer};

use std::io;

use protocol::{LineCodec, ProtocolError, FRAME_TERMINATOR};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Errors on the admin channel.
#[derive(Debug, Error)]
pub enum AdminError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("operation timed out")]
    Timeout,

    #[error("daemon closed the connection")]
    Closed,

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

/// Read one raw frame, terminator included.
///
/// Returns `None` on a clean end of stream. Reads at most one frame's worth
/// of bytes; an over-long line comes back unterminated and fails to decode.
async fn read_frame<R>(reader: &mut R, codec: &LineCodec) -> Result<Option<Vec<u8>>, AdminError>
where
    R: AsyncBufRead + Unpin,
{
    let mut frame = Vec::new();
    let read = reader
        .take(codec.max_frame_size() as u64)
        .read_until(FRAME_TERMINATOR, &mut frame)
        .await?;

    if read == 0 {
        return Ok(None);
    }
    Ok(Some(frame))
}
