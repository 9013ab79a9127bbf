//! # Workhorse Protocol Library
//!
//! Wire types shared by the workhorse daemon and its command-line client.
//!
//! ## Overview
//!
//! The daemon exposes two endpoints:
//!
//! - **Primary endpoint**: an opaque byte bridge between a client and one
//!   worker process. The broker never interprets this traffic; the only frame
//!   it writes there is [`CapacityExceeded`] when no worker is free.
//! - **Admin endpoint**: newline-delimited JSON requests naming a command
//!   (`daemon.status`, `daemon.stop`) and tagged JSON responses.
//!
//! ```text
//! ┌──────────────┐  {"command":"daemon.status"}\n   ┌──────────────┐
//! │  CLI client  │ ───────────────────────────────▶ │    daemon    │
//! │              │ ◀─────────────────────────────── │  admin chan  │
//! └──────────────┘  {"type":"status",...}\n         └──────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{AdminRequest, AdminResponse, LineCodec};
//!
//! let codec = LineCodec::new();
//! let frame = codec.encode(&AdminRequest::status()).unwrap();
//! assert!(frame.ends_with(b"\n"));
//!
//! let request: AdminRequest = codec.decode(&frame).unwrap();
//! assert_eq!(request.command, protocol::CMD_STATUS);
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: Admin requests/responses and broker notices
//! - [`framing`]: Newline-delimited JSON codec
//! - [`error`]: Error types

pub mod error;
pub mod framing;
pub mod messages;

pub use error::{ProtocolError, Result};
pub use framing::{LineCodec, FRAME_TERMINATOR, MAX_FRAME_SIZE};
pub use messages::{
    AdminRequest, AdminResponse, CapacityExceeded, PoolStatus, WorkerStatus, CMD_STATUS, CMD_STOP,
};
