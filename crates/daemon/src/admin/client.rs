//! Admin endpoint client used by the command-line interface.

use std::time::Duration;

use protocol::{AdminRequest, AdminResponse, LineCodec, PoolStatus};
use tokio::io::{AsyncWriteExt, BufReader, ReadHalf, WriteHalf};

use super::{read_frame, AdminError};
use crate::transport::{self, BoxedStream, Endpoint};

/// Default timeout for client operations in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 5;

/// Acknowledgment of a `daemon.stop` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopAck {
    /// Grace window before the daemon shuts down.
    pub delay: Duration,
    /// True if an earlier request had already scheduled the shutdown.
    pub already_scheduled: bool,
}

/// A client for the daemon's admin endpoint.
pub struct AdminClient {
    reader: BufReader<ReadHalf<BoxedStream>>,
    writer: WriteHalf<BoxedStream>,
    codec: LineCodec,
    timeout: Duration,
}

impl AdminClient {
    /// Connect to the admin endpoint.
    ///
    /// Fails if the daemon is not running or has no admin endpoint.
    pub async fn connect(endpoint: &Endpoint) -> Result<Self, AdminError> {
        let stream = transport::connect(endpoint).await?;
        Ok(Self::from_stream(
            stream,
            Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        ))
    }

    /// Connect, giving up after `timeout`. The timeout also applies to
    /// every later request.
    pub async fn connect_with_timeout(
        endpoint: &Endpoint,
        timeout: Duration,
    ) -> Result<Self, AdminError> {
        let stream = tokio::time::timeout(timeout, transport::connect(endpoint))
            .await
            .map_err(|_| AdminError::Timeout)??;
        Ok(Self::from_stream(stream, timeout))
    }

    fn from_stream(stream: BoxedStream, timeout: Duration) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            codec: LineCodec::new(),
            timeout,
        }
    }

    /// Send a request and wait for its response.
    ///
    /// Unknown commands get no response, so sending one ends in
    /// [`AdminError::Timeout`].
    pub async fn send(&mut self, request: &AdminRequest) -> Result<AdminResponse, AdminError> {
        tokio::time::timeout(self.timeout, self.send_internal(request))
            .await
            .map_err(|_| AdminError::Timeout)?
    }

    async fn send_internal(&mut self, request: &AdminRequest) -> Result<AdminResponse, AdminError> {
        let frame = self.codec.encode(request)?;
        self.writer.write_all(&frame).await?;
        self.writer.flush().await?;

        match read_frame(&mut self.reader, &self.codec).await? {
            Some(frame) => Ok(self.codec.decode(&frame)?),
            None => Err(AdminError::Closed),
        }
    }

    /// Fetch the pool status snapshot.
    pub async fn status(&mut self) -> Result<PoolStatus, AdminError> {
        match self.send(&AdminRequest::status()).await? {
            AdminResponse::Status(status) => Ok(status),
            other => Err(AdminError::UnexpectedResponse(format!("{:?}", other))),
        }
    }

    /// Ask the daemon to shut down after its configured delay.
    pub async fn stop(&mut self) -> Result<StopAck, AdminError> {
        match self.send(&AdminRequest::stop()).await? {
            AdminResponse::Stopping {
                delay_ms,
                already_scheduled,
            } => Ok(StopAck {
                delay: Duration::from_millis(delay_ms),
                already_scheduled,
            }),
            other => Err(AdminError::UnexpectedResponse(format!("{:?}", other))),
        }
    }
}
