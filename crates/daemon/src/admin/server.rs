//! Admin endpoint server.

use std::io;
use std::sync::Arc;

use protocol::{AdminRequest, AdminResponse, LineCodec};
use tokio::io::{AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::dispatch::CommandDispatcher;
use super::{read_frame, AdminError};
use crate::transport::{self, BoxedStream, Connection, Endpoint, Listener};

/// Listens for admin clients.
pub struct AdminServer {
    listener: Listener,
}

impl AdminServer {
    /// Bind the admin endpoint.
    pub async fn bind(endpoint: &Endpoint) -> io::Result<Self> {
        Ok(Self {
            listener: Listener::bind(endpoint).await?,
        })
    }

    /// The endpoint actually bound.
    pub fn local_endpoint(&self) -> io::Result<Endpoint> {
        self.listener.local_endpoint()
    }

    /// Wait for the next admin client.
    pub async fn accept(&self) -> io::Result<AdminConnection> {
        Ok(AdminConnection::new(self.listener.accept().await?))
    }
}

/// One connected admin client.
pub struct AdminConnection {
    reader: BufReader<ReadHalf<BoxedStream>>,
    writer: WriteHalf<BoxedStream>,
    codec: LineCodec,
    peer: String,
}

impl AdminConnection {
    fn new(connection: Connection) -> Self {
        let peer = connection.peer_description().to_string();
        let (read_half, write_half) = tokio::io::split(connection.into_stream());
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            codec: LineCodec::new(),
            peer,
        }
    }

    /// Remote peer description.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Read the next request. `None` means the client disconnected.
    pub async fn read_request(&mut self) -> Result<Option<AdminRequest>, AdminError> {
        match read_frame(&mut self.reader, &self.codec).await? {
            Some(frame) => Ok(Some(self.codec.decode(&frame)?)),
            None => Ok(None),
        }
    }

    /// Send one response frame.
    pub async fn send_response(&mut self, response: &AdminResponse) -> Result<(), AdminError> {
        let frame = self.codec.encode(response)?;
        self.writer.write_all(&frame).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

/// Serve admin clients until `shutdown` is cancelled.
pub async fn serve(
    server: AdminServer,
    dispatcher: Arc<CommandDispatcher>,
    shutdown: CancellationToken,
) {
    info!("Admin channel accepting connections");

    loop {
        let accepted = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            accepted = server.accept() => accepted,
        };

        match accepted {
            Ok(connection) => {
                debug!(peer = %connection.peer(), "Admin client connected");
                tokio::spawn(handle_connection(
                    connection,
                    Arc::clone(&dispatcher),
                    shutdown.clone(),
                ));
            }
            Err(e) => {
                warn!("Failed to accept admin connection: {}", e);
                if !transport::accept_error_pause(&shutdown).await {
                    break;
                }
            }
        }
    }

    info!("Admin channel stopped");
}

async fn handle_connection(
    mut connection: AdminConnection,
    dispatcher: Arc<CommandDispatcher>,
    shutdown: CancellationToken,
) {
    loop {
        let request = tokio::select! {
            _ = shutdown.cancelled() => break,
            request = connection.read_request() => request,
        };

        let request = match request {
            Ok(Some(request)) => request,
            Ok(None) => {
                debug!(peer = %connection.peer(), "Admin client disconnected");
                break;
            }
            Err(e) => {
                error!(peer = %connection.peer(), "Invalid admin request: {}", e);
                break;
            }
        };

        debug!(peer = %connection.peer(), command = %request.command, "Admin request");
        let Some(response) = dispatcher.dispatch(&request) else {
            continue;
        };

        if let Err(e) = connection.send_response(&response).await {
            warn!(peer = %connection.peer(), "Failed to send admin response: {}", e);
            break;
        }
    }
}
