//! Stream transport for the primary and admin endpoints.
//!
//! Both endpoints accept either TCP (`tcp://host:port` or a bare `host:port`)
//! or Unix domain sockets (`unix:///path/to/socket`).

use std::fmt;
use std::io;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;

const TCP_SCHEME: &str = "tcp://";
const UNIX_SCHEME: &str = "unix://";

/// Pause after a failed accept so a persistent error does not spin.
pub const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Error returned when an endpoint string cannot be parsed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct ParseEndpointError(String);

/// An address the daemon listens on or connects to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// TCP `host:port`.
    Tcp(String),
    /// Unix domain socket path.
    Unix(PathBuf),
}

impl Endpoint {
    /// Host part of a TCP endpoint.
    pub fn host(&self) -> Option<&str> {
        match self {
            Endpoint::Tcp(addr) => addr.rsplit_once(':').map(|(host, _)| host),
            Endpoint::Unix(_) => None,
        }
    }

    /// Port of a TCP endpoint.
    pub fn port(&self) -> Option<u16> {
        match self {
            Endpoint::Tcp(addr) => addr.rsplit_once(':').and_then(|(_, port)| port.parse().ok()),
            Endpoint::Unix(_) => None,
        }
    }
}

impl FromStr for Endpoint {
    type Err = ParseEndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();

        if let Some(path) = s.strip_prefix(UNIX_SCHEME) {
            if path.is_empty() {
                return Err(ParseEndpointError("unix socket path is empty".to_string()));
            }
            return Ok(Endpoint::Unix(PathBuf::from(path)));
        }

        let addr = s.strip_prefix(TCP_SCHEME).unwrap_or(s);
        if addr.contains("://") {
            return Err(ParseEndpointError(format!(
                "unsupported scheme, expected {} or {}",
                TCP_SCHEME, UNIX_SCHEME
            )));
        }

        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| ParseEndpointError("missing port".to_string()))?;
        if host.is_empty() {
            return Err(ParseEndpointError("missing host".to_string()));
        }
        port.parse::<u16>()
            .map_err(|_| ParseEndpointError(format!("invalid port {:?}", port)))?;

        Ok(Endpoint::Tcp(addr.to_string()))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "{}{}", TCP_SCHEME, addr),
            Endpoint::Unix(path) => write!(f, "{}{}", UNIX_SCHEME, path.display()),
        }
    }
}

/// A bidirectional byte stream.
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Stream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Type-erased stream over either transport.
pub type BoxedStream = Box<dyn Stream>;

/// An accepted inbound connection.
pub struct Connection {
    stream: BoxedStream,
    peer: String,
}

impl Connection {
    /// Wrap an already-established stream.
    pub fn new(stream: BoxedStream, peer: impl Into<String>) -> Self {
        Self {
            stream,
            peer: peer.into(),
        }
    }

    /// Best-effort human-readable description of the remote peer.
    pub fn peer_description(&self) -> &str {
        &self.peer
    }

    /// Mutable access to the underlying stream.
    pub fn stream_mut(&mut self) -> &mut BoxedStream {
        &mut self.stream
    }

    /// Consume the connection, returning the stream.
    pub fn into_stream(self) -> BoxedStream {
        self.stream
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

/// A bound listening endpoint.
pub enum Listener {
    Tcp(TcpListener),
    Unix { listener: UnixListener, path: PathBuf },
}

impl Listener {
    /// Bind to the given endpoint.
    ///
    /// For Unix endpoints, parent directories are created and a stale socket
    /// file at the path is removed first. A path that is not a socket, or a
    /// socket something is still listening on, is left alone and refused.
    pub async fn bind(endpoint: &Endpoint) -> io::Result<Self> {
        match endpoint {
            Endpoint::Tcp(addr) => Ok(Listener::Tcp(TcpListener::bind(addr.as_str()).await?)),
            Endpoint::Unix(path) => {
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        std::fs::create_dir_all(parent)?;
                    }
                }

                clear_stale_socket(path)?;

                let listener = UnixListener::bind(path)?;
                Ok(Listener::Unix {
                    listener,
                    path: path.clone(),
                })
            }
        }
    }

    /// Wait for the next inbound connection.
    pub async fn accept(&self) -> io::Result<Connection> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, addr) = listener.accept().await?;
                if let Err(e) = stream.set_nodelay(true) {
                    tracing::debug!(peer = %addr, "Failed to set TCP_NODELAY: {}", e);
                }
                Ok(Connection::new(Box::new(stream), addr.to_string()))
            }
            Listener::Unix { listener, .. } => {
                let (stream, addr) = listener.accept().await?;
                let peer = match addr.as_pathname() {
                    Some(path) => format!("unix:{}", path.display()),
                    None => "unix:anonymous".to_string(),
                };
                Ok(Connection::new(Box::new(stream), peer))
            }
        }
    }

    /// The endpoint actually bound. A TCP port of 0 resolves to the assigned port.
    pub fn local_endpoint(&self) -> io::Result<Endpoint> {
        match self {
            Listener::Tcp(listener) => Ok(Endpoint::Tcp(listener.local_addr()?.to_string())),
            Listener::Unix { path, .. } => Ok(Endpoint::Unix(path.clone())),
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Listener::Unix { path, .. } = self {
            remove_socket_file(path);
        }
    }
}

fn clear_stale_socket(path: &Path) -> io::Result<()> {
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };

    if !metadata.file_type().is_socket() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} exists and is not a socket", path.display()),
        ));
    }
    if std::os::unix::net::UnixStream::connect(path).is_ok() {
        return Err(io::Error::new(
            io::ErrorKind::AddrInUse,
            format!("{} is in use by another listener", path.display()),
        ));
    }

    tracing::debug!(path = %path.display(), "Removing stale socket file");
    std::fs::remove_file(path)
}

fn remove_socket_file(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), "Failed to remove socket file: {}", e);
        }
    }
}

/// Wait out [`ACCEPT_ERROR_BACKOFF`] after a failed accept.
///
/// Returns `false` if `shutdown` fires first.
pub async fn accept_error_pause(shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => true,
    }
}

/// Open an outbound connection to the endpoint.
pub async fn connect(endpoint: &Endpoint) -> io::Result<BoxedStream> {
    match endpoint {
        Endpoint::Tcp(addr) => {
            let stream = TcpStream::connect(addr.as_str()).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream))
        }
        Endpoint::Unix(path) => Ok(Box::new(UnixStream::connect(path).await?)),
    }
}
