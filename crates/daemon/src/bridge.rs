//! Bridging client connections to worker processes.
//!
//! The broker only needs one capability from the bridge layer: given an
//! accepted connection and a worker's handle, start a session that ends by
//! signalling a [`SessionListener`]. [`ProxyBridge`] does that by relaying raw
//! bytes between the client and the worker's bridge endpoint.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use protocol::{CapacityExceeded, LineCodec};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::session::{SessionEnd, SessionId, SessionListener};
use crate::transport::{self, Connection, Endpoint};

/// How long the other direction may keep flowing once one side has finished.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Everything needed to reach a ready worker. Set once, never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeHandle {
    /// Index of the worker in its pool.
    pub worker_index: usize,
    /// Endpoint the worker accepts bridge connections on.
    pub endpoint: Endpoint,
}

/// Bridge construction failures.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("bridge already exists for worker {worker_index} (session {session_id})")]
    AlreadyExists {
        worker_index: usize,
        session_id: SessionId,
    },

    #[error("illegal argument: {0}")]
    IllegalArgument(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Creates sessions between client connections and workers.
pub trait Bridge: Send + Sync {
    /// Start a session serving `connection` with the worker behind `handle`.
    ///
    /// On `Ok`, the bridge owns the session and fires exactly one signal on
    /// `listener` when it ends. On `Err`, no signal is fired and the caller
    /// is responsible for the worker.
    fn open(
        &self,
        session_id: SessionId,
        connection: Connection,
        handle: &BridgeHandle,
        listener: Arc<dyn SessionListener>,
    ) -> Result<(), BridgeError>;
}

/// Relays bytes between the client and the worker endpoint.
///
/// A session lasts until one direction reaches end of stream. The other
/// direction then gets the drain timeout to finish before both sockets are
/// closed, so a peer that half-closes and then idles cannot pin a worker.
#[derive(Debug, Clone)]
pub struct ProxyBridge {
    active: Arc<DashMap<usize, SessionId>>,
    drain_timeout: Duration,
}

impl Default for ProxyBridge {
    fn default() -> Self {
        Self {
            active: Arc::new(DashMap::new()),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

impl ProxyBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override how long a half-closed session may keep draining.
    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    /// Number of live bridged sessions.
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    fn validate(handle: &BridgeHandle) -> Result<(), BridgeError> {
        match &handle.endpoint {
            Endpoint::Tcp(_) if handle.endpoint.port().unwrap_or(0) == 0 => Err(
                BridgeError::IllegalArgument(format!("worker endpoint {} has no port", handle.endpoint)),
            ),
            Endpoint::Unix(path) if path.as_os_str().is_empty() => Err(
                BridgeError::IllegalArgument("worker socket path is empty".to_string()),
            ),
            _ => Ok(()),
        }
    }
}

impl Bridge for ProxyBridge {
    fn open(
        &self,
        session_id: SessionId,
        connection: Connection,
        handle: &BridgeHandle,
        listener: Arc<dyn SessionListener>,
    ) -> Result<(), BridgeError> {
        Self::validate(handle)?;

        match self.active.entry(handle.worker_index) {
            Entry::Occupied(existing) => {
                return Err(BridgeError::AlreadyExists {
                    worker_index: handle.worker_index,
                    session_id: *existing.get(),
                });
            }
            Entry::Vacant(slot) => {
                slot.insert(session_id);
            }
        }

        let active = Arc::clone(&self.active);
        let handle = handle.clone();
        let drain_timeout = self.drain_timeout;
        tokio::spawn(async move {
            let end = relay(session_id, connection, &handle.endpoint, drain_timeout).await;
            // Unregister before the listener can hand the worker to someone else.
            active.remove(&handle.worker_index);
            listener.finished(&end);
        });

        Ok(())
    }
}

async fn relay(
    session_id: SessionId,
    connection: Connection,
    endpoint: &Endpoint,
    drain_timeout: Duration,
) -> SessionEnd {
    let peer = connection.peer_description().to_string();
    let client = connection.into_stream();

    let worker = match transport::connect(endpoint).await {
        Ok(stream) => stream,
        Err(e) => {
            return SessionEnd::Errored(format!("cannot reach worker at {}: {}", endpoint, e));
        }
    };
    debug!(%session_id, %peer, %endpoint, "Bridge established");

    let (mut client_rd, mut client_wr) = tokio::io::split(client);
    let (mut worker_rd, mut worker_wr) = tokio::io::split(worker);

    let upstream = async {
        let sent = tokio::io::copy(&mut client_rd, &mut worker_wr).await?;
        worker_wr.shutdown().await?;
        Ok::<_, io::Error>(sent)
    };
    let downstream = async {
        let received = tokio::io::copy(&mut worker_rd, &mut client_wr).await?;
        client_wr.shutdown().await?;
        Ok::<_, io::Error>(received)
    };
    tokio::pin!(upstream, downstream);

    let (first, client_finished) = tokio::select! {
        sent = &mut upstream => (sent, true),
        received = &mut downstream => (received, false),
    };
    if let Err(e) = first {
        return classify(&e);
    }

    let rest = if client_finished {
        tokio::time::timeout(drain_timeout, &mut downstream).await
    } else {
        tokio::time::timeout(drain_timeout, &mut upstream).await
    };
    match rest {
        Ok(Ok(_)) => {
            debug!(%session_id, "Bridge drained");
            SessionEnd::Closed
        }
        Ok(Err(e)) => classify(&e),
        Err(_) => {
            debug!(%session_id, client_finished, "Bridge drain timed out, closing both sides");
            SessionEnd::Closed
        }
    }
}

fn classify(error: &io::Error) -> SessionEnd {
    match error.kind() {
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::UnexpectedEof => SessionEnd::Terminated,
        _ => SessionEnd::Errored(error.to_string()),
    }
}

/// Serve a client that arrived while every worker was busy.
///
/// Writes one [`CapacityExceeded`] frame and closes. Never touches a worker.
pub async fn reject_no_capacity(
    mut connection: Connection,
    poolsize: usize,
    listener: Arc<dyn SessionListener>,
) {
    let peer = connection.peer_description().to_string();
    let end = match write_notice(&mut connection, poolsize).await {
        Ok(()) => SessionEnd::Closed,
        Err(e) => classify(&e),
    };
    info!(%peer, "Rejected connection closed");
    listener.finished(&end);
}

async fn write_notice(connection: &mut Connection, poolsize: usize) -> io::Result<()> {
    let frame = LineCodec::new()
        .encode(&CapacityExceeded::new(poolsize))
        .map_err(io::Error::other)?;
    let stream = connection.stream_mut();
    stream.write_all(&frame).await?;
    stream.flush().await?;
    stream.shutdown().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Listener;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::sync::mpsc;

    /// Records the end signal and forwards it to the test.
    struct ChannelListener(Mutex<Option<mpsc::UnboundedSender<SessionEnd>>>);

    impl ChannelListener {
        fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<SessionEnd>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (Arc::new(Self(Mutex::new(Some(tx)))), rx)
        }

        fn send(&self, end: SessionEnd) {
            if let Some(tx) = self.0.lock().unwrap().as_ref() {
                let _ = tx.send(end);
            }
        }
    }

    impl SessionListener for ChannelListener {
        fn closed(&self) {
            self.send(SessionEnd::Closed);
        }
        fn terminated(&self) {
            self.send(SessionEnd::Terminated);
        }
        fn errored(&self, reason: &str) {
            self.send(SessionEnd::Errored(reason.to_string()));
        }
    }

    /// Echo server standing in for a worker.
    async fn echo_worker() -> Endpoint {
        let listener = Listener::bind(&"127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let endpoint = listener.local_endpoint().unwrap();
        tokio::spawn(async move {
            while let Ok(conn) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut reader, mut writer) = tokio::io::split(conn.into_stream());
                    let _ = tokio::io::copy(&mut reader, &mut writer).await;
                    let _ = writer.shutdown().await;
                });
            }
        });
        endpoint
    }

    /// A connected (client side, broker side) pair.
    async fn client_pair() -> (tokio::net::TcpStream, Connection) {
        let listener = Listener::bind(&"127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let endpoint = listener.local_endpoint().unwrap();
        let client = tokio::net::TcpStream::connect(match &endpoint {
            Endpoint::Tcp(addr) => addr.clone(),
            Endpoint::Unix(_) => unreachable!(),
        })
        .await
        .unwrap();
        let conn = listener.accept().await.unwrap();
        (client, conn)
    }

    #[tokio::test]
    async fn test_proxy_relays_and_reports_closed() {
        let endpoint = echo_worker().await;
        let bridge = ProxyBridge::new();
        let (mut client, conn) = client_pair().await;
        let (listener, mut ends) = ChannelListener::new();

        let handle = BridgeHandle {
            worker_index: 0,
            endpoint,
        };
        bridge
            .open(SessionId::new(), conn, &handle, listener)
            .unwrap();

        client.write_all(b"hello worker").await.unwrap();
        client.shutdown().await.unwrap();
        let mut echoed = Vec::new();
        client.read_to_end(&mut echoed).await.unwrap();
        assert_eq!(echoed, b"hello worker");

        let end = tokio::time::timeout(Duration::from_secs(2), ends.recv())
            .await
            .unwrap();
        assert_eq!(end, Some(SessionEnd::Closed));
        assert_eq!(bridge.active_count(), 0);
    }

    #[tokio::test]
    async fn test_idle_worker_after_client_eof_is_closed() {
        // Reads the request to its end, then keeps the socket open without replying.
        let worker = Listener::bind(&"127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let endpoint = worker.local_endpoint().unwrap();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            let conn = worker.accept().await.unwrap();
            let mut stream = conn.into_stream();
            let mut request = Vec::new();
            stream.read_to_end(&mut request).await.unwrap();
            let _ = release_rx.await;
            drop(stream);
        });

        let bridge = ProxyBridge::new().with_drain_timeout(Duration::from_millis(100));
        let (mut client, conn) = client_pair().await;
        let (listener, mut ends) = ChannelListener::new();
        bridge
            .open(
                SessionId::new(),
                conn,
                &BridgeHandle {
                    worker_index: 3,
                    endpoint,
                },
                listener,
            )
            .unwrap();

        client.write_all(b"request").await.unwrap();
        client.shutdown().await.unwrap();

        let end = tokio::time::timeout(Duration::from_secs(2), ends.recv())
            .await
            .unwrap();
        assert_eq!(end, Some(SessionEnd::Closed));
        assert_eq!(bridge.active_count(), 0);

        let mut rest = Vec::new();
        tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert!(rest.is_empty());
        let _ = release_tx.send(());
    }

    #[tokio::test]
    async fn test_second_bridge_to_same_worker_is_rejected() {
        let endpoint = echo_worker().await;
        let bridge = ProxyBridge::new();
        let handle = BridgeHandle {
            worker_index: 1,
            endpoint,
        };

        let (_client_a, conn_a) = client_pair().await;
        let (listener_a, _ends_a) = ChannelListener::new();
        bridge
            .open(SessionId::new(), conn_a, &handle, listener_a)
            .unwrap();

        let (_client_b, conn_b) = client_pair().await;
        let (listener_b, _ends_b) = ChannelListener::new();
        let result = bridge.open(SessionId::new(), conn_b, &handle, listener_b);
        assert!(matches!(
            result,
            Err(BridgeError::AlreadyExists { worker_index: 1, .. })
        ));
        assert_eq!(bridge.active_count(), 1);
    }

    #[tokio::test]
    async fn test_invalid_handles_are_illegal_arguments() {
        let bridge = ProxyBridge::new();

        for endpoint in [
            Endpoint::Tcp("127.0.0.1:0".to_string()),
            Endpoint::Unix(PathBuf::new()),
        ] {
            let (_client, conn) = client_pair().await;
            let (listener, _ends) = ChannelListener::new();
            let handle = BridgeHandle {
                worker_index: 0,
                endpoint,
            };
            let result = bridge.open(SessionId::new(), conn, &handle, listener);
            assert!(matches!(result, Err(BridgeError::IllegalArgument(_))));
        }
        assert_eq!(bridge.active_count(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_worker_reports_errored() {
        let unused = Listener::bind(&"127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let endpoint = unused.local_endpoint().unwrap();
        drop(unused);

        let bridge = ProxyBridge::new();
        let (_client, conn) = client_pair().await;
        let (listener, mut ends) = ChannelListener::new();
        bridge
            .open(
                SessionId::new(),
                conn,
                &BridgeHandle {
                    worker_index: 0,
                    endpoint,
                },
                listener,
            )
            .unwrap();

        let end = tokio::time::timeout(Duration::from_secs(2), ends.recv())
            .await
            .unwrap();
        assert!(matches!(end, Some(SessionEnd::Errored(_))));
        assert_eq!(bridge.active_count(), 0);
    }

    #[tokio::test]
    async fn test_reject_no_capacity_writes_notice() {
        let (mut client, conn) = client_pair().await;
        let (listener, mut ends) = ChannelListener::new();

        reject_no_capacity(conn, 2, listener).await;

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        let notice: CapacityExceeded = LineCodec::new().decode(&received).unwrap();
        assert_eq!(notice, CapacityExceeded::new(2));
        assert_eq!(ends.recv().await, Some(SessionEnd::Closed));
    }

    #[test]
    fn test_classify_errors() {
        let reset = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        let other = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        assert_eq!(classify(&reset), SessionEnd::Terminated);
        assert!(matches!(classify(&other), SessionEnd::Errored(_)));
    }
}
