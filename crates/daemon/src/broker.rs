//! The primary accept loop.
//!
//! One task accepts connections and hands each one either a worker (through
//! the [`Bridge`]) or the capacity-exceeded reply. It never does any work on
//! behalf of a client itself.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bridge::{reject_no_capacity, Bridge, BridgeError};
use crate::session::{NoopListener, SessionId, SessionListener, WorkerReleaseListener};
use crate::transport::{self, Connection, Listener};
use crate::worker::WorkerPool;

/// What happened to one accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Bridged to the worker at this index.
    Assigned(usize),
    /// No free worker; the client gets the capacity-exceeded reply.
    Rejected,
    /// The bridge could not be built; the worker was returned.
    Failed(usize),
}

/// Assigns accepted connections to workers.
pub struct ConnectionBroker {
    pool: Arc<WorkerPool>,
    bridge: Arc<dyn Bridge>,
}

impl ConnectionBroker {
    pub fn new(pool: Arc<WorkerPool>, bridge: Arc<dyn Bridge>) -> Self {
        Self { pool, bridge }
    }

    /// Accept connections until `shutdown` is cancelled.
    ///
    /// Accept errors are logged and skipped. The listener is dropped (and the
    /// endpoint closed) when this returns.
    pub async fn run(&self, listener: Listener, shutdown: CancellationToken) {
        info!("Accepting client connections");

        loop {
            let accepted = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok(connection) => {
                    self.dispatch(connection);
                }
                Err(e) => {
                    if shutdown.is_cancelled() {
                        break;
                    }
                    warn!("Failed to accept connection: {}", e);
                    if !transport::accept_error_pause(&shutdown).await {
                        break;
                    }
                }
            }
        }

        info!("Stopped accepting client connections");
    }

    /// Route one accepted connection.
    pub fn dispatch(&self, connection: Connection) -> Dispatch {
        let peer = connection.peer_description().to_string();
        info!(%peer, "Accepted connection");

        let Some(worker) = self.pool.take() else {
            let poolsize = self.pool.size();
            warn!(%peer, poolsize, "Rejected connection, all workers busy");
            tokio::spawn(reject_no_capacity(connection, poolsize, Arc::new(NoopListener)));
            return Dispatch::Rejected;
        };

        let index = worker.index();
        let session_id = SessionId::new();
        let listener = Arc::new(WorkerReleaseListener::new(
            session_id,
            Arc::clone(&worker),
            Arc::clone(&self.pool),
        ));

        let Some(handle) = worker.bridge_handle() else {
            error!(%session_id, worker = index, "Worker has no bridge handle");
            listener.errored("worker has no bridge handle");
            return Dispatch::Failed(index);
        };

        info!(%session_id, worker = index, %peer, "Assigned worker");
        match self
            .bridge
            .open(session_id, connection, &handle, listener.clone())
        {
            Ok(()) => {
                debug!(%session_id, worker = index, "Session started");
                Dispatch::Assigned(index)
            }
            Err(e @ BridgeError::AlreadyExists { .. }) => {
                error!(%session_id, worker = index, "Bridge already exists: {}", e);
                listener.errored(&e.to_string());
                Dispatch::Failed(index)
            }
            Err(e @ BridgeError::IllegalArgument(_)) => {
                error!(%session_id, worker = index, "Illegal bridge argument: {}", e);
                listener.errored(&e.to_string());
                Dispatch::Failed(index)
            }
            Err(e) => {
                error!(%session_id, worker = index, "Failed to create bridge: {}", e);
                listener.errored(&e.to_string());
                Dispatch::Failed(index)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::BridgeHandle;
    use crate::transport::Endpoint;
    use crate::worker::{Launcher, ReadySignal, TerminateFuture, WorkerError, WorkerProcess, WorkerSpec};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    struct InstantLauncher;

    struct NoProcess;

    impl WorkerProcess for NoProcess {
        fn pid(&self) -> Option<u32> {
            None
        }

        fn terminate(self: Box<Self>, _grace: Duration) -> TerminateFuture {
            Box::pin(async { Ok(()) })
        }
    }

    impl Launcher for InstantLauncher {
        fn launch(
            &self,
            spec: &WorkerSpec,
            ready: ReadySignal,
        ) -> Result<Box<dyn WorkerProcess>, WorkerError> {
            ready.fire(BridgeHandle {
                worker_index: spec.index,
                endpoint: spec.endpoint.clone(),
            });
            Ok(Box::new(NoProcess))
        }
    }

    /// Bridge that keeps sessions open until the test ends them.
    #[derive(Default)]
    struct HeldBridge {
        opened: AtomicUsize,
        fail_with_already_exists: bool,
        listeners: Mutex<Vec<Arc<dyn SessionListener>>>,
    }

    impl Bridge for HeldBridge {
        fn open(
            &self,
            session_id: SessionId,
            _connection: Connection,
            handle: &BridgeHandle,
            listener: Arc<dyn SessionListener>,
        ) -> Result<(), BridgeError> {
            if self.fail_with_already_exists {
                return Err(BridgeError::AlreadyExists {
                    worker_index: handle.worker_index,
                    session_id,
                });
            }
            self.opened.fetch_add(1, Ordering::SeqCst);
            self.listeners.lock().unwrap().push(listener);
            Ok(())
        }
    }

    async fn pool_of(size: usize) -> Arc<WorkerPool> {
        let pool = Arc::new(WorkerPool::new(Arc::new(InstantLauncher), Duration::ZERO));
        for i in 0..size {
            pool.append(WorkerSpec::new(
                format!("w{}", i),
                PathBuf::from("/tmp"),
                Endpoint::Tcp(format!("127.0.0.1:{}", 9100 + i)),
            ))
            .unwrap();
        }
        pool.wait_till_ready().await.unwrap();
        pool
    }

    async fn connection() -> (tokio::net::TcpStream, Connection) {
        let listener = Listener::bind(&"127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let Endpoint::Tcp(addr) = listener.local_endpoint().unwrap() else {
            unreachable!()
        };
        let client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let conn = listener.accept().await.unwrap();
        (client, conn)
    }

    #[tokio::test]
    async fn test_dispatch_assigns_lowest_free_worker() {
        let pool = pool_of(2).await;
        let bridge = Arc::new(HeldBridge::default());
        let broker = ConnectionBroker::new(Arc::clone(&pool), bridge.clone());

        let (_c0, conn0) = connection().await;
        let (_c1, conn1) = connection().await;
        assert_eq!(broker.dispatch(conn0), Dispatch::Assigned(0));
        assert_eq!(broker.dispatch(conn1), Dispatch::Assigned(1));
        assert_eq!(bridge.opened.load(Ordering::SeqCst), 2);
        assert_eq!(pool.free_count(), 0);
    }

    #[tokio::test]
    async fn test_dispatch_rejects_when_exhausted() {
        let pool = pool_of(1).await;
        let bridge = Arc::new(HeldBridge::default());
        let broker = ConnectionBroker::new(Arc::clone(&pool), bridge.clone());

        let (_c0, conn0) = connection().await;
        broker.dispatch(conn0);

        let (mut c1, conn1) = connection().await;
        assert_eq!(broker.dispatch(conn1), Dispatch::Rejected);

        let mut reply = String::new();
        c1.read_to_string(&mut reply).await.unwrap();
        assert!(reply.contains("capacity_exceeded"));
        assert_eq!(bridge.opened.load(Ordering::SeqCst), 1);

        // The overflow path must not return a phantom worker.
        assert_eq!(pool.free_count(), 0);
        assert!(pool.get(0).unwrap().is_busy());
    }

    #[tokio::test]
    async fn test_bridge_failure_returns_worker() {
        let pool = pool_of(1).await;
        let bridge = Arc::new(HeldBridge {
            fail_with_already_exists: true,
            ..HeldBridge::default()
        });
        let broker = ConnectionBroker::new(Arc::clone(&pool), bridge);

        let (_c0, conn0) = connection().await;
        assert_eq!(broker.dispatch(conn0), Dispatch::Failed(0));

        tokio::time::timeout(Duration::from_secs(1), async {
            while pool.free_count() != 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(pool.get(0).unwrap().usage_count(), 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let pool = pool_of(1).await;
        let broker = ConnectionBroker::new(pool, Arc::new(HeldBridge::default()));
        let listener = Listener::bind(&"127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let endpoint = listener.local_endpoint().unwrap();
        let shutdown = CancellationToken::new();

        let run = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { broker.run(listener, shutdown).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(1), run)
            .await
            .unwrap()
            .unwrap();
        assert!(crate::transport::connect(&endpoint).await.is_err());
    }
}
