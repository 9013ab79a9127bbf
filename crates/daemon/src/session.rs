//! Session identity and the listeners that reclaim workers.
//!
//! Every session that holds a worker carries a [`WorkerReleaseListener`].
//! Whatever ends the session (clean close, reset, error, or several of these
//! racing) the worker goes back to the pool exactly once.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::worker::{Worker, WorkerPool};

/// Unique identifier of one client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generate a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// Both sides closed cleanly.
    Closed,
    /// The connection was reset or aborted.
    Terminated,
    /// Any other failure.
    Errored(String),
}

impl fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEnd::Closed => write!(f, "closed"),
            SessionEnd::Terminated => write!(f, "terminated"),
            SessionEnd::Errored(reason) => write!(f, "errored: {}", reason),
        }
    }
}

/// Observer of a session's end-of-life signals.
///
/// The transport may deliver more than one signal, on any thread.
pub trait SessionListener: Send + Sync {
    /// The session ended cleanly.
    fn closed(&self);

    /// The session was cut off.
    fn terminated(&self);

    /// The session failed.
    fn errored(&self, reason: &str);

    /// Dispatch on a [`SessionEnd`].
    fn finished(&self, end: &SessionEnd) {
        match end {
            SessionEnd::Closed => self.closed(),
            SessionEnd::Terminated => self.terminated(),
            SessionEnd::Errored(reason) => self.errored(reason),
        }
    }
}

/// Returns the session's worker to the pool on the first end signal.
pub struct WorkerReleaseListener {
    session_id: SessionId,
    worker: Arc<Worker>,
    pool: Arc<WorkerPool>,
    handled: AtomicBool,
}

impl WorkerReleaseListener {
    pub fn new(session_id: SessionId, worker: Arc<Worker>, pool: Arc<WorkerPool>) -> Self {
        Self {
            session_id,
            worker,
            pool,
            handled: AtomicBool::new(false),
        }
    }

    /// Whether an end signal has already been handled.
    pub fn is_handled(&self) -> bool {
        self.handled.load(Ordering::Acquire)
    }

    fn handle(&self, end: SessionEnd) {
        if self.handled.swap(true, Ordering::AcqRel) {
            debug!(session_id = %self.session_id, %end, "Session end already handled");
            return;
        }

        let duration = self.worker.record_session_end();
        match &end {
            SessionEnd::Errored(_) => warn!(
                session_id = %self.session_id,
                worker = self.worker.index(),
                duration_ms = duration.as_millis() as u64,
                "Session {}", end
            ),
            _ => info!(
                session_id = %self.session_id,
                worker = self.worker.index(),
                duration_ms = duration.as_millis() as u64,
                "Session {}", end
            ),
        }

        let pool = Arc::clone(&self.pool);
        let worker = Arc::clone(&self.worker);
        let session_id = self.session_id;
        let release = move || {
            if pool.release(&worker) {
                info!(%session_id, worker = worker.index(), "Worker returned to pool");
            }
        };

        // Off the transport's own task.
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move { release() });
            }
            Err(_) => release(),
        }
    }
}

impl SessionListener for WorkerReleaseListener {
    fn closed(&self) {
        self.handle(SessionEnd::Closed);
    }

    fn terminated(&self) {
        self.handle(SessionEnd::Terminated);
    }

    fn errored(&self, reason: &str) {
        self.handle(SessionEnd::Errored(reason.to_string()));
    }
}

/// Listener for sessions that never held a worker.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl SessionListener for NoopListener {
    fn closed(&self) {
        debug!("Overflow session closed");
    }

    fn terminated(&self) {
        debug!("Overflow session terminated");
    }

    fn errored(&self, reason: &str) {
        debug!("Overflow session errored: {}", reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::BridgeHandle;
    use crate::transport::Endpoint;
    use crate::worker::{Launcher, ReadySignal, TerminateFuture, WorkerError, WorkerProcess, WorkerSpec};
    use std::path::PathBuf;
    use std::time::Duration;

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

    async fn pool_of(size: usize) -> Arc<WorkerPool> {
        let pool = Arc::new(WorkerPool::new(Arc::new(InstantLauncher), Duration::ZERO));
        for i in 0..size {
            pool.append(WorkerSpec::new(
                format!("w{}", i),
                PathBuf::from("/tmp"),
                Endpoint::Tcp("127.0.0.1:9".to_string()),
            ))
            .unwrap();
        }
        pool.wait_till_ready().await.unwrap();
        pool
    }

    async fn wait_for_free(pool: &WorkerPool, expected: usize) {
        tokio::time::timeout(Duration::from_secs(1), async {
            while pool.free_count() != expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[test]
    fn test_session_ids_are_unique() {
        assert_ne!(SessionId::new(), SessionId::new());
        assert_eq!(SessionId::new().to_string().len(), 36);
    }

    #[tokio::test]
    async fn test_listener_releases_worker() {
        let pool = pool_of(1).await;
        let worker = pool.take().unwrap();
        let listener = WorkerReleaseListener::new(SessionId::new(), worker, Arc::clone(&pool));

        listener.closed();
        assert!(listener.is_handled());
        wait_for_free(&pool, 1).await;
    }

    #[tokio::test]
    async fn test_listener_releases_once_under_repeated_signals() {
        let pool = pool_of(2).await;
        let worker = pool.take().unwrap();
        let listener = Arc::new(WorkerReleaseListener::new(
            SessionId::new(),
            Arc::clone(&worker),
            Arc::clone(&pool),
        ));

        let signals: Vec<_> = (0..8)
            .map(|i| {
                let listener = Arc::clone(&listener);
                std::thread::spawn(move || match i % 3 {
                    0 => listener.closed(),
                    1 => listener.terminated(),
                    _ => listener.errored("boom"),
                })
            })
            .collect();
        for signal in signals {
            signal.join().unwrap();
        }

        wait_for_free(&pool, 2).await;

        // The worker is taken again; a late signal must not free it.
        let again = pool.take().unwrap();
        assert_eq!(again.index(), worker.index());
        listener.terminated();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(again.is_busy());
        assert_eq!(again.usage_count(), 2);
    }

    #[test]
    fn test_listener_without_runtime_releases_inline() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let pool = runtime.block_on(pool_of(1));
        let worker = pool.take().unwrap();

        let listener = WorkerReleaseListener::new(SessionId::new(), worker, Arc::clone(&pool));
        listener.errored("transport gone");

        assert_eq!(pool.free_count(), 1);
    }

    #[test]
    fn test_finished_dispatches_by_kind() {
        use std::sync::Mutex;

        #[derive(Default)]
        struct Recorder(Mutex<Vec<String>>);

        impl SessionListener for Recorder {
            fn closed(&self) {
                self.0.lock().unwrap().push("closed".to_string());
            }
            fn terminated(&self) {
                self.0.lock().unwrap().push("terminated".to_string());
            }
            fn errored(&self, reason: &str) {
                self.0.lock().unwrap().push(format!("errored:{}", reason));
            }
        }

        let recorder = Recorder::default();
        recorder.finished(&SessionEnd::Closed);
        recorder.finished(&SessionEnd::Terminated);
        recorder.finished(&SessionEnd::Errored("x".to_string()));

        assert_eq!(
            *recorder.0.lock().unwrap(),
            vec!["closed", "terminated", "errored:x"]
        );
    }
}
