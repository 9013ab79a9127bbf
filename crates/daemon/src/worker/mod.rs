//! Worker processes and the pool that hands them out.
//!
//! A [`Worker`] wraps one external process and its profile directory. It
//! moves `starting → ready` exactly once, then `free ⇄ busy` under the
//! control of [`WorkerPool`] until the pool is terminated.

mod launcher;
mod pool;

pub use launcher::{CommandLauncher, Launcher, TerminateFuture, WorkerProcess, WorkerSpec};
pub use pool::{PoolError, PoolPhase, WorkerPool};

use std::io;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use protocol::WorkerStatus;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::bridge::BridgeHandle;
use crate::transport::Endpoint;

/// Errors raised while launching or stopping a worker process.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to prepare profile directory {path}: {source}")]
    WorkingDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to spawn worker {profile}: {source}")]
    Spawn {
        profile: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to signal worker process {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: nix::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Default)]
struct WorkerState {
    ready: bool,
    busy: bool,
    shutting_down: bool,
    usage_count: u64,
    usage_start: Option<Instant>,
    last_usage: Duration,
    bridge: Option<BridgeHandle>,
}

/// One external worker process.
pub struct Worker {
    index: usize,
    profile_id: String,
    endpoint: Endpoint,
    state: Mutex<WorkerState>,
    ready_tx: watch::Sender<bool>,
    process: Mutex<Option<Box<dyn WorkerProcess>>>,
}

impl Worker {
    pub(crate) fn new(spec: &WorkerSpec) -> Self {
        let (ready_tx, _) = watch::channel(false);
        Self {
            index: spec.index,
            profile_id: spec.profile_id.clone(),
            endpoint: spec.endpoint.clone(),
            state: Mutex::new(WorkerState::default()),
            ready_tx,
            process: Mutex::new(None),
        }
    }

    /// Stable index assigned when the pool was built.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Profile (installation) identifier.
    pub fn profile_id(&self) -> &str {
        &self.profile_id
    }

    /// Endpoint the worker accepts bridge connections on.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// OS process id, if the process has been launched and not yet terminated.
    pub fn pid(&self) -> Option<u32> {
        self.process
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(|p| p.pid())
    }

    fn state(&self) -> MutexGuard<'_, WorkerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn attach_process(&self, process: Box<dyn WorkerProcess>) {
        *self.process.lock().unwrap_or_else(PoisonError::into_inner) = Some(process);
    }

    /// Record readiness and store the bridge handle.
    ///
    /// Returns `false` (and changes nothing) if the worker was already ready
    /// or is shutting down.
    pub fn mark_ready(&self, handle: BridgeHandle) -> bool {
        {
            let mut state = self.state();
            if state.shutting_down {
                drop(state);
                debug!(worker = self.index, profile = %self.profile_id, "Ignoring readiness signal after shutdown");
                return false;
            }
            if state.ready {
                drop(state);
                warn!(worker = self.index, profile = %self.profile_id, "Ignoring duplicate readiness signal");
                return false;
            }
            state.ready = true;
            state.bridge = Some(handle);
        }

        self.ready_tx.send_replace(true);
        info!(worker = self.index, profile = %self.profile_id, "Worker ready");
        true
    }

    /// Whether the worker has signalled readiness.
    pub fn is_ready(&self) -> bool {
        self.state().ready
    }

    /// Whether the worker is bound to a session.
    pub fn is_busy(&self) -> bool {
        self.state().busy
    }

    /// Whether the worker can be taken right now.
    pub fn is_free(&self) -> bool {
        let state = self.state();
        state.ready && !state.busy && !state.shutting_down
    }

    /// Number of sessions served so far.
    pub fn usage_count(&self) -> u64 {
        self.state().usage_count
    }

    /// Bridge handle, set once the worker is ready.
    pub fn bridge_handle(&self) -> Option<BridgeHandle> {
        self.state().bridge.clone()
    }

    /// Elapsed time of the current session, or the duration of the last one.
    pub fn usage_duration(&self) -> Duration {
        let state = self.state();
        match (state.busy, state.usage_start) {
            (true, Some(start)) => start.elapsed(),
            _ => state.last_usage,
        }
    }

    /// Wait until [`Worker::mark_ready`] has been called.
    pub async fn wait_ready(&self) {
        let mut rx = self.ready_tx.subscribe();
        // The sender lives as long as `self`, so this only returns once ready.
        let _ = rx.wait_for(|ready| *ready).await;
    }

    /// Free → busy. Only the pool calls this, under its own lock.
    pub(crate) fn try_take(&self) -> bool {
        let mut state = self.state();
        if !state.ready || state.busy || state.shutting_down {
            return false;
        }
        state.busy = true;
        state.usage_count += 1;
        state.usage_start = Some(Instant::now());
        true
    }

    /// Busy → free. Returns `false` if the worker was already free.
    pub(crate) fn release(&self) -> bool {
        let mut state = self.state();
        if !state.busy {
            return false;
        }
        state.busy = false;
        if let Some(start) = state.usage_start.take() {
            state.last_usage = start.elapsed();
        }
        true
    }

    /// Freeze the usage duration of the session that just ended.
    ///
    /// The worker stays busy until the pool releases it.
    pub fn record_session_end(&self) -> Duration {
        let mut state = self.state();
        if let Some(start) = state.usage_start.take() {
            state.last_usage = start.elapsed();
        }
        state.last_usage
    }

    /// Value copy of this worker's metrics.
    pub fn status(&self) -> WorkerStatus {
        let state = self.state();
        let duration = match (state.busy, state.usage_start) {
            (true, Some(start)) => start.elapsed(),
            _ => state.last_usage,
        };
        WorkerStatus {
            index: self.index,
            in_use: state.busy,
            usage_count: state.usage_count,
            usage_duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            profile_id: self.profile_id.clone(),
        }
    }

    /// Stop the underlying process, whatever the busy state.
    ///
    /// Sessions still bridged to this worker fail on their own afterwards.
    pub async fn terminate(&self, grace: Duration) -> Result<(), WorkerError> {
        self.state().shutting_down = true;

        let process = self
            .process
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        match process {
            Some(process) => {
                debug!(worker = self.index, pid = ?process.pid(), "Terminating worker process");
                process.terminate(grace).await
            }
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("index", &self.index)
            .field("profile_id", &self.profile_id)
            .field("endpoint", &self.endpoint)
            .field("state", &*self.state())
            .finish()
    }
}

/// One-shot readiness callback handed to a launcher.
///
/// Holds a weak reference so a launcher task that outlives the pool does not
/// keep the worker alive.
#[derive(Debug, Clone)]
pub struct ReadySignal {
    worker: Weak<Worker>,
}

impl ReadySignal {
    pub(crate) fn new(worker: Weak<Worker>) -> Self {
        Self { worker }
    }

    /// Mark the worker ready with its bridge handle.
    ///
    /// Returns `false` if the worker is gone or refused the signal.
    pub fn fire(self, handle: BridgeHandle) -> bool {
        match self.worker.upgrade() {
            Some(worker) => worker.mark_ready(handle),
            None => false,
        }
    }
}
