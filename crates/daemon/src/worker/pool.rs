//! The fixed-size worker pool.
//!
//! `take` and `release` are short critical sections under one mutex: a scan
//! of the worker list plus an update of a single worker. Lock order is always
//! append gate, then pool, then worker. Logging happens after the pool lock
//! is dropped.
//!
//! Launching a worker happens under the append gate only, so the launcher may
//! read the pool. Phase changes take the gate as well and therefore never
//! interleave with a launch.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use protocol::PoolStatus;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::launcher::{Launcher, WorkerSpec};
use super::{ReadySignal, Worker, WorkerError};

/// Pool lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolPhase {
    /// Workers are being appended and started.
    Building,
    /// Every worker signalled readiness.
    Ready,
    /// `terminate` is in progress.
    Terminating,
    /// Every worker has been terminated.
    Terminated,
}

/// Errors from pool construction.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("workers can only be appended while building, pool is {0:?}")]
    NotBuilding(PoolPhase),

    #[error("duplicate worker profile: {0}")]
    DuplicateProfile(String),

    #[error(transparent)]
    Launch(#[from] WorkerError),

    #[error("pool was terminated before all workers became ready")]
    Terminated,
}

struct PoolInner {
    phase: PoolPhase,
    workers: Vec<Arc<Worker>>,
}

/// Ordered, thread-safe collection of workers.
pub struct WorkerPool {
    inner: Mutex<PoolInner>,
    append_gate: Mutex<()>,
    launcher: Arc<dyn Launcher>,
    terminate_grace: Duration,
}

impl WorkerPool {
    /// Create an empty pool in the `Building` phase.
    pub fn new(launcher: Arc<dyn Launcher>, terminate_grace: Duration) -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                phase: PoolPhase::Building,
                workers: Vec::new(),
            }),
            append_gate: Mutex::new(()),
            launcher,
            terminate_grace,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn gate(&self) -> MutexGuard<'_, ()> {
        self.append_gate.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current phase.
    pub fn phase(&self) -> PoolPhase {
        self.lock().phase
    }

    /// Start a worker and append it. Valid only while building.
    ///
    /// The worker's index is its position in the pool. The launcher must not
    /// call `append` itself.
    pub fn append(&self, spec: WorkerSpec) -> Result<Arc<Worker>, PoolError> {
        let _gate = self.gate();
        let index = {
            let inner = self.lock();
            if inner.phase != PoolPhase::Building {
                return Err(PoolError::NotBuilding(inner.phase));
            }
            if inner
                .workers
                .iter()
                .any(|w| w.profile_id() == spec.profile_id)
            {
                return Err(PoolError::DuplicateProfile(spec.profile_id));
            }
            inner.workers.len()
        };

        let spec = WorkerSpec { index, ..spec };
        let worker = Arc::new(Worker::new(&spec));
        let process = self
            .launcher
            .launch(&spec, ReadySignal::new(Arc::downgrade(&worker)))?;
        worker.attach_process(process);
        self.lock().workers.push(Arc::clone(&worker));

        debug!(worker = spec.index, profile = %spec.profile_id, "Worker appended to pool");
        Ok(worker)
    }

    /// Wait until every appended worker is ready, then move to `Ready`.
    ///
    /// A worker that never becomes ready makes this wait forever.
    pub async fn wait_till_ready(&self) -> Result<(), PoolError> {
        let workers = {
            let _gate = self.gate();
            let inner = self.lock();
            match inner.phase {
                PoolPhase::Building => inner.workers.clone(),
                PoolPhase::Ready => return Ok(()),
                PoolPhase::Terminating | PoolPhase::Terminated => {
                    return Err(PoolError::Terminated)
                }
            }
        };

        for worker in &workers {
            worker.wait_ready().await;
        }

        let gate = self.gate();
        let mut inner = self.lock();
        match inner.phase {
            PoolPhase::Building | PoolPhase::Ready => {
                inner.phase = PoolPhase::Ready;
                drop(inner);
                drop(gate);
                info!(poolsize = workers.len(), "All workers ready");
                Ok(())
            }
            PoolPhase::Terminating | PoolPhase::Terminated => Err(PoolError::Terminated),
        }
    }

    /// Take the lowest-index free worker, or `None` if every worker is busy.
    ///
    /// Never blocks beyond the pool lock.
    pub fn take(&self) -> Option<Arc<Worker>> {
        let (taken, free) = {
            let inner = self.lock();
            if matches!(inner.phase, PoolPhase::Terminating | PoolPhase::Terminated) {
                return None;
            }
            let taken = inner.workers.iter().find(|w| w.try_take()).cloned();
            (taken, count_free(&inner.workers))
        };

        if let Some(worker) = &taken {
            debug!(worker = worker.index(), free, "Worker taken");
        }
        taken
    }

    /// Return a worker to the pool.
    ///
    /// Returns `false` without changing anything if the worker was already
    /// free or does not belong to this pool.
    pub fn release(&self, worker: &Arc<Worker>) -> bool {
        let (released, free) = {
            let inner = self.lock();
            let owned = inner
                .workers
                .get(worker.index())
                .is_some_and(|w| Arc::ptr_eq(w, worker));
            if !owned {
                drop(inner);
                warn!(worker = worker.index(), "Release of a worker from another pool ignored");
                return false;
            }
            (worker.release(), count_free(&inner.workers))
        };

        if released {
            debug!(worker = worker.index(), free, "Worker released");
        } else {
            warn!(worker = worker.index(), "Worker released twice, already free");
        }
        released
    }

    /// Number of workers.
    pub fn size(&self) -> usize {
        self.lock().workers.len()
    }

    /// Number of workers that `take` could hand out right now.
    pub fn free_count(&self) -> usize {
        count_free(&self.lock().workers)
    }

    /// Worker at `index`.
    pub fn get(&self, index: usize) -> Option<Arc<Worker>> {
        self.lock().workers.get(index).cloned()
    }

    /// Value copy of the pool's metrics.
    pub fn snapshot(&self) -> PoolStatus {
        let inner = self.lock();
        let workers: Vec<_> = inner.workers.iter().map(|w| w.status()).collect();
        PoolStatus {
            available: count_free(&inner.workers),
            poolsize: workers.len(),
            workers,
        }
    }

    /// Terminate every worker, whatever its state.
    ///
    /// Idempotent: a second call, concurrent or later, returns without doing
    /// anything. Failures are logged and do not stop the remaining workers
    /// from being terminated.
    pub async fn terminate(&self) {
        let workers = {
            let _gate = self.gate();
            let mut inner = self.lock();
            match inner.phase {
                PoolPhase::Terminating | PoolPhase::Terminated => {
                    drop(inner);
                    debug!("Pool already terminating");
                    return;
                }
                PoolPhase::Building | PoolPhase::Ready => {
                    inner.phase = PoolPhase::Terminating;
                    inner.workers.clone()
                }
            }
        };

        info!(poolsize = workers.len(), "Terminating worker pool");
        for worker in &workers {
            if let Err(e) = worker.terminate(self.terminate_grace).await {
                error!(worker = worker.index(), profile = %worker.profile_id(), "Failed to terminate worker: {}", e);
            }
        }

        self.lock().phase = PoolPhase::Terminated;
        info!("Worker pool terminated");
    }
}

fn count_free(workers: &[Arc<Worker>]) -> usize {
    workers.iter().filter(|w| w.is_free()).count()
}
