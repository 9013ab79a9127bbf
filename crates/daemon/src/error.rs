//! Top-level daemon errors.

use std::io;

use thiserror::Error;

use crate::config::ConfigError;
use crate::transport::Endpoint;
use crate::worker::{PoolError, WorkerError};

/// Exit code for a clean shutdown.
pub const EXIT_OK: u8 = 0;
/// Exit code for any failure not classified below.
pub const EXIT_FAILURE: u8 = 1;
/// Exit code for an invalid configuration.
pub const EXIT_CONFIG: u8 = 2;
/// Exit code for a worker that could not be launched.
pub const EXIT_WORKER_LAUNCH: u8 = 3;
/// Exit code for an endpoint that could not be bound.
pub const EXIT_BIND: u8 = 4;

/// Failures that stop the daemon from reaching the accepting state.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to launch worker: {0}")]
    WorkerLaunch(#[source] WorkerError),

    #[error("worker pool error: {0}")]
    Pool(#[source] PoolError),

    #[error("failed to bind {endpoint}: {source}")]
    Bind {
        endpoint: Endpoint,
        #[source]
        source: io::Error,
    },

    #[error("daemon already running (PID: {0})")]
    AlreadyRunning(u32),

    #[error("daemon was already started")]
    AlreadyStarted,

    #[error("daemon has not been started")]
    NotStarted,

    #[error("startup interrupted by shutdown request")]
    Interrupted,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<PoolError> for DaemonError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Launch(e) => DaemonError::WorkerLaunch(e),
            other => DaemonError::Pool(other),
        }
    }
}

impl DaemonError {
    /// Process exit code for this failure.
    pub fn exit_code(&self) -> u8 {
        match self {
            DaemonError::Config(_) => EXIT_CONFIG,
            DaemonError::WorkerLaunch(_) => EXIT_WORKER_LAUNCH,
            DaemonError::Bind { .. } => EXIT_BIND,
            _ => EXIT_FAILURE,
        }
    }
}
