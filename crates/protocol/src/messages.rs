//! Message types exchanged on the admin channel and the primary endpoint.
//!
//! The admin channel carries a command name per request and answers with a
//! tagged response record. The primary endpoint is an opaque byte bridge; the
//! only message the broker itself ever writes there is [`CapacityExceeded`].

use serde::{Deserialize, Serialize};

/// Command name that returns a [`PoolStatus`] snapshot.
pub const CMD_STATUS: &str = "daemon.status";

/// Command name that schedules a delayed daemon shutdown.
pub const CMD_STOP: &str = "daemon.stop";

/// A request sent to the admin endpoint.
///
/// Dispatch is by name so that an unknown command still parses and can be
/// logged by the daemon rather than rejected as malformed JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminRequest {
    /// Command name, e.g. `daemon.status`.
    pub command: String,
}

impl AdminRequest {
    /// Creates a request for an arbitrary command name.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    /// Request for `daemon.status`.
    pub fn status() -> Self {
        Self::new(CMD_STATUS)
    }

    /// Request for `daemon.stop`.
    pub fn stop() -> Self {
        Self::new(CMD_STOP)
    }
}

/// Responses sent from the daemon over the admin channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AdminResponse {
    /// Read-only snapshot of the worker pool.
    Status(PoolStatus),
    /// Acknowledgment that shutdown has been scheduled.
    #[serde(rename_all = "camelCase")]
    Stopping {
        /// Delay before the daemon starts shutting down.
        delay_ms: u64,
        /// True if an earlier stop request already scheduled the shutdown.
        already_scheduled: bool,
    },
}

/// Pool-level status record returned by `daemon.status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStatus {
    /// Number of free workers.
    pub available: usize,
    /// Total number of workers.
    pub poolsize: usize,
    /// Per-worker details in index order.
    pub workers: Vec<WorkerStatus>,
}

impl PoolStatus {
    /// Number of workers currently serving a session.
    pub fn in_use(&self) -> usize {
        self.workers.iter().filter(|w| w.in_use).count()
    }
}

/// Per-worker entry of a [`PoolStatus`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatus {
    /// Stable index assigned when the pool was built.
    pub index: usize,
    /// Whether the worker is bound to a live session.
    pub in_use: bool,
    /// Number of sessions the worker has served.
    pub usage_count: u64,
    /// Current session duration if in use, else the last session's duration.
    pub usage_duration_ms: u64,
    /// Profile (installation) identifier.
    pub profile_id: String,
}

/// Notice written to a client that arrived while every worker was busy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityExceeded {
    /// Always `capacity_exceeded`.
    pub error: String,
    /// Human-readable explanation.
    pub message: String,
    /// Pool size at the time of rejection.
    pub poolsize: usize,
}

impl CapacityExceeded {
    /// Machine-readable error tag.
    pub const TAG: &'static str = "capacity_exceeded";

    /// Creates the notice for a pool of the given size.
    pub fn new(poolsize: usize) -> Self {
        Self {
            error: Self::TAG.to_string(),
            message: format!("all {} workers are busy, try again later", poolsize),
            poolsize,
        }
    }
}
