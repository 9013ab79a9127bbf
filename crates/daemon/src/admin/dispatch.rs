//! Admin command dispatch by name.

use std::sync::Arc;
use std::time::Duration;

use protocol::{AdminRequest, AdminResponse, CMD_STATUS, CMD_STOP};
use tracing::{error, info};

use crate::lifecycle::ShutdownScheduler;
use crate::worker::WorkerPool;

/// Maps admin command names to actions.
pub struct CommandDispatcher {
    pool: Arc<WorkerPool>,
    scheduler: Arc<ShutdownScheduler>,
    stop_delay: Duration,
}

impl CommandDispatcher {
    pub fn new(pool: Arc<WorkerPool>, scheduler: Arc<ShutdownScheduler>, stop_delay: Duration) -> Self {
        Self {
            pool,
            scheduler,
            stop_delay,
        }
    }

    /// Run one command.
    ///
    /// Returns `None` for unknown commands, which get no response.
    pub fn dispatch(&self, request: &AdminRequest) -> Option<AdminResponse> {
        match request.command.as_str() {
            CMD_STATUS => Some(AdminResponse::Status(self.pool.snapshot())),
            CMD_STOP => {
                let scheduled = self.scheduler.schedule(self.stop_delay);
                let delay_ms = u64::try_from(self.stop_delay.as_millis()).unwrap_or(u64::MAX);
                if scheduled {
                    info!(delay_ms, "Shutdown requested over admin channel");
                } else {
                    info!("Shutdown already scheduled, ignoring repeated stop");
                }
                Some(AdminResponse::Stopping {
                    delay_ms,
                    already_scheduled: !scheduled,
                })
            }
            other => {
                error!(command = %other, "Unknown admin command");
                None
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests(token: tokio_util::sync::CancellationToken) -> Self {
        use crate::config::WorkerConfig;
        use crate::worker::CommandLauncher;

        let launcher = Arc::new(CommandLauncher::new(&WorkerConfig::default()));
        Self::new(
            Arc::new(WorkerPool::new(launcher, Duration::ZERO)),
            Arc::new(ShutdownScheduler::new(token)),
            Duration::ZERO,
        )
    }
}
