//! Launching and stopping worker processes.
//!
//! [`Launcher`] is the seam between the pool and the operating system: the
//! daemon uses [`CommandLauncher`], tests substitute in-process fakes.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{ReadySignal, WorkerError};
use crate::bridge::BridgeHandle;
use crate::config::WorkerConfig;
use crate::transport::{self, Endpoint};

/// Future returned by [`WorkerProcess::terminate`].
pub type TerminateFuture = Pin<Box<dyn Future<Output = Result<(), WorkerError>> + Send>>;

/// Everything a launcher needs to start one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSpec {
    /// Position in the pool. Assigned by [`super::WorkerPool::append`].
    pub index: usize,
    /// Profile (installation) identifier, unique within the pool.
    pub profile_id: String,
    /// Process working directory.
    pub working_dir: PathBuf,
    /// Endpoint the worker will accept bridge connections on.
    pub endpoint: Endpoint,
}

impl WorkerSpec {
    pub fn new(profile_id: impl Into<String>, working_dir: PathBuf, endpoint: Endpoint) -> Self {
        Self {
            index: 0,
            profile_id: profile_id.into(),
            working_dir,
            endpoint,
        }
    }
}

/// Starts worker processes.
pub trait Launcher: Send + Sync {
    /// Start the worker described by `spec` without waiting for it to be ready.
    ///
    /// The implementation fires `ready` once the worker accepts bridge
    /// connections. Errors are fatal to daemon startup.
    fn launch(
        &self,
        spec: &WorkerSpec,
        ready: ReadySignal,
    ) -> Result<Box<dyn WorkerProcess>, WorkerError>;
}

/// A running worker process.
pub trait WorkerProcess: Send + Sync {
    /// OS process id, if there is one.
    fn pid(&self) -> Option<u32>;

    /// Stop the process, escalating after `grace`.
    fn terminate(self: Box<Self>, grace: Duration) -> TerminateFuture;
}

/// Launches the configured worker command once per profile.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    command: String,
    args: Vec<String>,
    poll_interval: Duration,
}

impl CommandLauncher {
    pub fn new(config: &WorkerConfig) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            poll_interval: config.ready_poll_interval(),
        }
    }

    /// Substitute per-worker placeholders in the configured arguments.
    pub fn expand_args(&self, spec: &WorkerSpec) -> Vec<String> {
        let index = spec.index.to_string();
        let profile_dir = spec.working_dir.display().to_string();
        let host = spec.endpoint.host().unwrap_or_default();
        let port = spec
            .endpoint
            .port()
            .map(|p| p.to_string())
            .unwrap_or_default();

        self.args
            .iter()
            .map(|arg| {
                arg.replace("{index}", &index)
                    .replace("{profile_dir}", &profile_dir)
                    .replace("{profile}", &spec.profile_id)
                    .replace("{host}", host)
                    .replace("{port}", &port)
            })
            .collect()
    }
}

impl Launcher for CommandLauncher {
    fn launch(
        &self,
        spec: &WorkerSpec,
        ready: ReadySignal,
    ) -> Result<Box<dyn WorkerProcess>, WorkerError> {
        std::fs::create_dir_all(&spec.working_dir).map_err(|source| WorkerError::WorkingDir {
            path: spec.working_dir.clone(),
            source,
        })?;

        let args = self.expand_args(spec);
        debug!(worker = spec.index, command = %self.command, ?args, "Spawning worker");

        let mut child = Command::new(&self.command)
            .args(&args)
            .current_dir(&spec.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| WorkerError::Spawn {
                profile: spec.profile_id.clone(),
                source,
            })?;

        let pid = child.id();
        info!(worker = spec.index, profile = %spec.profile_id, ?pid, "Worker process started");

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(log_output(spec.index, "stdout", stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(log_output(spec.index, "stderr", stderr));
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let terminating = Arc::new(AtomicBool::new(false));
        tokio::spawn(supervise(
            spec.index,
            child,
            exit_tx,
            Arc::clone(&terminating),
        ));

        let probe = tokio::spawn(probe_ready(
            spec.index,
            spec.endpoint.clone(),
            self.poll_interval,
            exit_rx.clone(),
            ready,
        ));

        Ok(Box::new(ChildProcess {
            index: spec.index,
            pid,
            exit_rx,
            terminating,
            probe,
        }))
    }
}

/// Forward one output stream of a worker into the log.
async fn log_output<R>(index: usize, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(worker = index, stream, "{}", line);
    }
}

/// Own the child until it exits and publish its exit status.
async fn supervise(
    index: usize,
    mut child: Child,
    exit_tx: watch::Sender<Option<ExitStatus>>,
    terminating: Arc<AtomicBool>,
) {
    match child.wait().await {
        Ok(status) => {
            if terminating.load(Ordering::Acquire) {
                debug!(worker = index, %status, "Worker process exited");
            } else {
                warn!(worker = index, %status, "Worker process exited unexpectedly");
            }
            exit_tx.send_replace(Some(status));
        }
        Err(e) => {
            error!(worker = index, "Failed to wait for worker process: {}", e);
        }
    }
}

/// Poll the worker endpoint until it accepts a connection.
async fn probe_ready(
    index: usize,
    endpoint: Endpoint,
    interval: Duration,
    mut exit_rx: watch::Receiver<Option<ExitStatus>>,
    ready: ReadySignal,
) {
    loop {
        if transport::connect(&endpoint).await.is_ok() {
            ready.fire(BridgeHandle {
                worker_index: index,
                endpoint,
            });
            return;
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            changed = exit_rx.changed() => {
                if changed.is_err() || exit_rx.borrow().is_some() {
                    error!(worker = index, endpoint = %endpoint, "Worker exited before becoming ready");
                    return;
                }
            }
        }
    }
}

struct ChildProcess {
    index: usize,
    pid: Option<u32>,
    exit_rx: watch::Receiver<Option<ExitStatus>>,
    terminating: Arc<AtomicBool>,
    probe: JoinHandle<()>,
}

impl ChildProcess {
    fn signal(pid: u32, signal: Signal) -> Result<(), WorkerError> {
        match kill(Pid::from_raw(pid as i32), signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(source) => Err(WorkerError::Signal { pid, source }),
        }
    }
}

impl WorkerProcess for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn terminate(self: Box<Self>, grace: Duration) -> TerminateFuture {
        Box::pin(async move {
            let ChildProcess {
                index,
                pid,
                mut exit_rx,
                terminating,
                probe,
            } = *self;

            probe.abort();
            terminating.store(true, Ordering::Release);

            let Some(pid) = pid else {
                return Ok(());
            };
            if exit_rx.borrow().is_some() {
                return Ok(());
            }

            Self::signal(pid, Signal::SIGTERM)?;
            // The borrowed status must not be held across the next await.
            let timed_out = tokio::time::timeout(grace, exit_rx.wait_for(|s| s.is_some()))
                .await
                .is_err();
            if timed_out {
                warn!(worker = index, pid, "Worker ignored SIGTERM, sending SIGKILL");
                Self::signal(pid, Signal::SIGKILL)?;
                if exit_rx.wait_for(|s| s.is_some()).await.is_err() {
                    debug!(worker = index, pid, "Exit watcher gone before SIGKILL was observed");
                }
            }

            debug!(worker = index, pid, "Worker process stopped");
            Ok(())
        })
    }
}
