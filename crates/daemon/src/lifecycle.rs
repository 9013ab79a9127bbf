//! Daemon lifecycle controller.
//!
//! `initializing → accepting → shutting-down → stopped`. [`Daemon::start`]
//! launches the workers, waits for them and binds the endpoints;
//! [`Daemon::run`] serves until shutdown is requested; [`Daemon::shutdown`]
//! is idempotent and safe to race from several tasks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::admin::{self, AdminServer, CommandDispatcher};
use crate::bridge::{Bridge, ProxyBridge};
use crate::broker::ConnectionBroker;
use crate::config::Config;
use crate::error::DaemonError;
use crate::pidfile::{self, PidFile};
use crate::transport::{Endpoint, Listener};
use crate::worker::{CommandLauncher, Launcher, WorkerPool, WorkerSpec};

/// Capacity of the event broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Daemon lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    /// Building the pool and binding endpoints.
    Initializing,
    /// Serving clients.
    Accepting,
    /// Shutdown in progress.
    ShuttingDown,
    /// Shutdown finished.
    Stopped,
}

/// Events emitted by the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonEvent {
    /// Lifecycle state changed.
    StateChanged(DaemonState),
    /// Every worker signalled readiness.
    WorkersReady { poolsize: usize },
    /// The primary endpoint is bound.
    Listening { endpoint: Endpoint },
}

/// Endpoints actually bound by [`Daemon::start`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundEndpoints {
    pub listen: Endpoint,
    pub admin: Option<Endpoint>,
}

/// One-shot delayed shutdown.
///
/// The first [`schedule`](Self::schedule) starts a timer that cancels the
/// shutdown token; later calls, or calls after the token is already
/// cancelled, change nothing.
pub struct ShutdownScheduler {
    token: CancellationToken,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl ShutdownScheduler {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            pending: Mutex::new(None),
        }
    }

    /// Schedule shutdown after `delay`. Returns `false` if already scheduled.
    pub fn schedule(&self, delay: Duration) -> bool {
        let mut pending = lock(&self.pending);
        if pending.is_some() || self.token.is_cancelled() {
            return false;
        }

        let token = self.token.clone();
        *pending = Some(tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    info!("Scheduled shutdown starting");
                    token.cancel();
                }
                _ = token.cancelled() => {}
            }
        }));
        true
    }

    /// Whether a delayed shutdown has been scheduled.
    pub fn is_scheduled(&self) -> bool {
        lock(&self.pending).is_some()
    }

    /// Drop a pending timer. Does not un-schedule: later calls still no-op.
    pub fn cancel(&self) {
        if let Some(pending) = lock(&self.pending).as_ref() {
            pending.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The daemon: worker pool, primary endpoint and admin channel.
pub struct Daemon {
    config: Config,
    pool: Arc<WorkerPool>,
    bridge: Arc<dyn Bridge>,
    state: RwLock<DaemonState>,
    shutdown_token: CancellationToken,
    scheduler: Arc<ShutdownScheduler>,
    started: AtomicBool,
    already_shutdown: AtomicBool,
    listener: Mutex<Option<Listener>>,
    admin_server: Mutex<Option<AdminServer>>,
    admin_task: Mutex<Option<JoinHandle<()>>>,
    pid_file: Mutex<Option<PidFile>>,
    event_tx: broadcast::Sender<DaemonEvent>,
}

impl Daemon {
    /// Create a daemon that launches the configured worker command.
    pub fn new(config: Config) -> Result<Self, DaemonError> {
        config.validate()?;
        let launcher = Arc::new(CommandLauncher::new(&config.workers));
        Self::with_components(config, launcher, Arc::new(ProxyBridge::new()))
    }

    /// Create a daemon with explicit launcher and bridge implementations.
    pub fn with_components(
        config: Config,
        launcher: Arc<dyn Launcher>,
        bridge: Arc<dyn Bridge>,
    ) -> Result<Self, DaemonError> {
        config.validate_without_command()?;

        let shutdown_token = CancellationToken::new();
        let pool = Arc::new(WorkerPool::new(launcher, config.workers.terminate_grace()));
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            config,
            pool,
            bridge,
            state: RwLock::new(DaemonState::Initializing),
            scheduler: Arc::new(ShutdownScheduler::new(shutdown_token.clone())),
            shutdown_token,
            started: AtomicBool::new(false),
            already_shutdown: AtomicBool::new(false),
            listener: Mutex::new(None),
            admin_server: Mutex::new(None),
            admin_task: Mutex::new(None),
            pid_file: Mutex::new(None),
            event_tx,
        })
    }

    /// Returns the current state.
    pub async fn state(&self) -> DaemonState {
        *self.state.read().await
    }

    /// Returns a receiver for daemon events.
    pub fn subscribe(&self) -> broadcast::Receiver<DaemonEvent> {
        self.event_tx.subscribe()
    }

    /// The worker pool.
    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// The effective configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the shutdown token for external tasks to observe shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Launch the workers, wait until all are ready, bind the endpoints and
    /// write the PID file.
    ///
    /// Any failure terminates the workers already started before returning.
    pub async fn start(&self) -> Result<BoundEndpoints, DaemonError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(DaemonError::AlreadyStarted);
        }

        let pid_path = pidfile::pid_file_path(&self.config.daemon.data_dir);
        if let Some(pid) = pidfile::read_running_pid(&pid_path) {
            return Err(DaemonError::AlreadyRunning(pid));
        }

        match self.initialize().await {
            Ok(bound) => {
                match PidFile::create(&pid_path) {
                    Ok(pid_file) => *lock(&self.pid_file) = Some(pid_file),
                    Err(e) => {
                        self.shutdown().await;
                        return Err(DaemonError::Io(e));
                    }
                }
                Ok(bound)
            }
            Err(e) => {
                self.shutdown().await;
                Err(e)
            }
        }
    }

    async fn initialize(&self) -> Result<BoundEndpoints, DaemonError> {
        let workers = &self.config.workers;
        let workers_dir = self.config.workers_dir();
        info!(poolsize = workers.profiles.len(), command = %workers.command, "Starting workers");

        for (index, profile) in workers.profiles.iter().enumerate() {
            let endpoint = Endpoint::Tcp(format!("{}:{}", workers.host, workers.port_for(index)));
            let spec = WorkerSpec::new(profile.clone(), workers_dir.join(profile), endpoint);
            self.pool.append(spec)?;
        }

        tokio::select! {
            ready = self.pool.wait_till_ready() => ready?,
            _ = self.shutdown_token.cancelled() => return Err(DaemonError::Interrupted),
        }
        self.emit_event(DaemonEvent::WorkersReady {
            poolsize: self.pool.size(),
        });

        self.bind().await
    }

    async fn bind(&self) -> Result<BoundEndpoints, DaemonError> {
        let listen = self.config.broker.listen_endpoint()?;
        let listener = Listener::bind(&listen)
            .await
            .map_err(|source| DaemonError::Bind {
                endpoint: listen.clone(),
                source,
            })?;
        let listen = listener.local_endpoint()?;

        let admin = match self.config.broker.admin_endpoint()? {
            Some(endpoint) => {
                let server = AdminServer::bind(&endpoint)
                    .await
                    .map_err(|source| DaemonError::Bind {
                        endpoint: endpoint.clone(),
                        source,
                    })?;
                let bound = server.local_endpoint()?;
                *lock(&self.admin_server) = Some(server);
                Some(bound)
            }
            None => None,
        };

        *lock(&self.listener) = Some(listener);
        info!(listen = %listen, admin = ?admin.as_ref().map(|e| e.to_string()), "Endpoints bound");
        self.emit_event(DaemonEvent::Listening {
            endpoint: listen.clone(),
        });

        Ok(BoundEndpoints { listen, admin })
    }

    /// Serve clients on the calling task until shutdown is requested, then
    /// shut down.
    pub async fn run(&self) -> Result<(), DaemonError> {
        let listener = lock(&self.listener).take().ok_or(DaemonError::NotStarted)?;
        if self.already_shutdown.load(Ordering::Acquire) {
            return Ok(());
        }
        self.set_state(DaemonState::Accepting).await;

        let admin_server = lock(&self.admin_server).take();
        if let Some(server) = admin_server {
            let dispatcher = Arc::new(CommandDispatcher::new(
                Arc::clone(&self.pool),
                Arc::clone(&self.scheduler),
                self.config.broker.shutdown_delay(),
            ));
            let task = tokio::spawn(admin::serve(
                server,
                dispatcher,
                self.shutdown_token.clone(),
            ));
            *lock(&self.admin_task) = Some(task);
        }

        let broker = ConnectionBroker::new(Arc::clone(&self.pool), Arc::clone(&self.bridge));
        broker.run(listener, self.shutdown_token.clone()).await;

        self.shutdown().await;
        Ok(())
    }

    /// Schedule shutdown after `delay`, as `daemon.stop` does.
    ///
    /// Returns `false` if a shutdown was already scheduled.
    pub fn request_stop(&self, delay: Duration) -> bool {
        self.scheduler.schedule(delay)
    }

    /// Ask the running daemon to shut down now.
    pub fn request_shutdown(&self) {
        info!("Shutdown requested");
        self.shutdown_token.cancel();
    }

    /// Stop accepting, terminate all workers, join the admin task.
    ///
    /// Only the first call does anything; concurrent and later calls return
    /// immediately.
    pub async fn shutdown(&self) {
        if self.already_shutdown.swap(true, Ordering::AcqRel) {
            debug!("Shutdown already in progress");
            return;
        }

        self.set_state(DaemonState::ShuttingDown).await;
        info!("Shutting down daemon...");

        self.shutdown_token.cancel();
        self.scheduler.cancel();
        drop(lock(&self.listener).take());
        drop(lock(&self.admin_server).take());

        self.pool.terminate().await;

        let admin_task = lock(&self.admin_task).take();
        if let Some(task) = admin_task {
            if let Err(e) = task.await {
                warn!("Admin channel task failed: {}", e);
            }
        }

        drop(lock(&self.pid_file).take());

        self.set_state(DaemonState::Stopped).await;
        info!("Daemon stopped");
    }

    async fn set_state(&self, next: DaemonState) {
        *self.state.write().await = next;
        self.emit_event(DaemonEvent::StateChanged(next));
    }

    fn emit_event(&self, event: DaemonEvent) {
        let _ = self.event_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::BridgeHandle;
    use crate::error::{EXIT_BIND, EXIT_CONFIG};
    use crate::worker::{PoolPhase, ReadySignal, TerminateFuture, WorkerError, WorkerProcess};
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    #[derive(Default)]
    struct CountingLauncher {
        terminated: Arc<AtomicUsize>,
    }

    struct CountingProcess(Arc<AtomicUsize>);

    impl WorkerProcess for CountingProcess {
        fn pid(&self) -> Option<u32> {
            None
        }

        fn terminate(self: Box<Self>, _grace: Duration) -> TerminateFuture {
            Box::pin(async move {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }
    }

    impl Launcher for CountingLauncher {
        fn launch(
            &self,
            spec: &WorkerSpec,
            ready: ReadySignal,
        ) -> Result<Box<dyn WorkerProcess>, WorkerError> {
            ready.fire(BridgeHandle {
                worker_index: spec.index,
                endpoint: spec.endpoint.clone(),
            });
            Ok(Box::new(CountingProcess(Arc::clone(&self.terminated))))
        }
    }

    fn test_config(temp_dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.daemon.data_dir = temp_dir.path().to_path_buf();
        config.broker.listen = "tcp://127.0.0.1:0".to_string();
        config.broker.admin = Some("tcp://127.0.0.1:0".to_string());
        config.broker.shutdown_delay_ms = 0;
        config.workers.profiles = vec!["a".to_string(), "b".to_string()];
        config
    }

    fn test_daemon(config: Config) -> (Daemon, Arc<AtomicUsize>) {
        let launcher = CountingLauncher::default();
        let terminated = Arc::clone(&launcher.terminated);
        let daemon =
            Daemon::with_components(config, Arc::new(launcher), Arc::new(ProxyBridge::new()))
                .unwrap();
        (daemon, terminated)
    }

    #[tokio::test]
    async fn test_scheduler_schedules_once() {
        let token = CancellationToken::new();
        let scheduler = ShutdownScheduler::new(token.clone());

        assert!(scheduler.schedule(Duration::from_millis(30)));
        assert!(!scheduler.schedule(Duration::ZERO));
        assert!(scheduler.is_scheduled());
        assert!(!token.is_cancelled());

        tokio::time::timeout(Duration::from_secs(1), token.cancelled())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_scheduler_noop_after_cancel() {
        let token = CancellationToken::new();
        let scheduler = ShutdownScheduler::new(token.clone());
        token.cancel();

        assert!(!scheduler.schedule(Duration::ZERO));
        assert!(!scheduler.is_scheduled());
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = test_config(&temp_dir);
        config.workers.profiles.clear();

        let err = Daemon::new(config).err().unwrap();
        assert_eq!(err.exit_code(), EXIT_CONFIG);
    }

    #[tokio::test]
    async fn test_start_binds_and_writes_pid_file() {
        let temp_dir = TempDir::new().unwrap();
        let (daemon, _) = test_daemon(test_config(&temp_dir));
        let mut events = daemon.subscribe();

        let bound = daemon.start().await.unwrap();
        assert_ne!(bound.listen.port(), Some(0));
        assert!(bound.admin.is_some());
        assert_eq!(daemon.state().await, DaemonState::Initializing);
        assert_eq!(daemon.pool().phase(), PoolPhase::Ready);
        assert!(pidfile::pid_file_path(temp_dir.path()).exists());

        assert_eq!(
            events.recv().await.unwrap(),
            DaemonEvent::WorkersReady { poolsize: 2 }
        );

        assert!(matches!(
            daemon.start().await,
            Err(DaemonError::AlreadyStarted)
        ));
        daemon.shutdown().await;
        assert!(!pidfile::pid_file_path(temp_dir.path()).exists());
    }

    #[tokio::test]
    async fn test_start_refuses_when_pid_file_is_live() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(
            pidfile::pid_file_path(temp_dir.path()),
            std::process::id().to_string(),
        )
        .unwrap();
        let (daemon, terminated) = test_daemon(test_config(&temp_dir));

        let result = daemon.start().await;
        assert!(matches!(result, Err(DaemonError::AlreadyRunning(pid)) if pid == std::process::id()));
        assert_eq!(terminated.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_bind_failure_terminates_workers() {
        let temp_dir = TempDir::new().unwrap();
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = test_config(&temp_dir);
        config.broker.listen = format!("tcp://{}", taken.local_addr().unwrap());
        let (daemon, terminated) = test_daemon(config);

        let err = daemon.start().await.err().unwrap();
        assert_eq!(err.exit_code(), EXIT_BIND);
        assert_eq!(terminated.load(Ordering::SeqCst), 2);
        assert_eq!(daemon.pool().phase(), PoolPhase::Terminated);
        assert_eq!(daemon.state().await, DaemonState::Stopped);
    }

    #[tokio::test]
    async fn test_run_before_start_fails() {
        let temp_dir = TempDir::new().unwrap();
        let (daemon, _) = test_daemon(test_config(&temp_dir));
        assert!(matches!(daemon.run().await, Err(DaemonError::NotStarted)));
    }

    #[tokio::test]
    async fn test_concurrent_shutdown_terminates_once() {
        let temp_dir = TempDir::new().unwrap();
        let (daemon, terminated) = test_daemon(test_config(&temp_dir));
        daemon.start().await.unwrap();

        tokio::join!(daemon.shutdown(), daemon.shutdown());
        daemon.shutdown().await;

        assert_eq!(terminated.load(Ordering::SeqCst), 2);
        assert_eq!(daemon.state().await, DaemonState::Stopped);
    }

    #[tokio::test]
    async fn test_request_shutdown_ends_run() {
        let temp_dir = TempDir::new().unwrap();
        let (daemon, terminated) = test_daemon(test_config(&temp_dir));
        let daemon = Arc::new(daemon);
        daemon.start().await.unwrap();

        let run = tokio::spawn({
            let daemon = Arc::clone(&daemon);
            async move { daemon.run().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(daemon.state().await, DaemonState::Accepting);

        daemon.request_shutdown();
        tokio::time::timeout(Duration::from_secs(2), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(terminated.load(Ordering::SeqCst), 2);
        assert_eq!(daemon.state().await, DaemonState::Stopped);
    }

    #[tokio::test]
    async fn test_request_stop_reports_repeat() {
        let temp_dir = TempDir::new().unwrap();
        let (daemon, _) = test_daemon(test_config(&temp_dir));

        assert!(daemon.request_stop(Duration::from_secs(60)));
        assert!(!daemon.request_stop(Duration::ZERO));
        daemon.shutdown().await;
    }
}
