//! # Workhorse Daemon Library
//!
//! A connection broker in front of a fixed pool of external worker
//! processes. Each accepted client is bridged to exactly one idle worker for
//! the life of its connection; when every worker is busy the client gets an
//! immediate capacity-exceeded reply instead of waiting.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                            Daemon                               │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌──────────────────┐   take/release   ┌──────────────────────┐ │
//! │  │ ConnectionBroker │ ───────────────▶ │      WorkerPool      │ │
//! │  └──────────────────┘                  │  Worker 0 .. N-1     │ │
//! │           │                            └──────────────────────┘ │
//! │           ▼                                       ▲              │
//! │  ┌──────────────────┐   session end    ┌──────────────────────┐ │
//! │  │   ProxyBridge    │ ───────────────▶ │ WorkerReleaseListener│ │
//! │  └──────────────────┘                  └──────────────────────┘ │
//! │                                                                  │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │       Admin channel (daemon.status / daemon.stop)          │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use daemon::{Config, Daemon};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!
//!     let daemon = Daemon::new(config)?;
//!     let bound = daemon.start().await?;
//!     println!("listening on {}", bound.listen);
//!
//!     // Serves until daemon.stop or request_shutdown().
//!     daemon.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading, defaults and validation
//! - [`worker`]: Worker processes and the pool that owns them
//! - [`broker`]: The primary accept loop
//! - [`bridge`]: Client-to-worker relays
//! - [`session`]: Session end notifications and worker release
//! - [`admin`]: Admin channel server and client
//! - [`lifecycle`]: Startup, serving and shutdown

pub mod admin;
pub mod bridge;
pub mod broker;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod pidfile;
pub mod session;
pub mod transport;
pub mod worker;

// Re-export protocol for convenience
pub use protocol;

pub use config::Config;
pub use error::DaemonError;

pub use admin::{AdminClient, AdminError, StopAck};
pub use bridge::{Bridge, BridgeError, BridgeHandle, ProxyBridge};
pub use broker::{ConnectionBroker, Dispatch};
pub use lifecycle::{BoundEndpoints, Daemon, DaemonEvent, DaemonState, ShutdownScheduler};
pub use session::{SessionEnd, SessionId, SessionListener, WorkerReleaseListener};
pub use transport::{Connection, Endpoint, Listener};
pub use worker::{
    CommandLauncher, Launcher, PoolError, PoolPhase, ReadySignal, Worker, WorkerError,
    WorkerPool, WorkerProcess, WorkerSpec,
};
