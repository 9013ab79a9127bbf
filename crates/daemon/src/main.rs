//! Workhorse Daemon
//!
//! Brokers client connections onto a fixed pool of worker processes.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use daemon::admin::AdminClient;
use daemon::config::Config;
use daemon::error::{DaemonError, EXIT_CONFIG, EXIT_FAILURE, EXIT_OK};
use daemon::lifecycle::{Daemon, DaemonEvent};
use daemon::pidfile;
use daemon::transport::Endpoint;
use protocol::PoolStatus;

/// Timeout for connecting to the admin endpoint.
const ADMIN_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between liveness polls while waiting for the daemon to exit.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Workhorse Daemon - brokers client connections onto a pool of workers.
#[derive(Parser, Debug)]
#[command(name = "workhorse-daemon")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for the daemon.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the daemon in the foreground
    Start,

    /// Stop the running daemon
    Stop {
        /// Seconds to wait for the daemon to exit after its grace window
        #[arg(long, default_value = "30")]
        timeout: u64,
    },

    /// Show worker pool status
    Status {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Validate the configuration and print the effective settings
    CheckConfig,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let _log_guard = match daemon::logging::init(&config.daemon, cli.verbose) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {:#}", e);
            return ExitCode::from(EXIT_FAILURE);
        }
    };

    match cli.command {
        Commands::Start => match run_daemon(config).await {
            Ok(()) => ExitCode::from(EXIT_OK),
            Err(e) => {
                tracing::error!("Daemon failed: {}", e);
                eprintln!("Error: {}", e);
                if let DaemonError::AlreadyRunning(_) = e {
                    eprintln!();
                    eprintln!("To stop the existing daemon, run:");
                    eprintln!("  workhorse-daemon stop");
                }
                ExitCode::from(e.exit_code())
            }
        },
        Commands::Stop { timeout } => match graceful_stop_daemon(&config, timeout).await {
            Ok(()) => {
                println!("Daemon stopped successfully");
                ExitCode::from(EXIT_OK)
            }
            Err(e) => {
                eprintln!("Failed to stop daemon: {:#}", e);
                ExitCode::from(EXIT_FAILURE)
            }
        },
        Commands::Status { json } => match query_pool_status(&config).await {
            Ok(status) => {
                if json {
                    match serde_json::to_string_pretty(&status) {
                        Ok(text) => println!("{}", text),
                        Err(e) => {
                            eprintln!("Failed to encode status: {}", e);
                            return ExitCode::from(EXIT_FAILURE);
                        }
                    }
                } else {
                    let pid = pidfile::read_running_pid(&pidfile::pid_file_path(
                        &config.daemon.data_dir,
                    ));
                    print_status_table(&status, pid);
                }
                ExitCode::from(EXIT_OK)
            }
            Err(e) => {
                eprintln!("Daemon is not running: {:#}", e);
                ExitCode::from(EXIT_FAILURE)
            }
        },
        Commands::CheckConfig => match config.validate() {
            Ok(()) => match config.to_toml() {
                Ok(text) => {
                    print!("{}", text);
                    ExitCode::from(EXIT_OK)
                }
                Err(e) => {
                    eprintln!("Failed to render configuration: {:#}", e);
                    ExitCode::from(EXIT_FAILURE)
                }
            },
            Err(e) => {
                eprintln!("Invalid configuration: {}", e);
                ExitCode::from(EXIT_CONFIG)
            }
        },
    }
}

/// Load the configuration file and apply environment overrides.
fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    config.apply_env_overrides();
    Ok(config)
}

/// Run the daemon until it is stopped over the admin channel or by a signal.
async fn run_daemon(config: Config) -> Result<(), DaemonError> {
    let daemon = Arc::new(Daemon::new(config)?);

    // Log lifecycle events
    let mut events = daemon.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                DaemonEvent::StateChanged(state) => {
                    tracing::info!("Daemon state: {:?}", state);
                }
                DaemonEvent::WorkersReady { poolsize } => {
                    tracing::debug!(poolsize, "Worker pool ready");
                }
                DaemonEvent::Listening { endpoint } => {
                    tracing::debug!(endpoint = %endpoint, "Primary endpoint listening");
                }
            }
        }
    });

    let signal_daemon = Arc::clone(&daemon);
    tokio::spawn(async move {
        match wait_for_shutdown_signal().await {
            Ok(()) => signal_daemon.request_shutdown(),
            Err(e) => tracing::error!("Failed to register signal handlers: {}", e),
        }
    });

    let bound = daemon.start().await?;
    tracing::info!(
        listen = %bound.listen,
        admin = %bound.admin.as_ref().map(ToString::to_string).unwrap_or_else(|| "disabled".to_string()),
        poolsize = daemon.pool().size(),
        "Workhorse daemon ready"
    );

    daemon.run().await
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
    Ok(())
}

fn admin_endpoint(config: &Config) -> anyhow::Result<Endpoint> {
    config
        .broker
        .admin_endpoint()?
        .ok_or_else(|| anyhow::anyhow!("No admin endpoint configured"))
}

/// Fetch the pool snapshot over the admin channel.
async fn query_pool_status(config: &Config) -> anyhow::Result<PoolStatus> {
    let endpoint = admin_endpoint(config)?;

    let mut client = AdminClient::connect_with_timeout(&endpoint, ADMIN_CONNECT_TIMEOUT)
        .await
        .map_err(|e| anyhow::anyhow!("Cannot connect to {}: {}", endpoint, e))?;

    client
        .status()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to query status: {}", e))
}

/// Request shutdown over the admin channel and wait for the daemon to exit.
///
/// The daemon is considered gone once its admin endpoint refuses connections.
async fn graceful_stop_daemon(config: &Config, timeout_secs: u64) -> anyhow::Result<()> {
    let endpoint = admin_endpoint(config)?;

    let mut client = AdminClient::connect_with_timeout(&endpoint, ADMIN_CONNECT_TIMEOUT)
        .await
        .map_err(|_| anyhow::anyhow!("Daemon is not running (cannot connect to {})", endpoint))?;

    println!("Sending shutdown request...");
    let ack = client
        .stop()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to send stop request: {}", e))?;
    drop(client);

    if ack.already_scheduled {
        println!("Shutdown was already scheduled, waiting for daemon to exit...");
    } else {
        println!(
            "Shutdown acknowledged, daemon exits in {}...",
            format_duration(ack.delay)
        );
    }

    let start = std::time::Instant::now();
    let timeout = ack.delay + Duration::from_secs(timeout_secs);

    while start.elapsed() < timeout {
        if AdminClient::connect_with_timeout(&endpoint, Duration::from_millis(100))
            .await
            .is_err()
        {
            return Ok(());
        }
        tokio::time::sleep(STOP_POLL_INTERVAL).await;
    }

    Err(anyhow::anyhow!(
        "Timeout waiting for daemon to exit ({}s)",
        timeout.as_secs()
    ))
}

/// Print the pool snapshot as an ASCII table.
fn print_status_table(status: &PoolStatus, pid: Option<u32>) {
    match pid {
        Some(pid) => println!("Daemon Status: running (PID: {})", pid),
        None => println!("Daemon Status: running"),
    }
    println!(
        "  Workers:   {} ({} available, {} in use)",
        status.poolsize,
        status.available,
        status.in_use()
    );
    println!();

    let profile_width = status
        .workers
        .iter()
        .map(|w| w.profile_id.len())
        .max()
        .unwrap_or(7)
        .max(7);

    println!(
        "{:>5}  {:<profile_width$}  {:<6}  {:>8}  {:>12}",
        "INDEX",
        "PROFILE",
        "STATE",
        "SESSIONS",
        "BUSY TIME",
        profile_width = profile_width
    );
    println!("{}", "-".repeat(profile_width + 41));

    for worker in &status.workers {
        println!(
            "{:>5}  {:<profile_width$}  {:<6}  {:>8}  {:>12}",
            worker.index,
            worker.profile_id,
            if worker.in_use { "busy" } else { "idle" },
            worker.usage_count,
            format_duration(Duration::from_millis(worker.usage_duration_ms)),
            profile_width = profile_width
        );
    }
}

/// Format a duration to human-readable format.
fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else if secs > 0 {
        format!("{}s", seconds)
    } else {
        format!("{}ms", duration.as_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_debug_assert() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_start_command() {
        let cli = Cli::try_parse_from(["workhorse-daemon", "start"]).unwrap();
        assert!(matches!(cli.command, Commands::Start));
        assert!(cli.config.is_none());
        assert!(!cli.verbose);
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "workhorse-daemon",
            "start",
            "--config",
            "/etc/workhorse.toml",
            "-v",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/etc/workhorse.toml")));
        assert!(cli.verbose);
    }

    #[test]
    fn test_stop_command() {
        let cli = Cli::try_parse_from(["workhorse-daemon", "stop"]).unwrap();
        match cli.command {
            Commands::Stop { timeout } => assert_eq!(timeout, 30),
            _ => panic!("Expected Stop command"),
        }
    }

    #[test]
    fn test_stop_with_timeout() {
        let cli = Cli::try_parse_from(["workhorse-daemon", "stop", "--timeout", "5"]).unwrap();
        match cli.command {
            Commands::Stop { timeout } => assert_eq!(timeout, 5),
            _ => panic!("Expected Stop command"),
        }
    }

    #[test]
    fn test_status_command() {
        let cli = Cli::try_parse_from(["workhorse-daemon", "status"]).unwrap();
        assert!(matches!(cli.command, Commands::Status { json: false }));

        let cli = Cli::try_parse_from(["workhorse-daemon", "status", "--json"]).unwrap();
        assert!(matches!(cli.command, Commands::Status { json: true }));
    }

    #[test]
    fn test_check_config_command() {
        let cli = Cli::try_parse_from(["workhorse-daemon", "check-config"]).unwrap();
        assert!(matches!(cli.command, Commands::CheckConfig));
    }

    #[test]
    fn test_unknown_command_rejected() {
        assert!(Cli::try_parse_from(["workhorse-daemon", "pair"]).is_err());
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(format_duration(Duration::from_secs(42)), "42s");
        assert_eq!(format_duration(Duration::from_secs(125)), "2m 5s");
        assert_eq!(format_duration(Duration::from_secs(3725)), "1h 2m 5s");
    }
}
