//! Configuration management for the workhorse daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/workhorse/config.toml`.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transport::Endpoint;

/// Default primary endpoint.
pub const DEFAULT_LISTEN: &str = "tcp://127.0.0.1:2002";

/// Default admin endpoint.
pub const DEFAULT_ADMIN: &str = "tcp://127.0.0.1:2003";

/// Upper bound on the number of workers in one pool.
pub const MAX_WORKERS: usize = 64;

/// Upper bound on the admin stop grace window.
const MAX_SHUTDOWN_DELAY_MS: u64 = 3_600_000;

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("workers.profiles must list at least one profile")]
    NoWorkers,

    #[error("workers.profiles lists {0} profiles, the maximum is {MAX_WORKERS}")]
    TooManyWorkers(usize),

    #[error("duplicate worker profile: {0}")]
    DuplicateProfile(String),

    #[error("worker profile must be a single path component without '/', '..' or whitespace: {0:?}")]
    InvalidProfile(String),

    #[error("invalid {field} endpoint {value:?}: {reason}")]
    InvalidEndpoint {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("admin endpoint must differ from the listen endpoint: {0}")]
    AdminSameAsListen(String),

    #[error("shutdown_delay_ms must be at most {MAX_SHUTDOWN_DELAY_MS}, got {0}")]
    InvalidShutdownDelay(u64),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("base_port {base_port} leaves no room for {workers} workers below port 65536")]
    PortRangeOverflow { base_port: u16, workers: usize },

    #[error("ready_poll_interval_ms must be greater than 0")]
    InvalidPollInterval,

    #[error("worker command not found: {0}")]
    InvalidCommand(String),
}

/// Main configuration structure for the workhorse daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// Endpoint configuration for the broker and the admin channel.
    pub broker: BrokerConfig,

    /// Worker process configuration.
    pub workers: WorkerConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory for the pidfile and the per-worker profile directories.
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Optional file that receives a copy of the log output.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

/// Broker endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BrokerConfig {
    /// Primary endpoint that clients connect to.
    pub listen: String,

    /// Admin endpoint. `None` disables the admin channel; in TOML that is
    /// written `admin = ""` or `admin = "none"`.
    #[serde(with = "optional_endpoint")]
    pub admin: Option<String>,

    /// Delay between a `daemon.stop` request and the actual shutdown.
    pub shutdown_delay_ms: u64,
}

/// Worker process configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkerConfig {
    /// Program launched for each worker.
    pub command: String,

    /// Arguments; `{index}`, `{profile}`, `{profile_dir}`, `{host}` and
    /// `{port}` are substituted per worker.
    pub args: Vec<String>,

    /// One profile id per worker. The pool size is the length of this list.
    pub profiles: Vec<String>,

    /// Host the workers accept bridge connections on.
    pub host: String,

    /// Worker `i` listens on `base_port + i`.
    pub base_port: u16,

    /// How often the readiness probe tries to reach a starting worker.
    pub ready_poll_interval_ms: u64,

    /// Grace period between SIGTERM and SIGKILL when terminating a worker.
    pub terminate_grace_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
            log_file: None,
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            admin: Some(DEFAULT_ADMIN.to_string()),
            shutdown_delay_ms: 1000,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            command: "soffice".to_string(),
            args: vec![
                "--headless".to_string(),
                "--invisible".to_string(),
                "--nologo".to_string(),
                "--norestore".to_string(),
                "-env:UserInstallation=file://{profile_dir}".to_string(),
                "--accept=socket,host={host},port={port};urp;".to_string(),
            ],
            profiles: vec!["worker-0".to_string(), "worker-1".to_string()],
            host: "127.0.0.1".to_string(),
            base_port: 8100,
            ready_poll_interval_ms: 250,
            terminate_grace_ms: 2000,
        }
    }
}

impl BrokerConfig {
    /// Grace window applied to `daemon.stop`.
    pub fn shutdown_delay(&self) -> Duration {
        Duration::from_millis(self.shutdown_delay_ms)
    }

    /// Parsed primary endpoint.
    pub fn listen_endpoint(&self) -> Result<Endpoint, ConfigError> {
        parse_endpoint("listen", &self.listen)
    }

    /// Parsed admin endpoint, if configured.
    pub fn admin_endpoint(&self) -> Result<Option<Endpoint>, ConfigError> {
        self.admin
            .as_deref()
            .map(|value| parse_endpoint("admin", value))
            .transpose()
    }
}

impl WorkerConfig {
    /// Bridge port of the worker at `index`.
    pub fn port_for(&self, index: usize) -> u16 {
        // Range checked by `Config::validate`.
        self.base_port.saturating_add(index as u16)
    }

    /// Probe interval as a duration.
    pub fn ready_poll_interval(&self) -> Duration {
        Duration::from_millis(self.ready_poll_interval_ms)
    }

    /// Terminate grace period as a duration.
    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("workhorse")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("workhorse")
}

fn parse_endpoint(field: &'static str, value: &str) -> Result<Endpoint, ConfigError> {
    value
        .parse::<Endpoint>()
        .map_err(|e| ConfigError::InvalidEndpoint {
            field,
            value: value.to_string(),
            reason: e.to_string(),
        })
}

/// Interpret an endpoint setting where an empty value or `none` means off.
fn endpoint_setting(value: &str) -> Option<String> {
    let value = value.trim();
    if value.is_empty() || value.eq_ignore_ascii_case("none") {
        None
    } else {
        Some(value.to_string())
    }
}

/// Serde for an endpoint that can be switched off.
///
/// A missing key keeps the default; an explicit off value maps to `None` and
/// `None` is written back as `""` so it survives a round trip.
mod optional_endpoint {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<String>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(value.as_deref().unwrap_or(""))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
        let value = String::deserialize(deserializer)?;
        Ok(super::endpoint_setting(&value))
    }
}

fn is_valid_profile(profile: &str) -> bool {
    !profile.is_empty()
        && profile != "."
        && profile != ".."
        && !profile
            .chars()
            .any(|c| c == '/' || c == '\\' || c.is_whitespace() || c.is_control())
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - WORKHORSE_LISTEN: Override the primary endpoint
    /// - WORKHORSE_ADMIN: Override the admin endpoint (`none` disables it)
    /// - WORKHORSE_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(listen) = std::env::var("WORKHORSE_LISTEN") {
            if !listen.is_empty() {
                tracing::info!("Overriding broker.listen from environment: {}", listen);
                self.broker.listen = listen;
            }
        }

        if let Ok(admin) = std::env::var("WORKHORSE_ADMIN") {
            if !admin.is_empty() {
                tracing::info!("Overriding broker.admin from environment: {}", admin);
                self.broker.admin = endpoint_setting(&admin);
            }
        }

        if let Ok(level) = std::env::var("WORKHORSE_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.daemon.log_level = level;
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// The daemon refuses to start on any error; there is no degraded mode.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_without_command()?;

        // Validate the worker command resolves
        let command = Path::new(&self.workers.command);
        if command.is_absolute() {
            if !command.exists() {
                return Err(ConfigError::InvalidCommand(self.workers.command.clone()));
            }
        } else if which::which(&self.workers.command).is_err() {
            return Err(ConfigError::InvalidCommand(self.workers.command.clone()));
        }

        Ok(())
    }

    /// Validation that does not touch the filesystem or `PATH`.
    ///
    /// Used directly when the workers are launched by something other than
    /// the configured command.
    pub fn validate_without_command(&self) -> Result<(), ConfigError> {
        let profiles = &self.workers.profiles;
        if profiles.is_empty() {
            return Err(ConfigError::NoWorkers);
        }
        if profiles.len() > MAX_WORKERS {
            return Err(ConfigError::TooManyWorkers(profiles.len()));
        }

        let mut seen = HashSet::new();
        for profile in profiles {
            if !is_valid_profile(profile) {
                return Err(ConfigError::InvalidProfile(profile.clone()));
            }
            if !seen.insert(profile.as_str()) {
                return Err(ConfigError::DuplicateProfile(profile.clone()));
            }
        }

        if usize::from(self.workers.base_port) + profiles.len() > usize::from(u16::MAX) + 1 {
            return Err(ConfigError::PortRangeOverflow {
                base_port: self.workers.base_port,
                workers: profiles.len(),
            });
        }

        if self.workers.ready_poll_interval_ms == 0 {
            return Err(ConfigError::InvalidPollInterval);
        }

        let listen = self.broker.listen_endpoint()?;
        if let Some(admin) = self.broker.admin_endpoint()? {
            // Port 0 binds a fresh ephemeral port for each endpoint.
            if admin == listen && admin.port() != Some(0) {
                return Err(ConfigError::AdminSameAsListen(admin.to_string()));
            }
        }

        if self.broker.shutdown_delay_ms > MAX_SHUTDOWN_DELAY_MS {
            return Err(ConfigError::InvalidShutdownDelay(
                self.broker.shutdown_delay_ms,
            ));
        }

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        Ok(())
    }

    /// Directory holding the per-worker profile directories.
    pub fn workers_dir(&self) -> PathBuf {
        self.daemon.data_dir.join("workers")
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
