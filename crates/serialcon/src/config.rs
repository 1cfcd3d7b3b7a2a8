//! Configuration management for the serialcon daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/serialcon/config.toml`.

use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("port_range must be \"start:end\" with 1 <= start <= end <= 65535, got {0}")]
    InvalidPortRange(String),

    #[error("max_log_size must be greater than 0, got {0}")]
    InvalidMaxLogSize(u64),

    #[error("proxy_address must be an IP address, got {0:?}")]
    InvalidProxyAddress(String),

    #[error("endpoint_connect_timeout_secs must be between 1 and 600, got {0}")]
    InvalidConnectTimeout(u64),

    #[error("cleanup_interval_secs must be greater than 0, got {0}")]
    InvalidCleanupInterval(u64),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Default rotation threshold for console logs (512 KiB).
pub const DEFAULT_MAX_LOG_SIZE: u64 = 512 * 1024;

/// Default port range handed out to console bridges.
pub const DEFAULT_PORT_RANGE: &str = "10000:20000";

/// Main configuration structure for the serialcon daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// Serial console configuration.
    pub console: ConsoleConfig,

    /// Host layout: where instances and their endpoints live.
    pub host: HostConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Directory for daemon log files. Logs go to stderr only when unset.
    pub log_dir: Option<PathBuf>,

    /// Control socket path. Uses [`crate::ipc::get_socket_path`] when unset.
    pub socket_path: Option<PathBuf>,
}

/// Serial console configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConsoleConfig {
    /// Whether remote console access through a network bridge is enabled.
    pub enabled: bool,

    /// Address the network bridge listens on and reports to clients.
    pub proxy_address: String,

    /// Inclusive port range for bridge listeners, as "start:end".
    pub port_range: String,

    /// Console log size in bytes that triggers rotation.
    pub max_log_size: u64,

    /// How long to wait for a serial endpoint to accept a connection.
    pub endpoint_connect_timeout_secs: u64,

    /// How often dead sessions are reaped.
    pub cleanup_interval_secs: u64,
}

/// Host layout configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HostConfig {
    /// Directory holding one subdirectory per instance.
    pub instances_dir: PathBuf,

    /// Directory where the hypervisor exposes `<instance>.sock` serial endpoints.
    pub endpoint_dir: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: None,
            socket_path: None,
        }
    }
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            proxy_address: "127.0.0.1".to_string(),
            port_range: DEFAULT_PORT_RANGE.to_string(),
            max_log_size: DEFAULT_MAX_LOG_SIZE,
            endpoint_connect_timeout_secs: 30,
            cleanup_interval_secs: 60,
        }
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            instances_dir: default_data_dir().join("instances"),
            endpoint_dir: default_runtime_dir().join("serial"),
        }
    }
}

impl DaemonConfig {
    /// Returns the configured control socket path or the default one.
    pub fn control_socket(&self) -> PathBuf {
        self.socket_path
            .clone()
            .unwrap_or_else(crate::ipc::get_socket_path)
    }
}

impl ConsoleConfig {
    /// Returns the parsed port range, if valid.
    pub fn ports(&self) -> Option<(u16, u16)> {
        parse_port_range(&self.port_range)
    }

    /// Returns the endpoint connect timeout as a [`Duration`].
    pub fn endpoint_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.endpoint_connect_timeout_secs)
    }

    /// Returns the cleanup interval as a [`Duration`].
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

/// Parses an inclusive "start:end" port range.
pub fn parse_port_range(range: &str) -> Option<(u16, u16)> {
    let (start, end) = range.split_once(':')?;
    let start: u16 = start.trim().parse().ok()?;
    let end: u16 = end.trim().parse().ok()?;
    if start == 0 || start > end {
        return None;
    }
    Some((start, end))
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("serialcon")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("serialcon")
}

fn default_runtime_dir() -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("serialcon")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - SERIALCON_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - SERIALCON_CONSOLE_ENABLED: Enable or disable remote access (true/false/1/0)
    /// - SERIALCON_PROXY_ADDRESS: Override the bridge listen address
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("SERIALCON_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.daemon.log_level = level;
            }
        }

        if let Ok(enabled) = std::env::var("SERIALCON_CONSOLE_ENABLED") {
            match enabled.to_lowercase().as_str() {
                "1" | "true" | "yes" => self.console.enabled = true,
                "0" | "false" | "no" => self.console.enabled = false,
                "" => {}
                other => {
                    tracing::warn!("Ignoring invalid SERIALCON_CONSOLE_ENABLED value: {}", other)
                }
            }
        }

        if let Ok(address) = std::env::var("SERIALCON_PROXY_ADDRESS") {
            if !address.is_empty() {
                tracing::info!("Overriding proxy_address from environment: {}", address);
                self.console.proxy_address = address;
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.console.ports().is_none() {
            return Err(ConfigError::InvalidPortRange(
                self.console.port_range.clone(),
            ));
        }

        if self.console.max_log_size == 0 {
            return Err(ConfigError::InvalidMaxLogSize(self.console.max_log_size));
        }

        if self.console.proxy_address.parse::<IpAddr>().is_err() {
            return Err(ConfigError::InvalidProxyAddress(
                self.console.proxy_address.clone(),
            ));
        }

        let timeout = self.console.endpoint_connect_timeout_secs;
        if timeout == 0 || timeout > 600 {
            return Err(ConfigError::InvalidConnectTimeout(timeout));
        }

        if self.console.cleanup_interval_secs == 0 {
            return Err(ConfigError::InvalidCleanupInterval(
                self.console.cleanup_interval_secs,
            ));
        }

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        Ok(())
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

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
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
