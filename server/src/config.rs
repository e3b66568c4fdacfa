//! Server configuration.
//!
//! Loaded from a TOML file. The RUST_LOG environment variable overrides the
//! configured log level (see [`crate::logging`]).

use std::net::SocketAddr;
use std::path::Path;

use serde::Deserialize;

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    /// Client connection tunables (see [`crate::tunables::Tunables`]).
    #[serde(default)]
    pub client: ClientConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    /// Number of reactor worker threads.
    pub fn threads(&self) -> usize {
        self.server.worker_threads.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Listener and thread-pool settings.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Address the client listener binds. Every reactor worker binds it
    /// with SO_REUSEPORT so the kernel spreads accepted connections.
    #[serde(default = "default_address")]
    pub address: SocketAddr,

    #[serde(default = "default_backlog")]
    pub backlog: u32,

    /// Reactor worker threads (default: number of CPUs).
    pub worker_threads: Option<usize>,

    /// Request executor threads.
    #[serde(default = "default_executor_threads")]
    pub executor_threads: usize,

    /// How long shutdown waits for connections to drain.
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            address: default_address(),
            backlog: default_backlog(),
            worker_threads: None,
            executor_threads: default_executor_threads(),
            drain_timeout_secs: default_drain_timeout(),
        }
    }
}

fn default_address() -> SocketAddr {
    "0.0.0.0:20000".parse().unwrap()
}

fn default_backlog() -> u32 {
    1024
}

fn default_executor_threads() -> usize {
    2
}

fn default_drain_timeout() -> u64 {
    10
}

/// Client connection tunables. Absent fields keep the built-in defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    /// Max requests a connection may have in flight. Non-positive values
    /// are ignored; absent defaults to 16 when multiple workers are
    /// configured before the reactor starts.
    pub max_pending_ops: Option<i64>,

    /// Input-buffer bytes at which read-ahead is suspended.
    pub max_pending_bytes: Option<usize>,

    /// Read-ahead ceiling in bytes (floor 256).
    pub max_read_ahead: Option<usize>,

    /// Idle seconds before close; non-positive disables the timer.
    pub inactivity_timeout: Option<i64>,

    /// Queued output bytes at which request extraction pauses.
    pub max_write_behind: Option<usize>,

    pub in_buf_compaction_threshold: Option<usize>,
    pub out_buf_compaction_threshold: Option<usize>,

    /// Retain raw request headers and emit audit records.
    pub audit_logging: Option<bool>,

    /// Byte cap on the headers rendered into each audit record.
    pub audit_max_record_bytes: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level filter when RUST_LOG is unset (e.g. "info", "server=debug").
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,

    /// Include timestamps in log output.
    #[serde(default = "default_true")]
    pub timestamps: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            format: LogFormat::default(),
            timestamps: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.address, default_address());
        assert_eq!(config.server.executor_threads, 2);
        assert!(config.client.max_pending_ops.is_none());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn full_config_parses() {
        let text = r#"
            [server]
            address = "127.0.0.1:21000"
            backlog = 128
            worker_threads = 2
            executor_threads = 4
            drain_timeout_secs = 3

            [client]
            max_pending_ops = 16
            max_pending_bytes = 4096
            max_read_ahead = 8192
            inactivity_timeout = 300
            max_write_behind = 4096
            in_buf_compaction_threshold = 1024
            out_buf_compaction_threshold = 8192
            audit_logging = true
            audit_max_record_bytes = 512

            [logging]
            level = "debug"
            format = "json"
            timestamps = false
        "#;
        let config: Config = toml::from_str(text).unwrap();
        assert_eq!(config.server.worker_threads, Some(2));
        assert_eq!(config.client.max_pending_ops, Some(16));
        assert_eq!(config.client.audit_logging, Some(true));
        assert_eq!(config.logging.format, LogFormat::Json);
        assert!(!config.logging.timestamps);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(toml::from_str::<Config>("[server]\nbananas = 1\n").is_err());
    }
}
