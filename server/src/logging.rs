//! Structured logging initialization.
//!
//! The RUST_LOG environment variable takes precedence over the level in the
//! configuration file.

use tracing_subscriber::{EnvFilter, fmt};

use crate::config::{LogFormat, LoggingConfig};

/// Initialize the logging subsystem. Call once at startup.
pub fn init(config: &LoggingConfig) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(&config.level)
    };

    let builder = fmt().with_env_filter(filter).with_thread_names(true);
    match (config.format, config.timestamps) {
        (LogFormat::Compact, true) => builder.compact().init(),
        (LogFormat::Compact, false) => builder.compact().without_time().init(),
        (LogFormat::Json, true) => builder.json().init(),
        (LogFormat::Json, false) => builder.json().without_time().init(),
    }
}
