//! Tracing subscriber setup for binaries.
//!
//! The library only emits `tracing` events; installing a subscriber is the
//! binary's job. `RUST_LOG` wins over the configured level when set.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::{LogConfig, LogFormat};
use crate::error::{Error, Result};

/// Installs the global subscriber described by `config`.
///
/// # Errors
///
/// `Error::Config` if the filter is invalid or a subscriber is already set.
pub fn init_logging(config: &LogConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.level.as_str()))
        .map_err(|e| Error::Config(format!("invalid log filter: {}", e)))?;

    let (console, json) = match config.format {
        LogFormat::Console => (Some(fmt::layer().with_target(true).with_thread_names(true)), None),
        LogFormat::Json => (None, Some(fmt::layer().json().with_target(true).with_thread_names(true))),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(json)
        .try_init()
        .map_err(|e| Error::Config(format!("logging already initialized: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogLevel;

    #[test]
    fn test_second_init_is_error() {
        let config = LogConfig {
            level: LogLevel::Debug,
            format: LogFormat::Json,
        };
        // The first call may race other tests in this binary; only the second
        // is guaranteed to fail.
        let _ = init_logging(&config);
        assert!(matches!(init_logging(&config), Err(Error::Config(_))));
    }
}
