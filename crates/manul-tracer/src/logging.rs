//! Subscriber setup for binaries
//!
//! The library itself only emits `tracing` events under the span each
//! transport was built with; installing a subscriber is left to whoever owns
//! the process. `manul` calls [`init`] once at startup.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::LoggingConfig;
use crate::error::{Error, Result};

/// Install the global subscriber described by `config`.
///
/// `RUST_LOG` takes precedence over `config.level`. When a log directory is
/// configured the returned guard must be kept alive for buffered lines to be
/// flushed.
pub fn init(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| Error::config(format!("invalid log level '{}': {e}", config.level)))?;

    let json = match config.format.as_str() {
        "json" => true,
        "pretty" | "text" => false,
        other => return Err(Error::config(format!("unknown log format '{other}'"))),
    };

    let stderr_layer = if json {
        fmt::layer().json().with_writer(std::io::stderr).boxed()
    } else {
        fmt::layer().with_writer(std::io::stderr).boxed()
    };

    let (file_layer, guard) = match &config.directory {
        Some(directory) => {
            let appender = tracing_appender::rolling::daily(directory, "manul.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().json().with_ansi(false).with_writer(writer).boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| Error::internal(format!("failed to install subscriber: {e}")))?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_unknown_format() {
        let config = LoggingConfig {
            format: "xml".to_string(),
            ..LoggingConfig::default()
        };
        assert!(matches!(init(&config), Err(Error::Config(_))));
    }
}
