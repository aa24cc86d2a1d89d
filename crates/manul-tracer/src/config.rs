//! Configuration management for Manul Tracer
//!
//! Every section has a usable default, so an empty file (or no file at all)
//! yields a working tracer that writes to a SQLite file in the platform data
//! directory. Values are layered: defaults, then an optional TOML file, then
//! `MANUL__SECTION__KEY` environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;

/// Environment variable prefix for overrides (`MANUL__DATABASE__URL=...`)
pub const ENV_PREFIX: &str = "MANUL";

/// Main configuration struct
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Session and identity options for the tracer
    pub tracer: TracerConfig,

    /// Options for the underlying HTTP client
    pub http: HttpClientConfig,

    /// Database configuration
    pub database: DatabaseConfig,

    /// Collector (write pipeline) configuration
    pub collector: CollectorConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from defaults, an optional file and the environment.
    ///
    /// A `.env` file in the working directory is honoured if present.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Ok(env_file) = dotenvy::dotenv() {
            debug!(path = %env_file.display(), "Loaded .env file");
        }

        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?
            .try_deserialize()?;

        Ok(config)
    }
}

/// Tracer options: who is calling and whether traces are saved
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TracerConfig {
    /// Explicit session id; a UUID is generated when absent
    pub session_id: Option<String>,

    /// User the session belongs to
    pub user_id: Option<String>,

    /// Display name of the user
    pub username: Option<String>,

    /// Email of the user
    pub email: Option<String>,

    /// Whether finished traces are handed to the persistence sink at all
    pub auto_save: bool,

    /// Session type recorded with the session row
    pub session_type: String,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            session_id: None,
            user_id: None,
            username: None,
            email: None,
            auto_save: true,
            session_type: "tracer".to_string(),
        }
    }
}

impl TracerConfig {
    /// Whether any user identity was configured
    pub fn has_identity(&self) -> bool {
        self.user_id.is_some() || self.username.is_some() || self.email.is_some()
    }
}

/// HTTP client configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpClientConfig {
    /// Total request timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Option<Duration>,

    /// Connection establishment timeout
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Option<Duration>,

    /// Proxy URL applied to all requests
    pub proxy: Option<String>,

    /// Override for the client's user agent
    pub user_agent: Option<String>,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database URL (`sqlite://path/to/file.db` or `sqlite::memory:`)
    pub url: String,
    /// Maximum connections
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: format!("sqlite://{}", default_database_path().display()),
            max_connections: 5,
        }
    }
}

/// Default on-disk location of the trace database
pub fn default_database_path() -> PathBuf {
    directories::ProjectDirs::from("dev", "manul", "manul-tracer")
        .map(|dirs| dirs.data_dir().join("manul.db"))
        .unwrap_or_else(|| PathBuf::from("manul.db"))
}

/// Collector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Number of traces to batch before writing
    pub batch_size: usize,
    /// Maximum time a partial batch waits before being written
    #[serde(with = "humantime_serde")]
    pub flush_interval: Duration,
    /// Capacity of the queue between the transport and the writer
    pub buffer_size: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            flush_interval: Duration::from_secs(1),
            buffer_size: 1000,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Log format (json or pretty)
    pub format: String,
    /// Directory for daily-rolling log files, in addition to stderr
    pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            directory: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(config.tracer.auto_save);
        assert_eq!(config.tracer.session_type, "tracer");
        assert!(config.database.url.starts_with("sqlite://"));
        assert_eq!(config.collector.flush_interval, Duration::from_secs(1));
        assert_eq!(config.logging.format, "pretty");
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[tracer]
session_id = "s-1"
username = "manul"
auto_save = false

[http]
timeout = "30s"

[database]
url = "sqlite::memory:"

[collector]
flush_interval = "250ms"
"#
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.tracer.session_id.as_deref(), Some("s-1"));
        assert_eq!(config.tracer.username.as_deref(), Some("manul"));
        assert!(!config.tracer.auto_save);
        assert!(config.tracer.has_identity());
        assert_eq!(config.http.timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.database.url, "sqlite::memory:");
        assert_eq!(config.collector.flush_interval, Duration::from_millis(250));
        // untouched sections keep their defaults
        assert_eq!(config.collector.batch_size, 50);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let result = Config::load(Some(Path::new("/definitely/not/here.toml")));
        assert!(result.is_err());
    }
}
