//! Server configuration
//!
//! Loaded from a JSON file when one exists, otherwise from the
//! `RTC_SERVER_*` environment variables. A configuration that cannot be
//! loaded is fatal; `main` exits.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;

use crate::error::{RelayError, Result};

/// Default configuration file path, relative to the working directory
pub const DEFAULT_CONFIG_PATH: &str = "qrtc.json";

/// Server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// UDP port the QUIC endpoint binds
    pub quic_port: u16,
    /// TCP port the HTTP introspection endpoints bind
    pub http_port: u16,
    /// Authorization callout URI; every client is POSTed here once
    pub authorization_uri: String,
    /// Log verbosity
    pub log_level: LogLevel,
}

impl Config {
    /// Load configuration from `path` if the file exists, else from the
    /// environment.
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let raw = std::fs::read_to_string(path).map_err(|e| {
                RelayError::config(format!("failed to read {}: {}", path.display(), e))
            })?;
            serde_json::from_str(&raw).map_err(|e| {
                RelayError::config(format!("failed to parse {}: {}", path.display(), e))
            })
        } else {
            Self::from_env()
        }
    }

    /// Load configuration from the `RTC_SERVER_*` environment variables.
    /// Every variable is required.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            quic_port: parse_env("RTC_SERVER_QUIC_PORT")?,
            http_port: parse_env("RTC_SERVER_HTTP_PORT")?,
            authorization_uri: require_env("RTC_SERVER_AUTH_URI")?,
            log_level: parse_env("RTC_SERVER_LOG_LEVEL")?,
        })
    }
}

fn require_env(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| RelayError::config(format!("environment variable {} is not set", name)))
}

fn parse_env<T: FromStr>(name: &str) -> Result<T>
where
    T::Err: fmt::Display,
{
    require_env(name)?
        .parse()
        .map_err(|e| RelayError::config(format!("invalid {}: {}", name, e)))
}

/// Log verbosity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Critical,
    None,
}

impl LogLevel {
    /// Map onto a tracing level filter. `Critical` has no tracing
    /// equivalent and maps to `ERROR`; `None` disables logging.
    pub fn to_filter(self) -> LevelFilter {
        match self {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error | LogLevel::Critical => LevelFilter::ERROR,
            LogLevel::None => LevelFilter::OFF,
        }
    }
}

impl FromStr for LogLevel {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            "critical" => Ok(LogLevel::Critical),
            "none" => Ok(LogLevel::None),
            other => Err(RelayError::config(format!("unknown log level: {}", other))),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Critical => "critical",
            LogLevel::None => "none",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_from_json_file() {
        let dir = std::env::temp_dir().join("qrtc-config-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("qrtc.json");
        std::fs::write(
            &path,
            r#"{
                "quic_port": 4433,
                "http_port": 8080,
                "authorization_uri": "http://localhost:8080/auth/allow-all",
                "log_level": "debug"
            }"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.quic_port, 4433);
        assert_eq!(config.http_port, 8080);
        assert_eq!(
            config.authorization_uri,
            "http://localhost:8080/auth/allow-all"
        );
        assert_eq!(config.log_level, LogLevel::Debug);

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_malformed_json_is_config_error() {
        let dir = std::env::temp_dir().join("qrtc-config-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, RelayError::Config(_)), "got {:?}", err);

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_missing_env_var_is_config_error() {
        // A path that does not exist forces the environment fallback; the
        // variables are not set in the test environment.
        std::env::remove_var("RTC_SERVER_QUIC_PORT");
        let err = Config::load(Path::new("/nonexistent/qrtc.json")).unwrap_err();
        assert!(matches!(err, RelayError::Config(_)), "got {:?}", err);
    }

    #[test]
    fn test_log_level_parsing() {
        assert_eq!("trace".parse::<LogLevel>().unwrap(), LogLevel::Trace);
        assert_eq!("CRITICAL".parse::<LogLevel>().unwrap(), LogLevel::Critical);
        assert_eq!("none".parse::<LogLevel>().unwrap(), LogLevel::None);
        assert!("verbose".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_log_level_filter_mapping() {
        assert_eq!(LogLevel::Critical.to_filter(), LevelFilter::ERROR);
        assert_eq!(LogLevel::None.to_filter(), LevelFilter::OFF);
        assert_eq!(LogLevel::Info.to_filter(), LevelFilter::INFO);
    }

    #[test]
    fn test_config_roundtrips_through_json() {
        let config = Config {
            quic_port: 1,
            http_port: 2,
            authorization_uri: "http://auth.example/allow".to_string(),
            log_level: LogLevel::Warn,
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(config, back);
    }
}
