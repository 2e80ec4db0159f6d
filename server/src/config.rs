//! Configuration management for the server.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host address
    pub host: String,
    /// Server port
    pub port: u16,
    /// Session group document to run
    pub group_config_path: PathBuf,
    /// Runtime snapshot file; progress is not persisted when unset
    pub state_path: Option<PathBuf>,
    /// How long `stop` waits for sessions before giving up on them
    pub stop_timeout: Duration,
    pub monitor_interval: Duration,
    /// How often a session paused by a conflict re-checks it
    pub conflict_poll_interval: Duration,
    /// Operator token required by mutating endpoints
    pub auth_secret: Option<String>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());

        let port = env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let group_config_path = env::var("FERRY_GROUP_CONFIG")
            .map(PathBuf::from)
            .map_err(|_| ConfigError::MissingGroupConfig)?;

        let state_path = env::var("FERRY_STATE_PATH").ok().map(PathBuf::from);

        let stop_timeout = Duration::from_secs(number("FERRY_STOP_TIMEOUT_SECS", 30)?);
        let monitor_interval = Duration::from_millis(number("FERRY_MONITOR_INTERVAL_MS", 5000)?);
        let conflict_poll_interval =
            Duration::from_millis(number("FERRY_CONFLICT_POLL_MS", 3000)?);

        let auth_secret = env::var("AUTH_SECRET").ok().filter(|s| !s.is_empty());

        Ok(Self {
            host,
            port,
            group_config_path,
            state_path,
            stop_timeout,
            monitor_interval,
            conflict_poll_interval,
            auth_secret,
        })
    }

    /// Configuration for running a group in-process, e.g. from tests.
    pub fn for_group(group_config_path: impl Into<PathBuf>) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            group_config_path: group_config_path.into(),
            state_path: None,
            stop_timeout: Duration::from_secs(30),
            monitor_interval: Duration::from_millis(5000),
            conflict_poll_interval: Duration::from_millis(3000),
            auth_secret: None,
        }
    }
}

fn number(key: &'static str, default: u64) -> Result<u64, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidNumber(key)),
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("FERRY_GROUP_CONFIG environment variable is required")]
    MissingGroupConfig,

    #[error("Invalid PORT value")]
    InvalidPort,

    #[error("{0} must be a non-negative integer")]
    InvalidNumber(&'static str),
}
