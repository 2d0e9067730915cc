//! Runtime configuration.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Which fds get edge-triggered notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    LevelBoth,
    EdgeConn,
    EdgeListen,
    EdgeBoth,
}

impl TriggerMode {
    /// Decode the numeric startup flag; out-of-range values mean
    /// edge-triggered everywhere.
    pub fn from_index(value: u8) -> Self {
        match value {
            0 => TriggerMode::LevelBoth,
            1 => TriggerMode::EdgeConn,
            2 => TriggerMode::EdgeListen,
            _ => TriggerMode::EdgeBoth,
        }
    }

    pub fn listen_edge(&self) -> bool {
        matches!(self, TriggerMode::EdgeListen | TriggerMode::EdgeBoth)
    }

    pub fn conn_edge(&self) -> bool {
        matches!(self, TriggerMode::EdgeConn | TriggerMode::EdgeBoth)
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub trigger_mode: TriggerMode,
    /// Idle-connection timeout in milliseconds; 0 disables expiry.
    pub timeout_ms: u64,
    pub linger: bool,
    pub src_dir: PathBuf,
    pub max_connections: usize,
    pub worker_threads: usize,
}

impl ServerConfig {
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 1316,
            trigger_mode: TriggerMode::EdgeBoth,
            timeout_ms: 60_000,
            linger: false,
            src_dir: PathBuf::from("./resources"),
            max_connections: 65_536,
            worker_threads: 6,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl DbConfig {
    /// Read credentials from the environment, falling back to the
    /// defaults field by field.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: env::var("DB_HOST").unwrap_or(defaults.host),
            port: env::var("DB_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.port),
            user: env::var("DB_USER").unwrap_or(defaults.user),
            password: env::var("DB_PASSWORD").unwrap_or(defaults.password),
            database: env::var("DB_NAME").unwrap_or(defaults.database),
        }
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_owned(),
            port: 3306,
            user: "root".to_owned(),
            password: "root".to_owned(),
            database: "webserver".to_owned(),
        }
    }
}
