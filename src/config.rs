//! Configuration module for Upwatch.
//!
//! Loads configuration from environment variables with sensible defaults.

use crate::alerts::DEFAULT_NOTIFY_TIMEOUT;
use crate::monitor::DEFAULT_FAILURE_THRESHOLD;

use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Configuration error types.
#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {name}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// HTTP port for the web server (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "upwatch.db")
    pub db_path: String,
    /// Time between scheduler ticks (default: 60s)
    pub poll_interval: Duration,
    /// Latency above which an up service counts as degraded (default: 200ms)
    pub degraded_threshold_ms: i64,
    /// Consecutive raw failures before a service is down (default: 2)
    pub failure_threshold: u32,
    /// Dashboard link used when the alert config has none.
    pub status_page_url: String,
    /// Per-channel notification timeout (default: 10s)
    pub notify_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "upwatch.db".to_string(),
            poll_interval: Duration::from_secs(60),
            degraded_threshold_ms: 200,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            status_page_url: String::new(),
            notify_timeout: DEFAULT_NOTIFY_TIMEOUT,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `UPWATCH_HTTP_PORT`: HTTP port (default: 8080)
    /// - `UPWATCH_DB_PATH`: Database file path (default: "upwatch.db")
    /// - `UPWATCH_POLL_INTERVAL`: Seconds between checks (default: 60)
    /// - `UPWATCH_DEGRADED_THRESHOLD_MS`: Degraded latency in ms (default: 200)
    /// - `UPWATCH_FAILURE_THRESHOLD`: Failures before down (default: 2)
    /// - `UPWATCH_STATUS_PAGE_URL`: Fallback dashboard link (default: empty)
    /// - `UPWATCH_NOTIFY_TIMEOUT`: Notification timeout in seconds (default: 10)
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(|name| env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn load_from<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(port) = var("UPWATCH_HTTP_PORT") {
            cfg.http_port = parse("UPWATCH_HTTP_PORT", &port)?;
        }

        if let Some(db_path) = var("UPWATCH_DB_PATH") {
            cfg.db_path = db_path;
        }

        if let Some(secs) = var("UPWATCH_POLL_INTERVAL") {
            cfg.poll_interval = Duration::from_secs(positive("UPWATCH_POLL_INTERVAL", &secs)?);
        }

        if let Some(ms) = var("UPWATCH_DEGRADED_THRESHOLD_MS") {
            cfg.degraded_threshold_ms = positive("UPWATCH_DEGRADED_THRESHOLD_MS", &ms)? as i64;
        }

        if let Some(n) = var("UPWATCH_FAILURE_THRESHOLD") {
            cfg.failure_threshold = positive("UPWATCH_FAILURE_THRESHOLD", &n)? as u32;
        }

        if let Some(url) = var("UPWATCH_STATUS_PAGE_URL") {
            cfg.status_page_url = url.trim().to_string();
        }

        if let Some(secs) = var("UPWATCH_NOTIFY_TIMEOUT") {
            cfg.notify_timeout = Duration::from_secs(positive("UPWATCH_NOTIFY_TIMEOUT", &secs)?);
        }

        Ok(cfg)
    }
}

fn parse<T>(name: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        name,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn positive(name: &'static str, value: &str) -> Result<u64, ConfigError> {
    let n: u32 = parse(name, value)?;
    if n == 0 {
        return Err(ConfigError::Invalid {
            name,
            value: value.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(n as u64)
}
