//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A monitored service as held by the configuration store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    /// Stable identifier; immutable once created.
    pub key: String,
    pub name: String,
    pub url: String,
    /// One of `http`, `tcp`, `dns`, `always_up` or `demo`.
    pub check_type: String,
    /// Flavour used to pick an auth header (`sonarr`, `plex`, ...). Empty for generic.
    #[serde(default)]
    pub service_type: String,
    pub expected_status_min: u16,
    pub expected_status_max: u16,
    /// Probe timeout in seconds.
    pub timeout: f64,
    #[serde(default, skip_serializing)]
    pub api_token: Option<String>,
    /// Comma-separated keys of upstream services.
    #[serde(default)]
    pub depends_on: String,
    pub enabled: bool,
}

impl Default for Service {
    fn default() -> Self {
        Self {
            key: String::new(),
            name: String::new(),
            url: String::new(),
            check_type: "http".to_string(),
            service_type: String::new(),
            expected_status_min: 200,
            expected_status_max: 399,
            timeout: Self::DEFAULT_TIMEOUT_SECS,
            api_token: None,
            depends_on: String::new(),
            enabled: true,
        }
    }
}

impl Service {
    /// Probe timeout used when none is configured.
    pub const DEFAULT_TIMEOUT_SECS: f64 = 10.0;
    /// Largest probe timeout a service may configure.
    pub const MAX_TIMEOUT_SECS: f64 = 300.0;

    /// Upstream dependency keys, trimmed with empties removed.
    pub fn dependencies(&self) -> Vec<&str> {
        self.depends_on
            .split(',')
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .collect()
    }
}

/// One debounced check outcome. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    pub time: DateTime<Utc>,
    pub service_key: String,
    pub ok: bool,
    pub http_status: Option<u16>,
    pub latency_ms: Option<i64>,
}

/// A heartbeat as kept in the per-service ring buffer and the `heartbeats` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// 1 = up, 0 = down.
    pub status: u8,
    pub time: DateTime<Utc>,
    pub message: String,
    pub ping: Option<i64>,
    pub http_status: Option<u16>,
    pub important: bool,
}

impl Heartbeat {
    pub fn is_up(&self) -> bool {
        self.status == 1
    }
}

/// Granularity of a rollup bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BucketTier {
    Minutely,
    Hourly,
    Daily,
}

impl BucketTier {
    pub fn window_seconds(self) -> i32 {
        match self {
            BucketTier::Minutely => 60,
            BucketTier::Hourly => 3_600,
            BucketTier::Daily => 86_400,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "minutely" => Some(BucketTier::Minutely),
            "hourly" => Some(BucketTier::Hourly),
            "daily" => Some(BucketTier::Daily),
            _ => None,
        }
    }
}

/// Aggregated check counts for one service over one truncated time window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Bucket {
    pub service_key: String,
    /// Window start.
    pub time: DateTime<Utc>,
    pub up: i64,
    pub down: i64,
    /// Number of pings folded into `ping_avg`.
    pub ping_count: i64,
    pub ping_avg: Option<f64>,
    pub ping_min: Option<i64>,
    pub ping_max: Option<i64>,
}

impl Bucket {
    /// An empty bucket for the given service and window start.
    pub fn empty(service_key: &str, time: DateTime<Utc>) -> Self {
        Self {
            service_key: service_key.to_string(),
            time,
            up: 0,
            down: 0,
            ping_count: 0,
            ping_avg: None,
            ping_min: None,
            ping_max: None,
        }
    }

    /// A bucket holding exactly one check.
    pub fn single(service_key: &str, time: DateTime<Utc>, ok: bool, ping: Option<i64>) -> Self {
        Self {
            service_key: service_key.to_string(),
            time,
            up: ok as i64,
            down: (!ok) as i64,
            ping_count: ping.is_some() as i64,
            ping_avg: ping.map(|p| p as f64),
            ping_min: ping,
            ping_max: ping,
        }
    }

    /// Fold another bucket's counts and ping stats into this one.
    pub fn absorb(&mut self, other: &Bucket) {
        self.up += other.up;
        self.down += other.down;

        let total = self.ping_count + other.ping_count;
        if total > 0 {
            let ours = self.ping_avg.unwrap_or(0.0) * self.ping_count as f64;
            let theirs = other.ping_avg.unwrap_or(0.0) * other.ping_count as f64;
            self.ping_avg = Some((ours + theirs) / total as f64);
        }
        self.ping_count = total;

        self.ping_min = match (self.ping_min, other.ping_min) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.ping_max = match (self.ping_max, other.ping_max) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }

    pub fn total(&self) -> i64 {
        self.up + self.down
    }
}

/// Last status the alert manager recorded for a service.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StatusHistory {
    pub ok: bool,
    pub degraded: bool,
    pub updated_at: DateTime<Utc>,
}

/// Singleton alerting configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    pub enabled: bool,

    pub email_enabled: bool,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_user: String,
    pub smtp_password: String,
    pub smtp_from: String,
    pub smtp_to: String,

    pub discord_enabled: bool,
    pub discord_webhook_url: String,

    pub telegram_enabled: bool,
    pub telegram_bot_token: String,
    pub telegram_chat_id: String,

    pub webhook_enabled: bool,
    pub webhook_url: String,
    pub webhook_secret: String,

    pub alert_on_down: bool,
    pub alert_on_degraded: bool,
    pub alert_on_up: bool,

    pub status_page_url: String,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            email_enabled: false,
            smtp_host: String::new(),
            smtp_port: 587,
            smtp_user: String::new(),
            smtp_password: String::new(),
            smtp_from: String::new(),
            smtp_to: String::new(),
            discord_enabled: false,
            discord_webhook_url: String::new(),
            telegram_enabled: false,
            telegram_bot_token: String::new(),
            telegram_chat_id: String::new(),
            webhook_enabled: false,
            webhook_url: String::new(),
            webhook_secret: String::new(),
            alert_on_down: true,
            alert_on_degraded: false,
            alert_on_up: true,
            status_page_url: String::new(),
        }
    }
}

/// Audit log severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// A row of the operator-facing audit log.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub time: DateTime<Utc>,
    pub level: String,
    pub category: String,
    pub service_key: String,
    pub message: String,
    pub details: String,
}
