//! Statistics engine: heartbeat ring buffers, cached uptime and latency
//! figures, and recording of check outcomes into the minutely rollup tier.

use crate::db::{Bucket, BucketTier, DbError, Heartbeat, Store};
use crate::scheduler::truncate_to_window;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Heartbeats kept in memory per service.
pub const HEARTBEAT_BUFFER_SIZE: usize = 100;

/// How long a computed uptime or latency figure is served from cache.
pub const STATS_CACHE_TTL: Duration = Duration::from_secs(30);

/// Rolling window for uptime and latency figures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatsWindow {
    #[serde(rename = "24h")]
    Day,
    #[serde(rename = "7d")]
    Week,
    #[serde(rename = "30d")]
    Month,
}

impl StatsWindow {
    pub const ALL: [StatsWindow; 3] = [StatsWindow::Day, StatsWindow::Week, StatsWindow::Month];

    pub fn duration(self) -> ChronoDuration {
        match self {
            StatsWindow::Day => ChronoDuration::hours(24),
            StatsWindow::Week => ChronoDuration::days(7),
            StatsWindow::Month => ChronoDuration::days(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Metric {
    Uptime,
    Latency,
}

type CacheKey = (String, StatsWindow, Metric);

/// Uptime and latency figures for one service.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    pub uptime_24h: f64,
    pub uptime_7d: f64,
    pub uptime_30d: f64,
    pub avg_latency_24h: f64,
}

/// Owned by the application root and shared with the scheduler and web layer.
pub struct StatsEngine {
    store: Arc<Store>,
    heartbeats: RwLock<HashMap<String, VecDeque<Heartbeat>>>,
    cache: Mutex<HashMap<CacheKey, (f64, Instant)>>,
    cache_ttl: Duration,
}

impl StatsEngine {
    pub fn new(store: Arc<Store>) -> Self {
        Self::with_cache_ttl(store, STATS_CACHE_TTL)
    }

    pub fn with_cache_ttl(store: Arc<Store>, cache_ttl: Duration) -> Self {
        Self {
            store,
            heartbeats: RwLock::new(HashMap::new()),
            cache: Mutex::new(HashMap::new()),
            cache_ttl,
        }
    }

    /// Append a heartbeat to the service's ring buffer and return whether it
    /// is important (first ever, or a status change).
    pub fn add_heartbeat(
        &self,
        key: &str,
        up: bool,
        ping: Option<i64>,
        http_status: Option<u16>,
        message: &str,
    ) -> bool {
        self.push_heartbeat(key, up, ping, http_status, message).important
    }

    fn push_heartbeat(
        &self,
        key: &str,
        up: bool,
        ping: Option<i64>,
        http_status: Option<u16>,
        message: &str,
    ) -> Heartbeat {
        let status = up as u8;
        let hb = {
            let mut buffers = self.heartbeats.write();
            let buffer = buffers.entry(key.to_string()).or_default();
            let important = buffer.back().map_or(true, |last| last.status != status);
            let hb = Heartbeat {
                status,
                time: Utc::now(),
                message: message.to_string(),
                ping,
                http_status,
                important,
            };
            if buffer.len() >= HEARTBEAT_BUFFER_SIZE {
                buffer.pop_front();
            }
            buffer.push_back(hb.clone());
            hb
        };
        self.invalidate(key);
        hb
    }

    /// Record a check outcome: ring buffer, persisted heartbeat and the
    /// minutely rollup bucket. Returns whether the heartbeat is important.
    pub fn record_check(
        &self,
        key: &str,
        up: bool,
        ping: Option<i64>,
        http_status: Option<u16>,
        message: &str,
    ) -> Result<bool, DbError> {
        let hb = self.push_heartbeat(key, up, ping, http_status, message);
        self.store.insert_heartbeat(key, &hb)?;

        let minute = truncate_to_window(hb.time, BucketTier::Minutely.window_seconds());
        self.store
            .add_to_bucket(BucketTier::Minutely, &Bucket::single(key, minute, up, ping))?;

        if hb.important {
            tracing::info!(
                "Service {} is now {}",
                key,
                if up { "up" } else { "down" }
            );
        }
        Ok(hb.important)
    }

    /// Uptime percentage over the window. 100.0 when there are no samples.
    pub fn get_uptime(&self, key: &str, window: StatsWindow) -> Result<f64, DbError> {
        self.cached(key, window, Metric::Uptime, || {
            let since = Utc::now() - window.duration();
            let (count, ok) = self.store.sample_uptime(key, since)?;
            Ok(uptime_percentage(count, ok))
        })
    }

    /// Mean latency in milliseconds over the window. 0.0 when there is no data.
    pub fn get_average_latency(&self, key: &str, window: StatsWindow) -> Result<f64, DbError> {
        self.cached(key, window, Metric::Latency, || {
            let since = Utc::now() - window.duration();
            Ok(self.store.sample_average_latency(key, since)?.unwrap_or(0.0))
        })
    }

    /// All figures for one service.
    pub fn summary(&self, key: &str) -> Result<ServiceStats, DbError> {
        Ok(ServiceStats {
            uptime_24h: self.get_uptime(key, StatsWindow::Day)?,
            uptime_7d: self.get_uptime(key, StatsWindow::Week)?,
            uptime_30d: self.get_uptime(key, StatsWindow::Month)?,
            avg_latency_24h: self.get_average_latency(key, StatsWindow::Day)?,
        })
    }

    /// Up to `n` buffered heartbeats, newest first.
    pub fn get_recent_heartbeats(&self, key: &str, n: usize) -> Vec<Heartbeat> {
        self.heartbeats
            .read()
            .get(key)
            .map(|buffer| buffer.iter().rev().take(n).cloned().collect())
            .unwrap_or_default()
    }

    /// Rollup buckets of one tier for charts.
    pub fn history(
        &self,
        key: &str,
        tier: BucketTier,
        since: DateTime<Utc>,
    ) -> Result<Vec<Bucket>, DbError> {
        self.store.get_service_buckets(key, tier, since)
    }

    /// Seed empty ring buffers from persisted heartbeats.
    pub fn warm<'a, I>(&self, keys: I) -> Result<(), DbError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        for key in keys {
            if self.heartbeats.read().get(key).is_some_and(|b| !b.is_empty()) {
                continue;
            }
            let recent = self.store.get_recent_heartbeats(key, HEARTBEAT_BUFFER_SIZE)?;
            if recent.is_empty() {
                continue;
            }
            let buffer: VecDeque<Heartbeat> = recent.into_iter().rev().collect();
            self.heartbeats.write().insert(key.to_string(), buffer);
        }
        Ok(())
    }

    /// Drop everything held in memory for a deleted service.
    pub fn forget(&self, key: &str) {
        self.heartbeats.write().remove(key);
        self.invalidate(key);
    }

    /// Drop cached figures for a service.
    pub fn invalidate(&self, key: &str) {
        self.cache.lock().retain(|(k, _, _), _| k != key);
    }

    fn cached<F>(
        &self,
        key: &str,
        window: StatsWindow,
        metric: Metric,
        compute: F,
    ) -> Result<f64, DbError>
    where
        F: FnOnce() -> Result<f64, DbError>,
    {
        let cache_key = (key.to_string(), window, metric);
        if let Some((value, at)) = self.cache.lock().get(&cache_key) {
            if at.elapsed() < self.cache_ttl {
                return Ok(*value);
            }
        }

        let value = compute()?;
        self.cache.lock().insert(cache_key, (value, Instant::now()));
        Ok(value)
    }
}

/// `100 * ok / count`, or 100.0 when nothing was sampled.
pub fn uptime_percentage(count: i64, ok: i64) -> f64 {
    if count <= 0 {
        return 100.0;
    }
    (100.0 * ok as f64 / count as f64).clamp(0.0, 100.0)
}
