//! Retention manager for cleaning up old heartbeats and samples.

use crate::db::{DbError, Store};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

pub const HEARTBEAT_RETENTION_INTERVAL: Duration = Duration::from_secs(3_600);
pub const SAMPLE_RETENTION_INTERVAL: Duration = Duration::from_secs(86_400);

/// Heartbeats that did not change state are kept this long.
pub fn heartbeat_retention() -> ChronoDuration {
    ChronoDuration::hours(24)
}

/// State-change heartbeats are kept this long.
pub fn important_heartbeat_retention() -> ChronoDuration {
    ChronoDuration::days(7)
}

/// Raw samples back the 30 day uptime window, plus a day of slack.
pub fn sample_retention() -> ChronoDuration {
    ChronoDuration::days(31)
}

/// Manager for deleting data past retention periods.
pub struct RetentionManager {
    store: Arc<Store>,
    stop: broadcast::Sender<()>,
}

impl RetentionManager {
    pub fn new(store: Arc<Store>, stop: broadcast::Sender<()>) -> Self {
        Self { store, stop }
    }

    /// Start the hourly heartbeat prune and the daily sample prune.
    pub fn start(&self) {
        spawn_job(
            "heartbeats",
            self.store.clone(),
            self.stop.subscribe(),
            HEARTBEAT_RETENTION_INTERVAL,
            run_heartbeat_retention,
        );
        spawn_job(
            "samples",
            self.store.clone(),
            self.stop.subscribe(),
            SAMPLE_RETENTION_INTERVAL,
            run_sample_retention,
        );
    }
}

fn spawn_job(
    name: &'static str,
    store: Arc<Store>,
    mut stop_rx: broadcast::Receiver<()>,
    every: Duration,
    job: fn(&Store, DateTime<Utc>) -> Result<usize, DbError>,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = stop_rx.recv() => break,
                _ = interval.tick() => {
                    match job(&store, Utc::now()) {
                        Ok(0) => {}
                        Ok(n) => tracing::info!("RetentionManager: pruned {} {}", n, name),
                        Err(e) => tracing::error!("RetentionManager: {} cleanup failed: {}", name, e),
                    }
                }
            }
        }
    });
}

/// Delete unimportant heartbeats past 24h and all heartbeats past 7 days.
pub fn run_heartbeat_retention(store: &Store, now: DateTime<Utc>) -> Result<usize, DbError> {
    store.prune_heartbeats(
        now - heartbeat_retention(),
        now - important_heartbeat_retention(),
    )
}

pub fn run_sample_retention(store: &Store, now: DateTime<Utc>) -> Result<usize, DbError> {
    store.delete_samples_before(now - sample_retention())
}
