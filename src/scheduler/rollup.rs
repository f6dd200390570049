//! Rollup manager for folding fine-grained buckets into coarser tiers.
//!
//! minutely (kept 24h) → hourly (kept 30 days) → daily (kept 365 days).

use crate::db::{Bucket, BucketTier, DbError, Store};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

pub const HOURLY_JOB_INTERVAL: Duration = Duration::from_secs(3_600);
pub const DAILY_JOB_INTERVAL: Duration = Duration::from_secs(86_400);

/// Minutely buckets older than this are deleted once folded.
pub fn minutely_retention() -> ChronoDuration {
    ChronoDuration::hours(24)
}

pub fn hourly_retention() -> ChronoDuration {
    ChronoDuration::days(30)
}

pub fn daily_retention() -> ChronoDuration {
    ChronoDuration::days(365)
}

/// What one rollup pass did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RollupReport {
    /// Source buckets read.
    pub folded: usize,
    /// Target buckets upserted.
    pub written: usize,
    /// Expired buckets deleted across tiers.
    pub deleted: usize,
}

/// Manager for the hourly and daily rollup jobs.
pub struct RollupManager {
    store: Arc<Store>,
    stop: broadcast::Sender<()>,
}

impl RollupManager {
    pub fn new(store: Arc<Store>, stop: broadcast::Sender<()>) -> Self {
        Self { store, stop }
    }

    /// Start the rollup background tasks. Both run once immediately to catch
    /// up after downtime.
    pub fn start(&self) {
        spawn_job(
            "hourly rollup",
            self.store.clone(),
            self.stop.subscribe(),
            HOURLY_JOB_INTERVAL,
            run_hourly_rollup,
        );
        spawn_job(
            "daily rollup",
            self.store.clone(),
            self.stop.subscribe(),
            DAILY_JOB_INTERVAL,
            run_daily_rollup,
        );
    }
}

fn spawn_job(
    name: &'static str,
    store: Arc<Store>,
    mut stop_rx: broadcast::Receiver<()>,
    every: Duration,
    job: fn(&Store, DateTime<Utc>) -> Result<RollupReport, DbError>,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = stop_rx.recv() => break,
                _ = interval.tick() => {
                    match job(&store, Utc::now()) {
                        Ok(report) => tracing::info!(
                            "RollupManager: {} folded {} buckets into {}, deleted {}",
                            name,
                            report.folded,
                            report.written,
                            report.deleted
                        ),
                        Err(e) => tracing::error!("RollupManager: {} failed: {}", name, e),
                    }
                }
            }
        }
    });
}

/// Fold complete hours of minutely buckets into the hourly tier, then expire
/// old minutely buckets.
pub fn run_hourly_rollup(store: &Store, now: DateTime<Utc>) -> Result<RollupReport, DbError> {
    let cutoff = truncate_to_window(
        now - ChronoDuration::hours(1),
        BucketTier::Hourly.window_seconds(),
    );
    let mut report = fold_tier(store, BucketTier::Minutely, BucketTier::Hourly, cutoff)?;
    report.deleted += store.delete_buckets_before(BucketTier::Minutely, now - minutely_retention())?;
    Ok(report)
}

/// Fold complete days of hourly buckets into the daily tier, then expire old
/// hourly and daily buckets.
///
/// A day is only folded once the hourly tier has absorbed all of it, so the
/// two jobs may run in either order.
pub fn run_daily_rollup(store: &Store, now: DateTime<Utc>) -> Result<RollupReport, DbError> {
    let day = BucketTier::Daily.window_seconds();
    let mut report = match store.get_watermark(BucketTier::Hourly)? {
        Some(hourly_done) => {
            let cutoff = truncate_to_window(now - ChronoDuration::days(1), day)
                .min(truncate_to_window(hourly_done, day));
            fold_tier(store, BucketTier::Hourly, BucketTier::Daily, cutoff)?
        }
        None => RollupReport::default(),
    };
    report.deleted += store.delete_buckets_before(BucketTier::Hourly, now - hourly_retention())?;
    report.deleted += store.delete_buckets_before(BucketTier::Daily, now - daily_retention())?;
    Ok(report)
}

/// Fold every `source` bucket between the target's watermark and `cutoff`
/// into `target`, advancing the watermark to `cutoff`.
///
/// Source rows are read in full before the first write is issued; the store
/// has a single connection and must never see a write while a read of the
/// same statement is still open.
fn fold_tier(
    store: &Store,
    source: BucketTier,
    target: BucketTier,
    cutoff: DateTime<Utc>,
) -> Result<RollupReport, DbError> {
    let from = store.get_watermark(target)?;
    if from.is_some_and(|from| from >= cutoff) {
        return Ok(RollupReport::default());
    }

    let rows = store.get_buckets(source, from, cutoff)?;
    let folded = fold_buckets(&rows, target.window_seconds());

    store.merge_buckets(target, &folded, cutoff)?;

    tracing::debug!(
        "RollupManager: {:?} -> {:?} up to {}: {} rows into {} buckets",
        source,
        target,
        cutoff.format("%Y-%m-%d %H:%M"),
        rows.len(),
        folded.len()
    );

    Ok(RollupReport {
        folded: rows.len(),
        written: folded.len(),
        deleted: 0,
    })
}

/// Group buckets by (service, window start) and merge each group.
pub fn fold_buckets(buckets: &[Bucket], window_seconds: i32) -> Vec<Bucket> {
    let mut groups: BTreeMap<(String, DateTime<Utc>), Bucket> = BTreeMap::new();
    for bucket in buckets {
        let start = truncate_to_window(bucket.time, window_seconds);
        groups
            .entry((bucket.service_key.clone(), start))
            .or_insert_with(|| Bucket::empty(&bucket.service_key, start))
            .absorb(bucket);
    }
    groups.into_values().collect()
}

/// Truncate a datetime to the start of its containing window.
pub fn truncate_to_window(dt: DateTime<Utc>, window_seconds: i32) -> DateTime<Utc> {
    let ts = dt.timestamp();
    let truncated = ts - ts.rem_euclid(window_seconds as i64);
    DateTime::from_timestamp(truncated, 0).unwrap_or(dt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::store::tests::temp_store;
    use chrono::TimeZone;
    use std::collections::HashMap;

    fn at(d: u32, h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, d, h, m, 0).unwrap()
    }

    fn minutely(store: &Store, key: &str, t: DateTime<Utc>, up: i64, down: i64, ping: i64) {
        let bucket = Bucket {
            up,
            down,
            ping_count: up,
            ping_avg: Some(ping as f64),
            ping_min: Some(ping),
            ping_max: Some(ping),
            ..Bucket::empty(key, t)
        };
        store.add_to_bucket(BucketTier::Minutely, &bucket).unwrap();
    }

    fn totals(buckets: &[Bucket], window: i32) -> HashMap<(String, DateTime<Utc>), (i64, i64)> {
        let mut out = HashMap::new();
        for b in buckets {
            let e = out
                .entry((b.service_key.clone(), truncate_to_window(b.time, window)))
                .or_insert((0, 0));
            e.0 += b.up;
            e.1 += b.down;
        }
        out
    }

    #[test]
    fn test_truncate_to_window() {
        let dt = Utc.with_ymd_and_hms(2024, 1, 1, 12, 34, 56).unwrap();
        assert_eq!(truncate_to_window(dt, 60), Utc.with_ymd_and_hms(2024, 1, 1, 12, 34, 0).unwrap());
        assert_eq!(truncate_to_window(dt, 3600), Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap());
        assert_eq!(truncate_to_window(dt, 86400), Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_fold_buckets_merges_ping_stats() {
        let rows = vec![
            Bucket::single("a", at(1, 9, 5), true, Some(10)),
            Bucket::single("a", at(1, 9, 40), true, Some(30)),
            Bucket::single("a", at(1, 9, 41), false, None),
            Bucket::single("b", at(1, 9, 5), true, Some(100)),
        ];
        let folded = fold_buckets(&rows, 3600);
        assert_eq!(folded.len(), 2);

        let a = &folded[0];
        assert_eq!((a.service_key.as_str(), a.time), ("a", at(1, 9, 0)));
        assert_eq!((a.up, a.down, a.ping_count), (2, 1, 2));
        assert_eq!(a.ping_avg, Some(20.0));
        assert_eq!((a.ping_min, a.ping_max), (Some(10), Some(30)));
    }

    #[test]
    fn test_hourly_rollup_conserves_counts_and_runs_once() {
        let (_tmp, store) = temp_store();
        minutely(&store, "a", at(1, 8, 0), 3, 1, 20);
        minutely(&store, "a", at(2, 9, 5), 5, 0, 10);
        minutely(&store, "a", at(2, 9, 50), 2, 2, 30);
        minutely(&store, "a", at(2, 10, 10), 1, 0, 15);
        minutely(&store, "b", at(2, 10, 59), 0, 4, 0);
        minutely(&store, "a", at(2, 11, 20), 6, 0, 12);

        let source = store.get_buckets(BucketTier::Minutely, None, at(2, 11, 0)).unwrap();
        let expected = totals(&source, 3600);

        let now = at(2, 12, 30);
        let report = run_hourly_rollup(&store, now).unwrap();
        assert_eq!(report.folded, 5);
        assert_eq!(report.written, 4);
        assert_eq!(report.deleted, 1, "the day-old minutely bucket expires");

        let hourly = store.get_buckets(BucketTier::Hourly, None, now).unwrap();
        assert_eq!(totals(&hourly, 3600), expected);
        assert_eq!(store.get_watermark(BucketTier::Hourly).unwrap(), Some(at(2, 11, 0)));

        // Running again in the same hour must not double count.
        assert_eq!(run_hourly_rollup(&store, now).unwrap().folded, 0);
        let again = store.get_buckets(BucketTier::Hourly, None, now).unwrap();
        assert_eq!(totals(&again, 3600), expected);

        // The next hour picks up only the 11:xx bucket.
        let report = run_hourly_rollup(&store, at(2, 13, 30)).unwrap();
        assert_eq!(report.folded, 1);
        let eleven = store.get_service_buckets("a", BucketTier::Hourly, at(2, 11, 0)).unwrap();
        assert_eq!(eleven.len(), 1);
        assert_eq!((eleven[0].up, eleven[0].down), (6, 0));
    }

    #[test]
    fn test_daily_rollup_conserves_counts() {
        let (_tmp, store) = temp_store();
        minutely(&store, "a", at(1, 8, 0), 3, 1, 20);
        minutely(&store, "a", at(1, 23, 59), 1, 1, 20);
        minutely(&store, "a", at(2, 9, 5), 5, 0, 10);
        minutely(&store, "b", at(2, 10, 59), 0, 4, 0);
        run_hourly_rollup(&store, at(3, 6, 0)).unwrap();

        let hourly = store.get_buckets(BucketTier::Hourly, None, at(4, 0, 0)).unwrap();
        let hourly_total: i64 = hourly.iter().map(Bucket::total).sum();
        assert_eq!(hourly_total, 15);

        run_daily_rollup(&store, at(3, 12, 0)).unwrap();
        let day_one = store.get_service_buckets("a", BucketTier::Daily, at(1, 0, 0)).unwrap();
        assert_eq!(day_one.len(), 1);
        assert_eq!((day_one[0].up, day_one[0].down), (4, 2));

        run_daily_rollup(&store, at(4, 12, 0)).unwrap();
        let daily = store.get_buckets(BucketTier::Daily, None, at(5, 0, 0)).unwrap();
        assert_eq!(totals(&daily, 86400), totals(&hourly, 86400));
    }

    #[test]
    fn test_daily_rollup_expires_old_tiers() {
        let (_tmp, store) = temp_store();
        let now = at(20, 0, 0);
        let ancient = now - ChronoDuration::days(400);
        let old = now - ChronoDuration::days(45);
        store.add_to_bucket(BucketTier::Daily, &Bucket::single("a", ancient, true, None)).unwrap();
        store.add_to_bucket(BucketTier::Hourly, &Bucket::single("a", old, true, None)).unwrap();
        run_hourly_rollup(&store, now).unwrap();

        let report = run_daily_rollup(&store, now).unwrap();
        // The old hourly bucket is folded into daily before it is deleted.
        assert_eq!(report.folded, 1);
        assert_eq!(report.deleted, 2);
        let daily = store.get_buckets(BucketTier::Daily, None, now).unwrap();
        assert_eq!(daily.len(), 1);
        assert_eq!(daily[0].time, truncate_to_window(old, 86400));
    }

    #[test]
    fn test_daily_rollup_waits_for_hourly_tier() {
        let (_tmp, store) = temp_store();
        minutely(&store, "a", at(1, 10, 0), 2, 1, 20);
        minutely(&store, "a", at(1, 23, 30), 0, 1, 0);
        let now = at(3, 0, 30);

        // Daily first, as after a restart: nothing is complete in hourly yet.
        assert_eq!(run_daily_rollup(&store, now).unwrap().folded, 0);
        assert_eq!(store.get_watermark(BucketTier::Daily).unwrap(), None);

        run_hourly_rollup(&store, now).unwrap();
        run_daily_rollup(&store, now).unwrap();

        let hourly = store.get_buckets(BucketTier::Hourly, None, now).unwrap();
        let daily = store.get_buckets(BucketTier::Daily, None, now).unwrap();
        assert_eq!(hourly.iter().map(Bucket::total).sum::<i64>(), 4);
        assert_eq!(daily.iter().map(Bucket::total).sum::<i64>(), 4);
        assert_eq!(daily.len(), 1);
        assert_eq!(daily[0].time, at(1, 0, 0));
    }
}
