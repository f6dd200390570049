//! Rollup bucket storage (minutely, hourly and daily tiers).

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};

use super::models::{Bucket, BucketTier};
use super::store::{fmt_db_time, parse_db_time, time_column, DbError, Store};

/// Additive upsert: counts are summed and averages merged by ping weight.
const MERGE_BUCKET_SQL: &str =
    "INSERT INTO stat_buckets (window_seconds, service_key, time, up, down, ping_count, ping_avg, ping_min, ping_max)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
     ON CONFLICT(window_seconds, service_key, time) DO UPDATE SET
     up = up + excluded.up,
     down = down + excluded.down,
     ping_avg = CASE WHEN ping_count + excluded.ping_count = 0 THEN NULL
                ELSE (COALESCE(ping_avg, 0) * ping_count + COALESCE(excluded.ping_avg, 0) * excluded.ping_count)
                     / (ping_count + excluded.ping_count) END,
     ping_count = ping_count + excluded.ping_count,
     ping_min = MIN(COALESCE(ping_min, excluded.ping_min), COALESCE(excluded.ping_min, ping_min)),
     ping_max = MAX(COALESCE(ping_max, excluded.ping_max), COALESCE(excluded.ping_max, ping_max))";

const BUCKET_COLUMNS: &str =
    "service_key, time, up, down, ping_count, ping_avg, ping_min, ping_max";

impl Store {
    /// Fold a single bucket into the given tier.
    pub fn add_to_bucket(&self, tier: BucketTier, bucket: &Bucket) -> Result<(), DbError> {
        let conn = self.conn.lock();
        merge_one(&conn, tier, bucket)?;
        Ok(())
    }

    /// Fold a batch of buckets into `tier` and advance the tier's watermark to
    /// `folded_until`, atomically.
    ///
    /// The buckets must already be materialized in memory: this issues writes
    /// only and must not be interleaved with an open read of the source tier.
    pub fn merge_buckets(
        &self,
        tier: BucketTier,
        buckets: &[Bucket],
        folded_until: DateTime<Utc>,
    ) -> Result<(), DbError> {
        let conn = self.conn.lock();
        let tx = conn.unchecked_transaction()?;
        for bucket in buckets {
            merge_one(&tx, tier, bucket)?;
        }
        tx.execute(
            "INSERT INTO rollup_watermarks (window_seconds, folded_until) VALUES (?1, ?2)
             ON CONFLICT(window_seconds) DO UPDATE SET folded_until=excluded.folded_until",
            params![tier.window_seconds(), fmt_db_time(folded_until)],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// All buckets of a tier (every service) with `from <= time < to`, fully
    /// collected before returning.
    pub fn get_buckets(
        &self,
        tier: BucketTier,
        from: Option<DateTime<Utc>>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Bucket>, DbError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM stat_buckets
             WHERE window_seconds = ?1 AND (?2 IS NULL OR time >= ?2) AND time < ?3
             ORDER BY service_key, time",
            BUCKET_COLUMNS
        ))?;
        let buckets = stmt
            .query_map(
                params![tier.window_seconds(), from.map(fmt_db_time), fmt_db_time(to)],
                bucket_from_row,
            )?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(buckets)
    }

    /// Buckets of one service in a tier since `since`, oldest first.
    pub fn get_service_buckets(
        &self,
        key: &str,
        tier: BucketTier,
        since: DateTime<Utc>,
    ) -> Result<Vec<Bucket>, DbError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM stat_buckets
             WHERE window_seconds = ?1 AND service_key = ?2 AND time >= ?3 ORDER BY time",
            BUCKET_COLUMNS
        ))?;
        let buckets = stmt
            .query_map(
                params![tier.window_seconds(), key, fmt_db_time(since)],
                bucket_from_row,
            )?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(buckets)
    }

    /// Time up to which the given tier has absorbed its source tier.
    pub fn get_watermark(&self, tier: BucketTier) -> Result<Option<DateTime<Utc>>, DbError> {
        let conn = self.conn.lock();
        let folded: Option<String> = conn
            .query_row(
                "SELECT folded_until FROM rollup_watermarks WHERE window_seconds = ?1",
                params![tier.window_seconds()],
                |row| row.get(0),
            )
            .optional()?;
        folded
            .map(|s| {
                parse_db_time(&s).ok_or_else(|| {
                    DbError::Invalid(format!("unreadable {:?} watermark {:?}", tier, s))
                })
            })
            .transpose()
    }

    /// Delete buckets of a tier older than `cutoff`.
    pub fn delete_buckets_before(
        &self,
        tier: BucketTier,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, DbError> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "DELETE FROM stat_buckets WHERE window_seconds = ?1 AND time < ?2",
            params![tier.window_seconds(), fmt_db_time(cutoff)],
        )?;
        Ok(n)
    }
}

fn merge_one(conn: &Connection, tier: BucketTier, b: &Bucket) -> SqlResult<usize> {
    conn.execute(
        MERGE_BUCKET_SQL,
        params![
            tier.window_seconds(),
            b.service_key,
            fmt_db_time(b.time),
            b.up,
            b.down,
            b.ping_count,
            b.ping_avg,
            b.ping_min,
            b.ping_max,
        ],
    )
}

fn bucket_from_row(row: &Row<'_>) -> SqlResult<Bucket> {
    Ok(Bucket {
        service_key: row.get(0)?,
        time: time_column(row, 1)?,
        up: row.get(2)?,
        down: row.get(3)?,
        ping_count: row.get(4)?,
        ping_avg: row.get(5)?,
        ping_min: row.get(6)?,
        ping_max: row.get(7)?,
    })
}
