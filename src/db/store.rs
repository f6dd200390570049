//! SQLite database store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use super::models::*;

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Not found")]
    NotFound,
    #[error("Invalid record: {0}")]
    Invalid(String),
}

/// Thread-safe database store.
///
/// All access goes through one connection, so every write is serialized.
/// Methods that read rows always collect them into a `Vec` and drop the
/// statement before returning. Callers that read and then write (the rollup
/// jobs) must do so through separate calls: never hold a read cursor across a
/// write on the same connection.
#[derive(Clone)]
pub struct Store {
    pub(super) conn: Arc<Mutex<Connection>>,
}

const SERVICE_COLUMNS: &str = "key, name, url, check_type, service_type, expected_status_min, \
     expected_status_max, timeout, api_token, depends_on, enabled";

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Initialize the database schema.
    fn init(&self) -> Result<(), DbError> {
        let conn = self.conn.lock();
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| DbError::Migration(format!("pragma setup failed: {}", e)))?;
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| DbError::Migration(format!("Migration 1 failed: {}", e)))?;
        Ok(())
    }

    // --- Services ---

    /// Add a new service. The key must be unique.
    pub fn add_service(&self, service: &Service) -> Result<(), DbError> {
        validate_service(service)?;
        let conn = self.conn.lock();
        conn.execute(
            &format!(
                "INSERT INTO services ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                SERVICE_COLUMNS
            ),
            params![
                service.key,
                service.name,
                service.url,
                service.check_type,
                service.service_type,
                service.expected_status_min,
                service.expected_status_max,
                effective_timeout(service.timeout),
                service.api_token,
                service.depends_on,
                service.enabled,
            ],
        )?;
        Ok(())
    }

    /// Update an existing service. The key itself is never changed.
    pub fn update_service(&self, service: &Service) -> Result<(), DbError> {
        validate_service(service)?;
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE services SET name=?1, url=?2, check_type=?3, service_type=?4, expected_status_min=?5,
             expected_status_max=?6, timeout=?7, api_token=?8, depends_on=?9, enabled=?10 WHERE key=?11",
            params![
                service.name,
                service.url,
                service.check_type,
                service.service_type,
                service.expected_status_min,
                service.expected_status_max,
                effective_timeout(service.timeout),
                service.api_token,
                service.depends_on,
                service.enabled,
                service.key,
            ],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    /// Get all configured services, ordered by key.
    pub fn list_services(&self) -> Result<Vec<Service>, DbError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM services ORDER BY key",
            SERVICE_COLUMNS
        ))?;
        let services = stmt
            .query_map([], service_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(services)
    }

    /// Get a service by key.
    pub fn get_service(&self, key: &str) -> Result<Service, DbError> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM services WHERE key = ?1", SERVICE_COLUMNS),
            params![key],
            service_from_row,
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    /// Delete a service together with everything recorded for it.
    pub fn delete_service(&self, key: &str) -> Result<(), DbError> {
        let conn = self.conn.lock();
        let tx = conn.unchecked_transaction()?;
        tx.execute("DELETE FROM samples WHERE service_key = ?1", params![key])?;
        tx.execute("DELETE FROM heartbeats WHERE service_key = ?1", params![key])?;
        tx.execute("DELETE FROM stat_buckets WHERE service_key = ?1", params![key])?;
        tx.execute("DELETE FROM status_history WHERE service_key = ?1", params![key])?;
        let changed = tx.execute("DELETE FROM services WHERE key = ?1", params![key])?;
        tx.commit()?;
        if changed == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    /// Whether monitoring is disabled for a service.
    pub fn get_disabled_state(&self, key: &str) -> Result<bool, DbError> {
        let conn = self.conn.lock();
        let enabled: Option<bool> = conn
            .query_row(
                "SELECT enabled FROM services WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        enabled.map(|e| !e).ok_or(DbError::NotFound)
    }

    /// Enable or disable monitoring for a service.
    pub fn set_disabled_state(&self, key: &str, disabled: bool) -> Result<(), DbError> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE services SET enabled = ?1 WHERE key = ?2",
            params![!disabled, key],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    // --- Samples ---

    /// Append a debounced sample.
    pub fn insert_sample(&self, sample: &Sample) -> Result<(), DbError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO samples (time, service_key, ok, http_status, latency_ms) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                fmt_db_time(sample.time),
                sample.service_key,
                sample.ok,
                sample.http_status,
                sample.latency_ms,
            ],
        )?;
        Ok(())
    }

    /// Count samples and successful samples for a service since `since`.
    pub fn sample_uptime(&self, key: &str, since: DateTime<Utc>) -> Result<(i64, i64), DbError> {
        let conn = self.conn.lock();
        let counts = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(ok), 0) FROM samples WHERE service_key = ?1 AND time >= ?2",
            params![key, fmt_db_time(since)],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(counts)
    }

    /// Mean of the non-null latencies for a service since `since`.
    pub fn sample_average_latency(
        &self,
        key: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<f64>, DbError> {
        let conn = self.conn.lock();
        let avg = conn.query_row(
            "SELECT AVG(latency_ms) FROM samples
             WHERE service_key = ?1 AND time >= ?2 AND latency_ms IS NOT NULL",
            params![key, fmt_db_time(since)],
            |row| row.get(0),
        )?;
        Ok(avg)
    }

    /// Get samples for a service within a time range, oldest first.
    pub fn get_samples(
        &self,
        key: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Sample>, DbError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT time, service_key, ok, http_status, latency_ms FROM samples
             WHERE service_key = ?1 AND time >= ?2 AND time < ?3 ORDER BY time ASC LIMIT ?4",
        )?;
        let samples = stmt
            .query_map(
                params![key, fmt_db_time(start), fmt_db_time(end), limit],
                |row| {
                    Ok(Sample {
                        time: time_column(row, 0)?,
                        service_key: row.get(1)?,
                        ok: row.get(2)?,
                        http_status: row.get(3)?,
                        latency_ms: row.get(4)?,
                    })
                },
            )?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(samples)
    }

    /// Delete samples of every service older than `cutoff`.
    pub fn delete_samples_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "DELETE FROM samples WHERE time < ?1",
            params![fmt_db_time(cutoff)],
        )?;
        Ok(n)
    }

    // --- Heartbeats ---

    /// Persist a heartbeat.
    pub fn insert_heartbeat(&self, key: &str, hb: &Heartbeat) -> Result<(), DbError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO heartbeats (service_key, time, status, message, ping, http_status, important)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                key,
                fmt_db_time(hb.time),
                hb.status,
                hb.message,
                hb.ping,
                hb.http_status,
                hb.important,
            ],
        )?;
        Ok(())
    }

    /// Most recent heartbeats for a service, newest first.
    pub fn get_recent_heartbeats(&self, key: &str, limit: usize) -> Result<Vec<Heartbeat>, DbError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT status, time, message, ping, http_status, important FROM heartbeats
             WHERE service_key = ?1 ORDER BY time DESC, id DESC LIMIT ?2",
        )?;
        let heartbeats = stmt
            .query_map(params![key, limit as i64], |row| {
                Ok(Heartbeat {
                    status: row.get(0)?,
                    time: time_column(row, 1)?,
                    message: row.get(2)?,
                    ping: row.get(3)?,
                    http_status: row.get(4)?,
                    important: row.get(5)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(heartbeats)
    }

    /// Delete non-important heartbeats older than `unimportant_cutoff` and all
    /// heartbeats older than `all_cutoff`. Returns the number of rows removed.
    pub fn prune_heartbeats(
        &self,
        unimportant_cutoff: DateTime<Utc>,
        all_cutoff: DateTime<Utc>,
    ) -> Result<usize, DbError> {
        let conn = self.conn.lock();
        let tx = conn.unchecked_transaction()?;
        let minor = tx.execute(
            "DELETE FROM heartbeats WHERE important = 0 AND time < ?1",
            params![fmt_db_time(unimportant_cutoff)],
        )?;
        let all = tx.execute(
            "DELETE FROM heartbeats WHERE time < ?1",
            params![fmt_db_time(all_cutoff)],
        )?;
        tx.commit()?;
        Ok(minor + all)
    }

    // --- Status history ---

    /// Last status recorded by the alert manager for a service.
    pub fn get_last_status(&self, key: &str) -> Result<Option<StatusHistory>, DbError> {
        let conn = self.conn.lock();
        let status = conn
            .query_row(
                "SELECT ok, degraded, updated_at FROM status_history WHERE service_key = ?1",
                params![key],
                |row| {
                    Ok(StatusHistory {
                        ok: row.get(0)?,
                        degraded: row.get(1)?,
                        updated_at: time_column(row, 2)?,
                    })
                },
            )
            .optional()?;
        Ok(status)
    }

    /// Record the latest status for a service, replacing the previous one.
    pub fn upsert_status_history(&self, key: &str, ok: bool, degraded: bool) -> Result<(), DbError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO status_history (service_key, ok, degraded, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(service_key) DO UPDATE SET
             ok=excluded.ok, degraded=excluded.degraded, updated_at=excluded.updated_at",
            params![key, ok, degraded, fmt_db_time(Utc::now())],
        )?;
        Ok(())
    }

    // --- Alert configuration ---

    /// Load the alert configuration, or defaults when none has been saved.
    pub fn get_alert_config(&self) -> Result<AlertConfig, DbError> {
        let conn = self.conn.lock();
        let cfg = conn
            .query_row(
                "SELECT enabled, email_enabled, smtp_host, smtp_port, smtp_user, smtp_password, smtp_from,
                 smtp_to, discord_enabled, discord_webhook_url, telegram_enabled, telegram_bot_token,
                 telegram_chat_id, webhook_enabled, webhook_url, webhook_secret, alert_on_down,
                 alert_on_degraded, alert_on_up, status_page_url
                 FROM alert_config WHERE id = 1",
                [],
                |row| {
                    Ok(AlertConfig {
                        enabled: row.get(0)?,
                        email_enabled: row.get(1)?,
                        smtp_host: row.get(2)?,
                        smtp_port: row.get(3)?,
                        smtp_user: row.get(4)?,
                        smtp_password: row.get(5)?,
                        smtp_from: row.get(6)?,
                        smtp_to: row.get(7)?,
                        discord_enabled: row.get(8)?,
                        discord_webhook_url: row.get(9)?,
                        telegram_enabled: row.get(10)?,
                        telegram_bot_token: row.get(11)?,
                        telegram_chat_id: row.get(12)?,
                        webhook_enabled: row.get(13)?,
                        webhook_url: row.get(14)?,
                        webhook_secret: row.get(15)?,
                        alert_on_down: row.get(16)?,
                        alert_on_degraded: row.get(17)?,
                        alert_on_up: row.get(18)?,
                        status_page_url: row.get(19)?,
                    })
                },
            )
            .optional()?;
        Ok(cfg.unwrap_or_default())
    }

    /// Persist the alert configuration.
    pub fn save_alert_config(&self, cfg: &AlertConfig) -> Result<(), DbError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO alert_config (id, enabled, email_enabled, smtp_host, smtp_port, smtp_user,
             smtp_password, smtp_from, smtp_to, discord_enabled, discord_webhook_url, telegram_enabled,
             telegram_bot_token, telegram_chat_id, webhook_enabled, webhook_url, webhook_secret,
             alert_on_down, alert_on_degraded, alert_on_up, status_page_url)
             VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)",
            params![
                cfg.enabled,
                cfg.email_enabled,
                cfg.smtp_host,
                cfg.smtp_port,
                cfg.smtp_user,
                cfg.smtp_password,
                cfg.smtp_from,
                cfg.smtp_to,
                cfg.discord_enabled,
                cfg.discord_webhook_url,
                cfg.telegram_enabled,
                cfg.telegram_bot_token,
                cfg.telegram_chat_id,
                cfg.webhook_enabled,
                cfg.webhook_url,
                cfg.webhook_secret,
                cfg.alert_on_down,
                cfg.alert_on_degraded,
                cfg.alert_on_up,
                cfg.status_page_url,
            ],
        )?;
        Ok(())
    }

    // --- Audit log ---

    /// Append an entry to the operator-facing audit log.
    pub fn insert_log(
        &self,
        level: LogLevel,
        category: &str,
        service_key: &str,
        message: &str,
        details: &str,
    ) -> Result<(), DbError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO logs (time, level, category, service_key, message, details) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                fmt_db_time(Utc::now()),
                level.as_str(),
                category,
                service_key,
                message,
                details,
            ],
        )?;
        Ok(())
    }

    /// Most recent audit log entries, newest first, optionally filtered by category.
    pub fn get_logs(&self, category: Option<&str>, limit: usize) -> Result<Vec<LogEntry>, DbError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT time, level, category, service_key, message, details FROM logs
             WHERE ?1 IS NULL OR category = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let entries = stmt
            .query_map(params![category, limit as i64], |row| {
                Ok(LogEntry {
                    time: time_column(row, 0)?,
                    level: row.get(1)?,
                    category: row.get(2)?,
                    service_key: row.get(3)?,
                    message: row.get(4)?,
                    details: row.get(5)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(entries)
    }
}

fn service_from_row(row: &Row<'_>) -> SqlResult<Service> {
    Ok(Service {
        key: row.get(0)?,
        name: row.get(1)?,
        url: row.get(2)?,
        check_type: row.get(3)?,
        service_type: row.get(4)?,
        expected_status_min: row.get(5)?,
        expected_status_max: row.get(6)?,
        timeout: row.get(7)?,
        api_token: row.get(8)?,
        depends_on: row.get(9)?,
        enabled: row.get(10)?,
    })
}

fn validate_service(service: &Service) -> Result<(), DbError> {
    if service.key.trim().is_empty() {
        return Err(DbError::Invalid("service key is required".to_string()));
    }
    if !service.timeout.is_finite() || service.timeout > Service::MAX_TIMEOUT_SECS {
        return Err(DbError::Invalid(format!(
            "timeout must be at most {} seconds",
            Service::MAX_TIMEOUT_SECS
        )));
    }
    if service.expected_status_min > service.expected_status_max {
        return Err(DbError::Invalid(format!(
            "expected status range {}-{} is empty",
            service.expected_status_min, service.expected_status_max
        )));
    }
    Ok(())
}

fn effective_timeout(timeout: f64) -> f64 {
    if timeout <= 0.0 {
        Service::DEFAULT_TIMEOUT_SECS
    } else {
        timeout
    }
}

/// Format a timestamp the way every table stores it. The fixed width keeps
/// lexical order equal to chronological order.
pub(crate) fn fmt_db_time(dt: DateTime<Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S%.9f").to_string()
}

/// Read a timestamp column. An unparseable value fails the row instead of
/// being replaced by some other time.
pub(crate) fn time_column(row: &Row<'_>, idx: usize) -> SqlResult<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_db_time(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("unreadable timestamp {:?}", raw).into(),
        )
    })
}

/// Parse a datetime string from the database.
pub(crate) fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [
        "%Y-%m-%d %H:%M:%S%.9f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.9fZ",
        "%Y-%m-%dT%H:%M:%SZ",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    None
}
