//! Scheduler module for running checks and the background maintenance jobs.

mod retention;
mod rollup;

pub use retention::*;
pub use rollup::*;

use crate::alerts::{AlertDecision, AlertKind, AlertManager, Delivery};
use crate::config::ServerConfig;
use crate::db::{DbError, Sample, Service, Store};
use crate::monitor::{adjusted_ok, FailureTracker, DEFAULT_FAILURE_THRESHOLD};
use crate::probe::{run_check, CheckResult, ProbeConfig, ProbeError};
use crate::stats::StatsEngine;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Checks running at once within one tick.
pub const MAX_CONCURRENT_CHECKS: usize = 8;

/// Scheduler error types.
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("database error: {0}")]
    Db(#[from] DbError),
    #[error("service not found: {0}")]
    NotFound(String),
    #[error("check cancelled")]
    Cancelled,
}

/// Tunables for the check pipeline.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub poll_interval: Duration,
    pub degraded_threshold_ms: i64,
    pub failure_threshold: u32,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            degraded_threshold_ms: 200,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
        }
    }
}

impl From<&ServerConfig> for SchedulerSettings {
    fn from(cfg: &ServerConfig) -> Self {
        Self {
            poll_interval: cfg.poll_interval,
            degraded_threshold_ms: cfg.degraded_threshold_ms,
            failure_threshold: cfg.failure_threshold,
        }
    }
}

/// Result of running one service through the check pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct CheckOutcome {
    pub service_key: String,
    /// Raw probe result before debounce.
    pub raw_ok: bool,
    /// Debounced decision that was persisted.
    pub ok: bool,
    pub degraded: bool,
    pub consecutive_failures: u32,
    pub http_status: Option<u16>,
    pub latency_ms: Option<i64>,
    pub message: String,
    /// Alert handed to the channels by this check, if any.
    pub alert: Option<AlertKind>,
}

/// The main scheduler that orchestrates check execution.
pub struct Scheduler {
    store: Arc<Store>,
    tracker: Arc<FailureTracker>,
    stats: Arc<StatsEngine>,
    alerts: Arc<AlertManager>,
    settings: SchedulerSettings,
    /// Resolved probe per service key, with the settings it was built from.
    probes: Mutex<HashMap<String, (Service, Arc<ProbeConfig>)>>,
    stop: broadcast::Sender<()>,
    rollup_manager: RollupManager,
    retention_manager: RetentionManager,
}

impl Scheduler {
    pub fn new(
        store: Arc<Store>,
        tracker: Arc<FailureTracker>,
        stats: Arc<StatsEngine>,
        alerts: Arc<AlertManager>,
        settings: SchedulerSettings,
    ) -> Self {
        let (stop, _) = broadcast::channel(1);
        let rollup_manager = RollupManager::new(store.clone(), stop.clone());
        let retention_manager = RetentionManager::new(store.clone(), stop.clone());

        Self {
            store,
            tracker,
            stats,
            alerts,
            settings,
            probes: Mutex::new(HashMap::new()),
            stop,
            rollup_manager,
            retention_manager,
        }
    }

    /// Start the poll loop and the rollup and retention managers.
    pub async fn start(self: &Arc<Self>) -> Result<(), SchedulerError> {
        let services = self.store.list_services()?;
        tracing::info!(
            "Starting scheduler with {} services every {:?}",
            services.len(),
            self.settings.poll_interval
        );

        self.rollup_manager.start();
        self.retention_manager.start();

        let this = self.clone();
        let mut stop_rx = self.stop.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(this.settings.poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = stop_rx.recv() => break,
                    _ = interval.tick() => {
                        this.run_tick().await;
                    }
                }
            }
            tracing::info!("Scheduler stopped");
        });

        Ok(())
    }

    /// Stop the poll loop and the background managers.
    pub fn stop(&self) {
        let _ = self.stop.send(());
    }

    /// Check every enabled service once. A failing service never prevents the
    /// others from being checked.
    pub async fn run_tick(&self) -> Vec<CheckOutcome> {
        let services = match self.store.list_services() {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("Scheduler: failed to list services: {}", e);
                return Vec::new();
            }
        };

        self.tracker.prune(services.iter().map(|s| s.key.as_str()));
        let configured: HashSet<&str> = services.iter().map(|s| s.key.as_str()).collect();
        self.probes.lock().retain(|key, _| configured.contains(key.as_str()));

        let enabled: Vec<Service> = services.into_iter().filter(|s| s.enabled).collect();
        let outcomes: Vec<CheckOutcome> = stream::iter(enabled)
            .map(|service| async move { self.check(&service).await })
            .buffer_unordered(MAX_CONCURRENT_CHECKS)
            .collect()
            .await;

        let down = outcomes.iter().filter(|o| !o.ok).count();
        tracing::debug!("Scheduler: checked {} services, {} down", outcomes.len(), down);
        outcomes
    }

    /// Probe a service and run the result through the pipeline.
    pub async fn check(&self, service: &Service) -> CheckOutcome {
        let result = self.probe(service).await;
        self.process(service, result).0
    }

    /// Run the service's probe. Configuration problems become a failed result.
    async fn probe(&self, service: &Service) -> CheckResult {
        match self.probe_config(service) {
            Ok(config) => run_check(&config).await,
            Err(e) => CheckResult::failed(&e),
        }
    }

    /// Probe configuration for a service, resolved the first time the service
    /// is seen and again only after its settings change.
    fn probe_config(&self, service: &Service) -> Result<Arc<ProbeConfig>, ProbeError> {
        let mut probes = self.probes.lock();
        if let Some((seen, config)) = probes.get(&service.key) {
            if seen == service {
                return Ok(config.clone());
            }
        }
        let config = Arc::new(ProbeConfig::from_service(service)?);
        probes.insert(service.key.clone(), (service.clone(), config.clone()));
        Ok(config)
    }

    /// Check a service on demand. The probe is abandoned if `cancel` fires;
    /// once the probe completes the result is always recorded.
    pub async fn check_now(
        &self,
        key: &str,
        cancel: CancellationToken,
    ) -> Result<CheckOutcome, SchedulerError> {
        let service = match self.store.get_service(key) {
            Ok(s) => s,
            Err(DbError::NotFound) => return Err(SchedulerError::NotFound(key.to_string())),
            Err(e) => return Err(e.into()),
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SchedulerError::Cancelled),
            result = self.probe(&service) => result,
        };
        Ok(self.process(&service, result).0)
    }

    /// Enable or disable monitoring for a service. Either way its failure
    /// streak starts over.
    pub fn set_monitoring(&self, key: &str, enabled: bool) -> Result<(), SchedulerError> {
        match self.store.set_disabled_state(key, !enabled) {
            Err(DbError::NotFound) => return Err(SchedulerError::NotFound(key.to_string())),
            other => other?,
        }
        self.tracker.reset(key);
        tracing::info!(
            "Monitoring {} for {}",
            if enabled { "enabled" } else { "disabled" },
            key
        );
        Ok(())
    }

    /// Debounce, persist, record stats and alert. Each step logs its own
    /// failure and the remaining steps still run.
    fn process(
        &self,
        service: &Service,
        result: CheckResult,
    ) -> (CheckOutcome, Option<JoinHandle<Vec<Delivery>>>) {
        let key = &service.key;
        let failures = self.tracker.update(key, result.ok);
        let ok = adjusted_ok(result.ok, failures, self.settings.failure_threshold);
        let message = result.message();

        let sample = Sample {
            time: Utc::now(),
            service_key: key.clone(),
            ok,
            http_status: result.http_status,
            latency_ms: result.latency_ms,
        };
        if let Err(e) = self.store.insert_sample(&sample) {
            tracing::error!("Failed to save sample for {}: {}", key, e);
        }

        if let Err(e) =
            self.stats
                .record_check(key, ok, result.latency_ms, result.http_status, &message)
        {
            tracing::error!("Failed to record heartbeat for {}: {}", key, e);
        }

        let degraded = ok
            && result
                .latency_ms
                .is_some_and(|ms| ms > self.settings.degraded_threshold_ms);

        let (alert, delivery) = match self.alerts.check_and_send_alerts(service, ok, degraded) {
            Ok(decision) => {
                let kind = decision.fired();
                match decision {
                    AlertDecision::Fired { delivery, .. } => (kind, Some(delivery)),
                    _ => (None, None),
                }
            }
            Err(e) => {
                tracing::error!("Alert evaluation failed for {}: {}", key, e);
                (None, None)
            }
        };

        if !result.ok {
            tracing::debug!(
                "Check failed for {} ({} in a row): {}",
                key,
                failures,
                message
            );
        }

        let outcome = CheckOutcome {
            service_key: key.clone(),
            raw_ok: result.ok,
            ok,
            degraded,
            consecutive_failures: failures,
            http_status: result.http_status,
            latency_ms: result.latency_ms,
            message,
            alert,
        };
        (outcome, delivery)
    }
}
