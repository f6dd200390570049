//! Alert manager: status transitions, dependency suppression and fan-out to
//! notification channels.
//!
//! One call per check decides whether the service crossed a reportable
//! boundary (down, recovered, degraded), persists the new status and, when an
//! alert is due, sends it to every enabled channel on a background task.

mod channels;
mod status_page;

pub use channels::*;
pub use status_page::*;

use crate::db::{AlertConfig, DbError, LogLevel, Service, StatusHistory, Store};
use crate::probe::sanitize_error;

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

/// Default per-channel delivery timeout.
pub const DEFAULT_NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Alert error types.
#[derive(Error, Debug)]
pub enum AlertError {
    #[error("database error: {0}")]
    Db(#[from] DbError),
    #[error("unknown notification channel: {0}")]
    UnknownChannel(String),
}

/// Process-level alert settings that do not live in the database.
#[derive(Debug, Clone)]
pub struct AlertSettings {
    /// Used when the stored config has no status page URL.
    pub status_page_url: String,
    pub notify_timeout: Duration,
}

impl Default for AlertSettings {
    fn default() -> Self {
        Self {
            status_page_url: String::new(),
            notify_timeout: DEFAULT_NOTIFY_TIMEOUT,
        }
    }
}

/// What a call to [`AlertManager::check_and_send_alerts`] did.
#[derive(Debug)]
pub enum AlertDecision {
    /// Alerting is switched off; status was still recorded.
    Disabled,
    /// No reportable transition.
    Silent,
    /// An alert was due but an upstream dependency is down.
    Suppressed { kind: AlertKind, upstream: String },
    /// An alert was handed to the channels. Awaiting the handle is optional.
    Fired {
        kind: AlertKind,
        delivery: JoinHandle<Vec<Delivery>>,
    },
}

impl AlertDecision {
    pub fn fired(&self) -> Option<AlertKind> {
        match self {
            AlertDecision::Fired { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

/// Outcome of one channel delivery.
#[derive(Debug, Clone, Serialize)]
pub struct Delivery {
    pub channel: String,
    /// Sanitized failure reason.
    pub error: Option<String>,
}

impl Delivery {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Result of an admin-triggered test notification.
#[derive(Debug, Clone, Serialize)]
pub struct TestOutcome {
    pub success: bool,
    pub message: String,
}

/// Decide which alert, if any, a status change warrants.
///
/// Without a previous status only down or degraded are announced. With one,
/// a down transition wins over recovery, which wins over degradation.
pub fn transition(
    previous: Option<&StatusHistory>,
    ok: bool,
    degraded: bool,
    cfg: &AlertConfig,
) -> Option<AlertKind> {
    match previous {
        None => {
            if !ok && cfg.alert_on_down {
                Some(AlertKind::Down)
            } else if ok && degraded && cfg.alert_on_degraded {
                Some(AlertKind::Degraded)
            } else {
                None
            }
        }
        Some(prev) => {
            if prev.ok && !ok && cfg.alert_on_down {
                Some(AlertKind::Down)
            } else if !prev.ok && ok && cfg.alert_on_up {
                Some(AlertKind::Up)
            } else if !prev.degraded && degraded && ok && cfg.alert_on_degraded {
                Some(AlertKind::Degraded)
            } else {
                None
            }
        }
    }
}

/// Owned by the application root and shared with the scheduler and web layer.
pub struct AlertManager {
    store: Arc<Store>,
    config: RwLock<AlertConfig>,
    settings: AlertSettings,
    inferred_base_url: RwLock<Option<String>>,
    /// Fixed channel set replacing the config-derived one.
    channels: Option<Vec<Arc<dyn NotificationChannel>>>,
    /// Held from reading the previous status until the new one is written.
    decisions: Mutex<()>,
}

impl AlertManager {
    pub fn new(store: Arc<Store>, settings: AlertSettings) -> Result<Self, AlertError> {
        let config = store.get_alert_config()?;
        Ok(Self {
            store,
            config: RwLock::new(config),
            settings,
            inferred_base_url: RwLock::new(None),
            channels: None,
            decisions: Mutex::new(()),
        })
    }

    /// Deliver to these channels instead of the ones enabled in the config.
    pub fn with_channels(mut self, channels: Vec<Arc<dyn NotificationChannel>>) -> Self {
        self.channels = Some(channels);
        self
    }

    pub fn config(&self) -> AlertConfig {
        self.config.read().clone()
    }

    /// Re-read the alert config from the store.
    pub fn reload(&self) -> Result<(), AlertError> {
        let cfg = self.store.get_alert_config()?;
        *self.config.write() = cfg;
        tracing::info!("Alert configuration reloaded");
        Ok(())
    }

    pub fn save_config(&self, cfg: &AlertConfig) -> Result<(), AlertError> {
        self.store.save_alert_config(cfg)?;
        self.reload()
    }

    /// Remember the base URL clients reach us on, as a last-resort dashboard link.
    pub fn note_base_url(&self, base: Option<String>) {
        if let Some(base) = base {
            *self.inferred_base_url.write() = Some(base);
        }
    }

    pub fn status_page_url(&self) -> String {
        let remembered = self.inferred_base_url.read().clone();
        resolve_status_page_url(
            &self.config.read().status_page_url,
            &self.settings.status_page_url,
            remembered.as_deref(),
        )
    }

    /// Evaluate a check outcome, record the new status and dispatch any alert.
    /// Does nothing at all while alerting is disabled.
    pub fn check_and_send_alerts(
        &self,
        service: &Service,
        ok: bool,
        degraded: bool,
    ) -> Result<AlertDecision, AlertError> {
        let cfg = self.config();
        if !cfg.enabled {
            return Ok(AlertDecision::Disabled);
        }

        // Concurrent checks of one service must not both act on the old status.
        let serial = self.decisions.lock();
        let previous = self.store.get_last_status(&service.key)?;
        let kind = transition(previous.as_ref(), ok, degraded, &cfg);
        let upstream = match kind {
            Some(_) => self.down_dependency(service)?,
            None => None,
        };
        self.store.upsert_status_history(&service.key, ok, degraded)?;
        drop(serial);

        let Some(kind) = kind else {
            return Ok(AlertDecision::Silent);
        };

        if let Some(upstream) = upstream {
            let message = format!(
                "Suppressed {} alert for {}: dependency {} is down",
                kind.as_str(),
                service.key,
                upstream
            );
            tracing::warn!("{}", message);
            self.store
                .insert_log(LogLevel::Warn, "alert", &service.key, &message, "")?;
            return Ok(AlertDecision::Suppressed { kind, upstream });
        }

        let notification = Notification::for_transition(kind, service, &self.status_page_url());
        Ok(AlertDecision::Fired {
            kind,
            delivery: self.dispatch(&cfg, notification),
        })
    }

    /// First declared dependency whose last recorded status is down.
    fn down_dependency(&self, service: &Service) -> Result<Option<String>, DbError> {
        for dep in service.dependencies() {
            if dep == service.key {
                continue;
            }
            if let Some(status) = self.store.get_last_status(dep)? {
                if !status.ok {
                    return Ok(Some(dep.to_string()));
                }
            }
        }
        Ok(None)
    }

    fn dispatch(&self, cfg: &AlertConfig, notification: Notification) -> JoinHandle<Vec<Delivery>> {
        let channels = match &self.channels {
            Some(channels) => channels.clone(),
            None => enabled_channels(cfg, self.settings.notify_timeout),
        };
        if channels.is_empty() {
            tracing::debug!("No notification channels enabled for {}", notification.service_key);
        }
        let store = self.store.clone();

        tokio::spawn(async move {
            let sends = channels.iter().map(|channel| {
                let notification = &notification;
                async move { (channel.name().to_string(), channel.send(notification).await) }
            });
            join_all(sends)
                .await
                .into_iter()
                .map(|(channel, result)| record_delivery(&store, &notification, channel, result))
                .collect()
        })
    }

    /// Send a test notification through one channel, enabled or not.
    pub async fn send_test(&self, kind: ChannelKind, inferred_base: Option<&str>) -> TestOutcome {
        let cfg = self.config();
        let remembered = self.inferred_base_url.read().clone();
        let url = resolve_status_page_url(
            &cfg.status_page_url,
            &self.settings.status_page_url,
            inferred_base.or(remembered.as_deref()),
        );

        let channel = build_channel(kind, &cfg, self.settings.notify_timeout);
        let outcome = match channel.send(&Notification::test(&url)).await {
            Ok(()) => TestOutcome {
                success: true,
                message: format!("Test notification sent via {}", kind.as_str()),
            },
            Err(e) => TestOutcome {
                success: false,
                message: sanitize_error(&e.to_string()),
            },
        };

        let (level, summary) = if outcome.success {
            (LogLevel::Info, format!("Test notification via {} succeeded", kind.as_str()))
        } else {
            (LogLevel::Error, format!("Test notification via {} failed", kind.as_str()))
        };
        if let Err(e) = self
            .store
            .insert_log(level, "notification", "", &summary, &outcome.message)
        {
            tracing::error!("Failed to write audit log: {}", e);
        }
        outcome
    }
}

fn record_delivery(
    store: &Store,
    notification: &Notification,
    channel: String,
    result: Result<(), ChannelError>,
) -> Delivery {
    let kind = notification.kind.as_str();
    let key = &notification.service_key;

    let (level, message, error) = match result {
        Ok(()) => {
            tracing::info!("Sent {} alert for {} via {}", kind, key, channel);
            (LogLevel::Info, format!("Sent {} alert via {}", kind, channel), None)
        }
        Err(e) => {
            let reason = sanitize_error(&e.to_string());
            tracing::warn!("Failed to send {} alert for {} via {}: {}", kind, key, channel, reason);
            (
                LogLevel::Error,
                format!("Failed to send {} alert via {}", kind, channel),
                Some(reason),
            )
        }
    };

    let details = error.as_deref().unwrap_or_default();
    if let Err(e) = store.insert_log(level, "notification", key, &message, details) {
        tracing::error!("Failed to write audit log: {}", e);
    }

    Delivery { channel, error }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::store::tests::{service, temp_store};
    use parking_lot::Mutex;
    use tempfile::NamedTempFile;

    #[derive(Debug, Default)]
    struct FakeChannel {
        name: &'static str,
        fail: bool,
        sent: Mutex<Vec<AlertKind>>,
    }

    impl FakeChannel {
        fn new(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                ..Default::default()
            })
        }

        fn failing(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                fail: true,
                ..Default::default()
            })
        }

        fn sent(&self) -> Vec<AlertKind> {
            self.sent.lock().clone()
        }
    }

    #[async_trait::async_trait]
    impl NotificationChannel for FakeChannel {
        async fn send(&self, notification: &Notification) -> Result<(), ChannelError> {
            self.sent.lock().push(notification.kind);
            if self.fail {
                return Err(ChannelError::Http(
                    "connection refused for https://hooks.local/?token=abc".to_string(),
                ));
            }
            Ok(())
        }

        fn name(&self) -> &str {
            self.name
        }
    }

    fn all_toggles() -> AlertConfig {
        AlertConfig {
            enabled: true,
            alert_on_down: true,
            alert_on_up: true,
            alert_on_degraded: true,
            ..Default::default()
        }
    }

    fn manager(
        cfg: AlertConfig,
        channels: Vec<Arc<dyn NotificationChannel>>,
    ) -> (NamedTempFile, Arc<Store>, AlertManager) {
        let (tmp, store) = temp_store();
        let store = Arc::new(store);
        store.save_alert_config(&cfg).unwrap();
        let alerts = AlertManager::new(store.clone(), AlertSettings::default())
            .unwrap()
            .with_channels(channels);
        (tmp, store, alerts)
    }

    async fn settle(decision: AlertDecision) -> Option<Vec<Delivery>> {
        match decision {
            AlertDecision::Fired { delivery, .. } => Some(delivery.await.unwrap()),
            _ => None,
        }
    }

    fn status(ok: bool, degraded: bool) -> StatusHistory {
        StatusHistory {
            ok,
            degraded,
            updated_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_transition_first_observation() {
        let cfg = all_toggles();
        assert_eq!(transition(None, true, false, &cfg), None);
        assert_eq!(transition(None, false, false, &cfg), Some(AlertKind::Down));
        assert_eq!(transition(None, true, true, &cfg), Some(AlertKind::Degraded));

        let quiet = AlertConfig {
            alert_on_down: false,
            ..all_toggles()
        };
        assert_eq!(transition(None, false, false, &quiet), None);
    }

    #[test]
    fn test_transition_priority() {
        let cfg = all_toggles();
        let up = status(true, false);
        let down = status(false, false);
        let slow = status(true, true);

        assert_eq!(transition(Some(&up), false, false, &cfg), Some(AlertKind::Down));
        assert_eq!(transition(Some(&slow), false, false, &cfg), Some(AlertKind::Down));
        // Recovering straight into a slow state is reported as recovery.
        assert_eq!(transition(Some(&down), true, true, &cfg), Some(AlertKind::Up));
        assert_eq!(transition(Some(&up), true, true, &cfg), Some(AlertKind::Degraded));
        assert_eq!(transition(Some(&slow), true, true, &cfg), None);
        assert_eq!(transition(Some(&down), false, false, &cfg), None);

        let no_recovery = AlertConfig {
            alert_on_up: false,
            ..all_toggles()
        };
        assert_eq!(transition(Some(&down), true, false, &no_recovery), None);
    }

    #[tokio::test]
    async fn test_each_transition_fires_once() {
        let fake = FakeChannel::new("fake");
        let (_tmp, store, alerts) = manager(all_toggles(), vec![fake.clone() as Arc<dyn NotificationChannel>]);
        let svc = service("web");

        let sequence = [(true, false), (false, false), (true, false), (true, true), (false, false)];
        let mut fired = Vec::new();
        for (ok, degraded) in sequence {
            let decision = alerts.check_and_send_alerts(&svc, ok, degraded).unwrap();
            fired.push(decision.fired());
            settle(decision).await;
        }

        assert_eq!(
            fired,
            vec![None, Some(AlertKind::Down), Some(AlertKind::Up), Some(AlertKind::Degraded), Some(AlertKind::Down)]
        );
        assert_eq!(fake.sent().len(), 4);

        let last = store.get_last_status("web").unwrap().unwrap();
        assert!(!last.ok);
    }

    #[tokio::test]
    async fn test_disabled_alerting_has_no_side_effects() {
        let fake = FakeChannel::new("fake");
        let (_tmp, store, alerts) = manager(AlertConfig::default(), vec![fake.clone() as Arc<dyn NotificationChannel>]);
        let svc = service("web");

        let decision = alerts.check_and_send_alerts(&svc, false, false).unwrap();
        assert!(matches!(decision, AlertDecision::Disabled));
        assert!(store.get_last_status("web").unwrap().is_none());
        assert!(store.get_logs(None, 10).unwrap().is_empty());

        alerts.save_config(&all_toggles()).unwrap();
        let decision = alerts.check_and_send_alerts(&svc, false, false).unwrap();
        assert_eq!(decision.fired(), Some(AlertKind::Down));
        settle(decision).await;
        assert_eq!(fake.sent(), vec![AlertKind::Down]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_checks_alert_once() {
        let fake = FakeChannel::new("fake");
        let (_tmp, store, alerts) = manager(all_toggles(), vec![fake.clone() as Arc<dyn NotificationChannel>]);
        store.upsert_status_history("web", true, false).unwrap();
        let alerts = Arc::new(alerts);

        let racers: Vec<_> = (0..8)
            .map(|_| {
                let alerts = alerts.clone();
                tokio::task::spawn_blocking(move || {
                    alerts.check_and_send_alerts(&service("web"), false, false).unwrap()
                })
            })
            .collect();

        let mut fired = 0;
        for racer in racers {
            let decision = racer.await.unwrap();
            if decision.fired().is_some() {
                fired += 1;
            }
            settle(decision).await;
        }
        assert_eq!(fired, 1);
        assert_eq!(fake.sent(), vec![AlertKind::Down]);
    }

    #[tokio::test]
    async fn test_suppressed_cascade() {
        let fake = FakeChannel::new("fake");
        let (_tmp, store, alerts) = manager(all_toggles(), vec![fake.clone() as Arc<dyn NotificationChannel>]);

        store.upsert_status_history("nas", false, false).unwrap();
        store.upsert_status_history("plex", true, false).unwrap();
        let mut plex = service("plex");
        plex.depends_on = "router, nas".to_string();

        let decision = alerts.check_and_send_alerts(&plex, false, false).unwrap();
        match decision {
            AlertDecision::Suppressed { kind, upstream } => {
                assert_eq!(kind, AlertKind::Down);
                assert_eq!(upstream, "nas");
            }
            other => panic!("expected suppression, got {:?}", other),
        }

        assert!(fake.sent().is_empty());
        assert!(!store.get_last_status("plex").unwrap().unwrap().ok);

        let logs = store.get_logs(Some("alert"), 10).unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].level, "warn");
        assert_eq!(logs[0].service_key, "plex");
    }

    #[tokio::test]
    async fn test_failing_channel_does_not_block_others() {
        let good = FakeChannel::new("good");
        let bad = FakeChannel::failing("bad");
        let (_tmp, store, alerts) = manager(all_toggles(), vec![bad.clone() as Arc<dyn NotificationChannel>, good.clone()]);

        let decision = alerts.check_and_send_alerts(&service("web"), false, false).unwrap();
        let deliveries = settle(decision).await.unwrap();

        assert_eq!(deliveries.len(), 2);
        assert!(!deliveries[0].succeeded());
        assert!(deliveries[1].succeeded());
        assert_eq!(good.sent(), vec![AlertKind::Down]);

        let reason = deliveries[0].error.as_deref().unwrap();
        assert!(!reason.contains("token=abc"));

        let logs = store.get_logs(Some("notification"), 10).unwrap();
        assert_eq!(logs.len(), 2);
        assert!(logs.iter().any(|l| l.level == "error"));
    }

    #[tokio::test]
    async fn test_send_test_reports_incomplete_email() {
        let cfg = AlertConfig {
            email_enabled: true,
            smtp_to: "ops@example.com".to_string(),
            ..all_toggles()
        };
        let (_tmp, store, alerts) = manager(cfg, Vec::new());

        let outcome = alerts.send_test(ChannelKind::Email, None).await;
        assert!(!outcome.success);
        assert!(outcome.message.contains("incomplete"));
        assert_eq!(store.get_logs(Some("notification"), 10).unwrap().len(), 1);
    }

    #[test]
    fn test_status_page_url_precedence() {
        let (_tmp, store) = temp_store();
        let store = Arc::new(store);
        let settings = AlertSettings {
            status_page_url: "status.env".to_string(),
            ..Default::default()
        };
        let alerts = AlertManager::new(store, settings).unwrap();
        alerts.note_base_url(Some("http://req:8080".to_string()));
        assert_eq!(alerts.status_page_url(), "http://status.env");

        let cfg = AlertConfig {
            status_page_url: "https://status.example/".to_string(),
            ..AlertConfig::default()
        };
        alerts.save_config(&cfg).unwrap();
        assert_eq!(alerts.status_page_url(), "https://status.example");
    }
}
