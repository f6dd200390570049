//! HTTP request handlers.

use super::AppState;
use crate::alerts::{infer_base_url, AlertError, ChannelKind};
use crate::db::{AlertConfig, BucketTier, DbError, Service, StatusHistory};
use crate::probe::CheckKind;
use crate::scheduler::SchedulerError;
use crate::stats::{ServiceStats, HEARTBEAT_BUFFER_SIZE};

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

const REDACTED: &str = "********";

fn internal_error(e: impl std::fmt::Display) -> Response {
    tracing::error!("Request failed: {}", e);
    (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
}

fn db_error(e: DbError) -> Response {
    match e {
        DbError::NotFound => (StatusCode::NOT_FOUND, "Service not found").into_response(),
        DbError::Invalid(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
        other => internal_error(other),
    }
}

pub async fn handle_healthz() -> &'static str {
    "ok"
}

// ============================================================================
// API: Services
// ============================================================================

pub async fn handle_get_services(State(state): State<AppState>, headers: HeaderMap) -> Response {
    state.alerts.note_base_url(infer_base_url(&headers));
    match state.store.list_services() {
        Ok(services) => Json(services).into_response(),
        Err(e) => db_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateServiceRequest {
    pub key: String,
    #[serde(default)]
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub check_type: Option<String>,
    #[serde(default)]
    pub service_type: String,
    #[serde(default)]
    pub expected_status_min: Option<u16>,
    #[serde(default)]
    pub expected_status_max: Option<u16>,
    #[serde(default)]
    pub timeout: f64,
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default)]
    pub depends_on: String,
}

impl CreateServiceRequest {
    fn into_service(self) -> Service {
        let defaults = Service::default();
        let key = self.key.trim().to_string();
        Service {
            name: if self.name.trim().is_empty() {
                key.clone()
            } else {
                self.name
            },
            key,
            url: self.url.trim().to_string(),
            check_type: self.check_type.unwrap_or(defaults.check_type),
            service_type: self.service_type,
            expected_status_min: self.expected_status_min.unwrap_or(defaults.expected_status_min),
            expected_status_max: self.expected_status_max.unwrap_or(defaults.expected_status_max),
            timeout: self.timeout,
            api_token: self.api_token.filter(|t| !t.is_empty()),
            depends_on: self.depends_on,
            enabled: true,
        }
    }
}

pub async fn handle_create_service(
    State(state): State<AppState>,
    Json(req): Json<CreateServiceRequest>,
) -> Response {
    let service = req.into_service();

    if !["http", "tcp", "dns", "always_up", "demo"].contains(&service.check_type.as_str()) {
        return (StatusCode::BAD_REQUEST, "Invalid check type").into_response();
    }
    if let Err(e) = CheckKind::resolve(&service.check_type, &service.url) {
        return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
    }
    if state.store.get_service(&service.key).is_ok() {
        return (StatusCode::CONFLICT, "Service key already exists").into_response();
    }

    match state.store.add_service(&service) {
        Ok(()) => {
            tracing::info!("Added service {} ({})", service.key, service.check_type);
            (StatusCode::CREATED, Json(service)).into_response()
        }
        Err(e) => db_error(e),
    }
}

pub async fn handle_delete_service(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Response {
    match state.store.delete_service(&key) {
        Ok(()) => {
            state.stats.forget(&key);
            tracing::info!("Deleted service {}", key);
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => db_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct MonitoringRequest {
    pub enabled: bool,
}

pub async fn handle_set_monitoring(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(req): Json<MonitoringRequest>,
) -> Response {
    match state.scheduler.set_monitoring(&key, req.enabled) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(SchedulerError::NotFound(_)) => {
            (StatusCode::NOT_FOUND, "Service not found").into_response()
        }
        Err(e) => internal_error(e),
    }
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub key: String,
    pub enabled: bool,
    #[serde(flatten)]
    pub stats: ServiceStats,
    pub last_status: Option<StatusHistory>,
}

pub async fn handle_get_status(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Response {
    let service = match state.store.get_service(&key) {
        Ok(s) => s,
        Err(e) => return db_error(e),
    };

    let stats = match state.stats.summary(&key) {
        Ok(s) => s,
        Err(e) => return db_error(e),
    };

    let last_status = match state.store.get_last_status(&key) {
        Ok(s) => s,
        Err(e) => return db_error(e),
    };

    Json(StatusResponse {
        key,
        enabled: service.enabled,
        stats,
        last_status,
    })
    .into_response()
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatsQuery {
    pub limit: Option<usize>,
}

pub async fn handle_get_heartbeats(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(q): Query<HeartbeatsQuery>,
) -> Response {
    let limit = q.limit.unwrap_or(HEARTBEAT_BUFFER_SIZE).clamp(1, HEARTBEAT_BUFFER_SIZE);
    Json(state.stats.get_recent_heartbeats(&key, limit)).into_response()
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub tier: Option<String>,
}

pub async fn handle_get_history(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(q): Query<HistoryQuery>,
) -> Response {
    let tier = match q.tier.as_deref() {
        None => BucketTier::Hourly,
        Some(t) => match BucketTier::parse(t) {
            Some(tier) => tier,
            None => return (StatusCode::BAD_REQUEST, "Invalid tier").into_response(),
        },
    };

    let span = match tier {
        BucketTier::Minutely => ChronoDuration::hours(24),
        BucketTier::Hourly => ChronoDuration::days(30),
        BucketTier::Daily => ChronoDuration::days(365),
    };

    match state.stats.history(&key, tier, Utc::now() - span) {
        Ok(buckets) => Json(buckets).into_response(),
        Err(e) => db_error(e),
    }
}

pub async fn handle_check_now(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Response {
    // Cancelled when the client disconnects and axum drops this future.
    let token = CancellationToken::new();
    let _guard = token.clone().drop_guard();

    match state.scheduler.check_now(&key, token).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(SchedulerError::NotFound(_)) => {
            (StatusCode::NOT_FOUND, "Service not found").into_response()
        }
        Err(e) => internal_error(e),
    }
}

// ============================================================================
// API: Alerts
// ============================================================================

fn redact(mut cfg: AlertConfig) -> AlertConfig {
    for secret in [
        &mut cfg.smtp_password,
        &mut cfg.telegram_bot_token,
        &mut cfg.webhook_secret,
    ] {
        if !secret.is_empty() {
            *secret = REDACTED.to_string();
        }
    }
    cfg
}

pub async fn handle_get_alert_config(State(state): State<AppState>) -> Response {
    Json(redact(state.alerts.config())).into_response()
}

pub async fn handle_put_alert_config(
    State(state): State<AppState>,
    Json(mut cfg): Json<AlertConfig>,
) -> Response {
    // Redacted placeholders mean "keep the stored secret".
    let current = state.alerts.config();
    if cfg.smtp_password == REDACTED {
        cfg.smtp_password = current.smtp_password;
    }
    if cfg.telegram_bot_token == REDACTED {
        cfg.telegram_bot_token = current.telegram_bot_token;
    }
    if cfg.webhook_secret == REDACTED {
        cfg.webhook_secret = current.webhook_secret;
    }

    match state.alerts.save_config(&cfg) {
        Ok(()) => Json(redact(state.alerts.config())).into_response(),
        Err(e) => internal_error(e),
    }
}

pub async fn handle_reload_alerts(State(state): State<AppState>) -> Response {
    match state.alerts.reload() {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => internal_error(e),
    }
}

pub async fn handle_test_alert(
    State(state): State<AppState>,
    Path(channel): Path<String>,
    headers: HeaderMap,
) -> Response {
    let Some(kind) = ChannelKind::parse(&channel) else {
        return (
            StatusCode::NOT_FOUND,
            AlertError::UnknownChannel(channel).to_string(),
        )
            .into_response();
    };

    let inferred = infer_base_url(&headers);
    let outcome = state.alerts.send_test(kind, inferred.as_deref()).await;
    Json(outcome).into_response()
}
