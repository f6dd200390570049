//! Web server module.

mod handlers;

pub use handlers::*;

use crate::alerts::AlertManager;
use crate::config::ServerConfig;
use crate::db::Store;
use crate::scheduler::Scheduler;
use crate::stats::StatsEngine;

use axum::{
    extract::DefaultBodyLimit,
    routing::{delete, get, post, put},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub store: Arc<Store>,
    pub stats: Arc<StatsEngine>,
    pub alerts: Arc<AlertManager>,
    pub scheduler: Arc<Scheduler>,
}

/// Web server for Upwatch.
pub struct Server {
    state: AppState,
}

impl Server {
    /// Create a new server with the given dependencies.
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Build the router with all routes.
    pub fn routes(&self) -> Router {
        let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

        Router::new()
            .route("/healthz", get(handlers::handle_healthz))
            // Services
            .route("/api/services", get(handlers::handle_get_services))
            .route("/api/services", post(handlers::handle_create_service))
            .route("/api/services/{key}", delete(handlers::handle_delete_service))
            .route("/api/services/{key}/monitoring", put(handlers::handle_set_monitoring))
            .route("/api/services/{key}/status", get(handlers::handle_get_status))
            .route("/api/services/{key}/heartbeats", get(handlers::handle_get_heartbeats))
            .route("/api/services/{key}/history", get(handlers::handle_get_history))
            .route("/api/services/{key}/check", post(handlers::handle_check_now))
            // Alerts
            .route("/api/alerts/config", get(handlers::handle_get_alert_config))
            .route("/api/alerts/config", put(handlers::handle_put_alert_config))
            .route("/api/alerts/reload", post(handlers::handle_reload_alerts))
            .route("/api/alerts/test/{channel}", post(handlers::handle_test_alert))
            .layer(TraceLayer::new_for_http())
            .layer(cors)
            .layer(DefaultBodyLimit::max(1024 * 1024)) // 1MB
            .with_state(self.state.clone())
    }

    /// Start the server on the configured port.
    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let router = self.routes();

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router).await?;

        Ok(())
    }
}
