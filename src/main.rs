//! Upwatch - self-hosted uptime monitor.
//!
//! Polls configured services, debounces failures, keeps uptime statistics
//! and notifies over email, Discord, Telegram or webhooks on status changes.

mod alerts;
mod config;
mod db;
mod monitor;
mod probe;
mod scheduler;
mod stats;
#[cfg(test)]
mod test_util;
mod web;

use alerts::{AlertManager, AlertSettings};
use config::ServerConfig;
use db::Store;
use monitor::FailureTracker;
use scheduler::{Scheduler, SchedulerSettings};
use stats::StatsEngine;
use web::{AppState, Server};

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("upwatch=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load()?;
    tracing::info!("Starting Upwatch on port {}...", cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);

    // Initialize database
    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    // Add a demo service if none exist
    let services = store.list_services()?;
    if services.is_empty() {
        tracing::info!("Adding demo service");
        store.add_service(&db::Service {
            key: "demo".to_string(),
            name: "Demo".to_string(),
            url: "demo".to_string(),
            check_type: "always_up".to_string(),
            ..Default::default()
        })?;
    }

    let stats = Arc::new(StatsEngine::new(store.clone()));
    let keys: Vec<String> = store.list_services()?.into_iter().map(|s| s.key).collect();
    stats.warm(keys.iter().map(String::as_str))?;

    let alerts = Arc::new(AlertManager::new(
        store.clone(),
        AlertSettings {
            status_page_url: cfg.status_page_url.clone(),
            notify_timeout: cfg.notify_timeout,
        },
    )?);

    // Create and start scheduler
    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        Arc::new(FailureTracker::new()),
        stats.clone(),
        alerts.clone(),
        SchedulerSettings::from(&cfg),
    ));
    scheduler.start().await?;

    // Start web server
    let server = Server::new(AppState {
        config: cfg,
        store,
        stats,
        alerts,
        scheduler: scheduler.clone(),
    });
    let result = server.start().await;

    scheduler.stop();
    result
}
