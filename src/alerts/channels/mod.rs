//! Notification channel implementations.

mod discord;
mod email;
mod telegram;
mod webhook;

pub use discord::*;
pub use email::*;
pub use telegram::*;
pub use webhook::*;

use crate::db::{AlertConfig, Service};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Channel error types.
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("configuration incomplete: {0}")]
    Incomplete(&'static str),
    #[error("request failed: {0}")]
    Http(String),
    #[error("endpoint returned status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("smtp error: {0}")]
    Smtp(String),
}

impl From<reqwest::Error> for ChannelError {
    fn from(e: reqwest::Error) -> Self {
        ChannelError::Http(e.without_url().to_string())
    }
}

/// What happened to the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertKind {
    Down,
    Degraded,
    Up,
}

impl AlertKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertKind::Down => "down",
            AlertKind::Degraded => "degraded",
            AlertKind::Up => "up",
        }
    }

    fn label(self) -> &'static str {
        match self {
            AlertKind::Down => "DOWN",
            AlertKind::Degraded => "DEGRADED",
            AlertKind::Up => "UP",
        }
    }
}

/// A notification ready to hand to any channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub kind: AlertKind,
    pub service_key: String,
    pub service_name: String,
    pub subject: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    /// Dashboard link; empty when unknown.
    pub status_page_url: String,
}

impl Notification {
    pub fn for_transition(kind: AlertKind, service: &Service, status_page_url: &str) -> Self {
        let name = display_name(service);
        let (subject, message) = match kind {
            AlertKind::Down => (
                format!("🔴 {} is DOWN", name),
                format!("{} stopped responding to health checks.", name),
            ),
            AlertKind::Degraded => (
                format!("🟡 {} is DEGRADED", name),
                format!("{} is responding slowly.", name),
            ),
            AlertKind::Up => (
                format!("🟢 {} is back UP", name),
                format!("{} has recovered and is responding normally.", name),
            ),
        };
        Self {
            kind,
            service_key: service.key.clone(),
            service_name: name.to_string(),
            subject,
            message,
            timestamp: Utc::now(),
            status_page_url: status_page_url.to_string(),
        }
    }

    /// A harmless notification used to verify channel settings.
    pub fn test(status_page_url: &str) -> Self {
        Self {
            kind: AlertKind::Up,
            service_key: "test".to_string(),
            service_name: "Upwatch".to_string(),
            subject: "🔔 Upwatch test notification".to_string(),
            message: "If you can read this, notifications are configured correctly.".to_string(),
            timestamp: Utc::now(),
            status_page_url: status_page_url.to_string(),
        }
    }

    /// Message text with the dashboard link appended, if any.
    pub fn text(&self) -> String {
        if self.status_page_url.is_empty() {
            self.message.clone()
        } else {
            format!("{}\n\nView dashboard: {}", self.message, self.status_page_url)
        }
    }

    pub fn status_label(&self) -> &'static str {
        self.kind.label()
    }

    pub fn formatted_time(&self) -> String {
        self.timestamp.format("%Y-%m-%d %H:%M:%S UTC").to_string()
    }
}

fn display_name(service: &Service) -> &str {
    if service.name.trim().is_empty() {
        &service.key
    } else {
        &service.name
    }
}

/// Which delivery mechanism a channel uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Email,
    Discord,
    Telegram,
    Webhook,
}

impl ChannelKind {
    pub const ALL: [ChannelKind; 4] = [
        ChannelKind::Email,
        ChannelKind::Discord,
        ChannelKind::Telegram,
        ChannelKind::Webhook,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ChannelKind::Email => "email",
            ChannelKind::Discord => "discord",
            ChannelKind::Telegram => "telegram",
            ChannelKind::Webhook => "webhook",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }

    /// Whether the channel is switched on in the config.
    pub fn is_enabled(self, cfg: &AlertConfig) -> bool {
        match self {
            ChannelKind::Email => cfg.email_enabled,
            ChannelKind::Discord => cfg.discord_enabled,
            ChannelKind::Telegram => cfg.telegram_enabled,
            ChannelKind::Webhook => cfg.webhook_enabled,
        }
    }
}

/// Notification channel trait
#[async_trait::async_trait]
pub trait NotificationChannel: Send + Sync + std::fmt::Debug {
    /// Deliver a notification. Must give up within the channel's timeout.
    async fn send(&self, notification: &Notification) -> Result<(), ChannelError>;

    /// Name used in logs.
    fn name(&self) -> &str;
}

/// Build a channel from config, whether or not it is enabled.
pub fn build_channel(
    kind: ChannelKind,
    cfg: &AlertConfig,
    timeout: Duration,
) -> Arc<dyn NotificationChannel> {
    match kind {
        ChannelKind::Email => Arc::new(EmailChannel::from_config(cfg, timeout)),
        ChannelKind::Discord => Arc::new(DiscordChannel::new(&cfg.discord_webhook_url, timeout)),
        ChannelKind::Telegram => Arc::new(TelegramChannel::new(
            &cfg.telegram_bot_token,
            &cfg.telegram_chat_id,
            timeout,
        )),
        ChannelKind::Webhook => Arc::new(WebhookChannel::new(
            &cfg.webhook_url,
            &cfg.webhook_secret,
            timeout,
        )),
    }
}

/// All channels enabled in the config.
pub fn enabled_channels(cfg: &AlertConfig, timeout: Duration) -> Vec<Arc<dyn NotificationChannel>> {
    ChannelKind::ALL
        .into_iter()
        .filter(|kind| kind.is_enabled(cfg))
        .map(|kind| build_channel(kind, cfg, timeout))
        .collect()
}

/// A JSON-posting client with the per-channel timeout applied.
pub(crate) fn http_client(timeout: Duration) -> Result<reqwest::Client, ChannelError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("Upwatch/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(ChannelError::from)
}

/// Turn a non-2xx response into an error carrying a short body excerpt.
pub(crate) async fn ensure_success(response: reqwest::Response) -> Result<(), ChannelError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    Err(ChannelError::Rejected {
        status: status.as_u16(),
        body: body.chars().take(200).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::store::tests::service;

    #[test]
    fn test_notification_text_includes_dashboard_link() {
        let svc = service("web");
        let n = Notification::for_transition(AlertKind::Down, &svc, "http://status.local");
        assert_eq!(n.subject, "🔴 WEB is DOWN");
        assert!(n.text().ends_with("View dashboard: http://status.local"));

        let bare = Notification::for_transition(AlertKind::Up, &svc, "");
        assert_eq!(bare.text(), bare.message);
    }

    #[test]
    fn test_enabled_channels_follow_toggles() {
        let cfg = AlertConfig {
            enabled: true,
            discord_enabled: true,
            webhook_enabled: true,
            ..Default::default()
        };
        let names: Vec<String> = enabled_channels(&cfg, Duration::from_secs(1))
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        assert_eq!(names, vec!["discord", "webhook"]);
    }

    #[test]
    fn test_channel_kind_parse() {
        assert_eq!(ChannelKind::parse("telegram"), Some(ChannelKind::Telegram));
        assert_eq!(ChannelKind::parse("pager"), None);
    }
}
