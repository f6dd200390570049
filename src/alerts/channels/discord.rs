//! Discord webhook channel.

use super::{ensure_success, http_client, AlertKind, ChannelError, Notification, NotificationChannel};

use serde_json::{json, Value};
use std::time::Duration;

pub const DISCORD_RED: u32 = 0xE74C3C;
pub const DISCORD_YELLOW: u32 = 0xF1C40F;
pub const DISCORD_GREEN: u32 = 0x2ECC71;

#[derive(Debug)]
pub struct DiscordChannel {
    webhook_url: String,
    timeout: Duration,
}

impl DiscordChannel {
    pub fn new(webhook_url: &str, timeout: Duration) -> Self {
        Self {
            webhook_url: webhook_url.trim().to_string(),
            timeout,
        }
    }
}

pub fn embed_color(kind: AlertKind) -> u32 {
    match kind {
        AlertKind::Down => DISCORD_RED,
        AlertKind::Degraded => DISCORD_YELLOW,
        AlertKind::Up => DISCORD_GREEN,
    }
}

/// Build the webhook body: one embed with Service, Status and Time fields.
pub fn discord_payload(n: &Notification) -> Value {
    json!({
        "username": "Upwatch",
        "embeds": [{
            "title": n.subject,
            "description": n.text(),
            "color": embed_color(n.kind),
            "fields": [
                { "name": "Service", "value": n.service_name, "inline": true },
                { "name": "Status", "value": n.status_label(), "inline": true },
                { "name": "Time", "value": n.formatted_time(), "inline": false }
            ],
            "timestamp": n.timestamp.to_rfc3339()
        }]
    })
}

#[async_trait::async_trait]
impl NotificationChannel for DiscordChannel {
    async fn send(&self, notification: &Notification) -> Result<(), ChannelError> {
        if self.webhook_url.is_empty() {
            return Err(ChannelError::Incomplete("discord webhook URL is not set"));
        }

        let response = http_client(self.timeout)?
            .post(&self.webhook_url)
            .json(&discord_payload(notification))
            .send()
            .await?;
        ensure_success(response).await
    }

    fn name(&self) -> &str {
        "discord"
    }
}
