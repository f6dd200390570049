//! Telegram Bot API channel.

use super::{ensure_success, http_client, ChannelError, Notification, NotificationChannel};

use serde_json::{json, Value};
use std::time::Duration;

const TELEGRAM_API: &str = "https://api.telegram.org";

#[derive(Debug)]
pub struct TelegramChannel {
    api_base: String,
    bot_token: String,
    chat_id: String,
    timeout: Duration,
}

impl TelegramChannel {
    pub fn new(bot_token: &str, chat_id: &str, timeout: Duration) -> Self {
        Self {
            api_base: TELEGRAM_API.to_string(),
            bot_token: bot_token.trim().to_string(),
            chat_id: chat_id.trim().to_string(),
            timeout,
        }
    }

    /// Point the channel at a different Bot API host.
    pub fn with_api_base(mut self, api_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/bot{}/sendMessage", self.api_base, self.bot_token)
    }
}

/// Escape the characters Telegram's HTML mode treats as markup.
fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

pub fn telegram_payload(chat_id: &str, n: &Notification) -> Value {
    let text = format!(
        "<b>{}</b>\n\n{}\n\n🕒 {}",
        escape_html(&n.subject),
        escape_html(&n.text()),
        n.formatted_time()
    );
    json!({
        "chat_id": chat_id,
        "text": text,
        "parse_mode": "HTML",
    })
}

#[async_trait::async_trait]
impl NotificationChannel for TelegramChannel {
    async fn send(&self, notification: &Notification) -> Result<(), ChannelError> {
        if self.bot_token.is_empty() || self.chat_id.is_empty() {
            return Err(ChannelError::Incomplete("telegram bot token and chat id are required"));
        }

        let response = http_client(self.timeout)?
            .post(self.endpoint())
            .json(&telegram_payload(&self.chat_id, notification))
            .send()
            .await?;
        ensure_success(response).await
    }

    fn name(&self) -> &str {
        "telegram"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::AlertKind;
    use crate::db::store::tests::service;
    use crate::test_util::spawn_server;
    use axum::{extract::Path, routing::post, Json, Router};
    use tokio::sync::mpsc;

    #[test]
    fn test_payload_is_html() {
        let mut svc = service("nas");
        svc.name = "NAS <home>".to_string();
        let n = Notification::for_transition(AlertKind::Down, &svc, "");
        let payload = telegram_payload("42", &n);

        assert_eq!(payload["chat_id"], "42");
        assert_eq!(payload["parse_mode"], "HTML");
        let text = payload["text"].as_str().unwrap();
        assert!(text.starts_with("<b>🔴 NAS &lt;home&gt; is DOWN</b>\n\n"));
        assert!(text.contains("\n\n🕒 "));
    }

    #[tokio::test]
    async fn test_send_uses_bot_endpoint() {
        let (tx, mut rx) = mpsc::unbounded_channel::<(String, Value)>();
        let app = Router::new().route(
            "/{bot}/sendMessage",
            post(move |Path(bot): Path<String>, Json(body): Json<Value>| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send((bot, body));
                    Json(json!({ "ok": true }))
                }
            }),
        );
        let addr = spawn_server(app).await;

        let channel = TelegramChannel::new("123:abc", "99", Duration::from_secs(5))
            .with_api_base(&format!("http://{}", addr));
        channel.send(&Notification::test("")).await.unwrap();

        let (bot, body) = rx.recv().await.unwrap();
        assert_eq!(bot, "bot123:abc");
        assert_eq!(body["chat_id"], "99");
    }

    #[tokio::test]
    async fn test_missing_credentials_are_incomplete() {
        let channel = TelegramChannel::new("token", "", Duration::from_secs(1));
        let err = channel.send(&Notification::test("")).await.unwrap_err();
        assert!(matches!(err, ChannelError::Incomplete(_)));
    }
}
