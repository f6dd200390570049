//! Generic JSON webhook channel with optional HMAC signing.

use super::{ensure_success, http_client, ChannelError, Notification, NotificationChannel};

use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Upwatch-Signature";
pub const WEBHOOK_USER_AGENT: &str = concat!("Upwatch-Webhook/", env!("CARGO_PKG_VERSION"));

/// JSON body of a webhook delivery.
#[derive(Debug, Serialize)]
pub struct WebhookPayload<'a> {
    pub event: &'static str,
    pub service_key: &'a str,
    pub service_name: &'a str,
    pub status: &'static str,
    pub subject: &'a str,
    pub message: &'a str,
    pub timestamp: String,
}

impl<'a> WebhookPayload<'a> {
    pub fn new(n: &'a Notification) -> Self {
        Self {
            event: "status_change",
            service_key: &n.service_key,
            service_name: &n.service_name,
            status: n.kind.as_str(),
            subject: &n.subject,
            message: &n.message,
            timestamp: n.timestamp.to_rfc3339(),
        }
    }
}

/// Signature header value for a raw body: `sha256=<hex>`.
pub fn sign_payload(secret: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Check a received signature header against the raw body in constant time.
pub fn verify_signature(secret: &str, body: &[u8], header: &str) -> bool {
    let Some(hex_sig) = header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(sig) = hex::decode(hex_sig) else {
        return false;
    };
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(body);
    mac.verify_slice(&sig).is_ok()
}

#[derive(Debug)]
pub struct WebhookChannel {
    url: String,
    secret: String,
    timeout: Duration,
}

impl WebhookChannel {
    pub fn new(url: &str, secret: &str, timeout: Duration) -> Self {
        Self {
            url: url.trim().to_string(),
            secret: secret.to_string(),
            timeout,
        }
    }
}

#[async_trait::async_trait]
impl NotificationChannel for WebhookChannel {
    async fn send(&self, notification: &Notification) -> Result<(), ChannelError> {
        if self.url.is_empty() {
            return Err(ChannelError::Incomplete("webhook URL is not set"));
        }

        let body = serde_json::to_vec(&WebhookPayload::new(notification))
            .map_err(|e| ChannelError::Http(format!("encoding payload: {}", e)))?;

        let mut request = http_client(self.timeout)?
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(reqwest::header::USER_AGENT, WEBHOOK_USER_AGENT);
        if !self.secret.is_empty() {
            request = request.header(SIGNATURE_HEADER, sign_payload(&self.secret, &body));
        }

        let response = request.body(body).send().await?;
        ensure_success(response).await
    }

    fn name(&self) -> &str {
        "webhook"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::AlertKind;
    use crate::db::store::tests::service;
    use crate::test_util::spawn_server;
    use axum::{body::Bytes, http::HeaderMap, routing::post, Router};
    use tokio::sync::mpsc;

    #[test]
    fn test_signature_round_trip() {
        let body = br#"{"event":"status_change"}"#;
        let header = sign_payload("s3cret", body);
        assert!(header.starts_with("sha256="));
        assert_eq!(header.len(), "sha256=".len() + 64);
        assert!(verify_signature("s3cret", body, &header));
        assert!(!verify_signature("other", body, &header));
    }

    #[test]
    fn test_signature_detects_one_byte_change() {
        let body = br#"{"status":"down"}"#.to_vec();
        let header = sign_payload("k", &body);

        let mut tampered = body.clone();
        tampered[3] ^= 0x01;
        assert!(!verify_signature("k", &tampered, &header));
    }

    #[test]
    fn test_verify_rejects_malformed_header() {
        assert!(!verify_signature("k", b"x", "md5=abcd"));
        assert!(!verify_signature("k", b"x", "sha256=zz"));
    }

    #[test]
    fn test_payload_fields() {
        let n = Notification::for_transition(AlertKind::Up, &service("db"), "");
        let value = serde_json::to_value(WebhookPayload::new(&n)).unwrap();
        assert_eq!(value["event"], "status_change");
        assert_eq!(value["service_key"], "db");
        assert_eq!(value["service_name"], "DB");
        assert_eq!(value["status"], "up");
        assert!(chrono::DateTime::parse_from_rfc3339(value["timestamp"].as_str().unwrap()).is_ok());
    }

    #[tokio::test]
    async fn test_send_signs_raw_body() {
        let (tx, mut rx) = mpsc::unbounded_channel::<(HeaderMap, Bytes)>();
        let app = Router::new().route(
            "/in",
            post(move |headers: HeaderMap, body: Bytes| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send((headers, body));
                    "ok"
                }
            }),
        );
        let addr = spawn_server(app).await;

        let channel = WebhookChannel::new(&format!("http://{}/in", addr), "hook-key", Duration::from_secs(5));
        let n = Notification::for_transition(AlertKind::Down, &service("api"), "");
        channel.send(&n).await.unwrap();

        let (headers, body) = rx.recv().await.unwrap();
        let signature = headers[SIGNATURE_HEADER].to_str().unwrap();
        assert!(verify_signature("hook-key", &body, signature));
        assert!(headers["user-agent"].to_str().unwrap().starts_with("Upwatch-Webhook/"));

        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["status"], "down");
    }

    #[tokio::test]
    async fn test_send_without_secret_is_unsigned() {
        let (tx, mut rx) = mpsc::unbounded_channel::<HeaderMap>();
        let app = Router::new().route(
            "/in",
            post(move |headers: HeaderMap| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(headers);
                    "ok"
                }
            }),
        );
        let addr = spawn_server(app).await;

        let channel = WebhookChannel::new(&format!("http://{}/in", addr), "", Duration::from_secs(5));
        channel.send(&Notification::test("")).await.unwrap();
        assert!(rx.recv().await.unwrap().get(SIGNATURE_HEADER).is_none());
    }
}
