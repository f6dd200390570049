//! SMTP email channel.

use super::{AlertKind, ChannelError, Notification, NotificationChannel};
use crate::db::AlertConfig;

use lettre::message::{header::ContentType, Mailbox};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::time::Duration;

/// Port on which SMTP speaks TLS from the first byte.
const IMPLICIT_TLS_PORT: u16 = 465;

#[derive(Clone)]
pub struct EmailChannel {
    host: String,
    port: u16,
    user: String,
    password: String,
    from: String,
    to: Vec<String>,
    timeout: Duration,
}

impl EmailChannel {
    pub fn from_config(cfg: &AlertConfig, timeout: Duration) -> Self {
        Self {
            host: cfg.smtp_host.trim().to_string(),
            port: cfg.smtp_port,
            user: cfg.smtp_user.clone(),
            password: cfg.smtp_password.clone(),
            from: cfg.smtp_from.trim().to_string(),
            to: cfg
                .smtp_to
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            timeout,
        }
    }

    /// Host and at least one recipient are required before any connection.
    fn validate(&self) -> Result<(), ChannelError> {
        if self.host.is_empty() {
            return Err(ChannelError::Incomplete("SMTP host is not set"));
        }
        if self.to.is_empty() {
            return Err(ChannelError::Incomplete("no email recipients configured"));
        }
        Ok(())
    }

    fn sender(&self) -> &str {
        if !self.from.is_empty() {
            &self.from
        } else if self.user.contains('@') {
            &self.user
        } else {
            "upwatch@localhost"
        }
    }

    fn build_message(&self, n: &Notification) -> Result<Message, ChannelError> {
        let from: Mailbox = self
            .sender()
            .parse()
            .map_err(|e| ChannelError::Smtp(format!("invalid sender address: {}", e)))?;

        let mut builder = Message::builder().from(from).subject(n.subject.clone());
        for to in &self.to {
            let mailbox: Mailbox = to
                .parse()
                .map_err(|e| ChannelError::Smtp(format!("invalid recipient {}: {}", to, e)))?;
            builder = builder.to(mailbox);
        }

        builder
            .header(ContentType::TEXT_HTML)
            .body(render_html(n))
            .map_err(|e| ChannelError::Smtp(e.to_string()))
    }

    fn transport(&self) -> Result<AsyncSmtpTransport<Tokio1Executor>, ChannelError> {
        let builder = if self.port == IMPLICIT_TLS_PORT {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&self.host)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&self.host)
        }
        .map_err(|e| ChannelError::Smtp(e.to_string()))?;

        let mut builder = builder.port(self.port).timeout(Some(self.timeout));
        // lettre only issues AUTH when the server's EHLO advertises it.
        if !self.user.is_empty() && !self.password.is_empty() {
            builder = builder.credentials(Credentials::new(self.user.clone(), self.password.clone()));
        }
        Ok(builder.build())
    }
}

impl std::fmt::Debug for EmailChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmailChannel")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("from", &self.sender())
            .field("to", &self.to)
            .finish_non_exhaustive()
    }
}

fn render_html(n: &Notification) -> String {
    let color = match n.kind {
        AlertKind::Down => "#e74c3c",
        AlertKind::Degraded => "#f1c40f",
        AlertKind::Up => "#2ecc71",
    };
    let link = if n.status_page_url.is_empty() {
        String::new()
    } else {
        format!(
            r#"<p><a href="{url}">View dashboard</a></p>"#,
            url = escape(&n.status_page_url)
        )
    };
    format!(
        r#"<html><body style="font-family:sans-serif">
<h2 style="color:{color}">{subject}</h2>
<p>{message}</p>
<table>
<tr><td><b>Service</b></td><td>{service}</td></tr>
<tr><td><b>Status</b></td><td>{status}</td></tr>
<tr><td><b>Time</b></td><td>{time}</td></tr>
</table>
{link}
</body></html>"#,
        color = color,
        subject = escape(&n.subject),
        message = escape(&n.message),
        service = escape(&n.service_name),
        status = n.status_label(),
        time = n.formatted_time(),
        link = link,
    )
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[async_trait::async_trait]
impl NotificationChannel for EmailChannel {
    async fn send(&self, notification: &Notification) -> Result<(), ChannelError> {
        self.validate()?;
        let message = self.build_message(notification)?;
        self.transport()?
            .send(message)
            .await
            .map_err(|e| ChannelError::Smtp(e.to_string()))?;
        Ok(())
    }

    fn name(&self) -> &str {
        "email"
    }
}
