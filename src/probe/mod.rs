//! Probe module for service health checks.
//!
//! Supports HTTP, TCP, DNS and always-up (demo) checks. A probe never returns
//! an error to its caller: every failure becomes a [`CheckResult`] with
//! `ok = false` and a sanitized error string.

mod dns;
mod guard;
mod http;
mod sanitize;
mod tcp;

pub use dns::*;
pub use guard::*;
pub use http::*;
pub use sanitize::*;
pub use tcp::*;

use crate::db::Service;

use serde::Serialize;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("target blocked: {0}")]
    Blocked(String),
}

/// What a probe actually exercises, selected once from the service config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckKind {
    /// Placeholder services; always reachable, no I/O.
    AlwaysUp,
    /// Plain TCP connect to `host:port`.
    Tcp { addr: String },
    /// Hostname resolution.
    Dns { host: String },
    /// HTTP GET with status range matching.
    Http { url: String },
}

impl CheckKind {
    /// Pick the check kind from the configured type, sniffing `tcp://` and
    /// `dns://` prefixes on the URL.
    pub fn resolve(check_type: &str, url: &str) -> Result<Self, ProbeError> {
        let url = url.trim();
        let check_type = check_type.trim().to_ascii_lowercase();

        if matches!(check_type.as_str(), "always_up" | "demo") {
            return Ok(CheckKind::AlwaysUp);
        }

        if let Some(addr) = url.strip_prefix("tcp://") {
            return Self::tcp(addr);
        }
        if let Some(host) = url.strip_prefix("dns://") {
            return Self::dns(host);
        }

        match check_type.as_str() {
            "tcp" => Self::tcp(url),
            "dns" => Self::dns(url),
            _ => {
                if url.is_empty() {
                    return Err(ProbeError::Config("missing URL".to_string()));
                }
                let url = if url.starts_with("http://") || url.starts_with("https://") {
                    url.to_string()
                } else {
                    format!("http://{}", url)
                };
                Ok(CheckKind::Http { url })
            }
        }
    }

    fn tcp(addr: &str) -> Result<Self, ProbeError> {
        let addr = addr.trim_end_matches('/');
        if split_host_port(addr).is_none() {
            return Err(ProbeError::Config(format!(
                "TCP target must be host:port, got {:?}",
                addr
            )));
        }
        Ok(CheckKind::Tcp {
            addr: addr.to_string(),
        })
    }

    fn dns(host: &str) -> Result<Self, ProbeError> {
        let host = host.split('/').next().unwrap_or_default().trim();
        if host.is_empty() {
            return Err(ProbeError::Config("DNS target needs a hostname".to_string()));
        }
        Ok(CheckKind::Dns {
            host: host.to_string(),
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            CheckKind::AlwaysUp => "always_up",
            CheckKind::Tcp { .. } => "tcp",
            CheckKind::Dns { .. } => "dns",
            CheckKind::Http { .. } => "http",
        }
    }
}

/// Probe configuration.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub kind: CheckKind,
    pub timeout: Duration,
    pub expected_status_min: u16,
    pub expected_status_max: u16,
    pub auth: Option<AuthHeader>,
}

impl ProbeConfig {
    pub fn new(kind: CheckKind, timeout: Duration) -> Self {
        Self {
            kind,
            timeout,
            expected_status_min: 200,
            expected_status_max: 399,
            auth: None,
        }
    }

    /// Build the probe configuration for a service.
    pub fn from_service(service: &Service) -> Result<Self, ProbeError> {
        let kind = CheckKind::resolve(&service.check_type, &service.url)?;
        let auth = service
            .api_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .map(|token| AuthHeader::for_service_type(&service.service_type, token));

        Ok(Self {
            kind,
            timeout: probe_timeout(service.timeout),
            expected_status_min: service.expected_status_min,
            expected_status_max: service.expected_status_max,
            auth,
        })
    }
}

/// Timeout for a configured number of seconds. Unset, negative or non-finite
/// values get the default; anything above the maximum is capped.
pub fn probe_timeout(secs: f64) -> Duration {
    let default = Duration::from_secs_f64(Service::DEFAULT_TIMEOUT_SECS);
    if !secs.is_finite() || secs <= 0.0 {
        return default;
    }
    Duration::try_from_secs_f64(secs.min(Service::MAX_TIMEOUT_SECS)).unwrap_or(default)
}

/// Outcome of a single probe.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckResult {
    /// Reachable and, for HTTP, status within the expected range.
    pub ok: bool,
    pub http_status: Option<u16>,
    /// Absent when the transport never completed.
    pub latency_ms: Option<i64>,
    /// Sanitized; safe to persist and display.
    pub error: Option<String>,
}

impl CheckResult {
    fn up(latency: Duration, http_status: Option<u16>) -> Self {
        Self {
            ok: true,
            http_status,
            latency_ms: Some(latency.as_millis() as i64),
            error: None,
        }
    }

    /// A failed check with no completed transport.
    pub fn failed(err: &ProbeError) -> Self {
        Self {
            ok: false,
            http_status: None,
            latency_ms: None,
            error: Some(sanitize_error(&err.to_string())),
        }
    }

    /// Human-readable summary for heartbeats.
    pub fn message(&self) -> String {
        match (&self.error, self.http_status) {
            (Some(e), _) => e.clone(),
            (None, Some(status)) => format!("HTTP {}", status),
            (None, None) => "OK".to_string(),
        }
    }
}

/// What a transport-level probe measured.
#[derive(Debug, Clone, Copy)]
pub struct Probed {
    pub latency: Duration,
    pub http_status: Option<u16>,
}

/// Run a probe with the given configuration.
pub async fn run_check(config: &ProbeConfig) -> CheckResult {
    if config.kind == CheckKind::AlwaysUp {
        return CheckResult::up(Duration::ZERO, Some(200));
    }

    let started = Instant::now();
    let result = match tokio::time::timeout(config.timeout, probe(config)).await {
        Ok(r) => r,
        Err(_) => Err(ProbeError::Timeout(config.timeout)),
    };

    match result {
        Ok(probed) => match probed.http_status {
            Some(status)
                if status < config.expected_status_min || status > config.expected_status_max =>
            {
                CheckResult {
                    ok: false,
                    http_status: Some(status),
                    latency_ms: Some(probed.latency.as_millis() as i64),
                    error: Some(format!(
                        "unexpected status {} (expected {}-{})",
                        status, config.expected_status_min, config.expected_status_max
                    )),
                }
            }
            status => CheckResult::up(probed.latency, status),
        },
        Err(e) => {
            tracing::debug!(
                "Probe {} failed after {:?}: {}",
                config.kind.name(),
                started.elapsed(),
                sanitize_error(&e.to_string())
            );
            CheckResult::failed(&e)
        }
    }
}

async fn probe(config: &ProbeConfig) -> Result<Probed, ProbeError> {
    match &config.kind {
        CheckKind::AlwaysUp => Ok(Probed {
            latency: Duration::ZERO,
            http_status: Some(200),
        }),
        CheckKind::Tcp { addr } => {
            if let Some((host, port)) = split_host_port(addr) {
                check_target_host(host, port).await?;
            }
            run_tcp_probe(addr, config.timeout).await
        }
        CheckKind::Dns { host } => run_dns_probe(host).await,
        CheckKind::Http { url } => {
            let parsed = url::Url::parse(url)
                .map_err(|e| ProbeError::Config(format!("invalid URL: {}", e)))?;
            if let Some(host) = parsed.host_str() {
                let port = parsed.port_or_known_default().unwrap_or(80);
                check_target_host(host, port).await?;
            }
            run_http_probe(url, config.auth.as_ref(), config.timeout).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_check_kind() {
        assert_eq!(CheckKind::resolve("demo", "").unwrap(), CheckKind::AlwaysUp);
        assert_eq!(CheckKind::resolve("always_up", "x").unwrap(), CheckKind::AlwaysUp);
        assert_eq!(
            CheckKind::resolve("http", "tcp://db.local:5432").unwrap(),
            CheckKind::Tcp { addr: "db.local:5432".to_string() }
        );
        assert_eq!(
            CheckKind::resolve("tcp", "db.local:5432").unwrap(),
            CheckKind::Tcp { addr: "db.local:5432".to_string() }
        );
        assert_eq!(
            CheckKind::resolve("", "dns://example.com").unwrap(),
            CheckKind::Dns { host: "example.com".to_string() }
        );
        assert_eq!(
            CheckKind::resolve("http", "example.com/health").unwrap(),
            CheckKind::Http { url: "http://example.com/health".to_string() }
        );
        assert_eq!(
            CheckKind::resolve("weird", "https://example.com").unwrap(),
            CheckKind::Http { url: "https://example.com".to_string() }
        );
        assert!(CheckKind::resolve("tcp", "no-port").is_err());
        assert!(CheckKind::resolve("http", "").is_err());
    }

    #[test]
    fn test_from_service_picks_auth_header() {
        let service = Service {
            key: "sonarr".to_string(),
            url: "http://sonarr:8989/api/v3/system/status".to_string(),
            service_type: "sonarr".to_string(),
            api_token: Some("abc".to_string()),
            timeout: 0.0,
            ..Default::default()
        };
        let config = ProbeConfig::from_service(&service).unwrap();
        assert_eq!(config.timeout, Duration::from_secs(10));
        let auth = config.auth.unwrap();
        assert_eq!(auth.name, "X-Api-Key");
        assert_eq!(auth.value, "abc");
    }

    #[tokio::test]
    async fn test_always_up_does_no_io() {
        let config = ProbeConfig::new(CheckKind::AlwaysUp, Duration::from_millis(1));
        let result = run_check(&config).await;
        assert_eq!(
            result,
            CheckResult {
                ok: true,
                http_status: Some(200),
                latency_ms: Some(0),
                error: None,
            }
        );
    }

    #[test]
    fn test_invalid_config_becomes_failed_result() {
        let service = Service {
            check_type: "tcp".to_string(),
            url: "missing-port".to_string(),
            ..Default::default()
        };
        let err = ProbeConfig::from_service(&service).unwrap_err();
        let result = CheckResult::failed(&err);
        assert!(!result.ok);
        assert!(result.latency_ms.is_none());
        assert!(result.error.unwrap().contains("host:port"));
    }

    #[test]
    fn test_probe_timeout_never_panics() {
        let default = Duration::from_secs(10);
        assert_eq!(probe_timeout(0.0), default);
        assert_eq!(probe_timeout(-3.0), default);
        assert_eq!(probe_timeout(f64::NAN), default);
        assert_eq!(probe_timeout(f64::INFINITY), default);
        assert_eq!(probe_timeout(1e20), Duration::from_secs(300));
        assert_eq!(probe_timeout(2.5), Duration::from_millis(2500));
    }
}
