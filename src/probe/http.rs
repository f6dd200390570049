//! HTTP probe implementation.

use reqwest::redirect::{Attempt, Policy};
use std::error::Error as _;
use std::time::{Duration, Instant};

use super::{is_metadata_host, ProbeError, Probed};

const MAX_REDIRECTS: usize = 10;

/// Header carrying a service's API token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthHeader {
    pub name: &'static str,
    pub value: String,
}

impl AuthHeader {
    /// Choose the header a given kind of service expects its token in.
    pub fn for_service_type(service_type: &str, token: &str) -> Self {
        match service_type.trim().to_ascii_lowercase().as_str() {
            "sonarr" | "radarr" | "lidarr" | "readarr" | "prowlarr" | "bazarr" | "whisparr"
            | "overseerr" | "jellyseerr" => Self {
                name: "X-Api-Key",
                value: token.to_string(),
            },
            "plex" => Self {
                name: "X-Plex-Token",
                value: token.to_string(),
            },
            "jellyfin" | "emby" => Self {
                name: "X-Emby-Token",
                value: token.to_string(),
            },
            _ => Self {
                name: "Authorization",
                value: format!("Bearer {}", token),
            },
        }
    }
}

/// Run an HTTP GET probe against the given URL.
///
/// Latency covers connect, TLS, redirects and response headers. The status
/// code is returned as-is; range matching is the caller's job.
pub async fn run_http_probe(
    url: &str,
    auth: Option<&AuthHeader>,
    timeout: Duration,
) -> Result<Probed, ProbeError> {
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("Upwatch/", env!("CARGO_PKG_VERSION")))
        .redirect(Policy::custom(guarded_redirect))
        .build()
        .map_err(|e| ProbeError::Network(describe(&e)))?;

    let mut request = client.get(url);
    if let Some(auth) = auth {
        request = request.header(auth.name, &auth.value);
    }

    let start = Instant::now();

    let response = request.send().await.map_err(|e| {
        if e.is_timeout() {
            ProbeError::Timeout(timeout)
        } else if let Some(blocked) = blocked_redirect(&e) {
            ProbeError::Blocked(blocked)
        } else {
            ProbeError::Network(describe(&e))
        }
    })?;

    Ok(Probed {
        latency: start.elapsed(),
        http_status: Some(response.status().as_u16()),
    })
}

/// Follow redirects like the default policy, but never to a metadata endpoint.
fn guarded_redirect(attempt: Attempt<'_>) -> reqwest::redirect::Action {
    if attempt.previous().len() >= MAX_REDIRECTS {
        return attempt.error(ProbeError::Network("too many redirects".to_string()));
    }
    let blocked = attempt
        .url()
        .host_str()
        .filter(|host| is_metadata_host(host))
        .map(str::to_string);
    match blocked {
        Some(host) => attempt.error(ProbeError::Blocked(format!(
            "redirect to {} is a cloud metadata endpoint",
            host
        ))),
        None => attempt.follow(),
    }
}

/// The reason a redirect was refused by [`guarded_redirect`], if that is what
/// failed the request.
fn blocked_redirect(err: &reqwest::Error) -> Option<String> {
    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(ProbeError::Blocked(reason)) = cause.downcast_ref::<ProbeError>() {
            return Some(reason.clone());
        }
        source = cause.source();
    }
    None
}

/// Flatten a reqwest error and its causes, without the request URL.
fn describe(err: &reqwest::Error) -> String {
    let mut message = if err.is_connect() {
        "connection failed".to_string()
    } else if err.is_redirect() {
        "too many redirects".to_string()
    } else if err.is_request() {
        "request failed".to_string()
    } else {
        "HTTP error".to_string()
    };

    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{run_check, CheckKind, ProbeConfig};
    use crate::test_util::spawn_server;
    use axum::{http::HeaderMap, http::StatusCode, response::Redirect, routing::get, Router};

    fn app() -> Router {
        Router::new()
            .route("/ok", get(|| async { "fine" }))
            .route("/broken", get(|| async { StatusCode::INTERNAL_SERVER_ERROR }))
            .route("/moved", get(|| async { Redirect::temporary("/ok") }))
            .route(
                "/to-metadata",
                get(|| async { Redirect::temporary("http://169.254.169.254/latest/meta-data/") }),
            )
            .route(
                "/secured",
                get(|headers: HeaderMap| async move {
                    match headers.get("X-Api-Key") {
                        Some(v) if v == "k3y" => StatusCode::OK,
                        _ => StatusCode::UNAUTHORIZED,
                    }
                }),
            )
            .route(
                "/slow",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(3)).await;
                    "late"
                }),
            )
    }

    fn config(url: String) -> ProbeConfig {
        ProbeConfig::new(CheckKind::Http { url }, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_http_probe_status_in_range() {
        let addr = spawn_server(app()).await;
        let result = run_check(&config(format!("http://{}/ok", addr))).await;
        assert!(result.ok, "{:?}", result.error);
        assert_eq!(result.http_status, Some(200));
        assert!(result.latency_ms.is_some());
    }

    #[tokio::test]
    async fn test_http_probe_status_out_of_range() {
        let addr = spawn_server(app()).await;
        let result = run_check(&config(format!("http://{}/broken", addr))).await;
        assert!(!result.ok);
        assert_eq!(result.http_status, Some(500));
        assert!(result.latency_ms.is_some(), "transport completed");

        let mut accepting = config(format!("http://{}/broken", addr));
        accepting.expected_status_max = 599;
        assert!(run_check(&accepting).await.ok);
    }

    #[tokio::test]
    async fn test_http_probe_injects_auth_header() {
        let addr = spawn_server(app()).await;
        let url = format!("http://{}/secured", addr);

        assert!(!run_check(&config(url.clone())).await.ok);

        let mut with_token = config(url);
        with_token.auth = Some(AuthHeader::for_service_type("radarr", "k3y"));
        assert!(run_check(&with_token).await.ok);
    }

    #[tokio::test]
    async fn test_http_probe_timeout() {
        let addr = spawn_server(app()).await;
        let mut cfg = config(format!("http://{}/slow", addr));
        cfg.timeout = Duration::from_millis(200);

        let result = run_check(&cfg).await;
        assert!(!result.ok);
        assert!(result.latency_ms.is_none());
        assert!(result.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_http_probe_connection_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = run_check(&config(format!("http://{}/?token=abc", addr))).await;
        assert!(!result.ok);
        let error = result.error.unwrap();
        assert!(!error.contains("abc"), "token leaked: {}", error);
    }

    #[tokio::test]
    async fn test_http_probe_follows_ordinary_redirects() {
        let addr = spawn_server(app()).await;
        let result = run_check(&config(format!("http://{}/moved", addr))).await;
        assert!(result.ok, "{:?}", result.error);
        assert_eq!(result.http_status, Some(200));
    }

    #[tokio::test]
    async fn test_http_probe_refuses_redirect_to_metadata() {
        let addr = spawn_server(app()).await;
        let result = run_check(&config(format!("http://{}/to-metadata", addr))).await;
        assert!(!result.ok);
        assert!(result.http_status.is_none());
        let error = result.error.unwrap();
        assert!(error.starts_with("target blocked"), "{}", error);
    }

    #[test]
    fn test_auth_header_flavours() {
        assert_eq!(AuthHeader::for_service_type("Plex", "t").name, "X-Plex-Token");
        assert_eq!(AuthHeader::for_service_type("jellyfin", "t").name, "X-Emby-Token");
        let generic = AuthHeader::for_service_type("", "t");
        assert_eq!(generic.name, "Authorization");
        assert_eq!(generic.value, "Bearer t");
    }
}
