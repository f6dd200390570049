//! TCP connect probe implementation.

use std::time::{Duration, Instant};
use tokio::net::TcpStream;

use super::{ProbeError, Probed};

/// Dial `addr` and report how long the connection took to establish.
pub async fn run_tcp_probe(addr: &str, timeout: Duration) -> Result<Probed, ProbeError> {
    let start = Instant::now();

    tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| ProbeError::Timeout(timeout))?
        .map_err(|e| ProbeError::Network(format!("TCP connection failed: {}", e)))?;

    Ok(Probed {
        latency: start.elapsed(),
        http_status: None,
    })
}

/// Split `host:port` (or `[v6]:port`) into its parts.
pub fn split_host_port(addr: &str) -> Option<(&str, u16)> {
    let (host, port) = addr.rsplit_once(':')?;
    let port = port.parse().ok()?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return None;
    }
    Some((host, port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{run_check, CheckKind, ProbeConfig};

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("db:5432"), Some(("db", 5432)));
        assert_eq!(split_host_port("[::1]:80"), Some(("::1", 80)));
        assert_eq!(split_host_port("db"), None);
        assert_eq!(split_host_port(":80"), None);
        assert_eq!(split_host_port("db:http"), None);
    }

    #[tokio::test]
    async fn test_tcp_probe_open_port() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let config = ProbeConfig::new(
            CheckKind::Tcp { addr: addr.to_string() },
            Duration::from_secs(2),
        );
        let result = run_check(&config).await;
        assert!(result.ok, "{:?}", result.error);
        assert_eq!(result.http_status, None);
        assert!(result.latency_ms.is_some());
    }

    #[tokio::test]
    async fn test_tcp_probe_closed_port() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let config = ProbeConfig::new(
            CheckKind::Tcp { addr: addr.to_string() },
            Duration::from_secs(2),
        );
        let result = run_check(&config).await;
        assert!(!result.ok);
        assert!(result.error.unwrap().contains("TCP connection failed"));
    }
}
