//! DNS probe implementation using the system resolver.

use std::time::Instant;

use super::{ProbeError, Probed};

/// Resolve `host` and report the lookup time. Succeeds iff at least one
/// address comes back.
pub async fn run_dns_probe(host: &str) -> Result<Probed, ProbeError> {
    let start = Instant::now();

    let addrs = tokio::net::lookup_host((host, 0))
        .await
        .map_err(|e| ProbeError::Network(format!("DNS lookup failed for {}: {}", host, e)))?;

    let count = addrs.count();
    let elapsed = start.elapsed();

    if count == 0 {
        return Err(ProbeError::Network(format!("no addresses found for {}", host)));
    }

    Ok(Probed {
        latency: elapsed,
        http_status: None,
    })
}
