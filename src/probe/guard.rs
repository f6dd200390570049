//! Target validation against cloud metadata endpoints.
//!
//! Service URLs are user-configured, so a probe could otherwise be pointed at
//! a provider's instance metadata service and leak credentials through the
//! status output.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use super::ProbeError;

const METADATA_HOSTNAMES: &[&str] = &[
    "metadata",
    "metadata.google.internal",
    "metadata.goog",
    "metadata.azure.internal",
    "instance-data",
    "instance-data.ec2.internal",
];

const METADATA_V4: &[Ipv4Addr] = &[
    // AWS, GCP, Azure, DigitalOcean, OpenStack
    Ipv4Addr::new(169, 254, 169, 254),
    // AWS ECS task metadata
    Ipv4Addr::new(169, 254, 170, 2),
    // Alibaba Cloud
    Ipv4Addr::new(100, 100, 100, 200),
    // Oracle Cloud
    Ipv4Addr::new(192, 0, 0, 192),
];

// AWS IMDS over IPv6: fd00:ec2::254
const METADATA_V6: &[Ipv6Addr] = &[Ipv6Addr::new(0xfd00, 0x0ec2, 0, 0, 0, 0, 0, 0x0254)];

/// Whether `ip` is a well-known metadata service address.
pub fn is_metadata_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => METADATA_V4.contains(&v4),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => METADATA_V4.contains(&v4),
            None => METADATA_V6.contains(&v6),
        },
    }
}

/// Whether `host` names a metadata endpoint without needing resolution.
pub fn is_metadata_host(host: &str) -> bool {
    let host = host
        .trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase();

    if let Ok(ip) = host.parse::<IpAddr>() {
        return is_metadata_ip(ip);
    }
    METADATA_HOSTNAMES.contains(&host.as_str())
}

/// Reject targets that are, or resolve to, a metadata endpoint.
///
/// A host that does not resolve at all is allowed through: nothing can be
/// reached through it, and the probe itself will report the failure.
pub async fn check_target_host(host: &str, port: u16) -> Result<(), ProbeError> {
    if is_metadata_host(host) {
        return Err(ProbeError::Blocked(format!(
            "{} is a cloud metadata endpoint",
            host
        )));
    }

    let lookup_host = host.trim_start_matches('[').trim_end_matches(']');
    match tokio::net::lookup_host((lookup_host, port)).await {
        Ok(addrs) => {
            for addr in addrs {
                if is_metadata_ip(addr.ip()) {
                    return Err(ProbeError::Blocked(format!(
                        "{} resolves to cloud metadata address {}",
                        host,
                        addr.ip()
                    )));
                }
            }
            Ok(())
        }
        Err(e) => {
            tracing::debug!("Target {} did not resolve during validation: {}", host, e);
            Ok(())
        }
    }
}
