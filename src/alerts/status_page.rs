//! Resolution of the dashboard link embedded in notifications.

use axum::http::HeaderMap;

/// Pick the status page URL: explicit config, then the environment fallback,
/// then a base URL inferred from a request. Empty when none is known.
pub fn resolve_status_page_url(configured: &str, env_fallback: &str, inferred: Option<&str>) -> String {
    [configured, env_fallback, inferred.unwrap_or_default()]
        .into_iter()
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(normalize_url)
        .unwrap_or_default()
}

/// Prefix `http://` to a bare host and drop trailing slashes.
pub fn normalize_url(url: &str) -> String {
    let url = url.trim().trim_end_matches('/');
    if url.contains("://") {
        url.to_string()
    } else {
        format!("http://{}", url)
    }
}

/// Base URL the client used to reach us, honouring reverse-proxy headers.
pub fn infer_base_url(headers: &HeaderMap) -> Option<String> {
    let host = first_value(headers, "x-forwarded-host").or_else(|| first_value(headers, "host"))?;
    let proto = first_value(headers, "x-forwarded-proto").unwrap_or("http");
    Some(format!("{}://{}", proto, host))
}

/// First comma-separated entry of a header, as proxies may append their own.
fn first_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}
