//! Scrubbing of probe error strings before they are stored or shown.

use regex::Regex;
use std::sync::OnceLock;

const MAX_ERROR_LEN: usize = 300;

fn url_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)\b[a-z][a-z0-9+.\-]*://[^\s"'<>()]+"#).expect("valid URL regex")
    })
}

fn secret_param_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"(?i)\b(api[_\-]?key|apikey|access_token|token|x-plex-token|password|secret)=[^&\s"']+"#,
        )
        .expect("valid secret regex")
    })
}

fn auth_value_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(bearer|x-api-key:|x-plex-token:|x-emby-token:)\s*[A-Za-z0-9._~+/=\-]+")
            .expect("valid auth regex")
    })
}

/// Strip URLs and credentials from an error message and cap its length.
pub fn sanitize_error(message: &str) -> String {
    let cleaned = url_regex().replace_all(message, "[url]");
    let cleaned = secret_param_regex().replace_all(&cleaned, "$1=[redacted]");
    let cleaned = auth_value_regex().replace_all(&cleaned, "$1 [redacted]");

    let mut out = cleaned.trim().to_string();
    if out.len() > MAX_ERROR_LEN {
        let mut cut = MAX_ERROR_LEN;
        while !out.is_char_boundary(cut) {
            cut -= 1;
        }
        out.truncate(cut);
        out.push('…');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_urls() {
        let msg = "error sending request for url (https://plex.local:32400/identity?X-Plex-Token=abc123)";
        let out = sanitize_error(msg);
        assert_eq!(out, "error sending request for url ([url])");
    }

    #[test]
    fn test_redacts_loose_credentials() {
        assert_eq!(sanitize_error("bad apikey=xyz&x=1"), "bad apikey=[redacted]&x=1");
        assert_eq!(
            sanitize_error("header Bearer eyJhbGciOi.abc rejected"),
            "header Bearer [redacted] rejected"
        );
    }

    #[test]
    fn test_leaves_plain_messages_alone() {
        let msg = "TCP connection failed: Connection refused (os error 111)";
        assert_eq!(sanitize_error(msg), msg);
    }

    #[test]
    fn test_caps_length() {
        let long = "x".repeat(1000);
        assert!(sanitize_error(&long).chars().count() <= MAX_ERROR_LEN + 1);
    }
}
