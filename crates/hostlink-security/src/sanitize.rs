//! Input, URL and JSON payload sanitation.

use std::net::IpAddr;
use std::sync::LazyLock;

use regex::Regex;
use url::{Host, Url};

use crate::error::SecurityError;

/// Script-injection patterns rejected in outbound JSON payloads.
static FORBIDDEN_PATTERNS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    [
        ("script tag", r"(?i)<\s*script"),
        ("javascript URI", r"(?i)javascript\s*:"),
        ("vbscript URI", r"(?i)vbscript\s*:"),
        ("HTML data URI", r"(?i)data\s*:\s*text/html"),
        ("inline event handler", r"(?i)\bon[a-z]+\s*="),
        ("eval call", r"(?i)\beval\s*\("),
    ]
    .into_iter()
    .filter_map(|(name, pattern)| Regex::new(pattern).ok().map(|re| (name, re)))
    .collect()
});

/// Strip null and control characters (keeping `\n`, `\t`, `\r`) and cut the
/// result to at most `max_len` characters.
pub fn sanitize_input(input: &str, max_len: usize) -> String {
    input
        .chars()
        .filter(|c| !c.is_control() || matches!(c, '\n' | '\t' | '\r'))
        .take(max_len)
        .collect()
}

/// Which URLs the agent may talk to.
#[derive(Debug, Clone, Default)]
pub struct UrlPolicy {
    /// When non-empty, the host must appear here (case-insensitive).
    pub allowed_hosts: Vec<String>,
    /// Permit `http`/`ws` and local hosts. Development only.
    pub allow_insecure: bool,
}

/// Parse and check a backend URL against `policy`.
pub fn validate_url(raw: &str, policy: &UrlPolicy) -> Result<Url, SecurityError> {
    let url = Url::parse(raw).map_err(|e| SecurityError::InvalidUrl(format!("{raw}: {e}")))?;

    let secure = matches!(url.scheme(), "https" | "wss");
    let plain = matches!(url.scheme(), "http" | "ws");
    if !(secure || (plain && policy.allow_insecure)) {
        return Err(SecurityError::InvalidUrl(format!(
            "scheme {} not allowed",
            url.scheme()
        )));
    }

    let host = url
        .host()
        .ok_or_else(|| SecurityError::InvalidUrl(format!("{raw}: missing host")))?;
    let host_label = normalize_host(&host);
    if host_label.is_empty() {
        return Err(SecurityError::InvalidUrl(format!("{raw}: empty host")));
    }

    if !policy.allow_insecure && is_local_host(&host) {
        return Err(SecurityError::InvalidUrl(format!(
            "host {host_label} is loopback or private"
        )));
    }

    if !policy.allowed_hosts.is_empty()
        && !policy
            .allowed_hosts
            .iter()
            .any(|allowed| allowed.trim_end_matches('.').eq_ignore_ascii_case(&host_label))
    {
        return Err(SecurityError::InvalidUrl(format!(
            "host {host_label} is not in the allow-list"
        )));
    }

    Ok(url)
}

/// Check a JSON payload's size, syntax and content.
pub fn validate_json(payload: &[u8], max_bytes: usize) -> Result<(), SecurityError> {
    if payload.len() > max_bytes {
        return Err(SecurityError::PayloadTooLarge {
            size: payload.len(),
            max: max_bytes,
        });
    }
    serde_json::from_slice::<serde_json::Value>(payload)
        .map_err(|e| SecurityError::InvalidJson(e.to_string()))?;

    let text = String::from_utf8_lossy(payload);
    if let Some((name, _)) = FORBIDDEN_PATTERNS.iter().find(|(_, re)| re.is_match(&text)) {
        return Err(SecurityError::ForbiddenContent((*name).to_string()));
    }
    Ok(())
}

fn normalize_host(host: &Host<&str>) -> String {
    match host {
        Host::Domain(domain) => domain.trim_end_matches('.').to_ascii_lowercase(),
        Host::Ipv4(ip) => ip.to_string(),
        Host::Ipv6(ip) => ip.to_string(),
    }
}

fn is_local_host(host: &Host<&str>) -> bool {
    match host {
        Host::Domain(domain) => {
            let domain = domain.trim_end_matches('.').to_ascii_lowercase();
            domain == "localhost"
                || domain.ends_with(".localhost")
                || domain.ends_with(".local")
                || domain.ends_with(".internal")
        }
        Host::Ipv4(ip) => is_private_ip(&IpAddr::V4(*ip)),
        Host::Ipv6(ip) => is_private_ip(&IpAddr::V6(*ip)),
    }
}

const fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(addr) => {
            addr.is_private()
                || addr.is_loopback()
                || addr.is_link_local()
                || addr.is_unspecified()
                || addr.is_broadcast()
        }
        IpAddr::V6(addr) => {
            addr.is_loopback()
                || addr.is_unspecified()
                || addr.is_unique_local()
                || addr.is_unicast_link_local()
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn strict() -> UrlPolicy {
        UrlPolicy::default()
    }

    #[test]
    fn strips_control_characters_but_keeps_whitespace() {
        let cleaned = sanitize_input("a\0b\x07c\nd\te\rf\x1b", 100);
        assert_eq!(cleaned, "abc\nd\te\rf");
    }

    #[test]
    fn truncates_by_characters() {
        assert_eq!(sanitize_input("héllo wörld", 5), "héllo");
        assert_eq!(sanitize_input("short", 100), "short");
    }

    #[test]
    fn accepts_https_and_wss() {
        assert!(validate_url("https://backend.example.com/api", &strict()).is_ok());
        assert!(validate_url("wss://backend.example.com/ws/agent", &strict()).is_ok());
    }

    #[test]
    fn rejects_plain_schemes() {
        assert!(validate_url("http://backend.example.com", &strict()).is_err());
        assert!(validate_url("ws://backend.example.com", &strict()).is_err());
        assert!(validate_url("ftp://backend.example.com", &strict()).is_err());
    }

    #[test]
    fn rejects_local_hosts() {
        for raw in [
            "https://localhost/api",
            "https://127.0.0.1/api",
            "https://10.1.2.3/api",
            "https://192.168.0.10/api",
            "https://172.16.5.4/api",
            "https://[::1]/api",
            "https://printer.local/api",
        ] {
            assert!(validate_url(raw, &strict()).is_err(), "{raw} accepted");
        }
    }

    #[test]
    fn insecure_policy_allows_local_development() {
        let policy = UrlPolicy {
            allow_insecure: true,
            ..Default::default()
        };
        assert!(validate_url("http://127.0.0.1:8080", &policy).is_ok());
        assert!(validate_url("ws://localhost:9000/ws", &policy).is_ok());
        assert!(validate_url("ftp://localhost", &policy).is_err());
    }

    #[test]
    fn allow_list_is_enforced() {
        let policy = UrlPolicy {
            allowed_hosts: vec!["Backend.Example.com".into()],
            allow_insecure: false,
        };
        assert!(validate_url("https://backend.example.com/x", &policy).is_ok());
        assert!(validate_url("https://other.example.com/x", &policy).is_err());
    }

    #[test]
    fn rejects_unparseable_url() {
        assert!(matches!(
            validate_url("not a url", &strict()),
            Err(SecurityError::InvalidUrl(_))
        ));
    }

    #[test]
    fn json_size_cap() {
        let payload = br#"{"k":"0123456789"}"#;
        assert!(validate_json(payload, 1024).is_ok());
        assert!(matches!(
            validate_json(payload, 4),
            Err(SecurityError::PayloadTooLarge { max: 4, .. })
        ));
    }

    #[test]
    fn json_must_parse() {
        assert!(matches!(
            validate_json(b"{broken", 1024),
            Err(SecurityError::InvalidJson(_))
        ));
    }

    #[test]
    fn json_denylist() {
        for payload in [
            r#"{"name":"<script>alert(1)</script>"}"#,
            r#"{"link":"javascript:void(0)"}"#,
            r#"{"html":"<img onerror=x>"}"#,
            r#"{"code":"eval (payload)"}"#,
        ] {
            assert!(
                matches!(
                    validate_json(payload.as_bytes(), 1024),
                    Err(SecurityError::ForbiddenContent(_))
                ),
                "{payload} accepted"
            );
        }
    }

    #[test]
    fn ordinary_telemetry_passes_denylist() {
        let payload =
            br#"{"hostname":"web-01","condition":"online","version":"1.2.3","evaluation":"ok"}"#;
        assert!(validate_json(payload, 1024).is_ok());
    }
}
