//! URL, identifier, and required-field validation.
//!
//! `sanitize_server_id`'s regex is not cosmetic: the identifier it validates
//! is passed to subprocess spawning and log file paths downstream, so it is
//! the security boundary against path traversal and argument injection.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;
use url::Url;

use crate::error::{CoreError, CoreResult};

fn server_id_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9._-]+$").expect("static pattern is valid"))
}

/// Parses `s` as a URL, prefixing any failure with `context`.
///
/// # Errors
///
/// Returns [`CoreError::InvalidUrl`] if `s` does not parse per RFC 3986.
pub fn validate_url(s: &str, context: &str) -> CoreResult<Url> {
    Url::parse(s).map_err(|source| CoreError::InvalidUrl {
        context: context.to_string(),
        source,
    })
}

/// Validates a server identifier against `[A-Za-z0-9._-]+`.
///
/// # Errors
///
/// Returns [`CoreError::InvalidServerId`] if `s` contains any other
/// character, or is empty.
pub fn sanitize_server_id(s: &str) -> CoreResult<&str> {
    if s.is_empty() || !server_id_pattern().is_match(s) {
        return Err(CoreError::InvalidServerId(s.to_string()));
    }
    Ok(s)
}

/// Validates an RFC 8707 resource indicator against the server's own
/// resource URI: both are normalized (lowercase scheme/host, default port
/// stripped, trailing slash trimmed) and compared in constant time.
///
/// # Errors
///
/// Returns [`CoreError::InvalidUrl`] if either URI fails to parse, or
/// [`CoreError::AudienceMismatch`] if the normalized forms differ.
pub fn validate_audience(requested: &str, server_resource: &str) -> CoreResult<()> {
    let requested_url = validate_url(requested, "resource")?;
    let server_url = validate_url(server_resource, "oauth.resource")?;

    let requested_normalized = normalize_resource_uri(&requested_url);
    let server_normalized = normalize_resource_uri(&server_url);

    let matches: bool =
        subtle::ConstantTimeEq::ct_eq(requested_normalized.as_bytes(), server_normalized.as_bytes()).into();
    if !matches {
        return Err(CoreError::AudienceMismatch {
            requested: requested.to_string(),
            server: server_resource.to_string(),
        });
    }
    Ok(())
}

/// Normalizes a resource URI per RFC 8707 §2: lowercase scheme/host, drop
/// the default port for the scheme, trim a trailing-slash-only path.
fn normalize_resource_uri(url: &Url) -> String {
    let mut normalized = format!("{}://", url.scheme().to_lowercase());
    if let Some(host) = url.host_str() {
        normalized.push_str(&host.to_lowercase());
    }
    if let Some(port) = url.port() {
        let default_port = match url.scheme() {
            "http" => Some(80),
            "https" => Some(443),
            _ => None,
        };
        if Some(port) != default_port {
            normalized.push(':');
            normalized.push_str(&port.to_string());
        }
    }
    let path = url.path().trim_end_matches('/');
    normalized.push_str(path);
    normalized
}

/// Ensures every field in `fields` is present in `obj` and non-empty (for
/// strings) / non-null (for other types).
///
/// # Errors
///
/// Returns [`CoreError::MissingField`] naming the first absent field.
pub fn validate_required(obj: &Value, fields: &[&str], context: &str) -> CoreResult<()> {
    for field in fields {
        let present = match obj.get(field) {
            Some(Value::Null) | None => false,
            Some(Value::String(s)) => !s.is_empty(),
            Some(_) => true,
        };
        if !present {
            return Err(CoreError::MissingField {
                context: context.to_string(),
                field: (*field).to_string(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accepts_valid_url() {
        assert!(validate_url("https://example.com/mcp", "ctx").is_ok());
    }

    #[test]
    fn rejects_invalid_url() {
        let err = validate_url("not a url", "config.servers[0].url").unwrap_err();
        assert!(matches!(err, CoreError::InvalidUrl { .. }));
    }

    #[test]
    fn sanitizes_server_id() {
        assert!(sanitize_server_id("github").is_ok());
        assert!(sanitize_server_id("github-mcp_v2.1").is_ok());
        assert!(sanitize_server_id("../../etc/passwd").is_err());
        assert!(sanitize_server_id("rm -rf /").is_err());
        assert!(sanitize_server_id("").is_err());
    }

    #[test]
    fn validate_required_catches_missing_and_empty() {
        let obj = json!({"name": "github", "url": ""});
        assert!(validate_required(&obj, &["name"], "server").is_ok());
        assert!(validate_required(&obj, &["url"], "server").is_err());
        assert!(validate_required(&obj, &["missing"], "server").is_err());
    }

    #[test]
    fn audience_matches_exact() {
        assert!(validate_audience("https://api.example.com", "https://api.example.com").is_ok());
    }

    #[test]
    fn audience_matches_with_trailing_slash() {
        assert!(validate_audience("https://api.example.com/", "https://api.example.com").is_ok());
        assert!(validate_audience("https://api.example.com", "https://api.example.com/").is_ok());
    }

    #[test]
    fn audience_matches_case_insensitively() {
        assert!(validate_audience("https://API.EXAMPLE.COM", "https://api.example.com").is_ok());
    }

    #[test]
    fn audience_ignores_default_port() {
        assert!(validate_audience("https://api.example.com:443", "https://api.example.com").is_ok());
    }

    #[test]
    fn audience_rejects_port_mismatch() {
        let err = validate_audience("https://api.example.com:8080", "https://api.example.com").unwrap_err();
        assert!(matches!(err, CoreError::AudienceMismatch { .. }));
    }

    #[test]
    fn audience_rejects_path_mismatch() {
        assert!(validate_audience("https://api.example.com/other", "https://api.example.com/mcp").is_err());
    }
}
