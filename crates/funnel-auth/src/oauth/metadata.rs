//! `.well-known` metadata builders: RFC 8414 Authorization Server Metadata
//! and RFC 9728 Protected Resource Metadata, plus the `WWW-Authenticate`
//! header the resource side returns on a 401.

use serde_json::{json, Value};

use super::provider::OAuthProviderConfig;

/// Builds the `/.well-known/oauth-authorization-server` document (RFC 8414).
pub fn authorization_server_metadata(config: &OAuthProviderConfig) -> Value {
    json!({
        "issuer": config.issuer,
        "authorization_endpoint": format!("{}/authorize", config.base_url),
        "token_endpoint": format!("{}/token", config.base_url),
        "registration_endpoint": format!("{}/register", config.base_url),
        "revocation_endpoint": format!("{}/revoke", config.base_url),
        "response_types_supported": ["code"],
        "grant_types_supported": ["authorization_code", "refresh_token"],
        "code_challenge_methods_supported": ["S256", "plain"],
        "scopes_supported": config.supported_scopes,
        "token_endpoint_auth_methods_supported": ["client_secret_post", "none"],
    })
}

/// Builds the `/.well-known/oauth-protected-resource` document (RFC 9728),
/// describing the resource this proxy guards rather than the AS itself.
pub fn protected_resource_metadata(resource: &str, config: &OAuthProviderConfig) -> Value {
    json!({
        "resource": resource,
        "authorization_servers": [config.issuer],
        "scopes_supported": config.supported_scopes,
        "bearer_methods_supported": ["header"],
    })
}

/// Builds a `WWW-Authenticate` header value per RFC 9728 §5.1, pointing the
/// client at the protected-resource metadata document.
pub fn www_authenticate(metadata_uri: &str, scope: Option<&str>, error: Option<&str>) -> String {
    let mut parts = vec![format!("Bearer resource_metadata=\"{metadata_uri}\"")];
    if let Some(scope) = scope {
        parts.push(format!("scope=\"{scope}\""));
    }
    if let Some(error) = error {
        parts.push(format!("error=\"{error}\""));
    }
    parts.join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn as_metadata_advertises_pkce_methods() {
        let config = OAuthProviderConfig::default();
        let doc = authorization_server_metadata(&config);
        assert_eq!(doc["code_challenge_methods_supported"], json!(["S256", "plain"]));
    }

    #[test]
    fn www_authenticate_includes_scope_and_error() {
        let header = www_authenticate("https://api.example/.well-known/oauth-protected-resource", Some("mcp"), Some("invalid_token"));
        assert!(header.starts_with("Bearer resource_metadata=\""));
        assert!(header.contains("scope=\"mcp\""));
        assert!(header.contains("error=\"invalid_token\""));
    }
}
