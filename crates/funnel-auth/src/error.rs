//! The closed OAuth error taxonomy (§4.11) and its HTTP status mapping.

use thiserror::Error;

/// A specialized `Result` type for auth operations.
pub type AuthResult<T> = std::result::Result<T, AuthError>;

/// Inbound-auth and OAuth failures. RFC 6749 §5.2 names the OAuth kinds;
/// `Startup`/`InvalidToken` are this crate's own additions for the
/// bearer-validator path.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum AuthError {
    #[error("invalid_request: {0}")]
    InvalidRequest(String),
    #[error("invalid_client: {0}")]
    InvalidClient(String),
    #[error("invalid_grant: {0}")]
    InvalidGrant(String),
    #[error("unauthorized_client: {0}")]
    UnauthorizedClient(String),
    #[error("unsupported_grant_type: {0}")]
    UnsupportedGrantType(String),
    #[error("invalid_scope: {0}")]
    InvalidScope(String),
    #[error("access_denied: {0}")]
    AccessDenied(String),
    #[error("consent_required")]
    ConsentRequired {
        /// Where the caller should send the resource owner to grant consent.
        consent_uri: String,
    },
    #[error("server_error: {0}")]
    ServerError(String),
    /// A bearer token failed validation (missing, malformed, wrong length,
    /// or didn't match any configured token).
    #[error("invalid bearer token: {0}")]
    InvalidToken(String),
    /// A fatal condition detected at startup (§6's exit-code-1 cases).
    #[error("startup error: {0}")]
    Startup(String),
    /// An RFC 8707 `resource` indicator didn't match this server's resource.
    #[error("invalid_target: {0}")]
    InvalidTarget(String),
}

impl AuthError {
    /// The machine-readable `error` field RFC 6749 §5.2 requires in the
    /// token/authorize error response body.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::InvalidClient(_) => "invalid_client",
            Self::InvalidGrant(_) => "invalid_grant",
            Self::UnauthorizedClient(_) => "unauthorized_client",
            Self::UnsupportedGrantType(_) => "unsupported_grant_type",
            Self::InvalidScope(_) => "invalid_scope",
            Self::AccessDenied(_) => "access_denied",
            Self::ConsentRequired { .. } => "consent_required",
            Self::ServerError(_) => "server_error",
            Self::InvalidToken(_) => "invalid_token",
            Self::Startup(_) => "startup_error",
            Self::InvalidTarget(_) => "invalid_target",
        }
    }

    /// The HTTP status this error maps to, per §4.11's table.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::InvalidClient(_) => 401,
            Self::InvalidToken(_) => 401,
            Self::ServerError(_) | Self::Startup(_) => 500,
            _ => 400,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_client_maps_to_401() {
        assert_eq!(AuthError::InvalidClient("x".into()).http_status(), 401);
    }

    #[test]
    fn server_error_maps_to_500() {
        assert_eq!(AuthError::ServerError("x".into()).http_status(), 500);
    }

    #[test]
    fn other_kinds_map_to_400() {
        assert_eq!(AuthError::InvalidGrant("x".into()).http_status(), 400);
        assert_eq!(AuthError::AccessDenied("x".into()).http_status(), 400);
    }

    #[test]
    fn codes_match_rfc_names() {
        assert_eq!(AuthError::InvalidScope("x".into()).code(), "invalid_scope");
        assert_eq!(
            AuthError::ConsentRequired {
                consent_uri: "https://x/consent".into()
            }
            .code(),
            "consent_required"
        );
    }
}
