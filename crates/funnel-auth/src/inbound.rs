//! Inbound bearer authentication (§4.10): constant-time token validation
//! guarding every inbound MCP/OAuth request.

use std::collections::HashMap;

use subtle::ConstantTimeEq;

use funnel_core::env::EnvResolver;

use crate::error::{AuthError, AuthResult};

const MIN_TOKEN_LENGTH: usize = 16;

/// Validates the `Authorization` header on inbound requests.
#[derive(Debug, Clone)]
pub enum InboundAuthValidator {
    /// No authentication required.
    None,
    /// One or more accepted bearer tokens.
    Bearer { tokens: Vec<String> },
}

impl InboundAuthValidator {
    /// No-auth validator.
    pub fn none() -> Self {
        Self::None
    }

    /// Builds a bearer validator, resolving each `${VAR}` token against
    /// `vars` and rejecting any token shorter than 16 characters.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Startup`] if a variable is undefined or a
    /// resolved token is too short.
    pub fn bearer(
        raw_tokens: Vec<String>,
        resolver: &EnvResolver,
        vars: &HashMap<String, String>,
    ) -> AuthResult<Self> {
        let mut tokens = Vec::with_capacity(raw_tokens.len());
        for raw in raw_tokens {
            let resolved = if EnvResolver::contains_pattern(&raw) {
                resolver
                    .resolve(&raw, vars)
                    .map_err(|err| AuthError::Startup(err.to_string()))?
            } else {
                raw
            };
            if resolved.len() < MIN_TOKEN_LENGTH {
                return Err(AuthError::Startup(format!(
                    "bearer token must be at least {MIN_TOKEN_LENGTH} characters"
                )));
            }
            tokens.push(resolved);
        }
        Ok(Self::Bearer { tokens })
    }

    /// Applies §4.10's startup rule: if no tokens were configured and
    /// `disable_override` is not set, a fresh 64-hex-char token is
    /// generated and returned alongside the validator for the caller to
    /// print once. If `disable_override` is set with no tokens configured,
    /// auth is disabled entirely.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Startup`] under the same conditions as
    /// [`Self::bearer`].
    pub fn from_startup_config(
        configured_tokens: Vec<String>,
        disable_override: bool,
        resolver: &EnvResolver,
        vars: &HashMap<String, String>,
    ) -> AuthResult<(Self, Option<String>)> {
        if !configured_tokens.is_empty() {
            return Ok((Self::bearer(configured_tokens, resolver, vars)?, None));
        }
        if disable_override {
            return Ok((Self::None, None));
        }
        let generated = generate_hex_token();
        Ok((
            Self::Bearer {
                tokens: vec![generated.clone()],
            },
            Some(generated),
        ))
    }

    /// Validates a raw `Authorization` header value.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidToken`] if the header is missing, not a
    /// `Bearer` scheme, empty, or doesn't match any configured token.
    pub fn validate_header(&self, header: Option<&str>) -> AuthResult<()> {
        let Self::Bearer { tokens } = self else {
            return Ok(());
        };

        let header = header.ok_or_else(|| AuthError::InvalidToken("missing Authorization header".to_string()))?;
        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| AuthError::InvalidToken("expected Bearer scheme".to_string()))?;
        if token.is_empty() {
            return Err(AuthError::InvalidToken("Empty Bearer token".to_string()));
        }

        // Every candidate is compared, win or lose, so total validation time
        // doesn't depend on which (if any) token matched.
        let mut matched = false;
        for candidate in tokens {
            matched |= constant_time_eq(candidate.as_bytes(), token.as_bytes());
        }
        if matched {
            Ok(())
        } else {
            Err(AuthError::InvalidToken("token did not match".to_string()))
        }
    }

    /// The `WWW-Authenticate` header value to return alongside a 401.
    pub fn www_authenticate(realm: &str) -> String {
        format!("Bearer realm=\"{realm}\"")
    }
}

/// Constant-time equality. Unequal-length inputs still perform a dummy
/// compare (against `a` itself) so the early length check doesn't leak
/// timing information about the candidate's length.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        let _ = a.ct_eq(a);
        return false;
    }
    bool::from(a.ct_eq(b))
}

fn generate_hex_token() -> String {
    (0..32)
        .map(|_| format!("{:02x}", fastrand::u8(..)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> EnvResolver {
        EnvResolver::new()
    }

    #[test]
    fn none_validator_accepts_anything() {
        let validator = InboundAuthValidator::None;
        assert!(validator.validate_header(None).is_ok());
    }

    #[test]
    fn rejects_missing_header() {
        let validator = InboundAuthValidator::Bearer {
            tokens: vec!["a".repeat(16)],
        };
        assert!(validator.validate_header(None).is_err());
    }

    #[test]
    fn rejects_wrong_scheme() {
        let validator = InboundAuthValidator::Bearer {
            tokens: vec!["a".repeat(16)],
        };
        let err = validator.validate_header(Some("Basic abcdef")).unwrap_err();
        assert!(matches!(err, AuthError::InvalidToken(_)));
    }

    #[test]
    fn rejects_empty_bearer_token() {
        let validator = InboundAuthValidator::Bearer {
            tokens: vec!["a".repeat(16)],
        };
        let err = validator.validate_header(Some("Bearer ")).unwrap_err();
        assert_eq!(err, AuthError::InvalidToken("Empty Bearer token".to_string()));
    }

    #[test]
    fn accepts_matching_token_among_several() {
        let tokens = vec!["a".repeat(16), "b".repeat(16), "c".repeat(16)];
        let validator = InboundAuthValidator::Bearer { tokens };
        assert!(validator
            .validate_header(Some(&format!("Bearer {}", "b".repeat(16))))
            .is_ok());
    }

    #[test]
    fn bearer_rejects_short_token() {
        let err = InboundAuthValidator::bearer(vec!["short".to_string()], &resolver(), &HashMap::new())
            .unwrap_err();
        assert!(matches!(err, AuthError::Startup(_)));
    }

    #[test]
    fn bearer_resolves_env_placeholder() {
        let mut vars = HashMap::new();
        vars.insert("TOKEN".to_string(), "x".repeat(20));
        let validator = InboundAuthValidator::bearer(vec!["${TOKEN}".to_string()], &resolver(), &vars).unwrap();
        match validator {
            InboundAuthValidator::Bearer { tokens } => assert_eq!(tokens, vec!["x".repeat(20)]),
            InboundAuthValidator::None => panic!("expected Bearer"),
        }
    }

    #[test]
    fn startup_generates_token_when_none_configured_and_override_unset() {
        let (validator, generated) =
            InboundAuthValidator::from_startup_config(vec![], false, &resolver(), &HashMap::new()).unwrap();
        let generated = generated.expect("a token should have been generated");
        assert_eq!(generated.len(), 64);
        assert!(validator
            .validate_header(Some(&format!("Bearer {generated}")))
            .is_ok());
    }

    #[test]
    fn startup_disables_auth_when_override_set_and_no_tokens() {
        let (validator, generated) =
            InboundAuthValidator::from_startup_config(vec![], true, &resolver(), &HashMap::new()).unwrap();
        assert!(generated.is_none());
        assert!(matches!(validator, InboundAuthValidator::None));
    }
}
