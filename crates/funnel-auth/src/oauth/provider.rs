//! Core OAuth Authorization Server logic (§4.11): registration,
//! authorize/consent, token issuance, revocation, and secret rotation.
//! HTTP wiring lives in [`super::router`]; this module is transport-agnostic.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use uuid::Uuid;

use super::pkce;
use super::store::OAuthStore;
use super::types::{AuthorizationCode, ClientRegistration, CodeChallengeMethod, ConsentRecord, IssuedToken};
use crate::error::{AuthError, AuthResult};

/// Tunables from the `oauth:` config block (§6).
#[derive(Debug, Clone)]
pub struct OAuthProviderConfig {
    pub issuer: String,
    pub base_url: String,
    pub supported_scopes: Vec<String>,
    pub default_code_expiry_secs: i64,
    pub default_token_expiry_secs: i64,
    pub issue_refresh_tokens: bool,
    pub require_pkce: bool,
}

impl Default for OAuthProviderConfig {
    fn default() -> Self {
        Self {
            issuer: "https://localhost".to_string(),
            base_url: "https://localhost".to_string(),
            supported_scopes: vec!["mcp".to_string()],
            default_code_expiry_secs: 60,
            default_token_expiry_secs: 3600,
            issue_refresh_tokens: true,
            require_pkce: true,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub redirect_uris: Vec<String>,
    #[serde(default)]
    pub grant_types: Option<Vec<String>>,
    #[serde(default)]
    pub response_types: Option<Vec<String>>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub token_endpoint_auth_method: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AuthorizeRequest {
    pub response_type: String,
    pub client_id: String,
    pub redirect_uri: String,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub code_challenge: Option<String>,
    #[serde(default)]
    pub code_challenge_method: Option<String>,
    /// The already-authenticated resource owner; establishing this identity
    /// is out of scope for this provider (assumed handled upstream, e.g. by
    /// a session cookie checked before this call).
    pub user_id: String,
}

/// Either a successful redirect carrying the code, or a redirect to the
/// consent UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorizeOutcome {
    Redirect(String),
    ConsentRequired { consent_uri: String },
}

#[derive(Debug, Deserialize)]
pub struct ConsentDecisionRequest {
    pub client_id: String,
    pub decision: String,
    #[serde(default)]
    pub approved_scopes: Option<Vec<String>>,
    #[serde(default)]
    pub redirect_uri: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub code_challenge: Option<String>,
    #[serde(default)]
    pub code_challenge_method: Option<String>,
    #[serde(default)]
    pub remember_decision: Option<bool>,
    #[serde(default)]
    pub ttl_seconds: Option<i64>,
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "grant_type", rename_all = "snake_case")]
pub enum TokenRequest {
    AuthorizationCode {
        code: String,
        redirect_uri: String,
        client_id: String,
        client_secret: Option<String>,
        code_verifier: Option<String>,
    },
    RefreshToken {
        refresh_token: String,
        client_id: String,
        client_secret: Option<String>,
        scope: Option<String>,
    },
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: &'static str,
    pub expires_in: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

/// RFC 6749 + PKCE authorization server, generic over its storage backend.
pub struct OAuthProvider<S: OAuthStore> {
    config: OAuthProviderConfig,
    store: Arc<S>,
}

impl<S: OAuthStore> OAuthProvider<S> {
    pub fn new(config: OAuthProviderConfig, store: Arc<S>) -> Self {
        Self { config, store }
    }

    pub fn config(&self) -> &OAuthProviderConfig {
        &self.config
    }

    pub async fn register(&self, req: RegisterRequest) -> AuthResult<ClientRegistration> {
        if req.redirect_uris.is_empty() {
            return Err(AuthError::InvalidRequest("redirect_uris must be non-empty".to_string()));
        }
        let public = req.token_endpoint_auth_method.as_deref() == Some("none");
        let now = Utc::now().timestamp();
        let client = ClientRegistration {
            client_id: format!("client_{}", Uuid::new_v4().simple()),
            client_secret: if public { None } else { Some(random_token(24)) },
            redirect_uris: req.redirect_uris,
            grant_types: req
                .grant_types
                .unwrap_or_else(|| vec!["authorization_code".to_string(), "refresh_token".to_string()]),
            response_types: req.response_types.unwrap_or_else(|| vec!["code".to_string()]),
            scope: req.scope,
            issued_at: now,
            secret_expires_at: 0,
        };
        self.store.save_client(client.clone()).await;
        Ok(client)
    }

    pub async fn authorize(&self, req: AuthorizeRequest) -> AuthResult<AuthorizeOutcome> {
        if req.response_type != "code" {
            return Err(AuthError::InvalidRequest(format!(
                "unsupported response_type '{}'",
                req.response_type
            )));
        }
        let client = self
            .store
            .get_client(&req.client_id)
            .await
            .ok_or_else(|| AuthError::InvalidClient(req.client_id.clone()))?;
        if !client.redirect_uris.iter().any(|u| u == &req.redirect_uri) {
            return Err(AuthError::InvalidRequest("redirect_uri not in client's allow-list".to_string()));
        }
        if client.is_public() && self.config.require_pkce && req.code_challenge.is_none() {
            return Err(AuthError::InvalidRequest(
                "code_challenge is mandatory for public clients".to_string(),
            ));
        }

        let requested_scopes = split_scopes(req.scope.as_deref());
        let now = Utc::now().timestamp();
        let has_consent = self
            .store
            .get_consent(&req.user_id, &req.client_id)
            .await
            .is_some_and(|record| record.covers(&requested_scopes, now));

        if !has_consent {
            let consent_uri = format!(
                "{}/consent?client_id={}&redirect_uri={}&scope={}&state={}&code_challenge={}&code_challenge_method={}",
                self.config.base_url,
                encode(&req.client_id),
                encode(&req.redirect_uri),
                encode(req.scope.as_deref().unwrap_or("")),
                encode(req.state.as_deref().unwrap_or("")),
                encode(req.code_challenge.as_deref().unwrap_or("")),
                encode(req.code_challenge_method.as_deref().unwrap_or("")),
            );
            return Ok(AuthorizeOutcome::ConsentRequired { consent_uri });
        }

        self.issue_code(req, requested_scopes, now).await
    }

    async fn issue_code(
        &self,
        req: AuthorizeRequest,
        scopes: HashSet<String>,
        now: i64,
    ) -> AuthResult<AuthorizeOutcome> {
        let method = req
            .code_challenge_method
            .as_deref()
            .map(str::parse::<CodeChallengeMethod>)
            .transpose()
            .map_err(AuthError::InvalidRequest)?;

        let code = random_token(16);
        let record = AuthorizationCode {
            code: code.clone(),
            client_id: req.client_id,
            user_id: req.user_id,
            redirect_uri: req.redirect_uri.clone(),
            scopes,
            code_challenge: req.code_challenge,
            code_challenge_method: method,
            state: req.state.clone(),
            expires_at: now + self.config.default_code_expiry_secs,
            created_at: now,
        };
        self.store.save_code(record).await;

        let mut redirect = format!("{}?code={}", req.redirect_uri, encode(&code));
        if let Some(state) = &req.state {
            redirect.push_str(&format!("&state={}", encode(state)));
        }
        Ok(AuthorizeOutcome::Redirect(redirect))
    }

    pub async fn decide_consent(&self, req: ConsentDecisionRequest) -> AuthResult<String> {
        match req.decision.as_str() {
            "approve" => {
                let approved: HashSet<String> = req.approved_scopes.unwrap_or_default().into_iter().collect();
                let now = Utc::now().timestamp();
                let expires_at = match (req.remember_decision, req.ttl_seconds) {
                    (Some(true), Some(ttl)) => Some(now + ttl),
                    _ => None,
                };
                // Carry the just-approved scopes back into the `/authorize`
                // redirect so the re-issued `AuthorizeRequest` sees them,
                // rather than an empty scope that `issue_code` would store.
                let scope_param = approved.iter().cloned().collect::<Vec<_>>().join(" ");
                self.store
                    .save_consent(&req.user_id, &req.client_id, ConsentRecord {
                        approved_scopes: approved,
                        expires_at,
                    })
                    .await;

                Ok(format!(
                    "{}/authorize?response_type=code&client_id={}&redirect_uri={}&scope={}&state={}&code_challenge={}&code_challenge_method={}&user_id={}",
                    self.config.base_url,
                    encode(&req.client_id),
                    encode(req.redirect_uri.as_deref().unwrap_or("")),
                    encode(&scope_param),
                    encode(req.state.as_deref().unwrap_or("")),
                    encode(req.code_challenge.as_deref().unwrap_or("")),
                    encode(req.code_challenge_method.as_deref().unwrap_or("")),
                    encode(&req.user_id),
                ))
            }
            "deny" => {
                let redirect_uri = req.redirect_uri.unwrap_or_default();
                let mut redirect = format!("{redirect_uri}?error=access_denied");
                if let Some(state) = &req.state {
                    redirect.push_str(&format!("&state={}", encode(state)));
                }
                Ok(redirect)
            }
            other => Err(AuthError::InvalidRequest(format!("unknown consent decision '{other}'"))),
        }
    }

    pub async fn token(&self, req: TokenRequest) -> AuthResult<TokenResponse> {
        match req {
            TokenRequest::AuthorizationCode {
                code,
                redirect_uri,
                client_id,
                client_secret,
                code_verifier,
            } => {
                let client = self
                    .store
                    .get_client(&client_id)
                    .await
                    .ok_or_else(|| AuthError::InvalidClient(client_id.clone()))?;
                self.authenticate_client(&client, client_secret.as_deref())?;

                let record = self
                    .store
                    .take_code(&code)
                    .await
                    .ok_or_else(|| AuthError::InvalidGrant("authorization code not found or already used".to_string()))?;

                let now = Utc::now().timestamp();
                if record.expires_at <= now {
                    return Err(AuthError::InvalidGrant("authorization code expired".to_string()));
                }
                if record.client_id != client_id {
                    return Err(AuthError::InvalidGrant("client_id does not match the authorization code".to_string()));
                }
                if record.redirect_uri != redirect_uri {
                    return Err(AuthError::InvalidGrant("redirect_uri does not match the authorization code".to_string()));
                }

                match (&record.code_challenge, record.code_challenge_method) {
                    (Some(challenge), Some(method)) => {
                        let verifier = code_verifier
                            .ok_or_else(|| AuthError::InvalidGrant("missing code_verifier".to_string()))?;
                        if !pkce::verify(method, &verifier, challenge) {
                            return Err(AuthError::InvalidGrant("PKCE verification failed".to_string()));
                        }
                    }
                    _ if client.is_public() && self.config.require_pkce => {
                        return Err(AuthError::InvalidGrant("PKCE is required for this client".to_string()));
                    }
                    _ => {}
                }

                self.issue_tokens(&client_id, &record.user_id, record.scopes).await
            }
            TokenRequest::RefreshToken {
                refresh_token,
                client_id,
                client_secret,
                scope,
            } => {
                let client = self
                    .store
                    .get_client(&client_id)
                    .await
                    .ok_or_else(|| AuthError::InvalidClient(client_id.clone()))?;
                self.authenticate_client(&client, client_secret.as_deref())?;

                let existing = self
                    .store
                    .get_refresh_token(&refresh_token)
                    .await
                    .ok_or_else(|| AuthError::InvalidGrant("refresh token not found".to_string()))?;
                let now = Utc::now().timestamp();
                if existing.is_expired(now) {
                    return Err(AuthError::InvalidGrant("refresh token expired".to_string()));
                }
                if existing.client_id != client_id {
                    return Err(AuthError::InvalidGrant("client_id does not match the refresh token".to_string()));
                }

                let scopes = match scope {
                    Some(requested) => {
                        let requested = split_scopes(Some(&requested));
                        if !requested.is_subset(&existing.scopes) {
                            return Err(AuthError::InvalidScope(
                                "requested scope exceeds the original grant".to_string(),
                            ));
                        }
                        requested
                    }
                    None => existing.scopes.clone(),
                };

                // Per §4.11, prior access tokens are not invalidated unless
                // policy says otherwise; this provider never rotates the
                // refresh token itself on use.
                self.issue_access_token(&client_id, &existing.user_id, scopes, None)
                    .await
            }
        }
    }

    async fn issue_tokens(&self, client_id: &str, user_id: &str, scopes: HashSet<String>) -> AuthResult<TokenResponse> {
        let refresh_token = if self.config.issue_refresh_tokens {
            let now = Utc::now().timestamp();
            let token = random_token(32);
            self.store
                .save_refresh_token(IssuedToken {
                    token: token.clone(),
                    client_id: client_id.to_string(),
                    user_id: user_id.to_string(),
                    scopes: scopes.clone(),
                    expires_at: 0,
                    created_at: now,
                })
                .await;
            Some(token)
        } else {
            None
        };
        self.issue_access_token(client_id, user_id, scopes, refresh_token).await
    }

    async fn issue_access_token(
        &self,
        client_id: &str,
        user_id: &str,
        scopes: HashSet<String>,
        refresh_token: Option<String>,
    ) -> AuthResult<TokenResponse> {
        let now = Utc::now().timestamp();
        let access_token = random_token(32);
        self.store
            .save_access_token(IssuedToken {
                token: access_token.clone(),
                client_id: client_id.to_string(),
                user_id: user_id.to_string(),
                scopes: scopes.clone(),
                expires_at: now + self.config.default_token_expiry_secs,
                created_at: now,
            })
            .await;

        Ok(TokenResponse {
            access_token,
            token_type: "Bearer",
            expires_in: self.config.default_token_expiry_secs,
            refresh_token,
            scope: (!scopes.is_empty()).then(|| scopes.into_iter().collect::<Vec<_>>().join(" ")),
        })
    }

    /// RFC 7009: deleting an unknown token is still success.
    pub async fn revoke(&self, token: &str) {
        let _ = self.store.delete_access_token(token).await;
        let _ = self.store.delete_refresh_token(token).await;
    }

    pub async fn rotate_secret(&self, client_id: &str, current_secret: &str) -> AuthResult<(String, i64)> {
        let client = self
            .store
            .get_client(client_id)
            .await
            .ok_or_else(|| AuthError::InvalidClient(client_id.to_string()))?;
        self.authenticate_client(&client, Some(current_secret))?;

        let new_secret = random_token(24);
        let expires_at = 0;
        self.store
            .rotate_client_secret(client_id, new_secret.clone(), expires_at)
            .await;
        Ok((new_secret, expires_at))
    }

    /// Validates an access token for the inbound resource path (not part of
    /// the AS endpoints themselves, but the natural place to keep token
    /// lookup colocated with the store it reads).
    pub async fn validate_access_token(&self, token: &str) -> AuthResult<IssuedToken> {
        let record = self
            .store
            .get_access_token(token)
            .await
            .ok_or_else(|| AuthError::InvalidToken("unknown access token".to_string()))?;
        if record.is_expired(Utc::now().timestamp()) {
            return Err(AuthError::InvalidToken("access token expired".to_string()));
        }
        Ok(record)
    }

    fn authenticate_client(&self, client: &ClientRegistration, provided_secret: Option<&str>) -> AuthResult<()> {
        if client.is_public() {
            return Ok(());
        }
        let expected = client.client_secret.as_deref().unwrap_or("");
        let provided = provided_secret.unwrap_or("");
        if constant_time_eq(expected.as_bytes(), provided.as_bytes()) {
            Ok(())
        } else {
            Err(AuthError::InvalidClient("client secret mismatch".to_string()))
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        let _ = a.ct_eq(a);
        return false;
    }
    bool::from(a.ct_eq(b))
}

fn split_scopes(scope: Option<&str>) -> HashSet<String> {
    scope
        .unwrap_or("")
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

fn encode(s: &str) -> String {
    utf8_percent_encode(s, NON_ALPHANUMERIC).to_string()
}

fn random_token(len_bytes: usize) -> String {
    (0..len_bytes).map(|_| format!("{:02x}", fastrand::u8(..))).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oauth::store::InMemoryOAuthStore;

    fn urlencoding_decode(s: &str) -> String {
        percent_encoding::percent_decode_str(s).decode_utf8_lossy().to_string()
    }

    async fn provider_with_confidential_client() -> (OAuthProvider<InMemoryOAuthStore>, ClientRegistration) {
        let store = Arc::new(InMemoryOAuthStore::new());
        let provider = OAuthProvider::new(OAuthProviderConfig::default(), store);
        let client = provider
            .register(RegisterRequest {
                redirect_uris: vec!["https://app.example/cb".to_string()],
                grant_types: None,
                response_types: None,
                scope: None,
                token_endpoint_auth_method: None,
            })
            .await
            .unwrap();
        (provider, client)
    }

    #[tokio::test]
    async fn register_issues_a_secret_for_confidential_clients() {
        let (_, client) = provider_with_confidential_client().await;
        assert!(client.client_secret.is_some());
    }

    #[tokio::test]
    async fn full_code_flow_with_consent_then_token_exchange() {
        let (provider, client) = provider_with_confidential_client().await;

        let outcome = provider
            .authorize(AuthorizeRequest {
                response_type: "code".to_string(),
                client_id: client.client_id.clone(),
                redirect_uri: "https://app.example/cb".to_string(),
                scope: Some("mcp".to_string()),
                state: Some("xyz".to_string()),
                code_challenge: None,
                code_challenge_method: None,
                user_id: "user-1".to_string(),
            })
            .await
            .unwrap();
        let consent_uri = match outcome {
            AuthorizeOutcome::ConsentRequired { consent_uri } => consent_uri,
            AuthorizeOutcome::Redirect(_) => panic!("expected consent_required on first attempt"),
        };
        assert!(consent_uri.contains("/consent"));

        let post_consent_redirect = provider
            .decide_consent(ConsentDecisionRequest {
                client_id: client.client_id.clone(),
                decision: "approve".to_string(),
                approved_scopes: Some(vec!["mcp".to_string()]),
                redirect_uri: Some("https://app.example/cb".to_string()),
                state: Some("xyz".to_string()),
                code_challenge: None,
                code_challenge_method: None,
                remember_decision: Some(false),
                ttl_seconds: None,
                user_id: "user-1".to_string(),
            })
            .await
            .unwrap();
        // The consent redirect must carry the approved scope back to
        // `/authorize`, not drop it, or the re-issued code would be scopeless.
        assert!(post_consent_redirect.contains("scope=mcp"));
        assert!(post_consent_redirect.contains("user_id=user-1"));

        // Follow the redirect as a real client would, re-deriving the next
        // `AuthorizeRequest` from its query string rather than hand-supplying
        // `scope` again, so this test actually exercises the fix.
        let query = post_consent_redirect.split_once('?').unwrap().1;
        let params: std::collections::HashMap<String, String> = query
            .split('&')
            .map(|pair| {
                let (k, v) = pair.split_once('=').unwrap();
                (k.to_string(), urlencoding_decode(v))
            })
            .collect();

        let outcome = provider
            .authorize(AuthorizeRequest {
                response_type: params["response_type"].clone(),
                client_id: params["client_id"].clone(),
                redirect_uri: params["redirect_uri"].clone(),
                scope: Some(params["scope"].clone()),
                state: Some(params["state"].clone()),
                code_challenge: None,
                code_challenge_method: None,
                user_id: params["user_id"].clone(),
            })
            .await
            .unwrap();
        let redirect = match outcome {
            AuthorizeOutcome::Redirect(r) => r,
            AuthorizeOutcome::ConsentRequired { .. } => panic!("consent should already be recorded"),
        };
        let code = redirect
            .split("code=")
            .nth(1)
            .unwrap()
            .split('&')
            .next()
            .unwrap()
            .to_string();

        let token = provider
            .token(TokenRequest::AuthorizationCode {
                code: code.clone(),
                redirect_uri: "https://app.example/cb".to_string(),
                client_id: client.client_id.clone(),
                client_secret: client.client_secret.clone(),
                code_verifier: None,
            })
            .await
            .unwrap();
        assert!(!token.access_token.is_empty());
        assert!(token.refresh_token.is_some());

        // The code is single-use.
        let replay = provider
            .token(TokenRequest::AuthorizationCode {
                code,
                redirect_uri: "https://app.example/cb".to_string(),
                client_id: client.client_id.clone(),
                client_secret: client.client_secret.clone(),
                code_verifier: None,
            })
            .await;
        assert!(matches!(replay, Err(AuthError::InvalidGrant(_))));
    }

    #[tokio::test]
    async fn refresh_grant_does_not_invalidate_prior_access_token() {
        let (provider, client) = provider_with_confidential_client().await;
        provider
            .store
            .save_consent(
                "user-1",
                &client.client_id,
                ConsentRecord {
                    approved_scopes: ["mcp".to_string()].into_iter().collect(),
                    expires_at: None,
                },
            )
            .await;
        let outcome = provider
            .authorize(AuthorizeRequest {
                response_type: "code".to_string(),
                client_id: client.client_id.clone(),
                redirect_uri: "https://app.example/cb".to_string(),
                scope: Some("mcp".to_string()),
                state: None,
                code_challenge: None,
                code_challenge_method: None,
                user_id: "user-1".to_string(),
            })
            .await
            .unwrap();
        let redirect = match outcome {
            AuthorizeOutcome::Redirect(r) => r,
            AuthorizeOutcome::ConsentRequired { .. } => panic!("consent pre-recorded"),
        };
        let code = redirect.split("code=").nth(1).unwrap().split('&').next().unwrap().to_string();

        let first = provider
            .token(TokenRequest::AuthorizationCode {
                code,
                redirect_uri: "https://app.example/cb".to_string(),
                client_id: client.client_id.clone(),
                client_secret: client.client_secret.clone(),
                code_verifier: None,
            })
            .await
            .unwrap();
        let refresh_token = first.refresh_token.clone().unwrap();

        let second = provider
            .token(TokenRequest::RefreshToken {
                refresh_token,
                client_id: client.client_id.clone(),
                client_secret: client.client_secret.clone(),
                scope: None,
            })
            .await
            .unwrap();
        assert_ne!(first.access_token, second.access_token);

        assert!(provider.validate_access_token(&first.access_token).await.is_ok());
        assert!(provider.validate_access_token(&second.access_token).await.is_ok());
    }

    #[tokio::test]
    async fn revoke_unknown_token_is_success() {
        let (provider, _) = provider_with_confidential_client().await;
        provider.revoke("never-issued").await;
    }

    #[tokio::test]
    async fn rotate_secret_requires_current_secret() {
        let (provider, client) = provider_with_confidential_client().await;
        let err = provider.rotate_secret(&client.client_id, "wrong").await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidClient(_)));

        let (new_secret, _) = provider
            .rotate_secret(&client.client_id, client.client_secret.as_deref().unwrap())
            .await
            .unwrap();
        assert_ne!(new_secret, client.client_secret.unwrap());
    }
}
