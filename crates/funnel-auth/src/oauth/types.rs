//! OAuth data model (§3, §4.11): clients, codes, tokens, and consent.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// `S256` (default, base64url(SHA-256(verifier))) or `plain` (verifier
/// equals challenge verbatim). `plain` exists only for clients that cannot
/// compute SHA-256; `S256` should be preferred whenever possible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CodeChallengeMethod {
    Plain,
    S256,
}

impl std::fmt::Display for CodeChallengeMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Plain => write!(f, "plain"),
            Self::S256 => write!(f, "S256"),
        }
    }
}

impl std::str::FromStr for CodeChallengeMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plain" => Ok(Self::Plain),
            "S256" => Ok(Self::S256),
            other => Err(format!("unsupported code_challenge_method '{other}'")),
        }
    }
}

/// A registered OAuth client (RFC 7591). `client_secret` is `None` for
/// public clients, which must authenticate via PKCE instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRegistration {
    pub client_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    /// The exhaustive allow-list; `authorize` rejects any other
    /// `redirect_uri`.
    pub redirect_uris: Vec<String>,
    pub grant_types: Vec<String>,
    pub response_types: Vec<String>,
    pub scope: Option<String>,
    pub issued_at: i64,
    /// `0` means the secret never expires.
    pub secret_expires_at: i64,
}

impl ClientRegistration {
    /// Whether this client was registered without a secret (must use PKCE).
    pub fn is_public(&self) -> bool {
        self.client_secret.is_none()
    }
}

/// A single-use authorization code (RFC 6749 §4.1). Redemption deletes the
/// code from the store before tokens are issued, so a racing second redeem
/// always observes "not found" rather than a double-issue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationCode {
    pub code: String,
    pub client_id: String,
    pub user_id: String,
    pub redirect_uri: String,
    pub scopes: HashSet<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<CodeChallengeMethod>,
    pub state: Option<String>,
    pub expires_at: i64,
    pub created_at: i64,
}

/// An issued access or refresh token. The same shape serves both; access
/// tokens always have a nonzero `expires_at`, refresh tokens default to
/// `0` (never expires) unless the provider is configured otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuedToken {
    pub token: String,
    pub client_id: String,
    pub user_id: String,
    pub scopes: HashSet<String>,
    pub expires_at: i64,
    pub created_at: i64,
}

impl IssuedToken {
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at != 0 && now >= self.expires_at
    }
}

/// One resource owner's consent decision for one client, keyed externally
/// by `(user_id, client_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsentRecord {
    pub approved_scopes: HashSet<String>,
    /// `None` means the consent never expires.
    pub expires_at: Option<i64>,
}

impl ConsentRecord {
    /// Whether every scope in `requested` is covered, and the record
    /// hasn't expired as of `now`.
    pub fn covers(&self, requested: &HashSet<String>, now: i64) -> bool {
        if let Some(expiry) = self.expires_at {
            if now >= expiry {
                return false;
            }
        }
        requested.is_subset(&self.approved_scopes)
    }
}
