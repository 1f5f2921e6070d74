//! Storage for clients, codes, tokens, and consent (§5's "OAuth storage"
//! atomicity requirements). `InMemoryOAuthStore` is the only implementation
//! shipped here; anything durable plugs in behind the same trait.

use async_trait::async_trait;
use dashmap::DashMap;

use super::types::{AuthorizationCode, ClientRegistration, ConsentRecord, IssuedToken};

fn consent_key(user_id: &str, client_id: &str) -> String {
    format!("{user_id}::{client_id}")
}

/// Every operation here must be atomic with respect to concurrent callers;
/// in particular `take_code` must delete-then-return so a racing second
/// redeem always observes `None`.
#[async_trait]
pub trait OAuthStore: Send + Sync {
    async fn save_client(&self, client: ClientRegistration);
    async fn get_client(&self, client_id: &str) -> Option<ClientRegistration>;
    /// Replaces the client's secret, returning `false` if the client
    /// doesn't exist.
    async fn rotate_client_secret(&self, client_id: &str, new_secret: String, expires_at: i64) -> bool;

    async fn save_code(&self, code: AuthorizationCode);
    /// Removes and returns the code in one step. `None` means either the
    /// code never existed or it has already been redeemed.
    async fn take_code(&self, code: &str) -> Option<AuthorizationCode>;

    async fn save_access_token(&self, token: IssuedToken);
    async fn get_access_token(&self, token: &str) -> Option<IssuedToken>;
    async fn delete_access_token(&self, token: &str) -> bool;

    async fn save_refresh_token(&self, token: IssuedToken);
    async fn get_refresh_token(&self, token: &str) -> Option<IssuedToken>;
    async fn delete_refresh_token(&self, token: &str) -> bool;

    async fn save_consent(&self, user_id: &str, client_id: &str, record: ConsentRecord);
    async fn get_consent(&self, user_id: &str, client_id: &str) -> Option<ConsentRecord>;
}

/// `DashMap`-backed store, scoped to one process's lifetime.
#[derive(Default)]
pub struct InMemoryOAuthStore {
    clients: DashMap<String, ClientRegistration>,
    codes: DashMap<String, AuthorizationCode>,
    access_tokens: DashMap<String, IssuedToken>,
    refresh_tokens: DashMap<String, IssuedToken>,
    consent: DashMap<String, ConsentRecord>,
}

impl InMemoryOAuthStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OAuthStore for InMemoryOAuthStore {
    async fn save_client(&self, client: ClientRegistration) {
        self.clients.insert(client.client_id.clone(), client);
    }

    async fn get_client(&self, client_id: &str) -> Option<ClientRegistration> {
        self.clients.get(client_id).map(|entry| entry.clone())
    }

    async fn rotate_client_secret(&self, client_id: &str, new_secret: String, expires_at: i64) -> bool {
        let Some(mut entry) = self.clients.get_mut(client_id) else {
            return false;
        };
        entry.client_secret = Some(new_secret);
        entry.secret_expires_at = expires_at;
        true
    }

    async fn save_code(&self, code: AuthorizationCode) {
        self.codes.insert(code.code.clone(), code);
    }

    async fn take_code(&self, code: &str) -> Option<AuthorizationCode> {
        self.codes.remove(code).map(|(_, v)| v)
    }

    async fn save_access_token(&self, token: IssuedToken) {
        self.access_tokens.insert(token.token.clone(), token);
    }

    async fn get_access_token(&self, token: &str) -> Option<IssuedToken> {
        self.access_tokens.get(token).map(|entry| entry.clone())
    }

    async fn delete_access_token(&self, token: &str) -> bool {
        self.access_tokens.remove(token).is_some()
    }

    async fn save_refresh_token(&self, token: IssuedToken) {
        self.refresh_tokens.insert(token.token.clone(), token);
    }

    async fn get_refresh_token(&self, token: &str) -> Option<IssuedToken> {
        self.refresh_tokens.get(token).map(|entry| entry.clone())
    }

    async fn delete_refresh_token(&self, token: &str) -> bool {
        self.refresh_tokens.remove(token).is_some()
    }

    async fn save_consent(&self, user_id: &str, client_id: &str, record: ConsentRecord) {
        self.consent.insert(consent_key(user_id, client_id), record);
    }

    async fn get_consent(&self, user_id: &str, client_id: &str) -> Option<ConsentRecord> {
        self.consent
            .get(&consent_key(user_id, client_id))
            .map(|entry| entry.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn code(id: &str) -> AuthorizationCode {
        AuthorizationCode {
            code: id.to_string(),
            client_id: "client-1".to_string(),
            user_id: "user-1".to_string(),
            redirect_uri: "https://app.example/cb".to_string(),
            scopes: HashSet::new(),
            code_challenge: None,
            code_challenge_method: None,
            state: None,
            expires_at: 0,
            created_at: 0,
        }
    }

    #[tokio::test]
    async fn take_code_is_single_use() {
        let store = InMemoryOAuthStore::new();
        store.save_code(code("abc")).await;
        assert!(store.take_code("abc").await.is_some());
        assert!(store.take_code("abc").await.is_none());
    }

    #[tokio::test]
    async fn rotate_secret_fails_for_unknown_client() {
        let store = InMemoryOAuthStore::new();
        assert!(!store.rotate_client_secret("nope", "s".to_string(), 0).await);
    }
}
