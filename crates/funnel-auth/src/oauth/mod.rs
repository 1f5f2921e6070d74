//! RFC 6749 + PKCE authorization server (§4.11): data model, storage,
//! provider logic, `.well-known` metadata, and the axum HTTP surface.

pub mod metadata;
pub mod pkce;
pub mod provider;
pub mod router;
pub mod store;
pub mod types;

pub use provider::{OAuthProvider, OAuthProviderConfig};
pub use router::{router as oauth_router, OAuthRouterState};
pub use store::{InMemoryOAuthStore, OAuthStore};
pub use types::{AuthorizationCode, ClientRegistration, CodeChallengeMethod, ConsentRecord, IssuedToken};
