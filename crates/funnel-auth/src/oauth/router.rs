//! Axum HTTP surface for the authorization server: `/register`,
//! `/authorize`, `/consent`, `/token`, `/revoke`,
//! `/clients/:id/rotate-secret`, and the two `.well-known` metadata
//! documents.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Json, Redirect};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::json;

use super::metadata::{authorization_server_metadata, protected_resource_metadata};
use super::provider::{
    AuthorizeOutcome, AuthorizeRequest, ConsentDecisionRequest, OAuthProvider, RegisterRequest, TokenRequest,
};
use super::store::OAuthStore;
use crate::error::AuthError;

#[derive(Clone)]
pub struct OAuthRouterState<S: OAuthStore> {
    pub provider: Arc<OAuthProvider<S>>,
    /// The resource identifier advertised in the protected-resource document;
    /// distinct from the authorization server's own `issuer`.
    pub resource: String,
}

/// Mounts every authorization-server endpoint onto a fresh [`Router`].
pub fn router<S: OAuthStore + 'static>(state: OAuthRouterState<S>) -> Router {
    Router::new()
        .route("/register", post(register::<S>))
        .route("/authorize", get(authorize::<S>))
        .route("/consent", get(consent_page::<S>).post(consent::<S>))
        .route("/token", post(token::<S>))
        .route("/revoke", post(revoke::<S>))
        .route("/clients/{id}/rotate-secret", post(rotate_secret::<S>))
        .route("/.well-known/oauth-authorization-server", get(as_metadata::<S>))
        .route("/.well-known/oauth-protected-resource", get(resource_metadata::<S>))
        .with_state(state)
}

impl IntoResponse for AuthError {
    fn into_response(self) -> axum::response::Response {
        let status = StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::BAD_REQUEST);
        let body = match &self {
            AuthError::ConsentRequired { consent_uri } => json!({
                "error": self.code(),
                "consent_uri": consent_uri,
            }),
            other => json!({
                "error": self.code(),
                "error_description": other.to_string(),
            }),
        };
        (status, Json(body)).into_response()
    }
}

async fn register<S: OAuthStore>(
    State(state): State<OAuthRouterState<S>>,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse, AuthError> {
    let client = state.provider.register(req).await?;
    Ok((StatusCode::CREATED, Json(client)))
}

/// RFC 8707 resource indicator, read independently of [`AuthorizeRequest`]
/// since `Query` may be applied more than once to the same URI.
#[derive(Debug, Deserialize)]
struct ResourceQuery {
    #[serde(default)]
    resource: Option<String>,
}

/// Rejects a request whose `resource` indicator doesn't match the single
/// resource this authorization server serves. A no-op when `resource` is
/// absent.
fn check_resource_indicator(resource: &Option<String>, server_resource: &str) -> Result<(), AuthError> {
    match resource {
        Some(requested) => funnel_core::validate_audience(requested, server_resource)
            .map_err(|err| AuthError::InvalidTarget(err.to_string())),
        None => Ok(()),
    }
}

async fn authorize<S: OAuthStore>(
    State(state): State<OAuthRouterState<S>>,
    Query(resource_query): Query<ResourceQuery>,
    Query(req): Query<AuthorizeRequest>,
) -> Result<impl IntoResponse, AuthError> {
    check_resource_indicator(&resource_query.resource, &state.resource)?;
    match state.provider.authorize(req).await? {
        AuthorizeOutcome::Redirect(url) => Ok(Redirect::to(&url).into_response()),
        AuthorizeOutcome::ConsentRequired { consent_uri } => Ok(Redirect::to(&consent_uri).into_response()),
    }
}

/// The fields `authorize`'s `consent_uri` carries to `/consent` (§4.11).
#[derive(Debug, Deserialize)]
struct ConsentQuery {
    client_id: String,
    #[serde(default)]
    redirect_uri: Option<String>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    code_challenge: Option<String>,
    #[serde(default)]
    code_challenge_method: Option<String>,
}

/// `GET /consent`: where `authorize`'s `consent_uri` redirects a user-agent
/// that hasn't yet approved the requested scopes. Content-negotiated per
/// `Accept` — a browser gets an HTML page that `POST`s the decision back as
/// JSON to this same path; any other caller gets the same fields as plain
/// JSON metadata.
async fn consent_page<S: OAuthStore>(Query(query): Query<ConsentQuery>, headers: HeaderMap) -> impl IntoResponse {
    let wants_html = headers
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|accept| accept.contains("text/html"));

    if wants_html {
        Html(render_consent_html(&query)).into_response()
    } else {
        Json(json!({
            "client_id": query.client_id,
            "redirect_uri": query.redirect_uri,
            "scope": query.scope,
            "state": query.state,
            "code_challenge": query.code_challenge,
            "code_challenge_method": query.code_challenge_method,
        }))
        .into_response()
    }
}

/// Resource-owner identity is assumed established upstream of this page
/// (§4.11's note on `AuthorizeRequest::user_id`, e.g. by a session cookie a
/// reverse proxy would attach); the form below asks for it directly since
/// this provider has no session layer of its own.
fn render_consent_html(query: &ConsentQuery) -> String {
    format!(
        r#"<!doctype html>
<html lang="en">
  <head>
    <meta charset="utf-8" />
    <meta name="viewport" content="width=device-width, initial-scale=1" />
    <title>Authorize access</title>
  </head>
  <body>
    <h1>Authorize access</h1>
    <p><strong>{client_id}</strong> is requesting access to: <code>{scope}</code></p>
    <form id="consent-form">
      <input type="hidden" name="client_id" value="{client_id}" />
      <input type="hidden" name="redirect_uri" value="{redirect_uri}" />
      <input type="hidden" name="scope" value="{scope}" />
      <input type="hidden" name="state" value="{state}" />
      <input type="hidden" name="code_challenge" value="{code_challenge}" />
      <input type="hidden" name="code_challenge_method" value="{code_challenge_method}" />
      <label>User ID <input type="text" name="user_id" required /></label>
      <button type="submit" name="decision" value="approve">Approve</button>
      <button type="submit" name="decision" value="deny">Deny</button>
    </form>
    <script>
      document.getElementById('consent-form').addEventListener('submit', function (event) {{
        event.preventDefault();
        var data = Object.fromEntries(new FormData(event.target, event.submitter).entries());
        fetch('/consent', {{
          method: 'POST',
          headers: {{ 'Content-Type': 'application/json' }},
          body: JSON.stringify({{
            client_id: data.client_id,
            decision: data.decision,
            approved_scopes: data.scope ? data.scope.split(' ').filter(Boolean) : [],
            redirect_uri: data.redirect_uri || null,
            state: data.state || null,
            code_challenge: data.code_challenge || null,
            code_challenge_method: data.code_challenge_method || null,
            user_id: data.user_id,
          }}),
        }}).then(function (response) {{
          if (response.redirected) {{ window.location.href = response.url; }}
        }});
      }});
    </script>
  </body>
</html>"#,
        client_id = html_escape(&query.client_id),
        redirect_uri = html_escape(query.redirect_uri.as_deref().unwrap_or("")),
        scope = html_escape(query.scope.as_deref().unwrap_or("")),
        state = html_escape(query.state.as_deref().unwrap_or("")),
        code_challenge = html_escape(query.code_challenge.as_deref().unwrap_or("")),
        code_challenge_method = html_escape(query.code_challenge_method.as_deref().unwrap_or("")),
    )
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

async fn consent<S: OAuthStore>(
    State(state): State<OAuthRouterState<S>>,
    Json(req): Json<ConsentDecisionRequest>,
) -> Result<impl IntoResponse, AuthError> {
    let redirect = state.provider.decide_consent(req).await?;
    Ok(Redirect::to(&redirect))
}

/// Form-encoded shape of `/token` (RFC 6749 §4.1.3/§6): `grant_type` selects
/// which of the other fields are required. Kept separate from
/// [`TokenRequest`] because an internally-tagged enum doesn't round-trip
/// cleanly through `application/x-www-form-urlencoded`.
#[derive(Debug, Deserialize)]
struct TokenFormRequest {
    grant_type: String,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    redirect_uri: Option<String>,
    client_id: String,
    #[serde(default)]
    client_secret: Option<String>,
    #[serde(default)]
    code_verifier: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    resource: Option<String>,
}

impl TryFrom<TokenFormRequest> for TokenRequest {
    type Error = AuthError;

    fn try_from(form: TokenFormRequest) -> Result<Self, Self::Error> {
        match form.grant_type.as_str() {
            "authorization_code" => Ok(TokenRequest::AuthorizationCode {
                code: form.code.ok_or_else(|| AuthError::InvalidRequest("missing code".to_string()))?,
                redirect_uri: form
                    .redirect_uri
                    .ok_or_else(|| AuthError::InvalidRequest("missing redirect_uri".to_string()))?,
                client_id: form.client_id,
                client_secret: form.client_secret,
                code_verifier: form.code_verifier,
            }),
            "refresh_token" => Ok(TokenRequest::RefreshToken {
                refresh_token: form
                    .refresh_token
                    .ok_or_else(|| AuthError::InvalidRequest("missing refresh_token".to_string()))?,
                client_id: form.client_id,
                client_secret: form.client_secret,
                scope: form.scope,
            }),
            other => Err(AuthError::UnsupportedGrantType(other.to_string())),
        }
    }
}

async fn token<S: OAuthStore>(
    State(state): State<OAuthRouterState<S>>,
    axum::Form(form): axum::Form<TokenFormRequest>,
) -> Result<impl IntoResponse, AuthError> {
    check_resource_indicator(&form.resource, &state.resource)?;
    let req = TokenRequest::try_from(form)?;
    let response = state.provider.token(req).await?;
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
struct RevokeRequest {
    token: String,
    #[serde(default)]
    #[allow(dead_code)]
    token_type_hint: Option<String>,
}

async fn revoke<S: OAuthStore>(
    State(state): State<OAuthRouterState<S>>,
    axum::Form(req): axum::Form<RevokeRequest>,
) -> impl IntoResponse {
    state.provider.revoke(&req.token).await;
    StatusCode::OK
}

#[derive(Debug, Deserialize)]
struct RotateSecretRequest {
    current_secret: String,
}

async fn rotate_secret<S: OAuthStore>(
    State(state): State<OAuthRouterState<S>>,
    Path(client_id): Path<String>,
    Json(req): Json<RotateSecretRequest>,
) -> Result<impl IntoResponse, AuthError> {
    let (client_secret, client_secret_expires_at) =
        state.provider.rotate_secret(&client_id, &req.current_secret).await?;
    Ok(Json(json!({
        "client_secret": client_secret,
        "client_secret_expires_at": client_secret_expires_at,
    })))
}

async fn as_metadata<S: OAuthStore>(State(state): State<OAuthRouterState<S>>) -> impl IntoResponse {
    Json(authorization_server_metadata(state.provider.config()))
}

async fn resource_metadata<S: OAuthStore>(State(state): State<OAuthRouterState<S>>) -> impl IntoResponse {
    Json(protected_resource_metadata(&state.resource, state.provider.config()))
}
