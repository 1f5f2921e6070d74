//! Axum HTTP surface (§6): the bearer-gated inbound MCP endpoint, plus
//! the OAuth authorization server router merged in when configured.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderValue, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::post;
use axum::Router;
use serde_json::Value;
use tracing::warn;

use funnel_auth::inbound::InboundAuthValidator;
use funnel_auth::oauth::{oauth_router, InMemoryOAuthStore, OAuthProvider, OAuthProviderConfig, OAuthRouterState};
use funnel_core::env::EnvResolver;
use funnel_protocol::{JsonRpcMessage, JsonRpcResponse, JsonRpcResponsePayload, JsonRpcVersion};

use crate::config::{FunnelConfig, InboundAuthType};
use crate::error::{ProxyError, ProxyResult};
use crate::kernel::ProxyKernel;

/// The `WWW-Authenticate` realm advertised on a 401 (§8 scenario 1).
pub const INBOUND_REALM: &str = "MCP Proxy API";

/// Where the inbound JSON-RPC surface is mounted.
pub const MCP_ENDPOINT: &str = "/api/streamable/mcp";

/// Resolves inbound auth per §4.10/§6: `MCP_FUNNEL_AUTH_TOKEN` and
/// `DISABLE_INBOUND_AUTH` layer on top of the config file's
/// `inboundAuth` section.
///
/// # Errors
///
/// Returns [`ProxyError::Auth`] if a configured token is too short or a
/// `${VAR}` token reference is undefined.
pub fn build_inbound_auth(config: &FunnelConfig) -> ProxyResult<(InboundAuthValidator, Option<String>)> {
    let resolver = EnvResolver::new();
    let vars: HashMap<String, String> = std::env::vars().collect();

    let mut tokens = config.inbound_auth.tokens.clone();
    if let Ok(explicit) = std::env::var("MCP_FUNNEL_AUTH_TOKEN") {
        tokens.push(explicit);
    }

    let disable_override = matches!(std::env::var("DISABLE_INBOUND_AUTH").as_deref(), Ok("true"))
        || (tokens.is_empty() && config.inbound_auth.auth_type == InboundAuthType::None);

    InboundAuthValidator::from_startup_config(tokens, disable_override, &resolver, &vars).map_err(ProxyError::from)
}

/// Builds the full inbound `Router`: the MCP endpoint gated by `validator`,
/// merged with the OAuth router when `config.oauth` is set.
pub fn build_router(kernel: Arc<ProxyKernel>, validator: Arc<InboundAuthValidator>, config: &FunnelConfig) -> Router {
    let mcp_router = Router::new()
        .route(MCP_ENDPOINT, post(handle_mcp))
        .route_layer(middleware::from_fn_with_state(validator, require_bearer))
        .with_state(kernel);

    match &config.oauth {
        Some(section) => {
            let provider_config: OAuthProviderConfig = section.into();
            let resource = section.resource.clone().unwrap_or_else(|| section.base_url.clone());
            let store = Arc::new(InMemoryOAuthStore::new());
            let provider = Arc::new(OAuthProvider::new(provider_config, store));
            let oauth_state = OAuthRouterState { provider, resource };
            mcp_router.merge(oauth_router(oauth_state))
        }
        None => mcp_router,
    }
}

async fn require_bearer(
    State(validator): State<Arc<InboundAuthValidator>>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let header_value = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    if let Err(err) = validator.validate_header(header_value) {
        let mut response = (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": err.to_string() })),
        )
            .into_response();
        if let Ok(value) = HeaderValue::from_str(&InboundAuthValidator::www_authenticate(INBOUND_REALM)) {
            response.headers_mut().insert(header::WWW_AUTHENTICATE, value);
        }
        return response;
    }

    next.run(request).await
}

async fn handle_mcp(State(kernel): State<Arc<ProxyKernel>>, body: Bytes) -> Response {
    let message = match JsonRpcMessage::parse(&body) {
        Ok(message) => message,
        Err(err) => {
            return (StatusCode::BAD_REQUEST, Json(serde_json::json!({ "error": err.to_string() })))
                .into_response()
        }
    };

    match message {
        JsonRpcMessage::Request(request) => {
            let result = dispatch(&kernel, &request.method, request.params).await;
            let payload = match result {
                Ok(value) => JsonRpcResponsePayload::Result { result: value },
                Err(err) => JsonRpcResponsePayload::Error { error: err.into() },
            };
            Json(JsonRpcResponse {
                jsonrpc: JsonRpcVersion,
                id: request.id,
                payload,
            })
            .into_response()
        }
        JsonRpcMessage::Notification(notification) => {
            if notification.method != "notifications/tools/list_changed" {
                warn!(method = %notification.method, "ignoring unsupported inbound notification");
            }
            StatusCode::ACCEPTED.into_response()
        }
        JsonRpcMessage::Response(_) => {
            (StatusCode::BAD_REQUEST, Json(serde_json::json!({ "error": "unexpected response frame" })))
                .into_response()
        }
    }
}

/// Handles the methods §6 requires: `initialize`, `tools/list`,
/// `tools/call`; anything else is `-32601 Method not found`.
async fn dispatch(kernel: &ProxyKernel, method: &str, params: Option<Value>) -> Result<Value, ProxyError> {
    match method {
        "initialize" => Ok(serde_json::json!({
            "protocolVersion": "2024-11-05",
            "capabilities": { "tools": { "listChanged": true } },
            "serverInfo": { "name": "mcp-funnel", "version": env!("CARGO_PKG_VERSION") },
        })),
        "tools/list" => Ok(serde_json::json!({ "tools": kernel.list_tools() })),
        "tools/call" => {
            let params = params.ok_or_else(|| ProxyError::schema_validation("missing params"))?;
            let name = params
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| ProxyError::schema_validation("missing 'name'"))?;
            let arguments = params.get("arguments").cloned();
            kernel.call_tool(name, arguments).await
        }
        other => Err(ProxyError::UnknownMethod(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tower::ServiceExt;

    fn test_config(tokens: Vec<String>) -> FunnelConfig {
        FunnelConfig {
            servers: Vec::new(),
            hide_tools: Vec::new(),
            expose_tools: Vec::new(),
            expose_core_tools: Vec::new(),
            inbound_auth: crate::config::InboundAuthConfig {
                auth_type: InboundAuthType::Bearer,
                tokens,
            },
            oauth: None,
            secrets: Vec::new(),
            overrides: Vec::new(),
        }
    }

    fn empty_kernel() -> Arc<ProxyKernel> {
        let config = test_config(vec!["x".repeat(16)]);
        let factory = funnel_transport::TransportFactory::new();
        Arc::new(ProxyKernel::build(&config, &factory, None).unwrap())
    }

    #[tokio::test]
    async fn missing_bearer_header_yields_401_with_realm() {
        let token = "a".repeat(32);
        let config = test_config(vec![token.clone()]);
        let (validator, _) = build_inbound_auth(&config).unwrap();
        let app = build_router(empty_kernel(), Arc::new(validator), &config);

        let request = Request::builder()
            .method("POST")
            .uri(MCP_ENDPOINT)
            .body(axum::body::Body::from(
                serde_json::to_vec(&serde_json::json!({
                    "jsonrpc": "2.0", "id": 1, "method": "tools/list"
                }))
                .unwrap(),
            ))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let www_auth = response
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .unwrap();
        assert_eq!(www_auth, "Bearer realm=\"MCP Proxy API\"");
    }

    #[tokio::test]
    async fn valid_bearer_header_is_not_rejected() {
        let token = "a".repeat(32);
        let config = test_config(vec![token.clone()]);
        let (validator, _) = build_inbound_auth(&config).unwrap();
        let app = build_router(empty_kernel(), Arc::new(validator), &config);

        let request = Request::builder()
            .method("POST")
            .uri(MCP_ENDPOINT)
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .body(axum::body::Body::from(
                serde_json::to_vec(&serde_json::json!({
                    "jsonrpc": "2.0", "id": 1, "method": "tools/list"
                }))
                .unwrap(),
            ))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_ne!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn unknown_method_maps_to_method_not_found_over_http() {
        let token = "a".repeat(32);
        let config = test_config(vec![token.clone()]);
        let (validator, _) = build_inbound_auth(&config).unwrap();
        let app = build_router(empty_kernel(), Arc::new(validator), &config);

        let request = Request::builder()
            .method("POST")
            .uri(MCP_ENDPOINT)
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .body(axum::body::Body::from(
                serde_json::to_vec(&serde_json::json!({
                    "jsonrpc": "2.0", "id": 1, "method": "frobnicate"
                }))
                .unwrap(),
            ))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["error"]["code"], -32601);
    }
}
