//! Builds concrete transports from configuration (§4.8): legacy-shape
//! normalization, `${VAR}` resolution, scheme validation, and
//! config-keyed instance caching.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;

use funnel_core::env::EnvResolver;
use funnel_protocol::{JsonRpcMessage, RequestId, TransportError};

use crate::base::{AuthHeaderProvider, BaseClientTransport, ClientTransportOps, TransportEvent};
use crate::config::{ReconnectionPolicy, TransportConfig};
use crate::correlator::{CorrelatedResult, MessageCorrelator};
use crate::{sse, stdio, streamable_http, websocket};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A type-erased handle onto any `BaseClientTransport<T>`, so the factory
/// can return one concrete type regardless of wire protocol.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn start(&self) -> Result<(), TransportError>;
    async fn send_request(&self, method: String, params: Option<Value>) -> CorrelatedResult;
    async fn send_non_request(&self, message: &JsonRpcMessage) -> Result<(), TransportError>;
    async fn close(&self);
    fn subscribe(&self) -> tokio::sync::broadcast::Receiver<TransportEvent>;
}

#[async_trait::async_trait]
impl<T: ClientTransportOps + 'static> Transport for BaseClientTransport<T> {
    async fn start(&self) -> Result<(), TransportError> {
        self.start().await
    }

    async fn send_request(&self, method: String, params: Option<Value>) -> CorrelatedResult {
        self.send_request(method, params).await
    }

    async fn send_non_request(&self, message: &JsonRpcMessage) -> Result<(), TransportError> {
        self.send_non_request(message).await
    }

    async fn close(&self) {
        self.close().await
    }

    fn subscribe(&self) -> tokio::sync::broadcast::Receiver<TransportEvent> {
        self.subscribe()
    }
}

// Unused in practice (responses are correlated by id, not echoed through
// this trait), kept only so `RequestId` stays a named import for docs that
// reference §4.8's id-correlation contract.
#[allow(dead_code)]
fn _request_id_marker(_: RequestId) {}

/// Builds and caches `Transport` instances from `TransportConfig`.
pub struct TransportFactory {
    env: EnvResolver,
    cache: DashMap<String, Arc<dyn Transport>>,
}

impl TransportFactory {
    /// A factory using the default (strict) environment resolver.
    pub fn new() -> Self {
        Self {
            env: EnvResolver::new(),
            cache: DashMap::new(),
        }
    }

    /// A factory using a caller-supplied resolver (e.g. lenient mode for
    /// tests, or one seeded with a custom max recursion depth).
    pub fn with_env_resolver(env: EnvResolver) -> Self {
        Self {
            env,
            cache: DashMap::new(),
        }
    }

    /// Parses raw JSON config, normalizing the legacy bare
    /// `{command, args, env}` shape (no `transport` tag) into `Stdio`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidResponse`] if the shape matches
    /// neither the legacy form nor a tagged `TransportConfig` variant.
    pub fn parse_config(&self, raw: &Value) -> Result<TransportConfig, TransportError> {
        if raw.get("transport").is_none() && raw.get("command").is_some() {
            let command = raw
                .get("command")
                .and_then(Value::as_str)
                .ok_or_else(|| TransportError::InvalidResponse("missing 'command'".to_string()))?
                .to_string();
            let args = raw
                .get("args")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default();
            let env = raw
                .get("env")
                .and_then(Value::as_object)
                .map(|obj| {
                    obj.iter()
                        .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                        .collect()
                })
                .unwrap_or_default();
            return Ok(TransportConfig::Stdio { command, args, env });
        }

        serde_json::from_value(raw.clone())
            .map_err(|err| TransportError::InvalidResponse(format!("invalid transport config: {err}")))
    }

    /// Resolves `${VAR[:default]}` placeholders across every string field
    /// of `config` by round-tripping through `serde_json::Value`.
    pub fn resolve_env(&self, config: &TransportConfig) -> Result<TransportConfig, TransportError> {
        let vars: std::collections::HashMap<String, String> = std::env::vars().collect();
        let mut value = serde_json::to_value(config)
            .map_err(|err| TransportError::InvalidResponse(err.to_string()))?;
        resolve_strings(&mut value, &self.env, &vars)
            .map_err(|err| TransportError::InvalidResponse(err.to_string()))?;
        serde_json::from_value(value).map_err(|err| TransportError::InvalidResponse(err.to_string()))
    }

    /// Builds (or returns a cached) `Transport` for `config`.
    ///
    /// Instances are keyed by the serialized config plus the auth
    /// provider's pointer identity, so reconfiguring a server (or swapping
    /// its credentials) always yields a fresh transport rather than reusing
    /// a stale one.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidUrl`] if the configured URL's
    /// scheme doesn't match what the transport kind requires.
    pub fn create(
        &self,
        raw_config: &Value,
        auth: Option<Arc<dyn AuthHeaderProvider>>,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        let config = self.resolve_env(&self.parse_config(raw_config)?)?;
        let key = cache_key(&config, &auth);
        if let Some(existing) = self.cache.get(&key) {
            return Ok(existing.clone());
        }

        let correlator = MessageCorrelator::new(DEFAULT_REQUEST_TIMEOUT);
        let transport: Arc<dyn Transport> = match config {
            TransportConfig::Stdio { command, args, env } => {
                stdio::build(command, args, env, correlator, ReconnectionPolicy::conservative())
            }
            TransportConfig::Sse {
                url,
                timeout_ms,
                reconnect,
                auth: static_auth,
            } => {
                require_scheme(&url, &["http", "https"])?;
                sse::build(
                    url,
                    Duration::from_millis(timeout_ms),
                    static_auth.map(|a| format!("Bearer {}", a.token)),
                    correlator,
                    reconnect,
                )
            }
            TransportConfig::WebSocket {
                url,
                reconnect,
                ping_interval_ms,
                auth: static_auth,
                ..
            } => {
                require_scheme(&url, &["ws", "wss"])?;
                websocket::build(
                    url,
                    static_auth.map(|a| format!("Bearer {}", a.token)),
                    ping_interval_ms.map(Duration::from_millis),
                    correlator,
                    reconnect,
                )
            }
            TransportConfig::StreamableHttp {
                url,
                timeout_ms,
                reconnect,
                session_id,
                dedicated_event_stream,
                ..
            } => {
                require_scheme(&url, &["http", "https"])?;
                streamable_http::build(
                    url,
                    Duration::from_millis(timeout_ms),
                    session_id,
                    dedicated_event_stream,
                    auth.clone(),
                    correlator,
                    reconnect,
                )
            }
        };

        self.cache.insert(key, transport.clone());
        Ok(transport)
    }
}

impl Default for TransportFactory {
    fn default() -> Self {
        Self::new()
    }
}

fn require_scheme(url: &str, allowed: &[&str]) -> Result<(), TransportError> {
    let parsed = url::Url::parse(url).map_err(|err| TransportError::InvalidUrl(err.to_string()))?;
    if allowed.contains(&parsed.scheme()) {
        Ok(())
    } else {
        Err(TransportError::InvalidUrl(format!(
            "scheme '{}' not allowed, expected one of {allowed:?}",
            parsed.scheme()
        )))
    }
}

fn cache_key(config: &TransportConfig, auth: &Option<Arc<dyn AuthHeaderProvider>>) -> String {
    let serialized = serde_json::to_string(config).unwrap_or_default();
    let auth_identity = auth
        .as_ref()
        .map(|a| format!("{:p}", Arc::as_ptr(a)))
        .unwrap_or_default();
    format!("{serialized}|{auth_identity}")
}

fn resolve_strings(
    value: &mut Value,
    resolver: &EnvResolver,
    vars: &std::collections::HashMap<String, String>,
) -> Result<(), funnel_core::error::CoreError> {
    match value {
        Value::String(s) => {
            if EnvResolver::contains_pattern(s) {
                *s = resolver.resolve(s, vars)?;
            }
        }
        Value::Array(items) => {
            for item in items {
                resolve_strings(item, resolver, vars)?;
            }
        }
        Value::Object(map) => {
            for (_, v) in map.iter_mut() {
                resolve_strings(v, resolver, vars)?;
            }
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_legacy_command_shape_to_stdio() {
        let factory = TransportFactory::new();
        let raw = serde_json::json!({"command": "node", "args": ["server.js"]});
        let config = factory.parse_config(&raw).unwrap();
        assert!(matches!(config, TransportConfig::Stdio { command, .. } if command == "node"));
    }

    #[test]
    fn rejects_websocket_config_with_http_scheme() {
        let factory = TransportFactory::new();
        let raw = serde_json::json!({
            "transport": "web-socket",
            "url": "http://example.invalid/ws"
        });
        let err = factory.create(&raw, None).unwrap_err();
        assert!(matches!(err, TransportError::InvalidUrl(_) | TransportError::InvalidResponse(_)));
    }

    #[test]
    fn resolves_env_placeholders_in_stdio_config() {
        std::env::set_var("FUNNEL_TEST_TOKEN", "secret-value");
        let factory = TransportFactory::new();
        let raw = serde_json::json!({
            "command": "node",
            "env": {"TOKEN": "${FUNNEL_TEST_TOKEN}"}
        });
        let config = factory.parse_config(&raw).unwrap();
        let resolved = factory.resolve_env(&config).unwrap();
        match resolved {
            TransportConfig::Stdio { env, .. } => {
                assert_eq!(env.get("TOKEN").unwrap(), "secret-value");
            }
            other => panic!("expected Stdio, got {other:?}"),
        }
        std::env::remove_var("FUNNEL_TEST_TOKEN");
    }

    #[test]
    fn caches_transport_by_config_and_auth_identity() {
        let factory = TransportFactory::new();
        let raw = serde_json::json!({"command": "cat", "args": []});
        let first = factory.create(&raw, None).unwrap();
        let second = factory.create(&raw, None).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }
}
