//! Proxy-layer errors (§7): wraps transport and auth errors, adds
//! kernel/config-specific kinds, and converts everything into a JSON-RPC
//! error object for the inbound path.

use thiserror::Error;

use funnel_protocol::{JsonRpcError, TransportError};

/// A specialized `Result` type for proxy operations.
pub type ProxyResult<T> = std::result::Result<T, ProxyError>;

/// The proxy's own error hierarchy: transport and auth errors pass through
/// unchanged (so their retryability/taxonomy survives), proxy-specific
/// kinds cover everything the kernel, override manager, and config loader
/// can fail on.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ProxyError {
    /// Wraps a transport-layer failure from an upstream connection.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Wraps an OAuth/inbound-auth failure.
    #[error("auth error: {0}")]
    Auth(#[from] funnel_auth::AuthError),

    /// A correlated request resolved with a JSON-RPC error object from the
    /// upstream server itself (as opposed to a transport-level failure).
    #[error("upstream error {}: {}", .0.code, .0.message)]
    UpstreamRpc(#[from] JsonRpcError),

    /// Invalid or missing config.
    #[error("configuration error: {message}")]
    Configuration {
        message: String,
        key: Option<String>,
    },

    /// A named upstream server could not be found in the registry.
    #[error("unknown server: {0}")]
    UnknownServer(String),

    /// A `tools/call` named a tool this proxy has never registered.
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    /// An inbound JSON-RPC method this proxy doesn't implement.
    #[error("unknown method: {0}")]
    UnknownMethod(String),

    /// A tool call's arguments failed the upstream's declared schema.
    #[error("schema validation error: {message}")]
    SchemaValidation { message: String },

    /// An operation exceeded its configured deadline.
    #[error("timeout: {operation} exceeded {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Too many concurrent sessions or requests.
    #[error("rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    /// JSON (de)serialization failure outside the transport layer.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl ProxyError {
    /// A configuration error with no particular key.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
            key: None,
        }
    }

    /// A configuration error naming the offending key.
    pub fn configuration_with_key(message: impl Into<String>, key: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
            key: Some(key.into()),
        }
    }

    /// A schema validation error.
    pub fn schema_validation(message: impl Into<String>) -> Self {
        Self::SchemaValidation {
            message: message.into(),
        }
    }

    /// A timeout error.
    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Client-safe message: strips internal detail that could leak config
    /// paths, upstream URLs, or stack context.
    pub fn sanitize(&self) -> String {
        match self {
            Self::Transport(_) => "Upstream transport error".to_string(),
            Self::Auth(_) => "Authentication error".to_string(),
            Self::UpstreamRpc(rpc) => rpc.message.clone(),
            Self::Configuration { .. } => "Configuration error".to_string(),
            Self::UnknownServer(_) => "Unknown server".to_string(),
            Self::UnknownTool(name) => format!("Unknown tool: {name}"),
            Self::UnknownMethod(method) => format!("Unknown method: {method}"),
            Self::SchemaValidation { .. } => "Schema validation failed".to_string(),
            Self::Timeout { operation, .. } => format!("Operation '{operation}' timed out"),
            Self::RateLimitExceeded(_) => "Rate limit exceeded".to_string(),
            Self::Serialization(_) => "Data serialization error".to_string(),
        }
    }

    /// Whether this error warrants an automatic retry by the caller.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(err) => err.retryable(),
            Self::Timeout { .. } => true,
            _ => false,
        }
    }
}

/// Maps any `ProxyError` onto the taxonomy's JSON-RPC error codes (§4.3,
/// §6): unknown-method lookups get `-32601`, malformed arguments get
/// `-32602`, everything else collapses to `-32603 Internal error` with the
/// sanitized message.
impl From<ProxyError> for JsonRpcError {
    fn from(err: ProxyError) -> Self {
        match &err {
            ProxyError::UpstreamRpc(rpc) => rpc.clone(),
            ProxyError::UnknownMethod(method) => JsonRpcError::method_not_found(method),
            ProxyError::UnknownTool(_) => JsonRpcError::method_not_found(&err.sanitize()),
            ProxyError::SchemaValidation { message } => JsonRpcError::invalid_params(message.clone()),
            ProxyError::Timeout { .. } => JsonRpcError::request_timeout(),
            ProxyError::Transport(TransportError::ConnectionFailed(_) | TransportError::ConnectionReset(_)) => {
                JsonRpcError::transport_closed()
            }
            _ => JsonRpcError::internal(err.sanitize()),
        }
    }
}

/// Extension trait attaching proxy error context without discarding the
/// underlying error's kind.
pub trait ProxyErrorExt<T> {
    /// Wraps a config-loading failure, naming the offending key.
    fn config_context(self, key: impl Into<String>) -> ProxyResult<T>;
}

impl<T, E> ProxyErrorExt<T> for Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn config_context(self, key: impl Into<String>) -> ProxyResult<T> {
        self.map_err(|e| ProxyError::configuration_with_key(e.to_string(), key.into()))
    }
}
