//! JSON-RPC 2.0 message plane: the wire shapes exchanged with every
//! upstream transport and the inbound MCP endpoint.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::sync::atomic::{AtomicI64, Ordering};
use uuid::Uuid;

/// The literal `"2.0"` JSON-RPC version marker. Rejects any other value on
/// deserialization rather than accepting and ignoring it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JsonRpcVersion;

const JSONRPC_VERSION: &str = "2.0";

impl Serialize for JsonRpcVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(JSONRPC_VERSION)
    }
}

impl<'de> Deserialize<'de> for JsonRpcVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        if s != JSONRPC_VERSION {
            return Err(serde::de::Error::custom(format!(
                "unsupported jsonrpc version '{s}', expected \"{JSONRPC_VERSION}\""
            )));
        }
        Ok(JsonRpcVersion)
    }
}

/// An opaque, globally-unique-per-transport request identifier.
///
/// Immutable once created. The wire representation may be a JSON number or
/// string per the JSON-RPC spec; `RequestId` accepts either on the wire but
/// this proxy only ever generates the `Number` form internally (a
/// monotonically increasing counter), using `String`/UUID form only when
/// echoing an id supplied by an inbound caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Numeric id, as generated by [`RequestIdGenerator`].
    Number(i64),
    /// String id, typically echoed back from an inbound caller's own id.
    String(String),
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => write!(f, "{s}"),
        }
    }
}

/// Generates request ids for outbound requests on one transport instance.
///
/// Two strategies are supported: a monotonically increasing counter
/// (default, cheap and log-friendly) or UUIDv4 (useful when ids must not
/// reveal call volume to the upstream server).
#[derive(Debug)]
pub enum RequestIdGenerator {
    /// Monotonically increasing integer counter, starting at 1.
    Counter(AtomicI64),
    /// Random UUIDv4 per call.
    Uuid,
}

impl RequestIdGenerator {
    /// A counter-based generator starting at 1.
    pub fn counter() -> Self {
        Self::Counter(AtomicI64::new(1))
    }

    /// A UUIDv4-based generator.
    pub fn uuid() -> Self {
        Self::Uuid
    }

    /// Produces the next id. Never repeats for the lifetime of this
    /// generator (barring counter overflow, which would require i64::MAX
    /// calls on one transport instance).
    pub fn next(&self) -> RequestId {
        match self {
            Self::Counter(counter) => RequestId::Number(counter.fetch_add(1, Ordering::SeqCst)),
            Self::Uuid => RequestId::String(Uuid::new_v4().to_string()),
        }
    }
}

impl Default for RequestIdGenerator {
    fn default() -> Self {
        Self::counter()
    }
}

/// The `{code, message, data?}` shape of a JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// A JSON-RPC error code (standard `-32xxx` codes or an application code).
    pub code: i64,
    /// A short, human-readable message.
    pub message: String,
    /// Optional structured error detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    /// `-32601 Method not found`.
    pub fn method_not_found(method: &str) -> Self {
        Self {
            code: -32601,
            message: format!("Method not found: {method}"),
            data: None,
        }
    }

    /// `-32000 Request timeout`.
    pub fn request_timeout() -> Self {
        Self {
            code: -32000,
            message: "Request timeout".to_string(),
            data: None,
        }
    }

    /// `-32001 Transport closed`.
    pub fn transport_closed() -> Self {
        Self {
            code: -32001,
            message: "Transport closed".to_string(),
            data: None,
        }
    }

    /// `-32602 Invalid params`.
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self {
            code: -32602,
            message: message.into(),
            data: None,
        }
    }

    /// `-32603 Internal error`.
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            code: -32603,
            message: message.into(),
            data: None,
        }
    }
}

/// A JSON-RPC 2.0 request: expects a matching `Response`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: JsonRpcVersion,
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// A JSON-RPC 2.0 response: either a `result` or an `error`, never both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: JsonRpcVersion,
    pub id: RequestId,
    #[serde(flatten)]
    pub payload: JsonRpcResponsePayload,
}

/// The mutually-exclusive success/error halves of a response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcResponsePayload {
    /// Successful call; `result` may be any JSON value including `null`.
    Result {
        /// The call's return value.
        result: Value,
    },
    /// Failed call.
    Error {
        /// The error detail.
        error: JsonRpcError,
    },
}

/// A JSON-RPC 2.0 notification: no `id`, no response expected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: JsonRpcVersion,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// Any of the three message shapes that can appear on the wire, dispatched
/// on the presence of `id`/`method`/`result`/`error` rather than an
/// explicit discriminant (JSON-RPC has none).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    /// `{id, method, params?}` with no `result`/`error`.
    Request(JsonRpcRequest),
    /// `{id, result}` or `{id, error}`.
    Response(JsonRpcResponse),
    /// `{method, params?}` with no `id`.
    Notification(JsonRpcNotification),
}

impl JsonRpcMessage {
    /// Parses a raw line/frame of bytes as a JSON-RPC message.
    ///
    /// Per §4.6's `parseMessage` contract, the caller is expected to have
    /// already confirmed `jsonrpc == "2.0"` is present; a missing or wrong
    /// version surfaces as a deserialization error here, which callers
    /// should map to `ProtocolError`.
    pub fn parse(raw: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(raw)
    }

    /// Serializes back to a single JSON line (no trailing newline).
    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn request_round_trips() {
        let req = JsonRpcMessage::Request(JsonRpcRequest {
            jsonrpc: JsonRpcVersion,
            id: RequestId::Number(1),
            method: "tools/call".to_string(),
            params: Some(serde_json::json!({"name": "echo"})),
        });
        let bytes = req.to_bytes().unwrap();
        let parsed = JsonRpcMessage::parse(&bytes).unwrap();
        match parsed {
            JsonRpcMessage::Request(r) => {
                assert_eq!(r.id, RequestId::Number(1));
                assert_eq!(r.method, "tools/call");
            }
            other => panic!("expected Request, got {other:?}"),
        }
    }

    #[test]
    fn response_distinguishes_result_from_error() {
        let ok = serde_json::json!({"jsonrpc":"2.0","id":1,"result":{"ok":true}});
        let parsed = JsonRpcMessage::parse(ok.to_string().as_bytes()).unwrap();
        assert!(matches!(
            parsed,
            JsonRpcMessage::Response(JsonRpcResponse {
                payload: JsonRpcResponsePayload::Result { .. },
                ..
            })
        ));

        let err = serde_json::json!({"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"nope"}});
        let parsed = JsonRpcMessage::parse(err.to_string().as_bytes()).unwrap();
        assert!(matches!(
            parsed,
            JsonRpcMessage::Response(JsonRpcResponse {
                payload: JsonRpcResponsePayload::Error { .. },
                ..
            })
        ));
    }

    #[test]
    fn notification_has_no_id() {
        let raw = serde_json::json!({"jsonrpc":"2.0","method":"notifications/tools/list_changed"});
        let parsed = JsonRpcMessage::parse(raw.to_string().as_bytes()).unwrap();
        assert!(matches!(parsed, JsonRpcMessage::Notification(_)));
    }

    #[test]
    fn rejects_wrong_jsonrpc_version() {
        let raw = serde_json::json!({"jsonrpc":"1.0","method":"ping"});
        assert!(JsonRpcMessage::parse(raw.to_string().as_bytes()).is_err());
    }

    #[test]
    fn generator_counter_is_monotonic() {
        let gen = RequestIdGenerator::counter();
        let a = gen.next();
        let b = gen.next();
        assert_eq!(a, RequestId::Number(1));
        assert_eq!(b, RequestId::Number(2));
    }

    #[test]
    fn generator_uuid_produces_string_ids() {
        let gen = RequestIdGenerator::uuid();
        match gen.next() {
            RequestId::String(s) => assert_eq!(s.len(), 36),
            other => panic!("expected String id, got {other:?}"),
        }
    }
}
