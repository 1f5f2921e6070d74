//! JSON-RPC 2.0 message types, request context, and the transport error
//! taxonomy shared across `mcp-funnel`'s transport, auth, and proxy layers.

pub mod context;
pub mod error;
pub mod message;

pub use context::RequestContext;
pub use error::{TransportError, TransportResult};
pub use message::{
    JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    JsonRpcResponsePayload, JsonRpcVersion, RequestId, RequestIdGenerator,
};
