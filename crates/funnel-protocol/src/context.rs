//! Per-request context threaded through the inbound dispatch path.

use crate::message::RequestId;

/// Identifies one inbound request as it is routed through the proxy kernel.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// The inbound caller's request id, echoed back on response.
    pub id: RequestId,
    /// The inbound session this request belongs to, if the transport is
    /// session-oriented (e.g. Streamable HTTP's `Mcp-Session-Id`).
    pub session_id: Option<String>,
}

impl RequestContext {
    /// Builds a context for a request with no session affinity.
    pub fn new(id: RequestId) -> Self {
        Self {
            id,
            session_id: None,
        }
    }

    /// Attaches a session id.
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}
