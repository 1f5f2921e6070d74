//! JSON-RPC id generation, pending-request tracking, and timeout handling
//! (§4.5). Owned exclusively by one transport instance.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::warn;

use funnel_protocol::{
    JsonRpcError, JsonRpcMessage, JsonRpcRequest, JsonRpcResponsePayload, JsonRpcVersion,
    RequestId, RequestIdGenerator,
};

/// Either the successful result or the structured error of a correlated
/// call.
pub type CorrelatedResult = Result<Value, JsonRpcError>;

struct Pending {
    method: String,
    responder: oneshot::Sender<CorrelatedResult>,
    timeout_handle: tokio::task::JoinHandle<()>,
}

/// Tracks outstanding requests for one transport and resolves them as
/// matching responses arrive, or rejects them on timeout/close.
pub struct MessageCorrelator {
    pending: Arc<DashMap<RequestId, Pending>>,
    ids: RequestIdGenerator,
    default_timeout: Duration,
}

impl MessageCorrelator {
    /// Creates a correlator with the given default per-request timeout.
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            pending: Arc::new(DashMap::new()),
            ids: RequestIdGenerator::counter(),
            default_timeout,
        }
    }

    /// Number of requests currently awaiting a response.
    pub fn pending_request_count(&self) -> usize {
        self.pending.len()
    }

    /// Sends a request: allocates the next id, serializes the JSON-RPC
    /// envelope, registers a pending entry with a timeout, invokes
    /// `send_fn` with the serialized bytes, and returns a future that
    /// resolves when the matching response arrives (or the timeout fires,
    /// or `send_fn` itself fails).
    ///
    /// # Errors
    ///
    /// The returned future resolves to `Err` carrying a JSON-RPC error
    /// object (`-32000 Request timeout` on timeout, or whatever `send_fn`
    /// reports if it fails synchronously).
    pub async fn send_request<F, Fut>(
        &self,
        method: impl Into<String>,
        params: Option<Value>,
        send_fn: F,
    ) -> CorrelatedResult
    where
        F: FnOnce(Vec<u8>) -> Fut,
        Fut: Future<Output = Result<(), JsonRpcError>>,
    {
        self.send_request_with_timeout(method, params, self.default_timeout, send_fn)
            .await
    }

    /// As [`Self::send_request`], with an explicit per-call timeout.
    pub async fn send_request_with_timeout<F, Fut>(
        &self,
        method: impl Into<String>,
        params: Option<Value>,
        timeout: Duration,
        send_fn: F,
    ) -> CorrelatedResult
    where
        F: FnOnce(Vec<u8>) -> Fut,
        Fut: Future<Output = Result<(), JsonRpcError>>,
    {
        let method = method.into();
        let id = self.ids.next();

        let request = JsonRpcMessage::Request(JsonRpcRequest {
            jsonrpc: JsonRpcVersion,
            id: id.clone(),
            method: method.clone(),
            params,
        });
        let bytes = match request.to_bytes() {
            Ok(b) => b,
            Err(err) => return Err(JsonRpcError::internal(err.to_string())),
        };

        let (tx, rx) = oneshot::channel();
        let pending = self.pending.clone();
        let timeout_id = id.clone();
        let timeout_handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some((_, entry)) = pending.remove(&timeout_id) {
                let _ = entry.responder.send(Err(JsonRpcError::request_timeout()));
            }
        });

        self.pending.insert(
            id.clone(),
            Pending {
                method,
                responder: tx,
                timeout_handle,
            },
        );

        if let Err(err) = send_fn(bytes).await {
            if let Some((_, entry)) = self.pending.remove(&id) {
                entry.timeout_handle.abort();
            }
            return Err(err);
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(JsonRpcError::transport_closed()),
        }
    }

    /// Processes one incoming message. Responses are matched against the
    /// pending map (resolving exactly once); notifications are handed to
    /// `on_notification`; requests from the remote side are handed to
    /// `on_request`. An unmatched response id is logged but never
    /// destabilizes the connection.
    pub fn handle_message(
        &self,
        message: JsonRpcMessage,
        mut on_notification: impl FnMut(String, Option<Value>),
        mut on_request: impl FnMut(RequestId, String, Option<Value>),
    ) {
        match message {
            JsonRpcMessage::Response(response) => {
                let Some((_, entry)) = self.pending.remove(&response.id) else {
                    warn!(id = %response.id, "received response for unknown or already-resolved request id");
                    return;
                };
                entry.timeout_handle.abort();
                let outcome = match response.payload {
                    JsonRpcResponsePayload::Result { result } => Ok(result),
                    JsonRpcResponsePayload::Error { error } => Err(error),
                };
                let _ = entry.responder.send(outcome);
                let _ = &entry.method; // retained for diagnostics/metrics hooks
            }
            JsonRpcMessage::Notification(notification) => {
                on_notification(notification.method, notification.params);
            }
            JsonRpcMessage::Request(request) => {
                on_request(request.id, request.method, request.params);
            }
        }
    }

    /// Rejects every currently-pending request with `err`, clearing their
    /// timers. Called on transport close/disconnect.
    pub fn reject_all_pending(&self, err: JsonRpcError) {
        let ids: Vec<RequestId> = self.pending.iter().map(|entry| entry.key().clone()).collect();
        for id in ids {
            if let Some((_, entry)) = self.pending.remove(&id) {
                entry.timeout_handle.abort();
                let _ = entry.responder.send(Err(err.clone()));
            }
        }
    }
}

impl Drop for MessageCorrelator {
    fn drop(&mut self) {
        for entry in self.pending.iter() {
            entry.value().timeout_handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn resolves_on_matching_response() {
        let correlator = Arc::new(MessageCorrelator::new(Duration::from_secs(5)));
        let c2 = correlator.clone();

        let handle = tokio::spawn(async move {
            c2.send_request("tools/list", None, |_bytes| async { Ok(()) })
                .await
        });

        tokio::task::yield_now().await;
        let response = JsonRpcMessage::parse(
            json!({"jsonrpc":"2.0","id":1,"result":{"tools":[]}})
                .to_string()
                .as_bytes(),
        )
        .unwrap();
        correlator.handle_message(response, |_, _| {}, |_, _, _| {});

        let result = handle.await.unwrap();
        assert_eq!(result.unwrap(), json!({"tools": []}));
        assert_eq!(correlator.pending_request_count(), 0);
    }

    #[tokio::test]
    async fn times_out_when_no_response_arrives() {
        let correlator = MessageCorrelator::new(Duration::from_millis(10));
        let result = correlator
            .send_request("slow", None, |_bytes| async { Ok(()) })
            .await;
        assert_eq!(result.unwrap_err().code, -32000);
        assert_eq!(correlator.pending_request_count(), 0);
    }

    #[tokio::test]
    async fn send_fn_failure_clears_pending_entry() {
        let correlator = MessageCorrelator::new(Duration::from_secs(5));
        let result = correlator
            .send_request("broken", None, |_bytes| async {
                Err(JsonRpcError::internal("send failed"))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(correlator.pending_request_count(), 0);
    }

    #[tokio::test]
    async fn reject_all_pending_clears_every_entry() {
        let correlator = Arc::new(MessageCorrelator::new(Duration::from_secs(5)));
        let c2 = correlator.clone();
        let handle = tokio::spawn(async move {
            c2.send_request("a", None, |_bytes| async { Ok(()) }).await
        });
        tokio::task::yield_now().await;
        assert_eq!(correlator.pending_request_count(), 1);

        correlator.reject_all_pending(JsonRpcError::transport_closed());
        let result = handle.await.unwrap();
        assert_eq!(result.unwrap_err().code, -32001);
        assert_eq!(correlator.pending_request_count(), 0);
    }

    #[tokio::test]
    async fn unknown_response_id_does_not_panic_or_destabilize() {
        let correlator = MessageCorrelator::new(Duration::from_secs(5));
        let response = JsonRpcMessage::parse(
            json!({"jsonrpc":"2.0","id":999,"result":null})
                .to_string()
                .as_bytes(),
        )
        .unwrap();
        correlator.handle_message(response, |_, _| {}, |_, _, _| {});
        assert_eq!(correlator.pending_request_count(), 0);
    }

    #[tokio::test]
    async fn notification_without_id_is_routed_to_notification_sink() {
        let correlator = MessageCorrelator::new(Duration::from_secs(5));
        let msg = JsonRpcMessage::parse(
            json!({"jsonrpc":"2.0","method":"notifications/tools/list_changed"})
                .to_string()
                .as_bytes(),
        )
        .unwrap();
        let mut seen = None;
        correlator.handle_message(msg, |method, _| seen = Some(method), |_, _, _| {});
        assert_eq!(seen.as_deref(), Some("notifications/tools/list_changed"));
    }
}
