//! Shared transport lifecycle: every wire implementation plugs into this
//! once instead of re-deriving start/send/close/error handling (§4.6).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::error;

use funnel_protocol::{JsonRpcError, JsonRpcMessage, RequestId, TransportError};

use crate::config::AuthHeaders;
use crate::correlator::{CorrelatedResult, MessageCorrelator};
use crate::reconnect::ReconnectionManager;

/// The wire-protocol-specific half of a transport: each of §4.7's four
/// implementations provides this.
#[async_trait]
pub trait ClientTransportOps: Send + Sync {
    /// Establishes the underlying connection (spawns the process, opens the
    /// socket, etc).
    async fn connect(&self) -> Result<(), TransportError>;

    /// Sends already-serialized bytes over the open connection. Used
    /// directly for responses/notifications, and via [`MessageCorrelator`]
    /// for requests.
    async fn send_message(&self, bytes: Vec<u8>) -> Result<(), TransportError>;

    /// Tears down the underlying connection.
    async fn close_connection(&self);
}

/// Supplies and refreshes authentication headers for a transport.
#[async_trait]
pub trait AuthHeaderProvider: Send + Sync {
    /// Current headers to attach to outgoing requests/upgrades.
    fn headers(&self) -> AuthHeaders;

    /// Refreshes credentials (e.g. exchanges a refresh token). Called once
    /// after a 401, per §4.6.
    async fn refresh(&self) -> Result<(), TransportError>;
}

/// A lifecycle event fired by [`BaseClientTransport`].
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Open,
    Close,
    Error(String),
    /// An upstream notification (method with no `id`).
    Notification(String, Option<Value>),
    /// A request initiated by the remote peer (bidirectional transports
    /// only; most upstream MCP servers never send these).
    RemoteRequest(RequestId, String, Option<Value>),
}

/// Shared lifecycle wrapper around one [`ClientTransportOps`] implementation:
/// start/send/close, auth header injection with 401-triggered refresh, and
/// reconnection wiring.
pub struct BaseClientTransport<T: ClientTransportOps> {
    inner: T,
    correlator: MessageCorrelator,
    reconnection: Arc<ReconnectionManager>,
    auth: Option<Arc<dyn AuthHeaderProvider>>,
    started: AtomicBool,
    closed: AtomicBool,
    events: broadcast::Sender<TransportEvent>,
}

impl<T: ClientTransportOps + 'static> BaseClientTransport<T> {
    /// Wraps `inner` with the shared lifecycle, governed by `reconnection`
    /// and timing out requests per `correlator`.
    pub fn new(
        inner: T,
        correlator: MessageCorrelator,
        reconnection: Arc<ReconnectionManager>,
        auth: Option<Arc<dyn AuthHeaderProvider>>,
    ) -> Self {
        let (events, _rx) = broadcast::channel(32);
        Self {
            inner,
            correlator,
            reconnection,
            auth,
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            events,
        }
    }

    /// Subscribes to lifecycle events (`Open`/`Close`/`Error`).
    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    /// Starts the transport. Fails if already started or already closed.
    ///
    /// # Errors
    ///
    /// Returns the underlying `connect()` error on failure, or
    /// [`TransportError::ConnectionFailed`] if called twice or after close.
    pub async fn start(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionFailed(
                "transport already closed".to_string(),
            ));
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(TransportError::ConnectionFailed(
                "transport already started".to_string(),
            ));
        }

        self.reconnection.on_connecting();
        match self.inner.connect().await {
            Ok(()) => {
                self.handle_connection_open();
                Ok(())
            }
            Err(err) => {
                self.handle_connection_error(err.clone()).await;
                Err(err)
            }
        }
    }

    fn handle_connection_open(&self) {
        self.reconnection.on_connected();
        let _ = self.events.send(TransportEvent::Open);
    }

    /// Sends a pre-built request and awaits its correlated response.
    ///
    /// # Errors
    ///
    /// Returns a JSON-RPC error object if the send fails, the request times
    /// out, or the connection closes while the request is in flight.
    pub async fn send_request(
        &self,
        method: impl Into<String>,
        params: Option<Value>,
    ) -> CorrelatedResult {
        self.correlator
            .send_request(method, params, |bytes| async move {
                self.inner
                    .send_message(bytes)
                    .await
                    .map_err(|err| JsonRpcError::internal(err.to_string()))
            })
            .await
    }

    /// Sends a response or notification directly (no correlation).
    ///
    /// # Errors
    ///
    /// Returns the underlying transport error if the write fails.
    pub async fn send_non_request(&self, message: &JsonRpcMessage) -> Result<(), TransportError> {
        let bytes = message
            .to_bytes()
            .map_err(|err| TransportError::ProtocolError(err.to_string()))?;
        self.inner.send_message(bytes).await
    }

    /// Closes the transport exactly once: cancels reconnection, rejects all
    /// pending requests, tears down the connection, and fires `Close`.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.correlator
            .reject_all_pending(JsonRpcError::transport_closed());
        self.reconnection.cancel();
        self.inner.close_connection().await;
        let _ = self.events.send(TransportEvent::Close);
    }

    /// Routes a connection-level error: wraps non-taxonomy errors, requests
    /// a reconnect if retryable, and always emits `Error`.
    pub async fn handle_connection_error(&self, err: TransportError) {
        let _ = self.events.send(TransportEvent::Error(err.to_string()));
        if err.retryable() {
            let reconnection = self.reconnection.clone();
            let result = reconnection.schedule_reconnect(|| self.inner.connect()).await;
            if let Err(give_up) = result {
                error!(error = %give_up, "reconnection exhausted");
            } else {
                self.handle_connection_open();
            }
        }
    }

    /// Parses a raw frame, requiring `"jsonrpc": "2.0"`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ProtocolError`] if the version is missing
    /// or wrong, or the frame isn't valid JSON-RPC at all.
    pub fn parse_message(raw: &[u8]) -> Result<JsonRpcMessage, TransportError> {
        JsonRpcMessage::parse(raw).map_err(|err| TransportError::ProtocolError(err.to_string()))
    }

    /// Hands an incoming frame to the correlator, routing responses,
    /// notifications, and remote-initiated requests appropriately.
    pub fn handle_incoming(
        &self,
        message: JsonRpcMessage,
        on_notification: impl FnMut(String, Option<Value>),
        on_request: impl FnMut(RequestId, String, Option<Value>),
    ) {
        self.correlator
            .handle_message(message, on_notification, on_request);
    }

    /// Parses and routes a raw incoming frame in one step, broadcasting
    /// notifications and remote requests as [`TransportEvent`]s. Wire
    /// implementations call this from their read loop via an
    /// [`IncomingSink`] handle bound through a [`SinkSlot`].
    pub fn ingest(&self, raw: &[u8]) {
        let message = match Self::parse_message(raw) {
            Ok(m) => m,
            Err(err) => {
                let _ = self.events.send(TransportEvent::Error(err.to_string()));
                return;
            }
        };
        let events = self.events.clone();
        let events2 = events.clone();
        self.handle_incoming(
            message,
            move |method, params| {
                let _ = events.send(TransportEvent::Notification(method, params));
            },
            move |id, method, params| {
                let _ = events2.send(TransportEvent::RemoteRequest(id, method, params));
            },
        );
    }

    /// Resolves the current auth headers, refreshing once on a 401 before
    /// giving up with a non-retryable `AuthenticationFailed`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::AuthenticationFailed`] if a second 401 is
    /// reported after one refresh attempt.
    pub async fn auth_headers_after_401(&self) -> Result<AuthHeaders, TransportError> {
        let Some(provider) = &self.auth else {
            return Ok(AuthHeaders::new());
        };
        provider.refresh().await?;
        Ok(provider.headers())
    }

    /// The current auth headers without forcing a refresh.
    pub fn auth_headers(&self) -> AuthHeaders {
        self.auth
            .as_ref()
            .map(|p| p.headers())
            .unwrap_or_default()
    }
}

/// A type-erased handle onto a `BaseClientTransport`'s `ingest` and
/// connection-error-reporting paths, letting a wire implementation's
/// background tasks call back in without knowing `T`.
pub trait TransportSink: Send + Sync {
    /// Parses and routes one raw frame.
    fn ingest(&self, raw: &[u8]);

    /// Reports a connection-level failure observed by the read loop (e.g.
    /// the child process exited, the socket closed unexpectedly).
    fn report_error(self: Arc<Self>, err: TransportError);
}

impl<T: ClientTransportOps + 'static> TransportSink for BaseClientTransport<T> {
    fn ingest(&self, raw: &[u8]) {
        BaseClientTransport::ingest(self, raw)
    }

    fn report_error(self: Arc<Self>, err: TransportError) {
        tokio::spawn(async move {
            self.handle_connection_error(err).await;
        });
    }
}

/// Late-bound slot for a [`TransportSink`], used to break the construction
/// cycle between a `BaseClientTransport<T>` (which owns `T`) and `T`'s
/// background read loop (which needs to call back into the transport).
///
/// Each wire implementation embeds a `SinkSlot` and calls [`Self::bind`]
/// once, immediately after wrapping itself in an `Arc<BaseClientTransport<_>>`,
/// before the read loop can observe any frames.
#[derive(Default)]
pub struct SinkSlot(std::sync::OnceLock<Arc<dyn TransportSink>>);

impl SinkSlot {
    /// An unbound slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds the sink. Subsequent calls are ignored (the slot is write-once).
    pub fn bind(&self, sink: Arc<dyn TransportSink>) {
        let _ = self.0.set(sink);
    }

    /// Forwards `raw` to the bound sink, or logs a warning if nothing is
    /// bound yet (a frame arriving before `bind` completes, which should
    /// not happen in normal operation).
    pub fn ingest(&self, raw: &[u8]) {
        match self.0.get() {
            Some(sink) => sink.ingest(raw),
            None => tracing::warn!("frame arrived before transport sink was bound"),
        }
    }

    /// Forwards a connection-level error to the bound sink, if any.
    pub fn report_error(&self, err: TransportError) {
        if let Some(sink) = self.0.get() {
            sink.clone().report_error(err);
        }
    }
}
