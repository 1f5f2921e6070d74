//! WebSocket transport: one persistent duplex connection per upstream (§4.7).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::warn;

use funnel_protocol::TransportError;

use crate::base::{BaseClientTransport, ClientTransportOps, SinkSlot, TransportSink};
use crate::config::ReconnectionPolicy;
use crate::correlator::MessageCorrelator;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Close codes that must not trigger an automatic reconnect: 1000 (normal
/// closure) and 1002 (protocol error, which a retry cannot fix).
fn is_terminal_close(code: u16) -> bool {
    code == 1000 || code == 1002
}

/// The WebSocket half of a transport: a single duplex stream, with an
/// optional periodic ping used to detect a silently-dead peer.
pub struct WebSocketOps {
    url: String,
    auth_header: Option<String>,
    ping_interval: Option<Duration>,
    closing: Arc<AtomicBool>,
    writer: Arc<Mutex<Option<futures::stream::SplitSink<WsStream, Message>>>>,
    last_pong: Arc<Mutex<Instant>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    ping_task: Mutex<Option<JoinHandle<()>>>,
    sink: Arc<SinkSlot>,
}

impl WebSocketOps {
    /// Builds an unstarted WebSocket transport against `url` (must be
    /// `ws://` or `wss://`), with an optional preformatted `Authorization`
    /// header and an optional keepalive ping interval.
    pub fn new(
        url: impl Into<String>,
        auth_header: Option<String>,
        ping_interval: Option<Duration>,
    ) -> Self {
        Self {
            url: url.into(),
            auth_header,
            ping_interval,
            closing: Arc::new(AtomicBool::new(false)),
            writer: Arc::new(Mutex::new(None)),
            last_pong: Arc::new(Mutex::new(Instant::now())),
            reader_task: Mutex::new(None),
            ping_task: Mutex::new(None),
            sink: Arc::new(SinkSlot::new()),
        }
    }

    fn spawn_reader(&self, mut read: futures::stream::SplitStream<WsStream>) {
        let sink = self.sink.clone();
        let closing = self.closing.clone();
        let last_pong = self.last_pong.clone();
        let handle = tokio::spawn(async move {
            while let Some(item) = read.next().await {
                match item {
                    Ok(Message::Text(text)) => sink.ingest(text.as_bytes()),
                    Ok(Message::Binary(data)) => sink.ingest(&data),
                    Ok(Message::Pong(_)) => {
                        *last_pong.lock().await = Instant::now();
                    }
                    Ok(Message::Close(frame)) => {
                        let code: u16 = frame
                            .as_ref()
                            .map(|f| u16::from(f.code))
                            .unwrap_or(1000);
                        if !closing.swap(true, Ordering::SeqCst) && !is_terminal_close(code) {
                            sink.report_error(TransportError::ConnectionReset(format!(
                                "peer closed with code {code}"
                            )));
                        }
                        return;
                    }
                    Ok(Message::Ping(_)) | Ok(Message::Frame(_)) => {}
                    Err(err) => {
                        warn!(error = %err, "WebSocket read error");
                        if !closing.swap(true, Ordering::SeqCst) {
                            sink.report_error(TransportError::ConnectionReset(err.to_string()));
                        }
                        return;
                    }
                }
            }
            if !closing.swap(true, Ordering::SeqCst) {
                sink.report_error(TransportError::ConnectionReset(
                    "WebSocket stream ended".to_string(),
                ));
            }
        });
        // Replaces (rather than leaks) a handle from a prior connection.
        if let Ok(mut guard) = self.reader_task.try_lock() {
            *guard = Some(handle);
        }
    }

    fn spawn_ping(&self, interval: Duration) {
        let writer = self.writer.clone();
        let closing = self.closing.clone();
        let last_pong = self.last_pong.clone();
        let sink = self.sink.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if closing.load(Ordering::SeqCst) {
                    return;
                }
                if last_pong.lock().await.elapsed() > interval * 2 {
                    if !closing.swap(true, Ordering::SeqCst) {
                        sink.report_error(TransportError::ConnectionTimeout(
                            "no pong received within two ping intervals".to_string(),
                        ));
                    }
                    return;
                }
                let mut guard = writer.lock().await;
                let Some(sink_half) = guard.as_mut() else {
                    return;
                };
                if sink_half.send(Message::Ping(Bytes::new())).await.is_err() && !closing.swap(true, Ordering::SeqCst)
                {
                    sink.report_error(TransportError::ConnectionReset(
                        "ping write failed".to_string(),
                    ));
                    return;
                }
            }
        });
        if let Ok(mut guard) = self.ping_task.try_lock() {
            *guard = Some(handle);
        }
    }
}

#[async_trait]
impl ClientTransportOps for WebSocketOps {
    async fn connect(&self) -> Result<(), TransportError> {
        let parsed = url::Url::parse(&self.url)
            .map_err(|err| TransportError::InvalidUrl(err.to_string()))?;
        if parsed.scheme() != "ws" && parsed.scheme() != "wss" {
            return Err(TransportError::InvalidUrl(format!(
                "unsupported WebSocket scheme '{}'",
                parsed.scheme()
            )));
        }

        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|err| TransportError::InvalidUrl(err.to_string()))?;
        if let Some(value) = &self.auth_header {
            let header_value = value
                .parse()
                .map_err(|_| TransportError::InvalidUrl("invalid auth header value".to_string()))?;
            request
                .headers_mut()
                .insert(http::header::AUTHORIZATION, header_value);
        }

        let (stream, _response) = connect_async(request).await.map_err(|err| {
            use tokio_tungstenite::tungstenite::Error as WsError;
            match err {
                WsError::Tls(_) => TransportError::SslHandshakeFailed(err.to_string()),
                WsError::Http(response) => {
                    TransportError::from_http_status(response.status().as_u16(), "WebSocket upgrade failed")
                }
                other => TransportError::ConnectionFailed(other.to_string()),
            }
        })?;

        let (write, read) = stream.split();
        self.closing.store(false, Ordering::SeqCst);
        *self.last_pong.lock().await = Instant::now();
        *self.writer.lock().await = Some(write);
        self.spawn_reader(read);
        if let Some(interval) = self.ping_interval {
            self.spawn_ping(interval);
        }

        Ok(())
    }

    async fn send_message(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        let text = String::from_utf8(bytes)
            .map_err(|err| TransportError::ProtocolError(err.to_string()))?;
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(TransportError::ConnectionFailed(
                "WebSocket transport not connected".to_string(),
            ));
        };
        writer
            .send(Message::text(text))
            .await
            .map_err(|err| TransportError::ConnectionReset(err.to_string()))
    }

    async fn close_connection(&self) {
        self.closing.store(true, Ordering::SeqCst);
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer
                .send(Message::Close(Some(
                    tokio_tungstenite::tungstenite::protocol::CloseFrame {
                        code: CloseCode::Normal,
                        reason: "closing".into(),
                    },
                )))
                .await;
        }
        if let Some(handle) = self.ping_task.lock().await.take() {
            handle.abort();
        }
        if let Some(handle) = self.reader_task.lock().await.take() {
            handle.abort();
        }
    }
}

/// Constructs a fully-wired WebSocket transport, binding its read loop back
/// into the shared lifecycle wrapper.
pub fn build(
    url: impl Into<String>,
    auth_header: Option<String>,
    ping_interval: Option<Duration>,
    correlator: MessageCorrelator,
    reconnect_policy: ReconnectionPolicy,
) -> Arc<BaseClientTransport<WebSocketOps>> {
    let ops = WebSocketOps::new(url, auth_header, ping_interval);
    let sink = ops.sink.clone();
    let base = Arc::new(BaseClientTransport::new(
        ops,
        correlator,
        Arc::new(crate::reconnect::ReconnectionManager::new(reconnect_policy)),
        None,
    ));
    sink.bind(base.clone() as Arc<dyn TransportSink>);
    base
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_close_codes_suppress_reconnect() {
        assert!(is_terminal_close(1000));
        assert!(is_terminal_close(1002));
        assert!(!is_terminal_close(1006));
    }

    #[tokio::test]
    async fn connect_rejects_non_ws_scheme() {
        let ops = WebSocketOps::new("http://example.invalid", None, None);
        let err = ops.connect().await.unwrap_err();
        assert!(matches!(err, TransportError::InvalidUrl(_)));
    }
}
