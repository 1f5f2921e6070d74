//! Streamable HTTP transport: one `POST` per outbound message, correlated by
//! `Mcp-Session-Id`, with an optional dedicated event stream for
//! server-initiated frames (§4.7, and the `dedicated_event_stream` Open
//! Question resolution).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::Client;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::warn;

use funnel_protocol::TransportError;

use crate::base::{AuthHeaderProvider, BaseClientTransport, ClientTransportOps, SinkSlot, TransportSink};
use crate::config::ReconnectionPolicy;
use crate::correlator::MessageCorrelator;

const SESSION_HEADER: &str = "Mcp-Session-Id";

/// The Streamable HTTP half of a transport.
pub struct StreamableHttpOps {
    url: String,
    timeout: Duration,
    session_id: Mutex<Option<String>>,
    dedicated_event_stream: bool,
    auth: Option<Arc<dyn AuthHeaderProvider>>,
    client: Client,
    closing: Arc<AtomicBool>,
    event_task: Mutex<Option<JoinHandle<()>>>,
    sink: Arc<SinkSlot>,
}

impl StreamableHttpOps {
    /// Builds an unstarted Streamable HTTP transport against `url`.
    pub fn new(
        url: impl Into<String>,
        timeout: Duration,
        session_id: Option<String>,
        dedicated_event_stream: bool,
        auth: Option<Arc<dyn AuthHeaderProvider>>,
    ) -> Self {
        Self {
            url: url.into(),
            timeout,
            session_id: Mutex::new(session_id),
            dedicated_event_stream,
            auth,
            client: Client::new(),
            closing: Arc::new(AtomicBool::new(false)),
            event_task: Mutex::new(None),
            sink: Arc::new(SinkSlot::new()),
        }
    }

    async fn apply_auth(&self, mut builder: reqwest::RequestBuilder, force_refresh: bool) -> reqwest::RequestBuilder {
        let Some(provider) = &self.auth else {
            return builder;
        };
        if force_refresh {
            let _ = provider.refresh().await;
        }
        for (key, value) in provider.headers().iter() {
            builder = builder.header(key.as_str(), value.as_str());
        }
        builder
    }

    async fn apply_session(&self, mut builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(id) = self.session_id.lock().await.clone() {
            builder = builder.header(SESSION_HEADER, id);
        }
        builder
    }

    async fn capture_session(&self, response: &reqwest::Response) {
        if let Some(value) = response.headers().get(SESSION_HEADER) {
            if let Ok(value) = value.to_str() {
                *self.session_id.lock().await = Some(value.to_string());
            }
        }
    }
}

#[async_trait]
impl ClientTransportOps for StreamableHttpOps {
    async fn connect(&self) -> Result<(), TransportError> {
        let url = url::Url::parse(&self.url)
            .map_err(|err| TransportError::InvalidUrl(err.to_string()))?;

        self.closing.store(false, Ordering::SeqCst);

        if !self.dedicated_event_stream {
            return Ok(());
        }

        let mut builder = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, "text/event-stream");
        builder = self.apply_session(builder).await;
        builder = self.apply_auth(builder, false).await;

        let response = builder
            .send()
            .await
            .map_err(|err| TransportError::ConnectionFailed(err.to_string()))?;
        if !response.status().is_success() {
            return Err(TransportError::from_http_status(
                response.status().as_u16(),
                "dedicated event stream open failed",
            ));
        }
        self.capture_session(&response).await;

        let sink = self.sink.clone();
        let closing = self.closing.clone();
        let handle = tokio::spawn(async move {
            let mut stream = response.bytes_stream().eventsource();
            while let Some(event) = stream.next().await {
                match event {
                    Ok(event) => {
                        if !event.data.is_empty() {
                            sink.ingest(event.data.as_bytes());
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, "dedicated event stream error");
                        if !closing.swap(true, Ordering::SeqCst) {
                            sink.report_error(TransportError::ConnectionReset(err.to_string()));
                        }
                        return;
                    }
                }
            }
            if !closing.swap(true, Ordering::SeqCst) {
                sink.report_error(TransportError::ConnectionReset(
                    "dedicated event stream ended".to_string(),
                ));
            }
        });
        *self.event_task.lock().await = Some(handle);

        Ok(())
    }

    async fn send_message(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        let url = url::Url::parse(&self.url)
            .map_err(|err| TransportError::InvalidUrl(err.to_string()))?;

        let send_once = |force_refresh: bool, body: Vec<u8>| {
            let url = url.clone();
            async move {
                let mut builder = self
                    .client
                    .post(url)
                    .timeout(self.timeout)
                    .header(reqwest::header::CONTENT_TYPE, "application/json")
                    .header(reqwest::header::ACCEPT, "application/json, text/event-stream");
                builder = self.apply_session(builder).await;
                builder = self.apply_auth(builder, force_refresh).await;
                builder.body(body).send().await
            }
        };

        let response = send_once(false, bytes.clone())
            .await
            .map_err(|err| TransportError::ConnectionFailed(err.to_string()))?;

        let response = if response.status().as_u16() == 401 && self.auth.is_some() {
            send_once(true, bytes)
                .await
                .map_err(|err| TransportError::ConnectionFailed(err.to_string()))?
        } else {
            response
        };

        if !response.status().is_success() {
            return Err(TransportError::from_http_status(
                response.status().as_u16(),
                "Streamable HTTP POST failed",
            ));
        }
        self.capture_session(&response).await;

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if content_type.starts_with("text/event-stream") {
            let sink = self.sink.clone();
            let mut stream = response.bytes_stream().eventsource();
            while let Some(event) = stream.next().await {
                if let Ok(event) = event {
                    if !event.data.is_empty() {
                        sink.ingest(event.data.as_bytes());
                    }
                }
            }
        } else {
            let body = response
                .bytes()
                .await
                .map_err(|err| TransportError::InvalidResponse(err.to_string()))?;
            if !body.is_empty() {
                self.sink.ingest(&body);
            }
        }

        Ok(())
    }

    async fn close_connection(&self) {
        self.closing.store(true, Ordering::SeqCst);
        if let Some(handle) = self.event_task.lock().await.take() {
            handle.abort();
        }
    }
}

/// Constructs a fully-wired Streamable HTTP transport, binding its event
/// stream (if any) back into the shared lifecycle wrapper.
pub fn build(
    url: impl Into<String>,
    timeout: Duration,
    session_id: Option<String>,
    dedicated_event_stream: bool,
    auth: Option<Arc<dyn AuthHeaderProvider>>,
    correlator: MessageCorrelator,
    reconnect_policy: ReconnectionPolicy,
) -> Arc<BaseClientTransport<StreamableHttpOps>> {
    let ops = StreamableHttpOps::new(url, timeout, session_id, dedicated_event_stream, auth);
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
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn send_message_captures_session_id_header() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header(SESSION_HEADER, "sess-123")
                    .set_body_raw("{}", "application/json"),
            )
            .mount(&server)
            .await;

        let ops = StreamableHttpOps::new(
            format!("{}/mcp", server.uri()),
            Duration::from_secs(5),
            None,
            false,
            None,
        );
        ops.send_message(b"{}".to_vec()).await.unwrap();
        assert_eq!(ops.session_id.lock().await.as_deref(), Some("sess-123"));
    }

    #[tokio::test]
    async fn send_message_without_dedicated_stream_does_not_connect() {
        let ops = StreamableHttpOps::new("http://example.invalid/mcp", Duration::from_secs(5), None, false, None);
        assert!(ops.connect().await.is_ok());
    }
}
