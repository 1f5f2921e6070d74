//! Server-Sent Events transport: an inbound `GET` event stream paired with
//! outbound `POST`s on the same URL (§4.7).

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

use crate::base::{BaseClientTransport, ClientTransportOps, SinkSlot, TransportSink};
use crate::config::ReconnectionPolicy;
use crate::correlator::MessageCorrelator;

/// The SSE half of a transport: one long-lived `GET` stream for server-sent
/// frames, one short-lived `POST` per outbound message.
pub struct SseOps {
    url: String,
    timeout: Duration,
    auth_header: Option<String>,
    client: Client,
    closing: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
    sink: Arc<SinkSlot>,
}

impl SseOps {
    /// Builds an unstarted SSE transport against `url`, with requests bound
    /// to `timeout` and an optional preformatted `Authorization` value.
    pub fn new(url: impl Into<String>, timeout: Duration, auth_header: Option<String>) -> Self {
        Self {
            url: url.into(),
            timeout,
            auth_header,
            client: Client::new(),
            closing: Arc::new(AtomicBool::new(false)),
            reader: Mutex::new(None),
            sink: Arc::new(SinkSlot::new()),
        }
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth_header {
            Some(value) => builder.header(reqwest::header::AUTHORIZATION, value),
            None => builder,
        }
    }
}

#[async_trait]
impl ClientTransportOps for SseOps {
    async fn connect(&self) -> Result<(), TransportError> {
        let url = url::Url::parse(&self.url)
            .map_err(|err| TransportError::InvalidUrl(err.to_string()))?;

        let response = self
            .request(
                self.client
                    .get(url)
                    .header(reqwest::header::ACCEPT, "text/event-stream"),
            )
            .send()
            .await
            .map_err(|err| TransportError::ConnectionFailed(err.to_string()))?;

        if !response.status().is_success() {
            return Err(TransportError::from_http_status(
                response.status().as_u16(),
                "SSE stream open failed",
            ));
        }

        self.closing.store(false, Ordering::SeqCst);
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
                        warn!(error = %err, "SSE stream error");
                        if !closing.swap(true, Ordering::SeqCst) {
                            sink.report_error(TransportError::ConnectionReset(err.to_string()));
                        }
                        return;
                    }
                }
            }
            if !closing.swap(true, Ordering::SeqCst) {
                sink.report_error(TransportError::ConnectionReset(
                    "SSE stream ended".to_string(),
                ));
            }
        });
        *self.reader.lock().await = Some(handle);

        Ok(())
    }

    async fn send_message(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        let url = url::Url::parse(&self.url)
            .map_err(|err| TransportError::InvalidUrl(err.to_string()))?;

        let response = self
            .request(
                self.client
                    .post(url)
                    .header(reqwest::header::CONTENT_TYPE, "application/json")
                    .timeout(self.timeout)
                    .body(bytes),
            )
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    TransportError::RequestTimeout(err.to_string())
                } else {
                    TransportError::ConnectionFailed(err.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(TransportError::from_http_status(
                response.status().as_u16(),
                "SSE POST failed",
            ));
        }
        Ok(())
    }

    async fn close_connection(&self) {
        self.closing.store(true, Ordering::SeqCst);
        if let Some(handle) = self.reader.lock().await.take() {
            handle.abort();
        }
    }
}

/// Constructs a fully-wired SSE transport, binding its read loop back into
/// the shared lifecycle wrapper.
pub fn build(
    url: impl Into<String>,
    timeout: Duration,
    auth_header: Option<String>,
    correlator: MessageCorrelator,
    reconnect_policy: ReconnectionPolicy,
) -> Arc<BaseClientTransport<SseOps>> {
    let ops = SseOps::new(url, timeout, auth_header);
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
    async fn connect_rejects_non_success_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/events"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let correlator = MessageCorrelator::new(Duration::from_secs(5));
        let transport = build(
            format!("{}/events", server.uri()),
            Duration::from_secs(5),
            None,
            correlator,
            ReconnectionPolicy::disabled(),
        );
        let err = transport.start().await.unwrap_err();
        assert!(matches!(err, TransportError::ServiceUnavailable(_)));
    }

    #[tokio::test]
    async fn send_message_posts_body_and_surfaces_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/events"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let ops = SseOps::new(format!("{}/events", server.uri()), Duration::from_secs(5), None);
        let err = ops.send_message(b"{}".to_vec()).await.unwrap_err();
        assert!(matches!(err, TransportError::AuthenticationFailed(_)));
    }
}
