use super::event_stream::{
    content_type_of, is_event_stream_content_type, spawn_event_stream_reader, StreamEnd,
    EVENT_STREAM_CONTENT_TYPE, JSON_CONTENT_TYPE,
};
use super::{EventChannel, Transport, TransportEvent};
use crate::mcp::endpoint::{parse_http_url, EndpointDescriptor, TransportKind};
use crate::mcp::error::McpError;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

/// Event stream for inbound frames, POST endpoint for outbound ones.
pub struct SseTransport {
    url: Url,
    headers: BTreeMap<String, String>,
    timeout: Duration,
    client: reqwest::Client,
    events: EventChannel,
    post_url: Mutex<Option<Url>>,
    shutdown: CancellationToken,
}

impl SseTransport {
    pub fn from_descriptor(descriptor: &EndpointDescriptor) -> Result<Self, McpError> {
        let EndpointDescriptor::Sse { url, headers, .. } = descriptor else {
            return Err(McpError::Configuration(
                "SSE transport requires an sse endpoint".to_string(),
            ));
        };
        let timeout = descriptor
            .http_timeout()
            .unwrap_or(Duration::from_secs(crate::mcp::endpoint::DEFAULT_HTTP_TIMEOUT_SECS));
        Ok(Self {
            url: parse_http_url(url)?,
            headers: headers.clone(),
            timeout,
            client: super::streamable_http::build_http_client(timeout)?,
            events: EventChannel::new(),
            post_url: Mutex::new(None),
            shutdown: CancellationToken::new(),
        })
    }

    fn post_url(&self) -> Option<Url> {
        self.post_url
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

pub(crate) fn apply_headers(
    mut request: reqwest::RequestBuilder,
    headers: &BTreeMap<String, String>,
) -> reqwest::RequestBuilder {
    for (name, value) in headers {
        request = request.header(name.as_str(), value.as_str());
    }
    request
}

#[async_trait]
impl Transport for SseTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Sse
    }

    async fn open(&self) -> Result<(), McpError> {
        debug!(url = %self.url, "Opening MCP event stream");
        let request = apply_headers(
            self.client
                .get(self.url.clone())
                .header("Accept", EVENT_STREAM_CONTENT_TYPE),
            &self.headers,
        );
        let response = tokio::time::timeout(self.timeout, request.send())
            .await
            .map_err(|_| {
                McpError::Connection(format!(
                    "no response from {} within {}s",
                    self.url,
                    self.timeout.as_secs()
                ))
            })?
            .map_err(|err| McpError::Connection(format!("GET {} failed: {err}", self.url)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(McpError::Connection(format!(
                "GET {} returned HTTP {status}",
                self.url
            )));
        }
        let content_type = content_type_of(&response);
        if !is_event_stream_content_type(&content_type) {
            return Err(McpError::Connection(format!(
                "expected {EVENT_STREAM_CONTENT_TYPE} from {}, got {content_type:?}",
                self.url
            )));
        }

        let (endpoint_tx, endpoint_rx) = oneshot::channel();
        spawn_event_stream_reader(
            response,
            self.events.sender(),
            self.shutdown.clone(),
            Some(endpoint_tx),
            StreamEnd::CloseSession,
        );

        let endpoint = tokio::time::timeout(self.timeout, endpoint_rx)
            .await
            .map_err(|_| {
                McpError::Connection(format!(
                    "server did not announce a message endpoint within {}s",
                    self.timeout.as_secs()
                ))
            })?
            .map_err(|_| {
                McpError::Connection("event stream ended before the endpoint event".to_string())
            })?;
        let post_url = self.url.join(&endpoint).map_err(|err| {
            McpError::Connection(format!("invalid endpoint {endpoint:?}: {err}"))
        })?;
        info!(stream = %self.url, endpoint = %post_url, "MCP event stream connected");
        *self
            .post_url
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(post_url);
        Ok(())
    }

    fn receive(&self) -> Result<mpsc::UnboundedReceiver<TransportEvent>, McpError> {
        self.events.take()
    }

    async fn send(&self, frame: String) -> Result<(), McpError> {
        let Some(post_url) = self.post_url() else {
            return Err(McpError::ConnectionLost(
                "message endpoint not established".to_string(),
            ));
        };
        let request = apply_headers(
            self.client
                .post(post_url.clone())
                .header("Content-Type", JSON_CONTENT_TYPE),
            &self.headers,
        )
        .body(frame);
        let response = request
            .send()
            .await
            .map_err(|err| McpError::ConnectionLost(format!("POST {post_url} failed: {err}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(McpError::unexpected(
                "POST",
                format!("{post_url} returned HTTP {status}: {}", body.trim()),
            ));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), McpError> {
        self.shutdown.cancel();
        Ok(())
    }
}

impl Drop for SseTransport {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
