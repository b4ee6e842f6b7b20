use super::event_stream::{
    content_type_of, is_event_stream_content_type, spawn_event_stream_reader, StreamEnd,
    JSON_AND_EVENT_STREAM_ACCEPT, JSON_CONTENT_TYPE, PROTOCOL_VERSION_HEADER, SESSION_ID_HEADER,
};
use super::sse::apply_headers;
use super::{EventChannel, Transport, TransportEvent};
use crate::mcp::endpoint::{parse_http_url, EndpointDescriptor, TransportKind};
use crate::mcp::error::McpError;
use async_trait::async_trait;
use reqwest::StatusCode;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

const HTTP_POOL_IDLE_TIMEOUT_SECONDS: u64 = 90;
const HTTP_POOL_MAX_IDLE_PER_HOST: usize = 8;

/// Client shared by both HTTP transports. Only connection establishment is
/// bounded; bodies may stream for the whole session.
pub(crate) fn build_http_client(connect_timeout: Duration) -> Result<reqwest::Client, McpError> {
    reqwest::Client::builder()
        .connect_timeout(connect_timeout)
        .pool_idle_timeout(Duration::from_secs(HTTP_POOL_IDLE_TIMEOUT_SECONDS))
        .pool_max_idle_per_host(HTTP_POOL_MAX_IDLE_PER_HOST)
        .build()
        .map_err(|err| McpError::Configuration(format!("failed to build HTTP client: {err}")))
}

/// One POST per outbound frame; responses come back in the POST body.
pub struct StreamableHttpTransport {
    url: Url,
    headers: BTreeMap<String, String>,
    client: reqwest::Client,
    events: EventChannel,
    session_id: Mutex<Option<String>>,
    protocol_version: Mutex<Option<String>>,
    shutdown: CancellationToken,
}

impl StreamableHttpTransport {
    pub fn from_descriptor(descriptor: &EndpointDescriptor) -> Result<Self, McpError> {
        let EndpointDescriptor::StreamableHttp { url, headers, .. } = descriptor else {
            return Err(McpError::Configuration(
                "streamable HTTP transport requires an http endpoint".to_string(),
            ));
        };
        let timeout = descriptor
            .http_timeout()
            .unwrap_or(Duration::from_secs(crate::mcp::endpoint::DEFAULT_HTTP_TIMEOUT_SECS));
        Ok(Self {
            url: parse_http_url(url)?,
            headers: headers.clone(),
            client: build_http_client(timeout)?,
            events: EventChannel::new(),
            session_id: Mutex::new(None),
            protocol_version: Mutex::new(None),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_id
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn protocol_version(&self) -> Option<String> {
        self.protocol_version
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn apply_session_headers(
        &self,
        mut request: reqwest::RequestBuilder,
    ) -> reqwest::RequestBuilder {
        request = apply_headers(request, &self.headers);
        if let Some(version) = self.protocol_version() {
            request = request.header(PROTOCOL_VERSION_HEADER, version);
        }
        if let Some(session_id) = self.session_id() {
            request = request.header(SESSION_ID_HEADER, session_id);
        }
        request
    }
}

#[async_trait]
impl Transport for StreamableHttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::StreamableHttp
    }

    fn supports_server_requests(&self) -> bool {
        false
    }

    fn set_protocol_version(&self, version: &str) {
        *self
            .protocol_version
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(version.to_string());
    }

    async fn open(&self) -> Result<(), McpError> {
        // Nothing to establish up front: the first POST carries `initialize`.
        debug!(url = %self.url, "Using MCP streamable HTTP endpoint");
        Ok(())
    }

    fn receive(&self) -> Result<mpsc::UnboundedReceiver<TransportEvent>, McpError> {
        self.events.take()
    }

    async fn send(&self, frame: String) -> Result<(), McpError> {
        let request = self
            .apply_session_headers(
                self.client
                    .post(self.url.clone())
                    .header("Content-Type", JSON_CONTENT_TYPE)
                    .header("Accept", JSON_AND_EVENT_STREAM_ACCEPT),
            )
            .body(frame);
        let response = request
            .send()
            .await
            .map_err(|err| McpError::Connection(format!("POST {} failed: {err}", self.url)))?;

        if let Some(session_id) = response
            .headers()
            .get(SESSION_ID_HEADER)
            .and_then(|value| value.to_str().ok())
        {
            let mut slot = self
                .session_id
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if slot.as_deref() != Some(session_id) {
                debug!(session_id = %session_id, "MCP server assigned session id");
                *slot = Some(session_id.to_string());
            }
        }

        let status = response.status();
        if status == StatusCode::ACCEPTED || status == StatusCode::NO_CONTENT {
            return Ok(());
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(McpError::unexpected(
                "POST",
                format!("{} returned HTTP {status}: {}", self.url, body.trim()),
            ));
        }

        let content_type = content_type_of(&response);
        let tx = self.events.sender();
        if is_event_stream_content_type(&content_type) {
            spawn_event_stream_reader(
                response,
                tx,
                self.shutdown.clone(),
                None,
                StreamEnd::Quiet,
            );
            return Ok(());
        }

        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let body = tokio::select! {
                _ = shutdown.cancelled() => return,
                body = response.text() => body,
            };
            match body {
                Ok(body) if body.trim().is_empty() => {}
                Ok(body) => {
                    let _ = tx.send(TransportEvent::Frame(body.trim().to_string()));
                }
                Err(err) => {
                    warn!(error = %err, "Failed reading MCP HTTP response body");
                    let _ = tx.send(TransportEvent::Malformed {
                        raw: String::new(),
                        reason: format!("unreadable response body: {err}"),
                    });
                }
            }
        });
        Ok(())
    }

    async fn close(&self) -> Result<(), McpError> {
        self.shutdown.cancel();
        if self.session_id().is_none() {
            return Ok(());
        }
        let request = self.apply_session_headers(self.client.delete(self.url.clone()));
        match tokio::time::timeout(Duration::from_secs(5), request.send()).await {
            Ok(Ok(response)) => {
                debug!(status = %response.status(), "MCP session delete acknowledged");
            }
            Ok(Err(err)) => debug!(error = %err, "MCP session delete failed"),
            Err(_) => debug!("MCP session delete timed out"),
        }
        Ok(())
    }
}

impl Drop for StreamableHttpTransport {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::transport::test_support::read_http_request;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn transport_for(addr: std::net::SocketAddr) -> StreamableHttpTransport {
        StreamableHttpTransport::from_descriptor(&EndpointDescriptor::StreamableHttp {
            url: format!("http://{addr}/mcp"),
            headers: BTreeMap::new(),
            timeout_secs: Some(5),
        })
        .unwrap()
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<TransportEvent>) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event in time")
            .expect("channel open")
    }

    #[tokio::test]
    async fn session_headers_follow_first_response() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let (head, body) = read_http_request(&mut conn).await;
            assert!(head.starts_with("POST /mcp"));
            assert!(head
                .to_ascii_lowercase()
                .contains("accept: application/json, text/event-stream"));
            assert!(body.contains("\"initialize\""));
            let reply = r#"{"jsonrpc":"2.0","id":1,"result":{}}"#;
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\nmcp-session-id: sess-42\r\nconnection: close\r\ncontent-length: {}\r\n\r\n{reply}",
                reply.len()
            );
            conn.write_all(response.as_bytes()).await.unwrap();
            drop(conn);

            let (mut conn, _) = listener.accept().await.unwrap();
            let (head, _) = read_http_request(&mut conn).await;
            let lower = head.to_ascii_lowercase();
            assert!(lower.contains("mcp-session-id: sess-42"));
            assert!(lower.contains("mcp-protocol-version: 2025-06-18"));
            conn.write_all(b"HTTP/1.1 202 Accepted\r\ncontent-length: 0\r\n\r\n")
                .await
                .unwrap();
        });

        let transport = transport_for(addr);
        transport.open().await.unwrap();
        let mut events = transport.receive().unwrap();

        transport
            .send(r#"{"jsonrpc":"2.0","id":1,"method":"initialize"}"#.to_string())
            .await
            .unwrap();
        assert_eq!(
            next_event(&mut events).await,
            TransportEvent::Frame(r#"{"jsonrpc":"2.0","id":1,"result":{}}"#.to_string())
        );
        assert_eq!(transport.session_id().as_deref(), Some("sess-42"));

        transport.set_protocol_version("2025-06-18");
        transport
            .send(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#.to_string())
            .await
            .unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn event_stream_bodies_are_split_into_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let _ = read_http_request(&mut conn).await;
            let body = "event: message\ndata: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\"}\n\ndata: {\"jsonrpc\":\"2.0\",\"id\":3,\"result\":{}}\n\n";
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ncontent-length: {}\r\n\r\n{body}",
                body.len()
            );
            conn.write_all(response.as_bytes()).await.unwrap();
        });

        let transport = transport_for(addr);
        let mut events = transport.receive().unwrap();
        transport
            .send(r#"{"jsonrpc":"2.0","id":3,"method":"tools/list"}"#.to_string())
            .await
            .unwrap();

        assert_eq!(
            next_event(&mut events).await,
            TransportEvent::Frame(
                r#"{"jsonrpc":"2.0","method":"notifications/progress"}"#.to_string()
            )
        );
        assert_eq!(
            next_event(&mut events).await,
            TransportEvent::Frame(r#"{"jsonrpc":"2.0","id":3,"result":{}}"#.to_string())
        );
    }

    #[tokio::test]
    async fn error_status_is_reported_to_the_sender() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let _ = read_http_request(&mut conn).await;
            conn.write_all(b"HTTP/1.1 500 Internal Server Error\r\ncontent-length: 4\r\n\r\nboom")
                .await
                .unwrap();
        });

        let transport = transport_for(addr);
        let err = transport
            .send(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#.to_string())
            .await
            .expect_err("500 fails the send");
        assert!(err.to_string().contains("HTTP 500"));
    }
}
