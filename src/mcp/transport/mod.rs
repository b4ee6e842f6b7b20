//! Message channels to MCP servers.
//!
//! Every mechanism (subprocess pipes, HTTP event stream, HTTP request/response,
//! package-resolved subprocesses) is normalized to the same contract: send one
//! encoded frame, receive a stream of [`TransportEvent`]s, close. Framing and
//! correlation live above this layer.

use crate::mcp::endpoint::{EndpointDescriptor, TransportKind};
use crate::mcp::error::McpError;
use async_trait::async_trait;
use std::sync::Mutex;
use tokio::sync::mpsc;

pub mod event_stream;
pub mod package;
pub mod sse;
pub mod stdio;
pub mod streamable_http;

pub use package::PackageTransport;
pub use sse::SseTransport;
pub use stdio::{StdioTransport, SubprocessSpec};
pub use streamable_http::StreamableHttpTransport;

/// Something the transport observed on the inbound side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One undecoded JSON-RPC payload (single envelope or batch).
    Frame(String),
    /// Inbound data that could not be turned into a payload at all.
    Malformed { raw: String, reason: String },
    /// Out-of-band text such as a subprocess stderr line.
    Diagnostic(String),
    /// The channel is gone; nothing more will arrive.
    Closed { reason: String },
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Whether the server can reach the client with its own requests.
    fn supports_server_requests(&self) -> bool {
        true
    }

    /// Called once the handshake settles on a protocol version.
    fn set_protocol_version(&self, _version: &str) {}

    async fn open(&self) -> Result<(), McpError>;

    /// Hands out the inbound event receiver. Only the first call succeeds.
    fn receive(&self) -> Result<mpsc::UnboundedReceiver<TransportEvent>, McpError>;

    /// Sends one encoded frame (no trailing newline).
    async fn send(&self, frame: String) -> Result<(), McpError>;

    async fn close(&self) -> Result<(), McpError>;
}

/// Sender half kept by the transport, receiver half handed out once.
pub(crate) struct EventChannel {
    tx: mpsc::UnboundedSender<TransportEvent>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
}

impl EventChannel {
    pub(crate) fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    pub(crate) fn sender(&self) -> mpsc::UnboundedSender<TransportEvent> {
        self.tx.clone()
    }

    pub(crate) fn take(&self) -> Result<mpsc::UnboundedReceiver<TransportEvent>, McpError> {
        self.rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or_else(|| McpError::Connection("transport events already taken".to_string()))
    }
}

/// Picks the transport implementation for a descriptor.
pub fn build_transport(descriptor: &EndpointDescriptor) -> Result<Box<dyn Transport>, McpError> {
    descriptor.validate()?;
    let transport: Box<dyn Transport> = match descriptor {
        EndpointDescriptor::Stdio {
            command,
            args,
            env,
            cwd,
        } => Box::new(StdioTransport::new(SubprocessSpec {
            program: command.clone(),
            args: args.clone(),
            env: env.clone(),
            cwd: cwd.clone(),
        })),
        EndpointDescriptor::Sse { .. } => Box::new(SseTransport::from_descriptor(descriptor)?),
        EndpointDescriptor::StreamableHttp { .. } => {
            Box::new(StreamableHttpTransport::from_descriptor(descriptor)?)
        }
        EndpointDescriptor::UvInstalled { .. } | EndpointDescriptor::UvLocal { .. } => {
            Box::new(PackageTransport::new(descriptor.clone()))
        }
    };
    Ok(transport)
}

#[cfg(test)]
pub(crate) mod test_support {
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;

    /// Reads one HTTP/1.1 request and returns its head and body.
    pub(crate) async fn read_http_request(stream: &mut TcpStream) -> (String, String) {
        let mut data = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = stream.read(&mut buf).await.expect("read request");
            if n == 0 {
                break;
            }
            data.extend_from_slice(&buf[..n]);
            let Some(split) = find_head_end(&data) else {
                continue;
            };
            let head = String::from_utf8_lossy(&data[..split]).to_string();
            let length = head
                .lines()
                .find_map(|line| {
                    let (name, value) = line.split_once(':')?;
                    name.trim()
                        .eq_ignore_ascii_case("content-length")
                        .then(|| value.trim().parse::<usize>().ok())
                        .flatten()
                })
                .unwrap_or(0);
            while data.len() < split + 4 + length {
                let n = stream.read(&mut buf).await.expect("read body");
                if n == 0 {
                    break;
                }
                data.extend_from_slice(&buf[..n]);
            }
            let body = String::from_utf8_lossy(&data[split + 4..]).to_string();
            return (head, body);
        }
        (String::from_utf8_lossy(&data).to_string(), String::new())
    }

    fn find_head_end(data: &[u8]) -> Option<usize> {
        data.windows(4).position(|window| window == b"\r\n\r\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn receiver_is_handed_out_once() {
        let channel = EventChannel::new();
        assert!(channel.take().is_ok());
        assert!(channel.take().is_err());
    }

    #[test]
    fn descriptor_selects_transport_kind() {
        let stdio = build_transport(&EndpointDescriptor::stdio("server", Vec::new())).unwrap();
        assert_eq!(stdio.kind(), TransportKind::Stdio);
        assert!(stdio.supports_server_requests());

        let http = build_transport(&EndpointDescriptor::StreamableHttp {
            url: "http://127.0.0.1:9/mcp".to_string(),
            headers: Default::default(),
            timeout_secs: None,
        })
        .unwrap();
        assert_eq!(http.kind(), TransportKind::StreamableHttp);
        assert!(!http.supports_server_requests());
    }

    #[test]
    fn invalid_descriptor_is_rejected_before_building() {
        let result = build_transport(&EndpointDescriptor::stdio("", Vec::new()));
        assert!(matches!(result, Err(McpError::Configuration(_))));
    }
}
