//! `text/event-stream` parsing shared by both HTTP transports.

use super::stdio::MAX_LINE_BYTES;
use super::TransportEvent;
use futures_util::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const JSON_CONTENT_TYPE: &str = "application/json";
pub const EVENT_STREAM_CONTENT_TYPE: &str = "text/event-stream";
pub const JSON_AND_EVENT_STREAM_ACCEPT: &str = "application/json, text/event-stream";
pub const PROTOCOL_VERSION_HEADER: &str = "MCP-Protocol-Version";
pub const SESSION_ID_HEADER: &str = "mcp-session-id";

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

impl SseEvent {
    /// Name of the event, `message` when the stream did not name it.
    pub fn name(&self) -> &str {
        self.event.as_deref().unwrap_or("message")
    }
}

/// Incremental parser: feed raw chunks, get complete events back.
///
/// A line, or the joined data of one event, longer than the limit is dropped
/// together with the rest of its event; the sizes are kept for
/// [`EventStreamParser::take_oversized`].
#[derive(Debug)]
pub struct EventStreamParser {
    limit: usize,
    buffer: Vec<u8>,
    skipped: usize,
    skip_event: bool,
    oversized: Vec<usize>,
    event: Option<String>,
    data: Vec<String>,
    data_len: usize,
    id: Option<String>,
}

impl Default for EventStreamParser {
    fn default() -> Self {
        Self::with_limit(MAX_LINE_BYTES)
    }
}

impl EventStreamParser {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit,
            buffer: Vec::new(),
            skipped: 0,
            skip_event: false,
            oversized: Vec::new(),
            event: None,
            data: Vec::new(),
            data_len: 0,
            id: None,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        let mut events = Vec::new();
        let mut rest = chunk;
        while let Some(newline) = memchr::memchr(b'\n', rest) {
            self.append(&rest[..newline]);
            rest = &rest[newline + 1..];
            self.end_line(&mut events);
        }
        self.append(rest);
        events
    }

    /// Flushes a trailing unterminated line and any event still being built.
    pub fn finish(&mut self) -> Vec<SseEvent> {
        let mut events = Vec::new();
        if !self.buffer.is_empty() || self.skipped > 0 {
            self.end_line(&mut events);
        }
        if !self.skip_event {
            self.dispatch(&mut events);
        }
        self.skip_event = false;
        events
    }

    /// Sizes of everything dropped for exceeding the limit since the last call.
    pub fn take_oversized(&mut self) -> Vec<usize> {
        std::mem::take(&mut self.oversized)
    }

    fn append(&mut self, bytes: &[u8]) {
        if self.skipped > 0 || self.buffer.len() + bytes.len() > self.limit {
            self.skipped += self.buffer.len() + bytes.len();
            self.buffer.clear();
        } else {
            self.buffer.extend_from_slice(bytes);
        }
    }

    fn end_line(&mut self, events: &mut Vec<SseEvent>) {
        if self.skipped > 0 {
            let skipped = std::mem::take(&mut self.skipped);
            self.drop_event(skipped);
            return;
        }
        let mut raw = std::mem::take(&mut self.buffer);
        if raw.last() == Some(&b'\r') {
            raw.pop();
        }
        let line = String::from_utf8_lossy(&raw).into_owned();
        self.process_line(&line, events);
    }

    fn drop_event(&mut self, bytes: usize) {
        warn!(bytes, limit = self.limit, "Discarding oversized server-sent event");
        self.oversized.push(bytes);
        self.event = None;
        self.data.clear();
        self.data_len = 0;
        self.skip_event = true;
    }

    fn process_line(&mut self, line: &str, events: &mut Vec<SseEvent>) {
        if line.is_empty() {
            if std::mem::take(&mut self.skip_event) {
                return;
            }
            self.dispatch(events);
            return;
        }
        if self.skip_event || line.starts_with(':') {
            return;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => {
                self.data_len += value.len() + 1;
                if self.data_len > self.limit {
                    let total = self.data_len;
                    self.drop_event(total);
                } else {
                    self.data.push(value.to_string());
                }
            }
            "id" => self.id = Some(value.to_string()),
            _ => {}
        }
    }

    fn dispatch(&mut self, events: &mut Vec<SseEvent>) {
        self.data_len = 0;
        if self.data.is_empty() {
            self.event = None;
            return;
        }
        events.push(SseEvent {
            event: self.event.take(),
            data: std::mem::take(&mut self.data).join("\n"),
            id: self.id.take(),
        });
    }
}

pub fn is_event_stream_content_type(content_type: &str) -> bool {
    media_type(content_type).eq_ignore_ascii_case(EVENT_STREAM_CONTENT_TYPE)
}

fn media_type(content_type: &str) -> &str {
    content_type.split(';').next().map(str::trim).unwrap_or("")
}

pub fn content_type_of(response: &reqwest::Response) -> String {
    response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .to_string()
}

/// What the reader does when the body ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamEnd {
    /// The stream is the session's only inbound channel; report `Closed`.
    CloseSession,
    /// A per-request body; ending is normal.
    Quiet,
}

/// Forwards `message` events as frames until the body ends or `shutdown`
/// fires. The first `endpoint` event is handed to `endpoint_tx` when given.
pub(crate) fn spawn_event_stream_reader(
    response: reqwest::Response,
    tx: mpsc::UnboundedSender<TransportEvent>,
    shutdown: CancellationToken,
    mut endpoint_tx: Option<oneshot::Sender<String>>,
    on_end: StreamEnd,
) {
    tokio::spawn(async move {
        let mut stream = response.bytes_stream();
        let mut parser = EventStreamParser::default();

        let mut handle = |events: Vec<SseEvent>| {
            for event in events {
                match event.name() {
                    "endpoint" => match endpoint_tx.take() {
                        Some(sender) => {
                            let _ = sender.send(event.data.trim().to_string());
                        }
                        None => debug!(data = %event.data, "Ignoring repeated endpoint event"),
                    },
                    "message" => {
                        let payload = event.data.trim();
                        if !payload.is_empty() {
                            let _ = tx.send(TransportEvent::Frame(payload.to_string()));
                        }
                    }
                    other => debug!(event = %other, "Ignoring unknown server-sent event"),
                }
            }
        };

        let reason = loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                chunk = stream.next() => match chunk {
                    Some(Ok(chunk)) => {
                        let events = parser.push(&chunk);
                        report_oversized(&mut parser, &tx);
                        handle(events);
                    }
                    Some(Err(err)) => {
                        warn!(error = %err, "MCP event stream failed");
                        break format!("event stream failed: {err}");
                    }
                    None => break "event stream ended".to_string(),
                }
            }
        };
        let events = parser.finish();
        report_oversized(&mut parser, &tx);
        handle(events);

        if on_end == StreamEnd::CloseSession {
            let _ = tx.send(TransportEvent::Closed { reason });
        }
    });
}

fn report_oversized(parser: &mut EventStreamParser, tx: &mpsc::UnboundedSender<TransportEvent>) {
    for bytes in parser.take_oversized() {
        let _ = tx.send(TransportEvent::Malformed {
            raw: String::new(),
            reason: format!("server-sent event of {bytes} bytes exceeds the size limit"),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parser_handles_partial_chunks_and_named_events() {
        let mut parser = EventStreamParser::default();
        assert!(parser.push(b"event: endpoint\r\ndata: /messages?s").is_empty());
        let events = parser.push(b"ession=1\r\n\r\ndata: {\"a\":1}\n\n");

        assert_eq!(
            events,
            vec![
                SseEvent {
                    event: Some("endpoint".to_string()),
                    data: "/messages?session=1".to_string(),
                    id: None,
                },
                SseEvent {
                    event: None,
                    data: "{\"a\":1}".to_string(),
                    id: None,
                },
            ]
        );
        assert_eq!(events[1].name(), "message");
    }

    #[test]
    fn multi_line_data_is_joined_and_comments_skipped() {
        let mut parser = EventStreamParser::default();
        let events = parser.push(b": keep-alive\nid: 7\ndata: [1,\ndata: 2]\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "[1,\n2]");
        assert_eq!(events[0].id.as_deref(), Some("7"));
    }

    #[test]
    fn finish_flushes_unterminated_event() {
        let mut parser = EventStreamParser::default();
        assert!(parser.push(b"data: {\"late\":true}").is_empty());
        let events = parser.finish();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "{\"late\":true}");
        assert!(parser.finish().is_empty());
    }

    #[test]
    fn oversized_lines_drop_their_event_only() {
        let mut parser = EventStreamParser::with_limit(16);
        assert!(parser.push(b"data: 0123456789").is_empty());
        assert!(parser.push(b"ABCDEF\nid: 3\n").is_empty());
        let events = parser.push(b"\ndata: {\"ok\":1}\n\n");

        assert_eq!(parser.take_oversized(), vec![22]);
        assert!(parser.take_oversized().is_empty());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "{\"ok\":1}");
    }

    #[test]
    fn data_spread_over_many_lines_is_capped() {
        let mut parser = EventStreamParser::with_limit(16);
        let events = parser.push(b"data: 12345678\ndata: 12345678\n\ndata: 1\n\n");
        assert_eq!(parser.take_oversized(), vec![18]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "1");
    }

    #[test]
    fn detects_content_types() {
        assert!(is_event_stream_content_type("text/event-stream; charset=utf-8"));
        assert!(is_event_stream_content_type("Text/Event-Stream"));
        assert!(!is_event_stream_content_type("application/json"));
    }
}
