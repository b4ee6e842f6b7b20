//! Session-scoped record of every frame crossing the transport.

use crate::mcp::codec::{Frame, FrameKind, RequestId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::io::Write as _;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tempfile::NamedTempFile;
use tracing::debug;
use unicode_width::UnicodeWidthStr;

const SUMMARY_PREVIEW_CHARS: usize = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Sent,
    Received,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Sent => "sent",
            Direction::Received => "received",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub direction: Direction,
    pub kind: FrameKind,
    pub method: Option<String>,
    pub id: Option<RequestId>,
    pub payload: Value,
    pub summary: String,
    pub elapsed_ms: Option<f64>,
    pub error: Option<String>,
}

impl LogEntry {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Debug, Default)]
struct LogBuffer {
    entries: Vec<LogEntry>,
    next_sequence: u64,
}

/// Cloneable handle to one session's log. All clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct ProtocolLog {
    buffer: Arc<Mutex<LogBuffer>>,
    mirror_sent: bool,
    mirror_received: bool,
}

impl ProtocolLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also emits each entry as a `tracing` debug event.
    pub fn with_mirroring(mut self, log_requests: bool, log_responses: bool) -> Self {
        self.mirror_sent = log_requests;
        self.mirror_received = log_responses;
        self
    }

    fn lock(&self) -> MutexGuard<'_, LogBuffer> {
        self.buffer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Records a decoded frame. `method` overrides the frame's own method and
    /// is how responses get attributed to the request they answer.
    pub fn record_frame(
        &self,
        direction: Direction,
        frame: &Frame,
        method: Option<&str>,
        elapsed: Option<Duration>,
    ) -> u64 {
        let error = match frame {
            Frame::Error { error, .. } => Some(format!("{}: {}", error.code, error.message)),
            _ => None,
        };
        let body = match frame {
            Frame::Request { params, .. } | Frame::Notification { params, .. } => {
                params.clone().unwrap_or(Value::Null)
            }
            Frame::Response { result, .. } => result.clone(),
            Frame::Error { error, .. } => serde_json::to_value(error).unwrap_or(Value::Null),
        };
        self.push(PendingEntry {
            direction,
            kind: frame.kind(),
            method: method.or(frame.method()).map(str::to_string),
            id: frame.id().cloned(),
            summary: preview(&body),
            payload: frame.to_value(),
            elapsed_ms: elapsed.map(|value| value.as_secs_f64() * 1000.0),
            error,
        })
    }

    /// Records a payload that could not be decoded.
    pub fn record_malformed(&self, direction: Direction, raw: &str, reason: &str) -> u64 {
        self.push(PendingEntry {
            direction,
            kind: FrameKind::Malformed,
            method: None,
            id: None,
            summary: truncate_chars(raw.trim(), SUMMARY_PREVIEW_CHARS),
            payload: Value::String(raw.to_string()),
            elapsed_ms: None,
            error: Some(reason.to_string()),
        })
    }

    fn push(&self, pending: PendingEntry) -> u64 {
        let entry = {
            let mut buffer = self.lock();
            buffer.next_sequence += 1;
            let entry = LogEntry {
                sequence: buffer.next_sequence,
                timestamp: Utc::now(),
                direction: pending.direction,
                kind: pending.kind,
                method: pending.method,
                id: pending.id,
                payload: pending.payload,
                summary: pending.summary,
                elapsed_ms: pending.elapsed_ms,
                error: pending.error,
            };
            buffer.entries.push(entry.clone());
            entry
        };

        let mirror = match entry.direction {
            Direction::Sent => self.mirror_sent,
            Direction::Received => self.mirror_received,
        };
        if mirror {
            debug!(
                target: "mcp_probe::protocol",
                sequence = entry.sequence,
                direction = entry.direction.as_str(),
                kind = entry.kind.as_str(),
                method = entry.method.as_deref().unwrap_or("-"),
                id = ?entry.id,
                elapsed_ms = ?entry.elapsed_ms,
                error = ?entry.error,
                "{}",
                entry.summary
            );
        }
        entry.sequence
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.lock().entries.clone()
    }

    /// Entries matching every given criterion, in arrival order. `limit` keeps
    /// the most recent matches.
    pub fn filter(
        &self,
        direction: Option<Direction>,
        method: Option<&str>,
        limit: Option<usize>,
    ) -> Vec<LogEntry> {
        let buffer = self.lock();
        let mut matched: Vec<LogEntry> = buffer
            .entries
            .iter()
            .filter(|entry| direction.is_none_or(|wanted| entry.direction == wanted))
            .filter(|entry| method.is_none_or(|wanted| entry.method.as_deref() == Some(wanted)))
            .cloned()
            .collect();
        if let Some(limit) = limit {
            let skip = matched.len().saturating_sub(limit);
            matched.drain(..skip);
        }
        matched
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops all entries. Sequence numbers keep increasing.
    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    pub fn export_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.entries())
    }

    /// Writes the JSON export next to `path` and renames it into place.
    pub fn export_to_path(&self, path: &Path) -> std::io::Result<()> {
        let contents = self.export_json().map_err(std::io::Error::other)?;
        let dir = path.parent().filter(|dir| !dir.as_os_str().is_empty());
        if let Some(dir) = dir {
            std::fs::create_dir_all(dir)?;
        }
        let mut temp_file = match dir {
            Some(dir) => NamedTempFile::new_in(dir)?,
            None => NamedTempFile::new_in(".")?,
        };
        temp_file.write_all(contents.as_bytes())?;
        temp_file.flush()?;
        temp_file.persist(path).map_err(|err| err.error)?;
        Ok(())
    }

    pub fn summary(&self) -> LogSummary {
        LogSummary::from_entries(&self.lock().entries)
    }
}

struct PendingEntry {
    direction: Direction,
    kind: FrameKind,
    method: Option<String>,
    id: Option<RequestId>,
    payload: Value,
    summary: String,
    elapsed_ms: Option<f64>,
    error: Option<String>,
}

fn preview(value: &Value) -> String {
    if value.is_null() {
        return String::new();
    }
    truncate_chars(&value.to_string(), SUMMARY_PREVIEW_CHARS)
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((index, _)) => format!("{}…", &text[..index]),
        None => text.to_string(),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MethodStats {
    pub method: String,
    pub requests: usize,
    pub responses: usize,
    pub errors: usize,
    pub average_ms: Option<f64>,
}

/// Totals plus per-method counts and latency.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LogSummary {
    pub total: usize,
    pub sent: usize,
    pub received: usize,
    pub errors: usize,
    pub malformed: usize,
    pub methods: Vec<MethodStats>,
}

impl LogSummary {
    fn from_entries(entries: &[LogEntry]) -> Self {
        let mut summary = LogSummary {
            total: entries.len(),
            ..LogSummary::default()
        };
        let mut by_method: BTreeMap<&str, (MethodStats, f64, usize)> = BTreeMap::new();

        for entry in entries {
            match entry.direction {
                Direction::Sent => summary.sent += 1,
                Direction::Received => summary.received += 1,
            }
            if entry.kind == FrameKind::Malformed {
                summary.malformed += 1;
            }
            if entry.is_error() {
                summary.errors += 1;
            }

            let Some(method) = entry.method.as_deref() else {
                continue;
            };
            let (stats, total_ms, timed) = by_method.entry(method).or_insert_with(|| {
                (
                    MethodStats {
                        method: method.to_string(),
                        ..MethodStats::default()
                    },
                    0.0,
                    0,
                )
            });
            match entry.kind {
                FrameKind::Request | FrameKind::Notification => stats.requests += 1,
                FrameKind::Response => stats.responses += 1,
                FrameKind::Error => {
                    stats.responses += 1;
                    stats.errors += 1;
                }
                FrameKind::Malformed => {}
            }
            if let Some(elapsed) = entry.elapsed_ms {
                *total_ms += elapsed;
                *timed += 1;
            }
        }

        summary.methods = by_method
            .into_values()
            .map(|(mut stats, total_ms, timed)| {
                if timed > 0 {
                    stats.average_ms = Some(total_ms / timed as f64);
                }
                stats
            })
            .collect();
        summary
    }

    /// Plain-text table suitable for a terminal.
    pub fn render(&self) -> String {
        let headers = ["Method", "Requests", "Responses", "Errors", "Avg (ms)"];
        let rows: Vec<[String; 5]> = self
            .methods
            .iter()
            .map(|stats| {
                [
                    stats.method.clone(),
                    stats.requests.to_string(),
                    stats.responses.to_string(),
                    stats.errors.to_string(),
                    stats
                        .average_ms
                        .map(|value| format!("{value:.2}"))
                        .unwrap_or_else(|| "-".to_string()),
                ]
            })
            .collect();

        let mut widths = headers.map(UnicodeWidthStr::width);
        for row in &rows {
            for (width, cell) in widths.iter_mut().zip(row) {
                *width = (*width).max(cell.width());
            }
        }

        let mut out = String::new();
        let _ = writeln!(
            out,
            "{} frames ({} sent, {} received), {} errors, {} malformed",
            self.total, self.sent, self.received, self.errors, self.malformed
        );
        push_row(&mut out, &headers.map(str::to_string), &widths);
        let rule: Vec<String> = widths.iter().map(|width| "-".repeat(*width)).collect();
        let _ = writeln!(out, "{}", rule.join("  "));
        for row in &rows {
            push_row(&mut out, row, &widths);
        }
        out
    }
}

fn push_row(out: &mut String, cells: &[String; 5], widths: &[usize; 5]) {
    let mut line = String::new();
    for (index, (cell, width)) in cells.iter().zip(widths).enumerate() {
        if index > 0 {
            line.push_str("  ");
        }
        let padding = width.saturating_sub(cell.width());
        // Numeric columns are right aligned.
        if index == 0 {
            line.push_str(cell);
            line.push_str(&" ".repeat(padding));
        } else {
            line.push_str(&" ".repeat(padding));
            line.push_str(cell);
        }
    }
    let _ = writeln!(out, "{}", line.trim_end());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::codec::RpcError;
    use serde_json::json;

    fn sample_log() -> ProtocolLog {
        let log = ProtocolLog::new();
        log.record_frame(
            Direction::Sent,
            &Frame::request(1u64, "tools/list", None),
            None,
            None,
        );
        log.record_frame(
            Direction::Received,
            &Frame::Response {
                id: RequestId::Number(1),
                result: json!({"tools": []}),
            },
            Some("tools/list"),
            Some(Duration::from_millis(4)),
        );
        log.record_frame(
            Direction::Sent,
            &Frame::request(2u64, "tools/call", Some(json!({"name": "missing"}))),
            None,
            None,
        );
        log.record_frame(
            Direction::Received,
            &Frame::Error {
                id: Some(RequestId::Number(2)),
                error: RpcError::new(-32602, "unknown tool"),
            },
            Some("tools/call"),
            Some(Duration::from_millis(6)),
        );
        log.record_malformed(Direction::Received, "garbage", "invalid JSON");
        log
    }

    #[test]
    fn responses_are_attributed_to_their_request_method() {
        let log = sample_log();
        let entries = log.filter(None, Some("tools/call"), None);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, entries[1].id);
        assert_eq!(entries[1].kind, FrameKind::Error);
        assert_eq!(entries[1].error.as_deref(), Some("-32602: unknown tool"));
        assert_eq!(entries[1].elapsed_ms, Some(6.0));
    }

    #[test]
    fn filter_limit_keeps_most_recent() {
        let log = sample_log();
        let received = log.filter(Some(Direction::Received), None, Some(2));
        assert_eq!(received.len(), 2);
        assert_eq!(received[1].kind, FrameKind::Malformed);
        assert!(received[0].sequence < received[1].sequence);
    }

    #[test]
    fn clear_keeps_sequence_monotonic() {
        let log = sample_log();
        assert_eq!(log.len(), 5);
        log.clear();
        assert!(log.is_empty());
        let sequence = log.record_frame(
            Direction::Sent,
            &Frame::notification("notifications/initialized", None),
            None,
            None,
        );
        assert_eq!(sequence, 6);
    }

    #[test]
    fn summary_counts_errors_and_latency() {
        let summary = sample_log().summary();
        assert_eq!(summary.total, 5);
        assert_eq!(summary.sent, 2);
        assert_eq!(summary.received, 3);
        assert_eq!(summary.errors, 2);
        assert_eq!(summary.malformed, 1);

        let call = summary
            .methods
            .iter()
            .find(|stats| stats.method == "tools/call")
            .expect("tools/call stats");
        assert_eq!(call.requests, 1);
        assert_eq!(call.errors, 1);
        assert_eq!(call.average_ms, Some(6.0));

        let table = summary.render();
        assert!(table.starts_with("5 frames (2 sent, 3 received), 2 errors, 1 malformed"));
        assert!(table.contains("tools/list"));
    }

    #[test]
    fn export_to_path_writes_parseable_json() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("logs").join("session.json");
        sample_log().export_to_path(&path).expect("export");

        let contents = std::fs::read_to_string(&path).expect("read export");
        let entries: Vec<LogEntry> = serde_json::from_str(&contents).expect("parse export");
        assert_eq!(entries.len(), 5);
        assert_eq!(entries[0].method.as_deref(), Some("tools/list"));
    }

    #[test]
    fn long_payloads_are_truncated_in_summary() {
        let log = ProtocolLog::new();
        let text = "é".repeat(300);
        log.record_frame(
            Direction::Sent,
            &Frame::request(1u64, "tools/call", Some(json!({ "text": text }))),
            None,
            None,
        );
        let entry = &log.entries()[0];
        assert!(entry.summary.ends_with('…'));
        assert_eq!(entry.summary.chars().count(), SUMMARY_PREVIEW_CHARS + 1);
    }
}
