//! Request/response correlation.
//!
//! Outbound requests get a fresh numeric id and a pending slot; inbound
//! responses resolve the slot with the matching id. Resolution removes the
//! entry before delivering, so each id resolves at most once no matter how
//! timeouts, cancellation and late responses interleave.

use crate::mcp::codec::{Frame, RequestId, RpcError};
use crate::mcp::error::McpError;
use crate::mcp::protocol_log::{Direction, ProtocolLog};
use crate::mcp::transport::Transport;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

type CallOutcome = Result<Value, McpError>;

struct PendingCall {
    method: String,
    sent_at: Instant,
    slot: oneshot::Sender<CallOutcome>,
}

#[derive(Default)]
struct PendingTable {
    calls: HashMap<u64, PendingCall>,
    /// Set once the engine stops accepting calls; new calls fail with it.
    closed: Option<McpError>,
}

/// What the session should do with an inbound frame after correlation.
#[derive(Debug, PartialEq)]
pub(crate) enum Inbound {
    /// Resolved a pending call, or was logged and discarded.
    Handled,
    /// A server-initiated request that needs an answer.
    ServerRequest {
        id: RequestId,
        method: String,
        params: Option<Value>,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
}

pub struct Correlator {
    next_id: AtomicU64,
    pending: Mutex<PendingTable>,
    transport: Arc<dyn Transport>,
    log: ProtocolLog,
}

impl Correlator {
    pub(crate) fn new(transport: Arc<dyn Transport>, log: ProtocolLog) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(PendingTable::default()),
            transport,
            log,
        }
    }

    fn table(&self) -> MutexGuard<'_, PendingTable> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn pending_count(&self) -> usize {
        self.table().calls.len()
    }

    /// Registers, logs and sends a request. The returned handle resolves with
    /// the outcome; dropping it abandons the call.
    pub async fn start_request(
        self: &Arc<Self>,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<CallHandle, McpError> {
        let (slot, rx) = oneshot::channel();
        let id = {
            let mut table = self.table();
            if let Some(error) = &table.closed {
                return Err(error.clone());
            }
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            table.calls.insert(
                id,
                PendingCall {
                    method: method.to_string(),
                    sent_at: Instant::now(),
                    slot,
                },
            );
            id
        };

        // Armed before sending: dropping the caller's future mid-send still
        // clears the pending entry.
        let mut handle = CallHandle {
            id,
            method: method.to_string(),
            deadline: Instant::now() + timeout,
            timeout,
            rx: None,
            early: None,
            engine: Arc::clone(self),
            finished: false,
        };

        let frame = Frame::request(id, method, params);
        self.log.record_frame(Direction::Sent, &frame, None, None);
        debug!(request_id = id, method = %method, "Sending MCP request");

        // The deadline covers the send too, and a call cancelled or answered
        // while the transport is still busy resolves immediately.
        let mut rx = rx;
        let sending = tokio::time::timeout_at(handle.deadline, self.transport.send(frame.encode()));
        tokio::select! {
            biased;
            sent = sending => match sent {
                Ok(Ok(())) => handle.rx = Some(rx),
                Ok(Err(err)) => return Err(err),
                Err(_) => return Err(handle.timed_out()),
            },
            early = &mut rx => {
                handle.early = Some(early.unwrap_or_else(|_| Err(handle.abandoned())));
            }
        }
        Ok(handle)
    }

    pub(crate) async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        let frame = Frame::notification(method, params);
        self.log.record_frame(Direction::Sent, &frame, None, None);
        debug!(method = %method, "Sending MCP notification");
        self.transport.send(frame.encode()).await
    }

    /// Sends the answer to a server-initiated request.
    pub(crate) async fn reply(
        &self,
        id: RequestId,
        method: &str,
        outcome: Result<Value, RpcError>,
    ) -> Result<(), McpError> {
        let frame = match outcome {
            Ok(result) => Frame::Response { id, result },
            Err(error) => Frame::Error {
                id: Some(id),
                error,
            },
        };
        self.log
            .record_frame(Direction::Sent, &frame, Some(method), None);
        self.transport.send(frame.encode()).await
    }

    /// Logs an inbound frame and resolves the pending call it answers.
    pub(crate) fn route(&self, frame: Frame) -> Inbound {
        match frame {
            Frame::Response { ref id, .. } | Frame::Error { id: Some(ref id), .. } => {
                let pending = id.as_u64().and_then(|key| self.table().calls.remove(&key));
                let Some(pending) = pending else {
                    self.log.record_frame(Direction::Received, &frame, None, None);
                    warn!(request_id = %id, "Discarding response with no pending request");
                    return Inbound::Handled;
                };
                let elapsed = pending.sent_at.elapsed();
                self.log.record_frame(
                    Direction::Received,
                    &frame,
                    Some(&pending.method),
                    Some(elapsed),
                );
                debug!(
                    request_id = %id,
                    method = %pending.method,
                    elapsed_ms = elapsed.as_millis(),
                    "Received MCP response"
                );
                let outcome = match frame {
                    Frame::Response { result, .. } => Ok(result),
                    Frame::Error { error, .. } => Err(McpError::from(error)),
                    _ => return Inbound::Handled,
                };
                let _ = pending.slot.send(outcome);
                Inbound::Handled
            }
            Frame::Error { id: None, ref error } => {
                self.log.record_frame(Direction::Received, &frame, None, None);
                warn!(
                    code = error.code,
                    message = %error.message,
                    "MCP server reported an error without id"
                );
                Inbound::Handled
            }
            Frame::Request { .. } | Frame::Notification { .. } => {
                self.log.record_frame(Direction::Received, &frame, None, None);
                match frame {
                    Frame::Request { id, method, params } => {
                        debug!(request_id = %id, method = %method, "Received MCP server request");
                        Inbound::ServerRequest { id, method, params }
                    }
                    Frame::Notification { method, params } => {
                        debug!(method = %method, "Received MCP notification");
                        Inbound::Notification { method, params }
                    }
                    _ => Inbound::Handled,
                }
            }
        }
    }

    /// Resolves every pending call with `error` and refuses new calls.
    pub(crate) fn fail_all(&self, error: McpError) -> usize {
        let drained: Vec<PendingCall> = {
            let mut table = self.table();
            if table.closed.is_none() {
                table.closed = Some(error.clone());
            }
            table.calls.drain().map(|(_, call)| call).collect()
        };
        let count = drained.len();
        for call in drained {
            let _ = call.slot.send(Err(error.clone()));
        }
        count
    }

    fn abandon(&self, id: u64) -> bool {
        self.table().calls.remove(&id).is_some()
    }
}

/// One in-flight request.
pub struct CallHandle {
    id: u64,
    method: String,
    deadline: Instant,
    timeout: Duration,
    rx: Option<oneshot::Receiver<CallOutcome>>,
    /// Outcome delivered before the send finished.
    early: Option<CallOutcome>,
    engine: Arc<Correlator>,
    finished: bool,
}

impl CallHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    fn abandoned(&self) -> McpError {
        McpError::Cancelled(format!(
            "{} abandoned before a response arrived",
            self.method
        ))
    }

    fn timed_out(&mut self) -> McpError {
        self.finished = true;
        // A response racing the deadline may already have been delivered.
        if !self.engine.abandon(self.id) {
            debug!(request_id = self.id, "Timeout raced a response; dropping it");
        }
        debug!(
            request_id = self.id,
            method = %self.method,
            timeout_ms = self.timeout.as_millis(),
            "MCP request timed out"
        );
        McpError::Timeout {
            method: self.method.clone(),
            after: self.timeout,
        }
    }

    pub async fn wait(mut self) -> Result<Value, McpError> {
        if let Some(outcome) = self.early.take() {
            self.finished = true;
            return outcome;
        }
        let Some(rx) = self.rx.take() else {
            return Err(McpError::Cancelled(self.method.clone()));
        };
        match tokio::time::timeout_at(self.deadline, rx).await {
            Ok(Ok(result)) => {
                self.finished = true;
                result
            }
            Ok(Err(_)) => {
                self.finished = true;
                Err(self.abandoned())
            }
            Err(_) => Err(self.timed_out()),
        }
    }
}

impl Drop for CallHandle {
    fn drop(&mut self) {
        if !self.finished && self.engine.abandon(self.id) {
            debug!(request_id = self.id, method = %self.method, "MCP request abandoned by caller");
        }
    }
}
