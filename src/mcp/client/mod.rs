//! Session runtime for one MCP server.
//!
//! [`McpSession`] owns a transport, runs the `initialize` handshake, gates
//! every operation on the lifecycle state and the negotiated capabilities,
//! and answers server-initiated requests through the registered callbacks.
//! The handle is cheap to clone; clones share the same session.

use crate::mcp::capabilities::{Capability, CapabilitySet};
use crate::mcp::codec;
use crate::mcp::endpoint::{EndpointDescriptor, TransportKind};
use crate::mcp::error::McpError;
use crate::mcp::protocol_log::{Direction, ProtocolLog};
use crate::mcp::transport::{self, Transport, TransportEvent};
use rust_mcp_schema::{
    CallToolResult, GetPromptResult, ListPromptsResult, ListResourceTemplatesResult,
    ListResourcesResult, ListToolsResult, ReadResourceResult,
};
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub mod callbacks;
pub mod correlation;
pub mod protocol;
pub mod state;


pub use callbacks::{
    CallbackError, CallbackKind, CallbackRegistry, ElicitationAction, ElicitationHandler,
    ElicitationRequest, ElicitationResponse, Root, RootsHandler, SamplingHandler, StaticRoots,
    StaticSampling,
};
pub use correlation::{CallHandle, Correlator};
pub use protocol::{ServerDetails, LATEST_PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS};
pub use state::SessionState;

use correlation::Inbound;
use protocol::{PageMerger, METHOD_INITIALIZE, METHOD_INITIALIZED};
use state::StateCell;

pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MAX_LIST_PAGES: usize = 20;
pub const DEFAULT_DIAGNOSTICS_CAPACITY: usize = 200;
const STDERR_TAIL_LINES: usize = 5;

/// Tunables for a session. `Default` gives the values used by the CLI when
/// nothing is configured.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub client_name: String,
    pub client_version: String,
    /// Version offered in `initialize`.
    pub protocol_version: String,
    pub request_timeout: Duration,
    pub handshake_timeout: Duration,
    pub max_list_pages: usize,
    pub diagnostics_capacity: usize,
    pub log_requests: bool,
    pub log_responses: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            client_name: env!("CARGO_PKG_NAME").to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            handshake_timeout: Duration::from_secs(DEFAULT_HANDSHAKE_TIMEOUT_SECS),
            max_list_pages: DEFAULT_MAX_LIST_PAGES,
            diagnostics_capacity: DEFAULT_DIAGNOSTICS_CAPACITY,
            log_requests: false,
            log_responses: false,
        }
    }
}

struct SessionInner {
    target: String,
    options: SessionOptions,
    transport: Arc<dyn Transport>,
    engine: Arc<Correlator>,
    log: ProtocolLog,
    callbacks: CallbackRegistry,
    state: Mutex<StateCell>,
    details: RwLock<Option<ServerDetails>>,
    diagnostics: Mutex<VecDeque<String>>,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct McpSession {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for McpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpSession")
            .field("target", &self.inner.target)
            .field("transport", &self.inner.transport.kind())
            .field("state", &self.state())
            .finish()
    }
}

impl McpSession {
    /// Builds a session for `descriptor` without connecting.
    pub fn new(descriptor: &EndpointDescriptor, options: SessionOptions) -> Result<Self, McpError> {
        let transport: Arc<dyn Transport> = Arc::from(transport::build_transport(descriptor)?);
        Ok(Self::with_transport(
            descriptor.display_target(),
            transport,
            options,
        ))
    }

    pub fn with_transport(
        target: impl Into<String>,
        transport: Arc<dyn Transport>,
        options: SessionOptions,
    ) -> Self {
        let log = ProtocolLog::new().with_mirroring(options.log_requests, options.log_responses);
        let engine = Arc::new(Correlator::new(Arc::clone(&transport), log.clone()));
        Self {
            inner: Arc::new(SessionInner {
                target: target.into(),
                options,
                transport,
                engine,
                log,
                callbacks: CallbackRegistry::default(),
                state: Mutex::new(StateCell::default()),
                details: RwLock::new(None),
                diagnostics: Mutex::new(VecDeque::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        self.inner.state().state()
    }

    /// The error that moved the session into `Failed`, if any.
    pub fn failure(&self) -> Option<McpError> {
        self.inner.state().failure().cloned()
    }

    pub fn target(&self) -> &str {
        &self.inner.target
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.inner.transport.kind()
    }

    pub fn protocol_log(&self) -> &ProtocolLog {
        &self.inner.log
    }

    /// Recent out-of-band lines (subprocess stderr), oldest first.
    pub fn diagnostics(&self) -> Vec<String> {
        self.inner.diagnostics().iter().cloned().collect()
    }

    pub fn pending_requests(&self) -> usize {
        self.inner.engine.pending_count()
    }

    /// Handshake outcome; `None` until the session has been ready once.
    pub fn server_details(&self) -> Option<ServerDetails> {
        self.inner.details().clone()
    }

    pub fn set_sampling_handler(&self, handler: Arc<dyn SamplingHandler>) {
        self.inner.callbacks.set_sampling(handler);
    }

    pub fn set_roots_handler(&self, handler: Arc<dyn RootsHandler>) {
        self.inner.callbacks.set_roots(handler);
    }

    pub fn set_elicitation_handler(&self, handler: Arc<dyn ElicitationHandler>) {
        self.inner.callbacks.set_elicitation(handler);
    }

    /// Opens the transport and performs the `initialize` handshake.
    ///
    /// Handlers registered before this call are declared as client
    /// capabilities. Any failure leaves the session `Failed`.
    pub async fn connect(&self) -> Result<ServerDetails, McpError> {
        self.inner
            .state()
            .transition(SessionState::Connecting, "connect")?;
        info!(
            transport = %self.inner.transport.kind(),
            target = %self.inner.target,
            "Connecting to MCP server"
        );

        match self.establish().await {
            Ok(details) => Ok(details),
            Err(err) => {
                let err = match err {
                    McpError::ConnectionLost(reason) => {
                        McpError::ConnectionLost(self.inner.with_stderr_tail(reason))
                    }
                    other => other,
                };
                if self.inner.fail(err.clone()) {
                    warn!(target = %self.inner.target, error = %err, "MCP connect failed");
                    self.inner.engine.fail_all(err.clone());
                    self.inner.shutdown.cancel();
                    if let Err(close_err) = self.inner.transport.close().await {
                        debug!(error = %close_err, "Transport close after failed connect");
                    }
                }
                // The reception task may have recorded the real cause first.
                Err(self.failure().unwrap_or(err))
            }
        }
    }

    async fn establish(&self) -> Result<ServerDetails, McpError> {
        let inner = &self.inner;
        inner.transport.open().await?;
        let events = inner.transport.receive()?;
        spawn_reception(inner, events);
        inner
            .state()
            .transition(SessionState::Handshaking, "connect")?;

        let enabled = inner.transport.supports_server_requests();
        let declared = if enabled {
            inner.callbacks.declared()
        } else {
            Vec::new()
        };
        let params = protocol::initialize_params(
            &inner.options.protocol_version,
            &inner.options.client_name,
            &inner.options.client_version,
            inner.callbacks.client_capabilities(enabled),
        );
        let result = inner
            .engine
            .start_request(METHOD_INITIALIZE, Some(params), inner.options.handshake_timeout)
            .await?
            .wait()
            .await
            .map_err(|err| match err {
                McpError::Remote { code, message, .. } => McpError::HandshakeRejected(format!(
                    "initialize failed with error {code}: {message}"
                )),
                other => other,
            })?;

        let details = protocol::parse_initialize_result(result, &declared)?;
        inner.transport.set_protocol_version(&details.protocol_version);
        inner.engine.notify(METHOD_INITIALIZED, None).await?;

        *inner
            .details
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(details.clone());
        inner.state().transition(SessionState::Ready, "connect")?;
        info!(
            server = %details.server_info.name,
            version = %details.server_info.version,
            protocol = %details.protocol_version,
            "MCP session ready"
        );
        Ok(details)
    }

    /// Stops the session. Pending calls resolve as cancelled. Closing an
    /// already closed session is a no-op.
    pub async fn close(&self) -> Result<(), McpError> {
        let graceful = {
            let mut cell = self.inner.state();
            match cell.state() {
                SessionState::Closing | SessionState::Closed => return Ok(()),
                SessionState::Failed => false,
                _ => {
                    cell.transition(SessionState::Closing, "close")?;
                    true
                }
            }
        };

        let cancelled = self
            .inner
            .engine
            .fail_all(McpError::Cancelled("session closed".to_string()));
        if cancelled > 0 {
            info!(cancelled, "Cancelled in-flight MCP requests on close");
        }
        self.inner.shutdown.cancel();
        let result = self.inner.transport.close().await;
        if graceful {
            self.inner.state().transition(SessionState::Closed, "close")?;
        }
        debug!(target = %self.inner.target, "MCP session closed");
        result
    }

    /// Capabilities negotiated during the handshake.
    pub fn capabilities(&self) -> Result<CapabilitySet, McpError> {
        self.inner.state().require_ready("capabilities")?;
        Ok(self
            .inner
            .details()
            .as_ref()
            .map(|details| details.capabilities.clone())
            .unwrap_or_default())
    }

    pub fn instructions(&self) -> Result<Option<String>, McpError> {
        self.inner.state().require_ready("instructions")?;
        Ok(self
            .inner
            .details()
            .as_ref()
            .and_then(|details| details.instructions.clone()))
    }

    /// Round trip of a `ping` request.
    pub async fn ping(&self) -> Result<Duration, McpError> {
        let started = Instant::now();
        self.call("ping", None).await?;
        Ok(started.elapsed())
    }

    pub async fn list_tools(&self) -> Result<ListToolsResult, McpError> {
        self.list_all("tools/list", "tools").await
    }

    /// Invokes a tool. A tool-level failure (`isError`) is still `Ok`.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Map<String, Value>>,
    ) -> Result<CallToolResult, McpError> {
        let mut params = json!({ "name": name });
        if let Some(arguments) = arguments {
            params["arguments"] = Value::Object(arguments);
        }
        let result = self.call("tools/call", Some(params)).await?;
        protocol::parse_result("tools/call", result)
    }

    pub async fn list_resources(&self) -> Result<ListResourcesResult, McpError> {
        self.list_all("resources/list", "resources").await
    }

    pub async fn list_resource_templates(&self) -> Result<ListResourceTemplatesResult, McpError> {
        self.list_all("resources/templates/list", "resourceTemplates")
            .await
    }

    pub async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult, McpError> {
        let result = self
            .call("resources/read", Some(json!({ "uri": uri })))
            .await?;
        protocol::parse_result("resources/read", result)
    }

    pub async fn subscribe_resource(&self, uri: &str) -> Result<(), McpError> {
        self.subscription("resources/subscribe", uri).await
    }

    pub async fn unsubscribe_resource(&self, uri: &str) -> Result<(), McpError> {
        self.subscription("resources/unsubscribe", uri).await
    }

    async fn subscription(&self, method: &str, uri: &str) -> Result<(), McpError> {
        self.inner.state().require_ready(method)?;
        let subscribable = self
            .inner
            .details()
            .as_ref()
            .is_some_and(|details| details.capabilities.resource_subscribe);
        if !subscribable {
            return Err(McpError::Unsupported {
                capability: Capability::Resources,
                method: method.to_string(),
            });
        }
        self.call(method, Some(json!({ "uri": uri }))).await?;
        Ok(())
    }

    pub async fn list_prompts(&self) -> Result<ListPromptsResult, McpError> {
        self.list_all("prompts/list", "prompts").await
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: &BTreeMap<String, String>,
    ) -> Result<GetPromptResult, McpError> {
        let mut params = json!({ "name": name });
        if !arguments.is_empty() {
            params["arguments"] = json!(arguments);
        }
        let result = self.call("prompts/get", Some(params)).await?;
        protocol::parse_result("prompts/get", result)
    }

    /// Sends an arbitrary request and returns the raw result. Only the
    /// lifecycle state is checked, so unadvertised methods can be probed.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        self.inner.state().require_ready(method)?;
        self.inner
            .start(method, params, self.inner.options.request_timeout)
            .await?
            .wait()
            .await
    }

    /// Sends a capability-checked request and hands back its handle, so
    /// several calls can be in flight at once.
    pub async fn start_call(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<CallHandle, McpError> {
        self.inner.state().require_ready(method)?;
        self.inner.require_capability(method)?;
        let timeout = timeout.unwrap_or(self.inner.options.request_timeout);
        self.inner.start(method, params, timeout).await
    }

    async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        self.start_call(method, params, None).await?.wait().await
    }

    async fn list_all<T: DeserializeOwned>(
        &self,
        method: &str,
        key: &'static str,
    ) -> Result<T, McpError> {
        let mut merger = PageMerger::new(method, key);
        let mut cursor = None;
        loop {
            let page = self.call(method, protocol::cursor_params(cursor)).await?;
            cursor = merger.push(page)?;
            if cursor.is_none() {
                break;
            }
            if merger.pages() >= self.inner.options.max_list_pages {
                warn!(method, pages = merger.pages(), "Stopping MCP list pagination at page limit");
                break;
            }
        }
        merger.finish()
    }
}

impl SessionInner {
    fn state(&self) -> MutexGuard<'_, StateCell> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn details(&self) -> std::sync::RwLockReadGuard<'_, Option<ServerDetails>> {
        self.details
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn diagnostics(&self) -> MutexGuard<'_, VecDeque<String>> {
        self.diagnostics
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Moves the session to `Failed` unless it is already shutting down.
    fn fail(&self, error: McpError) -> bool {
        let mut cell = self.state();
        if cell.state() == SessionState::Closing {
            return false;
        }
        cell.fail(error)
    }

    fn require_capability(&self, method: &str) -> Result<(), McpError> {
        let Some(capability) = Capability::for_method(method) else {
            return Ok(());
        };
        let supported = self
            .details()
            .as_ref()
            .is_some_and(|details| details.capabilities.supports(capability));
        if supported {
            Ok(())
        } else {
            Err(McpError::Unsupported {
                capability,
                method: method.to_string(),
            })
        }
    }

    async fn start(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<CallHandle, McpError> {
        match self.engine.start_request(method, params, timeout).await {
            Err(err) if err.is_fatal() => {
                if self.fail(err.clone()) {
                    warn!(method, error = %err, "MCP transport failed while sending");
                    self.engine.fail_all(err.clone());
                }
                Err(err)
            }
            other => other,
        }
    }

    fn push_diagnostic(&self, line: String) {
        debug!(target: "mcp_probe::stderr", server = %self.target, "{line}");
        let capacity = self.options.diagnostics_capacity.max(1);
        let mut lines = self.diagnostics();
        while lines.len() >= capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    fn with_stderr_tail(&self, reason: String) -> String {
        let lines = self.diagnostics();
        if lines.is_empty() || reason.contains("stderr:") {
            return reason;
        }
        let skip = lines.len().saturating_sub(STDERR_TAIL_LINES);
        let tail: Vec<&str> = lines.iter().skip(skip).map(String::as_str).collect();
        format!("{reason} (stderr: {})", tail.join(" | "))
    }

    fn connection_lost(&self, reason: String) {
        if matches!(
            self.state().state(),
            SessionState::Closing | SessionState::Closed
        ) {
            return;
        }
        let error = McpError::ConnectionLost(self.with_stderr_tail(reason));
        if self.fail(error.clone()) {
            warn!(target = %self.target, error = %error, "MCP session lost its transport");
        }
        let failed = self.engine.fail_all(error);
        if failed > 0 {
            debug!(failed, "Failed pending MCP requests after transport loss");
        }
    }

    /// Handles one transport event. Returns false once the transport is gone.
    fn handle_event(self: &Arc<Self>, event: TransportEvent) -> bool {
        match event {
            TransportEvent::Frame(payload) => {
                match codec::decode(&payload) {
                    Ok(decoded) => {
                        for rejected in decoded.rejected {
                            let reason = rejected.error.to_string();
                            self.log
                                .record_malformed(Direction::Received, &rejected.raw, &reason);
                            warn!(error = %reason, "Discarding malformed MCP batch element");
                        }
                        for frame in decoded.frames {
                            self.handle_inbound(self.engine.route(frame));
                        }
                    }
                    Err(err) => {
                        self.log
                            .record_malformed(Direction::Received, &payload, &err.to_string());
                        warn!(error = %err, "Discarding malformed MCP frame");
                    }
                }
                true
            }
            TransportEvent::Malformed { raw, reason } => {
                self.log.record_malformed(Direction::Received, &raw, &reason);
                warn!(reason = %reason, "Transport delivered malformed data");
                true
            }
            TransportEvent::Diagnostic(line) => {
                self.push_diagnostic(line);
                true
            }
            TransportEvent::Closed { reason } => {
                self.connection_lost(reason);
                false
            }
        }
    }

    fn handle_inbound(self: &Arc<Self>, inbound: Inbound) {
        match inbound {
            Inbound::Handled => {}
            Inbound::ServerRequest { id, method, params } => {
                let inner = Arc::clone(self);
                tokio::spawn(async move {
                    let enabled = inner.transport.supports_server_requests();
                    let outcome = inner.callbacks.dispatch(&method, params, enabled).await;
                    if let Err(error) = &outcome {
                        debug!(
                            method = %method,
                            code = error.code,
                            "Answering server request with error"
                        );
                    }
                    if let Err(err) = inner.engine.reply(id, &method, outcome).await {
                        warn!(
                            method = %method,
                            error = %err,
                            "Failed to answer MCP server request"
                        );
                    }
                });
            }
            Inbound::Notification { method, params } => {
                if method == "notifications/message" {
                    let params = params.unwrap_or(Value::Null);
                    let level = params
                        .get("level")
                        .and_then(Value::as_str)
                        .unwrap_or("info")
                        .to_string();
                    let data = params.get("data").cloned().unwrap_or(Value::Null);
                    info!(target: "mcp_probe::server", level = %level, "{data}");
                }
            }
        }
    }
}

/// Pumps transport events into the session until the transport closes or the
/// session shuts down. Holds only a weak reference so dropping every session
/// handle releases the transport.
fn spawn_reception(inner: &Arc<SessionInner>, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
    let session = Arc::downgrade(inner);
    let shutdown = inner.shutdown.clone();
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => event,
            };
            let Some(inner) = session.upgrade() else {
                break;
            };
            let Some(event) = event else {
                inner.connection_lost("transport stopped delivering events".to_string());
                break;
            };
            if !inner.handle_event(event) {
                break;
            }
        }
    });
}
