//! Answers the requests a server is allowed to send to its client.
//!
//! Handlers are optional and registered per kind. A request with no handler
//! (or arriving over a transport that cannot carry server requests) is
//! answered with an explicit decline so the server never waits forever.

use crate::mcp::capabilities::Capability;
use crate::mcp::codec::RpcError;
use crate::mcp::error::{JSONRPC_INTERNAL_ERROR, JSONRPC_INVALID_PARAMS, JSONRPC_METHOD_NOT_FOUND};
use async_trait::async_trait;
use rust_mcp_schema::{
    CreateMessageContent, CreateMessageRequestParams, CreateMessageResult, Role, TextContent,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::debug;

pub const METHOD_CREATE_MESSAGE: &str = "sampling/createMessage";
pub const METHOD_LIST_ROOTS: &str = "roots/list";
pub const METHOD_ELICIT: &str = "elicitation/create";
pub const METHOD_PING: &str = "ping";

/// Failure reported by a handler; sent to the server as an internal error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct CallbackError {
    pub message: String,
}

impl CallbackError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallbackKind {
    Sampling,
    Roots,
    Elicitation,
}

impl CallbackKind {
    pub fn method(self) -> &'static str {
        match self {
            CallbackKind::Sampling => METHOD_CREATE_MESSAGE,
            CallbackKind::Roots => METHOD_LIST_ROOTS,
            CallbackKind::Elicitation => METHOD_ELICIT,
        }
    }

    pub fn capability(self) -> Capability {
        match self {
            CallbackKind::Sampling => Capability::Sampling,
            CallbackKind::Roots => Capability::Roots,
            CallbackKind::Elicitation => Capability::Elicitation,
        }
    }
}

impl fmt::Display for CallbackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.capability().as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Root {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Root {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            name: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElicitationRequest {
    pub message: String,
    #[serde(default)]
    pub requested_schema: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElicitationAction {
    Accept,
    Decline,
    Cancel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElicitationResponse {
    pub action: ElicitationAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
}

#[async_trait]
pub trait SamplingHandler: Send + Sync {
    async fn create_message(
        &self,
        params: CreateMessageRequestParams,
    ) -> Result<CreateMessageResult, CallbackError>;
}

#[async_trait]
pub trait RootsHandler: Send + Sync {
    async fn list_roots(&self) -> Result<Vec<Root>, CallbackError>;
}

#[async_trait]
pub trait ElicitationHandler: Send + Sync {
    async fn elicit(&self, request: ElicitationRequest)
        -> Result<ElicitationResponse, CallbackError>;
}

/// Replies to every sampling request with the same assistant text.
#[derive(Debug, Clone)]
pub struct StaticSampling {
    pub text: String,
    pub model: String,
}

impl StaticSampling {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            model: "mcp-probe-static".to_string(),
        }
    }
}

#[async_trait]
impl SamplingHandler for StaticSampling {
    async fn create_message(
        &self,
        _params: CreateMessageRequestParams,
    ) -> Result<CreateMessageResult, CallbackError> {
        Ok(CreateMessageResult {
            content: CreateMessageContent::from(TextContent::new(self.text.clone(), None, None)),
            meta: None,
            model: self.model.clone(),
            role: Role::Assistant,
            stop_reason: Some("endTurn".to_string()),
        })
    }
}

/// Fixed list of roots.
#[derive(Debug, Clone, Default)]
pub struct StaticRoots(pub Vec<Root>);

#[async_trait]
impl RootsHandler for StaticRoots {
    async fn list_roots(&self) -> Result<Vec<Root>, CallbackError> {
        Ok(self.0.clone())
    }
}

/// At most one handler per kind; registering again replaces the old one.
#[derive(Default)]
pub struct CallbackRegistry {
    sampling: RwLock<Option<Arc<dyn SamplingHandler>>>,
    roots: RwLock<Option<Arc<dyn RootsHandler>>>,
    elicitation: RwLock<Option<Arc<dyn ElicitationHandler>>>,
}

fn read<T: Clone>(slot: &RwLock<T>) -> T {
    slot.read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone()
}

fn write<T>(slot: &RwLock<T>, value: T) {
    *slot
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner()) = value;
}

impl CallbackRegistry {
    pub fn set_sampling(&self, handler: Arc<dyn SamplingHandler>) {
        write(&self.sampling, Some(handler));
    }

    pub fn set_roots(&self, handler: Arc<dyn RootsHandler>) {
        write(&self.roots, Some(handler));
    }

    pub fn set_elicitation(&self, handler: Arc<dyn ElicitationHandler>) {
        write(&self.elicitation, Some(handler));
    }

    pub fn is_registered(&self, kind: CallbackKind) -> bool {
        match kind {
            CallbackKind::Sampling => read(&self.sampling).is_some(),
            CallbackKind::Roots => read(&self.roots).is_some(),
            CallbackKind::Elicitation => read(&self.elicitation).is_some(),
        }
    }

    /// Capabilities the client can honestly declare in `initialize`.
    pub fn declared(&self) -> Vec<Capability> {
        [
            CallbackKind::Sampling,
            CallbackKind::Roots,
            CallbackKind::Elicitation,
        ]
        .into_iter()
        .filter(|kind| self.is_registered(*kind))
        .map(CallbackKind::capability)
        .collect()
    }

    /// The `capabilities` object sent in `initialize`.
    pub fn client_capabilities(&self, enabled: bool) -> Value {
        let mut capabilities = serde_json::Map::new();
        if enabled {
            if self.is_registered(CallbackKind::Sampling) {
                capabilities.insert("sampling".to_string(), json!({}));
            }
            if self.is_registered(CallbackKind::Roots) {
                capabilities.insert("roots".to_string(), json!({ "listChanged": false }));
            }
            if self.is_registered(CallbackKind::Elicitation) {
                capabilities.insert("elicitation".to_string(), json!({}));
            }
        }
        Value::Object(capabilities)
    }

    /// Produces the result for one server request. `enabled` is false when the
    /// transport cannot carry server-initiated traffic.
    pub async fn dispatch(
        &self,
        method: &str,
        params: Option<Value>,
        enabled: bool,
    ) -> Result<Value, RpcError> {
        let kind = match method {
            METHOD_PING => return Ok(json!({})),
            METHOD_CREATE_MESSAGE => CallbackKind::Sampling,
            METHOD_LIST_ROOTS => CallbackKind::Roots,
            METHOD_ELICIT => CallbackKind::Elicitation,
            other => {
                return Err(RpcError::new(
                    JSONRPC_METHOD_NOT_FOUND,
                    format!("Method not found: {other}"),
                )
                .with_data(json!({ "reason": "unknown_method", "method": other })))
            }
        };
        if !enabled {
            return Err(decline(kind));
        }

        let params = params.unwrap_or_else(|| json!({}));
        match kind {
            CallbackKind::Sampling => {
                let Some(handler) = read(&self.sampling) else {
                    return Err(decline(kind));
                };
                let params: CreateMessageRequestParams =
                    serde_json::from_value(params).map_err(invalid_params)?;
                debug!(
                    messages = params.messages.len(),
                    max_tokens = params.max_tokens,
                    "Answering sampling request"
                );
                let result = handler.create_message(params).await.map_err(handler_failed)?;
                serde_json::to_value(result).map_err(encode_failed)
            }
            CallbackKind::Roots => {
                let Some(handler) = read(&self.roots) else {
                    return Err(decline(kind));
                };
                let roots = handler.list_roots().await.map_err(handler_failed)?;
                Ok(json!({ "roots": roots }))
            }
            CallbackKind::Elicitation => {
                let Some(handler) = read(&self.elicitation) else {
                    return Err(decline(kind));
                };
                let request: ElicitationRequest =
                    serde_json::from_value(params).map_err(invalid_params)?;
                let response = handler.elicit(request).await.map_err(handler_failed)?;
                serde_json::to_value(response).map_err(encode_failed)
            }
        }
    }
}

fn decline(kind: CallbackKind) -> RpcError {
    RpcError::new(
        JSONRPC_METHOD_NOT_FOUND,
        format!("Client does not handle {}", kind.method()),
    )
    .with_data(json!({ "reason": "declined", "capability": kind.capability().as_str() }))
}

fn invalid_params(err: serde_json::Error) -> RpcError {
    RpcError::new(JSONRPC_INVALID_PARAMS, format!("Invalid params: {err}"))
}

fn handler_failed(err: CallbackError) -> RpcError {
    RpcError::new(JSONRPC_INTERNAL_ERROR, err.message)
}

fn encode_failed(err: serde_json::Error) -> RpcError {
    handler_failed(CallbackError::new(err.to_string()))
}
