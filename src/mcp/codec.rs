//! JSON-RPC 2.0 envelope encoding and decoding.
//!
//! The codec knows nothing about transports or MCP method semantics: it turns
//! one text payload into zero or more [`Frame`]s and back.

use crate::mcp::error::McpError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

pub const JSONRPC_VERSION: &str = "2.0";

/// Correlation id as it appears on the wire. The client only ever allocates
/// numbers; servers may use strings for their own requests.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl RequestId {
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            RequestId::Number(value) => u64::try_from(*value).ok(),
            RequestId::String(_) => None,
        }
    }
}

impl From<u64> for RequestId {
    fn from(value: u64) -> Self {
        // Ids are allocated from 1 and never approach i64::MAX in one session.
        RequestId::Number(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(value) => write!(f, "{value}"),
            RequestId::String(value) => f.write_str(value),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

impl From<RpcError> for McpError {
    fn from(error: RpcError) -> Self {
        McpError::Remote {
            code: error.code,
            message: error.message,
            data: error.data,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Request {
        id: RequestId,
        method: String,
        params: Option<Value>,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
    Response {
        id: RequestId,
        result: Value,
    },
    Error {
        id: Option<RequestId>,
        error: RpcError,
    },
}

/// Coarse classification used by the protocol log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameKind {
    Request,
    Notification,
    Response,
    Error,
    Malformed,
}

impl FrameKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FrameKind::Request => "request",
            FrameKind::Notification => "notification",
            FrameKind::Response => "response",
            FrameKind::Error => "error",
            FrameKind::Malformed => "malformed",
        }
    }
}

impl Frame {
    pub fn request(
        id: impl Into<RequestId>,
        method: impl Into<String>,
        params: Option<Value>,
    ) -> Self {
        Frame::Request {
            id: id.into(),
            method: method.into(),
            params,
        }
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Frame::Notification {
            method: method.into(),
            params,
        }
    }

    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Request { .. } => FrameKind::Request,
            Frame::Notification { .. } => FrameKind::Notification,
            Frame::Response { .. } => FrameKind::Response,
            Frame::Error { .. } => FrameKind::Error,
        }
    }

    pub fn id(&self) -> Option<&RequestId> {
        match self {
            Frame::Request { id, .. } | Frame::Response { id, .. } => Some(id),
            Frame::Error { id, .. } => id.as_ref(),
            Frame::Notification { .. } => None,
        }
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            Frame::Request { method, .. } | Frame::Notification { method, .. } => Some(method),
            Frame::Response { .. } | Frame::Error { .. } => None,
        }
    }

    pub fn to_value(&self) -> Value {
        let mut object = Map::new();
        object.insert("jsonrpc".to_string(), Value::from(JSONRPC_VERSION));
        match self {
            Frame::Request { id, method, params } => {
                object.insert("id".to_string(), id_value(id));
                object.insert("method".to_string(), Value::from(method.as_str()));
                if let Some(params) = params {
                    object.insert("params".to_string(), params.clone());
                }
            }
            Frame::Notification { method, params } => {
                object.insert("method".to_string(), Value::from(method.as_str()));
                if let Some(params) = params {
                    object.insert("params".to_string(), params.clone());
                }
            }
            Frame::Response { id, result } => {
                object.insert("id".to_string(), id_value(id));
                object.insert("result".to_string(), result.clone());
            }
            Frame::Error { id, error } => {
                object.insert(
                    "id".to_string(),
                    id.as_ref().map(id_value).unwrap_or(Value::Null),
                );
                object.insert(
                    "error".to_string(),
                    serde_json::to_value(error).unwrap_or(Value::Null),
                );
            }
        }
        Value::Object(object)
    }

    /// Serializes to a single line of JSON (no trailing newline).
    pub fn encode(&self) -> String {
        self.to_value().to_string()
    }
}

fn id_value(id: &RequestId) -> Value {
    match id {
        RequestId::Number(value) => Value::from(*value),
        RequestId::String(value) => Value::from(value.as_str()),
    }
}

/// A batch element that failed validation, kept with its raw JSON.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejected {
    pub raw: String,
    pub error: McpError,
}

/// Outcome of decoding one payload: the valid frames in order, plus any
/// batch elements that had to be dropped.
#[derive(Debug, Default, PartialEq)]
pub struct Decoded {
    pub frames: Vec<Frame>,
    pub rejected: Vec<Rejected>,
}

/// Decodes one payload. A JSON array is treated as a batch whose elements
/// are validated one by one; a bad element does not sink its neighbours.
pub fn decode(payload: &str) -> Result<Decoded, McpError> {
    let value: Value = serde_json::from_str(payload.trim())
        .map_err(|err| McpError::MalformedFrame(format!("invalid JSON: {err}")))?;
    decode_value(value)
}

pub fn decode_value(value: Value) -> Result<Decoded, McpError> {
    let Value::Array(items) = value else {
        return Ok(Decoded {
            frames: vec![decode_object(value)?],
            rejected: Vec::new(),
        });
    };
    if items.is_empty() {
        return Err(McpError::MalformedFrame("empty batch".to_string()));
    }
    let mut decoded = Decoded::default();
    for item in items {
        let raw = item.to_string();
        match decode_object(item) {
            Ok(frame) => decoded.frames.push(frame),
            Err(error) => decoded.rejected.push(Rejected { raw, error }),
        }
    }
    Ok(decoded)
}

fn decode_object(value: Value) -> Result<Frame, McpError> {
    let Value::Object(mut object) = value else {
        return Err(McpError::MalformedFrame(
            "envelope is not a JSON object".to_string(),
        ));
    };

    match object.get("jsonrpc").and_then(Value::as_str) {
        Some(JSONRPC_VERSION) => {}
        Some(other) => {
            return Err(McpError::MalformedFrame(format!(
                "unsupported jsonrpc version {other:?}"
            )))
        }
        None => {
            return Err(McpError::MalformedFrame(
                "missing jsonrpc version".to_string(),
            ))
        }
    }

    let id = match object.remove("id") {
        None | Some(Value::Null) => None,
        Some(raw) => Some(serde_json::from_value::<RequestId>(raw).map_err(|_| {
            McpError::MalformedFrame("id must be a number or string".to_string())
        })?),
    };
    let params = object.remove("params");

    if let Some(method) = object.remove("method") {
        let Value::String(method) = method else {
            return Err(McpError::MalformedFrame("method must be a string".to_string()));
        };
        return Ok(match id {
            Some(id) => Frame::Request { id, method, params },
            None => Frame::Notification { method, params },
        });
    }

    if let Some(error) = object.remove("error") {
        let error = serde_json::from_value::<RpcError>(error)
            .map_err(|err| McpError::MalformedFrame(format!("invalid error object: {err}")))?;
        return Ok(Frame::Error { id, error });
    }

    if let Some(result) = object.remove("result") {
        let Some(id) = id else {
            return Err(McpError::MalformedFrame("response without id".to_string()));
        };
        return Ok(Frame::Response { id, result });
    }

    Err(McpError::MalformedFrame(
        "envelope has neither method, result nor error".to_string(),
    ))
}
