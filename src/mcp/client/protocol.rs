use crate::mcp::capabilities::{Capability, CapabilitySet};
use crate::mcp::error::McpError;
use rust_mcp_schema::{Implementation, InitializeResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Map, Value};

pub const LATEST_PROTOCOL_VERSION: &str = "2025-11-25";

/// Versions this client can speak, newest first.
pub const SUPPORTED_PROTOCOL_VERSIONS: [&str; 4] =
    ["2025-11-25", "2025-06-18", "2025-03-26", "2024-11-05"];

pub const METHOD_INITIALIZE: &str = "initialize";
pub const METHOD_INITIALIZED: &str = "notifications/initialized";

/// Identity and negotiated features of the connected server.
#[derive(Debug, Clone, Serialize)]
pub struct ServerDetails {
    pub server_info: Implementation,
    pub protocol_version: String,
    pub capabilities: CapabilitySet,
    pub raw_capabilities: Value,
    pub instructions: Option<String>,
}

pub(crate) fn is_supported_version(version: &str) -> bool {
    SUPPORTED_PROTOCOL_VERSIONS.contains(&version)
}

pub(crate) fn initialize_params(
    protocol_version: &str,
    client_name: &str,
    client_version: &str,
    client_capabilities: Value,
) -> Value {
    json!({
        "protocolVersion": protocol_version,
        "capabilities": client_capabilities,
        "clientInfo": {
            "name": client_name,
            "version": client_version,
        },
    })
}

/// Validates an `initialize` result and extracts the server details.
pub(crate) fn parse_initialize_result(
    value: Value,
    client_declared: &[Capability],
) -> Result<ServerDetails, McpError> {
    let raw_capabilities = value
        .get("capabilities")
        .cloned()
        .unwrap_or_else(|| json!({}));
    let result = serde_json::from_value::<InitializeResult>(value).map_err(|err| {
        McpError::HandshakeRejected(format!("unexpected initialize response: {err}"))
    })?;

    let version = result.protocol_version.trim();
    if version.is_empty() {
        return Err(McpError::HandshakeRejected(
            "initialize response has no protocol version".to_string(),
        ));
    }
    if !is_supported_version(version) {
        return Err(McpError::HandshakeRejected(format!(
            "server selected unsupported protocol version {version} (supported: {})",
            SUPPORTED_PROTOCOL_VERSIONS.join(", ")
        )));
    }

    let instructions = result
        .instructions
        .filter(|text| !text.trim().is_empty());
    let capabilities = CapabilitySet::from_handshake(
        &raw_capabilities,
        instructions.as_deref(),
        client_declared,
    );

    Ok(ServerDetails {
        server_info: result.server_info,
        protocol_version: version.to_string(),
        capabilities,
        raw_capabilities,
        instructions,
    })
}

pub(crate) fn parse_result<T: DeserializeOwned>(method: &str, value: Value) -> Result<T, McpError> {
    serde_json::from_value::<T>(value).map_err(|err| McpError::unexpected(method, err))
}

/// Accumulates list pages: items under `key` are concatenated, everything
/// else comes from the first page, `nextCursor` from the last one.
#[derive(Debug)]
pub(crate) struct PageMerger {
    method: String,
    key: &'static str,
    first: Option<Map<String, Value>>,
    items: Vec<Value>,
    next_cursor: Option<String>,
    pages: usize,
}

impl PageMerger {
    pub(crate) fn new(method: &str, key: &'static str) -> Self {
        Self {
            method: method.to_string(),
            key,
            first: None,
            items: Vec::new(),
            next_cursor: None,
            pages: 0,
        }
    }

    pub(crate) fn pages(&self) -> usize {
        self.pages
    }

    /// Adds one page and returns the cursor for the next request, if any.
    pub(crate) fn push(&mut self, page: Value) -> Result<Option<String>, McpError> {
        let Value::Object(mut page) = page else {
            return Err(McpError::unexpected(&self.method, "result is not an object"));
        };
        match page.remove(self.key) {
            Some(Value::Array(items)) => self.items.extend(items),
            Some(_) => {
                return Err(McpError::unexpected(
                    &self.method,
                    format!("`{}` is not an array", self.key),
                ))
            }
            None => {}
        }
        self.next_cursor = page
            .get("nextCursor")
            .and_then(Value::as_str)
            .filter(|cursor| !cursor.is_empty())
            .map(str::to_string);
        self.pages += 1;
        if self.first.is_none() {
            self.first = Some(page);
        }
        Ok(self.next_cursor.clone())
    }

    pub(crate) fn finish<T: DeserializeOwned>(self) -> Result<T, McpError> {
        let mut merged = self.first.unwrap_or_default();
        merged.insert(self.key.to_string(), Value::Array(self.items));
        match self.next_cursor {
            Some(cursor) => merged.insert("nextCursor".to_string(), Value::String(cursor)),
            None => merged.remove("nextCursor"),
        };
        parse_result(&self.method, Value::Object(merged))
    }
}

pub(crate) fn cursor_params(cursor: Option<String>) -> Option<Value> {
    cursor.map(|cursor| json!({ "cursor": cursor }))
}
