//! Minimal line-delimited MCP server used by the integration tests.
//!
//! Requests are handled concurrently, so a slow tool never holds up a fast
//! one. Some tools call back into the client (sampling, roots, elicitation)
//! and report the client's answer as their result.

use clap::Parser;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{oneshot, Mutex};

const SUPPORTED_VERSIONS: [&str; 4] = ["2025-11-25", "2025-06-18", "2025-03-26", "2024-11-05"];
const CLIENT_ANSWER_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug, Clone)]
#[command(name = "mcp-probe-stub")]
#[command(about = "Line-delimited MCP test server")]
struct StubArgs {
    /// Advertised capabilities: tools, resources, prompts, subscribe
    #[arg(long, value_delimiter = ',', default_value = "tools,resources,prompts")]
    capabilities: Vec<String>,

    #[arg(long)]
    instructions: Option<String>,

    /// Write a non-JSON line before the first response
    #[arg(long)]
    garbage: bool,

    /// Answer initialize with this version instead of negotiating
    #[arg(long)]
    protocol_version: Option<String>,

    /// Answer initialize with an error
    #[arg(long)]
    reject_initialize: bool,
}

type RpcOutcome = Result<Value, (i64, String)>;

struct Stub {
    args: StubArgs,
    out: Mutex<tokio::io::Stdout>,
    pending: std::sync::Mutex<HashMap<String, oneshot::Sender<Value>>>,
    next_callback: AtomicU64,
    garbage_pending: AtomicBool,
}

fn method_not_found(method: &str) -> (i64, String) {
    (-32601, format!("Method not found: {method}"))
}

fn text_result(text: impl Into<String>) -> Value {
    json!({ "content": [{ "type": "text", "text": text.into() }] })
}

fn tools() -> Value {
    json!([
        {
            "name": "echo",
            "description": "Return the arguments unchanged.",
            "inputSchema": {"type": "object"}
        },
        {
            "name": "add",
            "description": "Add two numbers together.",
            "inputSchema": {
                "type": "object",
                "properties": {"a": {"type": "number"}, "b": {"type": "number"}},
                "required": ["a", "b"]
            }
        },
        {
            "name": "sleep",
            "description": "Wait for `ms` milliseconds.",
            "inputSchema": {"type": "object", "properties": {"ms": {"type": "integer"}}}
        },
        {
            "name": "crash",
            "description": "Exit the server process immediately.",
            "inputSchema": {"type": "object"}
        },
        {
            "name": "sample",
            "description": "Ask the client for a sampling completion.",
            "inputSchema": {"type": "object", "properties": {"prompt": {"type": "string"}}}
        },
        {
            "name": "roots",
            "description": "Ask the client for its roots.",
            "inputSchema": {"type": "object"}
        },
        {
            "name": "elicit",
            "description": "Ask the client for user input.",
            "inputSchema": {"type": "object"}
        }
    ])
}

impl Stub {
    fn has(&self, capability: &str) -> bool {
        self.args
            .capabilities
            .iter()
            .any(|name| name.trim().eq_ignore_ascii_case(capability))
    }

    async fn write(&self, value: &Value) {
        let mut out = self.out.lock().await;
        if self.garbage_pending.swap(false, Ordering::SeqCst) {
            let _ = out.write_all(b"this line is not json\n").await;
        }
        let _ = out.write_all(value.to_string().as_bytes()).await;
        let _ = out.write_all(b"\n").await;
        let _ = out.flush().await;
    }

    /// Sends a request to the client and returns its full response envelope.
    async fn ask_client(&self, prefix: &str, method: &str, params: Value) -> Value {
        let id = format!(
            "{prefix}-{}",
            self.next_callback.fetch_add(1, Ordering::SeqCst)
        );
        let (tx, rx) = oneshot::channel();
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(id.clone(), tx);
        }
        self.write(&json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params}))
            .await;
        match tokio::time::timeout(CLIENT_ANSWER_TIMEOUT, rx).await {
            Ok(Ok(answer)) => answer,
            _ => json!({ "error": { "code": -1, "message": "client never answered" } }),
        }
    }

    fn complete(&self, message: &Value) {
        let Some(id) = message.get("id").and_then(Value::as_str) else {
            return;
        };
        let slot = self
            .pending
            .lock()
            .ok()
            .and_then(|mut pending| pending.remove(id));
        if let Some(slot) = slot {
            let _ = slot.send(message.clone());
        }
    }

    fn initialize(&self, params: &Value) -> RpcOutcome {
        if self.args.reject_initialize {
            return Err((-32600, "initialize rejected by stub".to_string()));
        }
        let requested = params
            .get("protocolVersion")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let version = match &self.args.protocol_version {
            Some(version) => version.clone(),
            None if SUPPORTED_VERSIONS.contains(&requested) => requested.to_string(),
            None => SUPPORTED_VERSIONS[1].to_string(),
        };

        let mut capabilities = serde_json::Map::new();
        if self.has("tools") {
            capabilities.insert("tools".to_string(), json!({}));
        }
        if self.has("resources") {
            capabilities.insert(
                "resources".to_string(),
                json!({ "subscribe": self.has("subscribe") }),
            );
        }
        if self.has("prompts") {
            capabilities.insert("prompts".to_string(), json!({}));
        }

        let mut result = json!({
            "protocolVersion": version,
            "capabilities": capabilities,
            "serverInfo": {"name": "mcp-probe-stub", "version": env!("CARGO_PKG_VERSION")}
        });
        if let Some(instructions) = &self.args.instructions {
            result["instructions"] = json!(instructions);
        }
        Ok(result)
    }

    async fn call_tool(&self, params: &Value) -> RpcOutcome {
        let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
        let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
        match name {
            "echo" => Ok(json!({
                "content": [{"type": "text", "text": arguments.to_string()}],
                "structuredContent": arguments
            })),
            "add" => {
                let a = arguments.get("a").and_then(Value::as_f64);
                let b = arguments.get("b").and_then(Value::as_f64);
                match (a, b) {
                    (Some(a), Some(b)) => Ok(text_result((a + b).to_string())),
                    _ => Ok(json!({
                        "content": [{"type": "text", "text": "a and b must be numbers"}],
                        "isError": true
                    })),
                }
            }
            "sleep" => {
                let ms = arguments.get("ms").and_then(Value::as_u64).unwrap_or(100);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(text_result(format!("slept {ms} ms")))
            }
            "crash" => {
                eprintln!("mcp-probe-stub: crashing on request");
                std::process::exit(3);
            }
            "sample" => {
                let prompt = arguments
                    .get("prompt")
                    .and_then(Value::as_str)
                    .unwrap_or("Say something.");
                let answer = self
                    .ask_client(
                        "s",
                        "sampling/createMessage",
                        json!({
                            "messages": [{
                                "role": "user",
                                "content": {"type": "text", "text": prompt}
                            }],
                            "maxTokens": 64,
                            "stopSequences": [],
                            "tools": []
                        }),
                    )
                    .await;
                Ok(text_result(answer.to_string()))
            }
            "roots" => {
                let answer = self.ask_client("r", "roots/list", json!({})).await;
                Ok(text_result(answer.to_string()))
            }
            "elicit" => {
                let answer = self
                    .ask_client(
                        "e",
                        "elicitation/create",
                        json!({
                            "message": "Pick a colour",
                            "requestedSchema": {
                                "type": "object",
                                "properties": {"colour": {"type": "string"}}
                            }
                        }),
                    )
                    .await;
                Ok(text_result(answer.to_string()))
            }
            other => Err((-32602, format!("Unknown tool: {other}"))),
        }
    }

    fn read_resource(&self, params: &Value) -> RpcOutcome {
        let uri = params.get("uri").and_then(Value::as_str).unwrap_or_default();
        let text = match uri {
            "config://version" => env!("CARGO_PKG_VERSION").to_string(),
            "config://settings" => {
                json!({"debug": true, "log_level": "INFO", "max_connections": 10}).to_string()
            }
            other => return Err((-32002, format!("Resource not found: {other}"))),
        };
        Ok(json!({ "contents": [{ "uri": uri, "mimeType": "text/plain", "text": text }] }))
    }

    fn get_prompt(&self, params: &Value) -> RpcOutcome {
        let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
        let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
        let text = match name {
            "code_review" => {
                let language = arguments
                    .get("language")
                    .and_then(Value::as_str)
                    .unwrap_or("python");
                format!("Please review the following {language} code.")
            }
            "summarize" => "Please summarize the following text.".to_string(),
            other => return Err((-32602, format!("Unknown prompt: {other}"))),
        };
        Ok(json!({
            "description": format!("{name} prompt"),
            "messages": [{"role": "user", "content": {"type": "text", "text": text}}]
        }))
    }

    async fn dispatch(&self, method: &str, params: &Value) -> RpcOutcome {
        let gate = |capability: &str| {
            if self.has(capability) {
                Ok(())
            } else {
                Err(method_not_found(method))
            }
        };
        match method {
            "initialize" => self.initialize(params),
            "ping" => Ok(json!({})),
            "tools/list" => gate("tools").map(|_| json!({ "tools": tools() })),
            "tools/call" => {
                gate("tools")?;
                self.call_tool(params).await
            }
            "resources/list" => gate("resources").map(|_| {
                json!({ "resources": [
                    {"uri": "config://version", "name": "version", "mimeType": "text/plain"},
                    {"uri": "config://settings", "name": "settings", "mimeType": "application/json"}
                ]})
            }),
            "resources/templates/list" => gate("resources").map(|_| {
                json!({ "resourceTemplates": [
                    {"uriTemplate": "config://{key}", "name": "config entry"}
                ]})
            }),
            "resources/read" => {
                gate("resources")?;
                self.read_resource(params)
            }
            "resources/subscribe" | "resources/unsubscribe" => {
                gate("subscribe")?;
                Ok(json!({}))
            }
            "prompts/list" => gate("prompts").map(|_| {
                json!({ "prompts": [
                    {
                        "name": "code_review",
                        "description": "Generate a prompt for code review.",
                        "arguments": [{"name": "language", "required": false}]
                    },
                    {"name": "summarize", "description": "Generate a prompt for summarization."}
                ]})
            }),
            "prompts/get" => {
                gate("prompts")?;
                self.get_prompt(params)
            }
            other => Err(method_not_found(other)),
        }
    }

    async fn handle(self: Arc<Self>, message: Value) {
        let Some(method) = message.get("method").and_then(Value::as_str) else {
            self.complete(&message);
            return;
        };
        // Notifications need no answer.
        let Some(id) = message.get("id").cloned() else {
            return;
        };
        let params = message.get("params").cloned().unwrap_or_else(|| json!({}));
        let response = match self.dispatch(method, &params).await {
            Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
            Err((code, text)) => json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {"code": code, "message": text}
            }),
        };
        self.write(&response).await;
    }
}

#[tokio::main]
async fn main() {
    let args = StubArgs::parse();
    eprintln!("mcp-probe-stub: ready");

    let stub = Arc::new(Stub {
        garbage_pending: AtomicBool::new(args.garbage),
        args,
        out: Mutex::new(tokio::io::stdout()),
        pending: std::sync::Mutex::new(HashMap::new()),
        next_callback: AtomicU64::new(1),
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(line) {
            Ok(message) => {
                tokio::spawn(Arc::clone(&stub).handle(message));
            }
            Err(err) => eprintln!("mcp-probe-stub: ignoring unparsable line: {err}"),
        }
    }
}
