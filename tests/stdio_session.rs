//! End-to-end sessions against the `mcp-probe-stub` server over stdio.

use futures_util::future::join_all;
use async_trait::async_trait;
use mcp_probe::mcp::client::{
    CallbackError, ElicitationAction, ElicitationHandler, ElicitationRequest, ElicitationResponse,
    StaticSampling,
};
use mcp_probe::mcp::codec::RequestId;
use mcp_probe::mcp::{
    Capability, Direction, EndpointDescriptor, McpError, McpSession, SessionOptions, SessionState,
    TransportKind,
};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

const STUB: &str = env!("CARGO_BIN_EXE_mcp-probe-stub");
const PROBE: &str = env!("CARGO_BIN_EXE_mcp-probe");

fn stub_session(stub_args: &[&str]) -> McpSession {
    let descriptor = EndpointDescriptor::stdio(
        STUB,
        stub_args.iter().map(|arg| arg.to_string()).collect(),
    );
    let options = SessionOptions {
        request_timeout: Duration::from_secs(10),
        handshake_timeout: Duration::from_secs(10),
        ..SessionOptions::default()
    };
    McpSession::new(&descriptor, options).expect("stub descriptor is valid")
}

async fn ready(stub_args: &[&str]) -> McpSession {
    let session = stub_session(stub_args);
    session.connect().await.expect("stub handshake succeeds");
    session
}

fn object(value: Value) -> Option<Map<String, Value>> {
    match value {
        Value::Object(map) => Some(map),
        other => panic!("expected object, got {other}"),
    }
}

fn first_text(result: &rust_mcp_schema::CallToolResult) -> String {
    let value = serde_json::to_value(result).unwrap();
    value["content"][0]["text"].as_str().unwrap_or_default().to_string()
}

fn tool_call(name: &str, arguments: Value) -> Option<Value> {
    Some(json!({ "name": name, "arguments": arguments }))
}

#[tokio::test]
async fn handshake_reports_server_details() {
    let session = ready(&["--instructions", "Call echo first."]).await;
    assert_eq!(session.state(), SessionState::Ready);
    assert_eq!(session.transport_kind(), TransportKind::Stdio);

    let details = session.server_details().unwrap();
    assert_eq!(details.server_info.name, "mcp-probe-stub");
    assert_eq!(details.protocol_version, mcp_probe::mcp::client::LATEST_PROTOCOL_VERSION);
    assert_eq!(
        session.instructions().unwrap().as_deref(),
        Some("Call echo first.")
    );
    assert!(session
        .diagnostics()
        .iter()
        .any(|line| line.contains("mcp-probe-stub: ready")));

    session.close().await.unwrap();
    assert_eq!(session.state(), SessionState::Closed);
}

#[tokio::test]
async fn every_call_logs_one_request_and_one_response() {
    let session = ready(&[]).await;
    session.protocol_log().clear();

    session.list_tools().await.unwrap();
    session
        .call_tool("add", object(json!({"a": 2, "b": 3})))
        .await
        .unwrap();
    session.ping().await.unwrap();

    let entries = session.protocol_log().entries();
    assert_eq!(entries.len(), 6);
    for pair in entries.chunks(2) {
        assert_eq!(pair[0].direction, Direction::Sent);
        assert_eq!(pair[1].direction, Direction::Received);
        assert_eq!(pair[0].id, pair[1].id);
        assert_eq!(pair[0].method, pair[1].method);
    }
    session.close().await.unwrap();
}

#[tokio::test]
async fn concurrent_calls_get_unique_ids() {
    let session = ready(&[]).await;
    session.protocol_log().clear();

    let calls = (0..20).map(|n| {
        let session = session.clone();
        async move {
            session
                .call_tool("echo", object(json!({ "n": n })))
                .await
                .map(|result| {
                    serde_json::to_value(result).unwrap()["structuredContent"]["n"].clone()
                })
        }
    });
    let results = join_all(calls).await;
    for (n, result) in results.into_iter().enumerate() {
        assert_eq!(result.unwrap(), json!(n));
    }

    let sent: Vec<RequestId> = session
        .protocol_log()
        .filter(Some(Direction::Sent), None, None)
        .into_iter()
        .filter_map(|entry| entry.id)
        .collect();
    let unique: HashSet<&RequestId> = sent.iter().collect();
    assert_eq!(sent.len(), 20);
    assert_eq!(unique.len(), 20);
    session.close().await.unwrap();
}

#[tokio::test]
async fn short_call_completes_before_long_call() {
    let session = ready(&[]).await;
    let slow = session
        .start_call("tools/call", tool_call("sleep", json!({"ms": 600})), None)
        .await
        .unwrap();
    let fast = session
        .start_call("tools/call", tool_call("sleep", json!({"ms": 10})), None)
        .await
        .unwrap();
    let (slow_id, fast_id) = (slow.id(), fast.id());

    let (slow_result, fast_result) = tokio::join!(slow.wait(), fast.wait());
    slow_result.unwrap();
    fast_result.unwrap();

    let received: Vec<u64> = session
        .protocol_log()
        .filter(Some(Direction::Received), Some("tools/call"), None)
        .into_iter()
        .filter_map(|entry| entry.id.and_then(|id| id.as_u64()))
        .collect();
    let position = |id: u64| received.iter().position(|seen| *seen == id).unwrap();
    assert!(position(fast_id) < position(slow_id));
    session.close().await.unwrap();
}

#[tokio::test]
async fn a_timed_out_call_leaves_the_session_usable() {
    let session = ready(&[]).await;
    let stuck = session
        .start_call(
            "tools/call",
            tool_call("sleep", json!({"ms": 3000})),
            Some(Duration::from_millis(150)),
        )
        .await
        .unwrap();
    let echoed = session.call_tool("echo", object(json!({"still": "alive"})));

    let (stuck, echoed) = tokio::join!(stuck.wait(), echoed);
    assert!(matches!(stuck, Err(McpError::Timeout { .. })));
    assert_eq!(
        serde_json::to_value(echoed.unwrap()).unwrap()["structuredContent"]["still"],
        "alive"
    );
    assert_eq!(session.state(), SessionState::Ready);
    session.close().await.unwrap();
}

#[tokio::test]
async fn close_cancels_pending_calls() {
    let session = ready(&[]).await;
    let mut handles = Vec::new();
    for _ in 0..3 {
        handles.push(
            session
                .start_call("tools/call", tool_call("sleep", json!({"ms": 5000})), None)
                .await
                .unwrap(),
        );
    }
    assert_eq!(session.pending_requests(), 3);

    session.close().await.unwrap();
    for handle in handles {
        assert!(matches!(handle.wait().await, Err(McpError::Cancelled(_))));
    }
    assert_eq!(session.pending_requests(), 0);
    assert!(matches!(
        session.ping().await,
        Err(McpError::InvalidState { .. })
    ));
}

#[tokio::test]
async fn echo_preserves_nested_arguments() {
    let session = ready(&[]).await;
    let arguments = json!({
        "text": "héllo",
        "nested": {"list": [1, 2.5, null, true], "empty": {}}
    });
    let result = session
        .call_tool("echo", object(arguments.clone()))
        .await
        .unwrap();
    let value = serde_json::to_value(&result).unwrap();
    assert_eq!(value["structuredContent"], arguments);
    let text: Value = serde_json::from_str(&first_text(&result)).unwrap();
    assert_eq!(text, arguments);
    session.close().await.unwrap();
}

#[tokio::test]
async fn resources_and_prompts_round_trip() {
    let session = ready(&[]).await;

    let resources = serde_json::to_value(session.list_resources().await.unwrap()).unwrap();
    assert_eq!(resources["resources"].as_array().unwrap().len(), 2);
    let settings = serde_json::to_value(session.read_resource("config://settings").await.unwrap())
        .unwrap();
    let parsed: Value =
        serde_json::from_str(settings["contents"][0]["text"].as_str().unwrap()).unwrap();
    assert_eq!(parsed["max_connections"], 10);

    let missing = session.read_resource("config://nope").await.unwrap_err();
    assert!(matches!(missing, McpError::Remote { code: -32002, .. }));

    let prompt = session
        .get_prompt(
            "code_review",
            &BTreeMap::from([("language".to_string(), "rust".to_string())]),
        )
        .await
        .unwrap();
    let prompt = serde_json::to_value(prompt).unwrap();
    assert!(prompt["messages"][0]["content"]["text"]
        .as_str()
        .unwrap()
        .contains("rust"));

    let subscribe = session.subscribe_resource("config://version").await;
    assert!(matches!(subscribe, Err(McpError::Unsupported { .. })));
    session.close().await.unwrap();
}

#[tokio::test]
async fn unadvertised_capabilities_fail_locally() {
    let session = ready(&["--capabilities", "tools", "--instructions", "Tools only."]).await;
    session.protocol_log().clear();

    let err = session.list_resources().await.unwrap_err();
    assert!(matches!(
        err,
        McpError::Unsupported {
            capability: Capability::Resources,
            ..
        }
    ));
    assert!(session.protocol_log().is_empty());
    assert_eq!(session.instructions().unwrap().as_deref(), Some("Tools only."));
    assert!(session.list_tools().await.is_ok());
    session.close().await.unwrap();
}

#[tokio::test]
async fn unhandled_server_requests_are_declined() {
    let session = ready(&[]).await;
    let result = session.call_tool("roots", None).await.unwrap();
    let answer: Value = serde_json::from_str(&first_text(&result)).unwrap();
    assert_eq!(answer["id"], "r-1");
    assert_eq!(answer["error"]["code"], -32601);
    assert_eq!(session.state(), SessionState::Ready);
    session.close().await.unwrap();
}

#[tokio::test]
async fn sampling_requests_are_answered_by_the_handler() {
    let session = stub_session(&[]);
    session.set_sampling_handler(Arc::new(StaticSampling::new("canned completion")));
    session.connect().await.unwrap();

    let result = session
        .call_tool("sample", object(json!({"prompt": "Write a haiku"})))
        .await
        .unwrap();
    let answer: Value = serde_json::from_str(&first_text(&result)).unwrap();
    assert_eq!(answer["id"], "s-1");
    assert_eq!(answer["result"]["role"], "assistant");
    assert!(answer["result"]["content"].to_string().contains("canned completion"));
    session.close().await.unwrap();
}

#[tokio::test]
async fn subscriptions_need_the_subscribe_flag() {
    let session = ready(&["--capabilities", "tools,resources,subscribe"]).await;
    assert!(session.capabilities().unwrap().resource_subscribe);
    session.subscribe_resource("config://version").await.unwrap();
    session.unsubscribe_resource("config://version").await.unwrap();
    assert!(matches!(
        session.list_prompts().await,
        Err(McpError::Unsupported {
            capability: Capability::Prompts,
            ..
        })
    ));
    session.close().await.unwrap();
}

struct PickBlue;

#[async_trait]
impl ElicitationHandler for PickBlue {
    async fn elicit(
        &self,
        request: ElicitationRequest,
    ) -> Result<ElicitationResponse, CallbackError> {
        assert_eq!(request.message, "Pick a colour");
        Ok(ElicitationResponse {
            action: ElicitationAction::Accept,
            content: Some(json!({ "colour": "blue" })),
        })
    }
}

#[tokio::test]
async fn elicitation_requests_reach_the_handler() {
    let session = stub_session(&[]);
    session.set_elicitation_handler(Arc::new(PickBlue));
    session.connect().await.unwrap();

    let result = session.call_tool("elicit", None).await.unwrap();
    let answer: Value = serde_json::from_str(&first_text(&result)).unwrap();
    assert_eq!(answer["id"], "e-1");
    assert_eq!(answer["result"]["action"], "accept");
    assert_eq!(answer["result"]["content"]["colour"], "blue");
    session.close().await.unwrap();
}

#[tokio::test]
async fn server_crash_fails_the_session_with_stderr_context() {
    let session = ready(&[]).await;
    let err = session.call_tool("crash", None).await.unwrap_err();
    let McpError::ConnectionLost(reason) = &err else {
        panic!("expected connection loss, got {err:?}");
    };
    assert!(reason.contains("status 3"), "{reason}");
    assert!(reason.contains("mcp-probe-stub"), "{reason}");

    assert_eq!(session.state(), SessionState::Failed);
    assert!(matches!(
        session.ping().await,
        Err(McpError::ConnectionLost(_))
    ));
    session.close().await.unwrap();
    assert_eq!(session.state(), SessionState::Failed);
}

#[tokio::test]
async fn garbage_lines_are_recorded_without_breaking_the_session() {
    let session = ready(&["--garbage"]).await;
    session.ping().await.unwrap();
    let malformed = session
        .protocol_log()
        .entries()
        .into_iter()
        .filter(|entry| entry.is_error() && entry.direction == Direction::Received)
        .count();
    assert_eq!(malformed, 1);
    session.close().await.unwrap();
}

#[tokio::test]
async fn rejected_initialize_is_a_handshake_failure() {
    let session = stub_session(&["--reject-initialize"]);
    let err = session.connect().await.unwrap_err();
    assert!(matches!(err, McpError::HandshakeRejected(_)));
    assert_eq!(session.state(), SessionState::Failed);

    let session = stub_session(&["--protocol-version", "1999-01-01"]);
    let err = session.connect().await.unwrap_err();
    assert!(matches!(err, McpError::HandshakeRejected(_)));
}

fn probe(args: &[&str]) -> std::process::Output {
    Command::new(PROBE)
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .expect("mcp-probe runs")
}

#[test]
fn cli_lists_tools_and_calls_them() {
    let output = probe(&["tools", "--stdio", STUB]);
    assert_eq!(output.status.code(), Some(0));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("echo"), "{stdout}");
    assert!(stdout.contains("Add two numbers together."), "{stdout}");

    let output = probe(&["call", "add", "--args", r#"{"a": 2, "b": 3}"#, "--stdio", STUB]);
    assert_eq!(output.status.code(), Some(0));
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "5");
}

#[test]
fn cli_exit_codes_reflect_failures() {
    let output = probe(&[
        "resources",
        "--stdio",
        STUB,
        "--extra-arg=--capabilities",
        "--extra-arg=tools",
    ]);
    assert_eq!(output.status.code(), Some(4));

    let output = probe(&["call", "add", "--args", r#"{"a": "x"}"#, "--stdio", STUB]);
    assert_eq!(output.status.code(), Some(4));

    let output = probe(&["call", "crash", "--stdio", STUB]);
    assert_eq!(output.status.code(), Some(3));

    let output = probe(&["call", "echo", "--args", "{oops", "--stdio", STUB]);
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn cli_exports_the_protocol_log() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.json");
    let output = probe(&[
        "ping",
        "--stdio",
        STUB,
        "--export-log",
        path.to_str().unwrap(),
    ]);
    assert_eq!(output.status.code(), Some(0));

    let exported: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    let methods: Vec<&str> = exported
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|entry| entry["method"].as_str())
        .collect();
    assert!(methods.contains(&"initialize"));
    assert!(methods.contains(&"ping"));
}
