use super::*;
use crate::mcp::endpoint::TransportKind;

mod test_helpers {
    use super::*;

    pub(super) fn parse_args(argv: &[&str]) -> Args {
        Args::try_parse_from(argv)
            .unwrap_or_else(|err| panic!("argv={argv:?} should parse successfully: {err}"))
    }

    pub(super) fn endpoint_for(argv: &[&str]) -> Result<EndpointDescriptor, CliError> {
        parse_args(argv).endpoint(None, &BTreeMap::new())
    }
}

use test_helpers::{endpoint_for, parse_args};

#[test]
fn stdio_command_follows_the_subcommand() {
    let args = parse_args(&["mcp-probe", "tools", "--stdio", "python", "server.py"]);
    assert_eq!(args.command, Some(Commands::Tools));
    let endpoint = args.endpoint(None, &BTreeMap::new()).unwrap();
    assert_eq!(
        endpoint,
        EndpointDescriptor::stdio("python", vec!["server.py".to_string()])
    );
}

#[test]
fn call_parses_tool_and_args() {
    let args = parse_args(&[
        "mcp-probe",
        "call",
        "echo",
        "--args",
        r#"{"text": "hi"}"#,
        "--http",
        "http://127.0.0.1:9000/mcp",
    ]);
    let Some(Commands::Call { tool, args: raw }) = &args.command else {
        panic!("expected call subcommand");
    };
    assert_eq!(tool, "echo");
    let parsed = parse_json_object(raw.as_deref()).unwrap().unwrap();
    assert_eq!(parsed["text"], "hi");
}

#[test]
fn invalid_json_args_are_usage_errors() {
    for raw in ["{oops", "[1, 2]"] {
        let err = parse_json_object(Some(raw)).unwrap_err();
        assert_eq!(err.exit_code(), EXIT_INVALID, "{raw}");
    }
    let err = prompt_arguments(Some(r#"{"nested": {"a": 1}}"#)).unwrap_err();
    assert!(matches!(err, CliError::Usage(_)));
    let args = prompt_arguments(Some(r#"{"city": "Oslo", "days": 3}"#)).unwrap();
    assert_eq!(args["days"], "3");
}

#[test]
fn connection_flags_are_mutually_exclusive() {
    let err = endpoint_for(&[
        "mcp-probe",
        "ping",
        "--sse",
        "http://localhost/sse",
        "--uv",
        "weather",
    ])
    .unwrap_err();
    assert!(err.to_string().contains("mutually exclusive"));
}

#[test]
fn missing_endpoint_falls_back_to_config() {
    let args = parse_args(&["mcp-probe", "ping"]);
    assert!(matches!(
        args.endpoint(None, &BTreeMap::new()),
        Err(CliError::Usage(_))
    ));

    let configured = EndpointDescriptor::stdio("node", vec!["server.js".to_string()]);
    let endpoint = args
        .endpoint(Some(configured.clone()), &BTreeMap::new())
        .unwrap();
    assert_eq!(endpoint, configured);
}

#[test]
fn uv_modifiers_and_extra_args_are_applied() {
    let endpoint = endpoint_for(&[
        "mcp-probe",
        "tools",
        "--uv",
        "weather-mcp",
        "--python",
        "3.12",
        "--with",
        "httpx",
        "--extra-arg=--units",
        "--extra-arg",
        "metric",
        "--env",
        "API_KEY=secret",
    ])
    .unwrap();
    assert_eq!(
        endpoint,
        EndpointDescriptor::UvInstalled {
            package: "weather-mcp".to_string(),
            python: Some("3.12".to_string()),
            with: vec!["httpx".to_string()],
            args: vec!["--units".to_string(), "metric".to_string()],
            env: BTreeMap::from([("API_KEY".to_string(), "secret".to_string())]),
        }
    );
}

#[test]
fn http_flags_take_headers_and_query_args() {
    let endpoint = endpoint_for(&[
        "mcp-probe",
        "tools",
        "--http",
        "https://mcp.example.com/mcp",
        "--header",
        "Authorization=Bearer abc",
        "--extra-arg",
        "tenant=acme",
    ])
    .unwrap();
    match endpoint {
        EndpointDescriptor::StreamableHttp { url, headers, .. } => {
            assert_eq!(url, "https://mcp.example.com/mcp?tenant=acme");
            assert_eq!(headers["Authorization"], "Bearer abc");
        }
        other => panic!("unexpected endpoint {other:?}"),
    }
}

#[test]
fn modifiers_for_other_transports_are_rejected() {
    let err = endpoint_for(&[
        "mcp-probe",
        "tools",
        "--sse",
        "http://localhost/sse",
        "--python",
        "3.12",
    ])
    .unwrap_err();
    assert_eq!(err.exit_code(), EXIT_INVALID);

    let err =
        endpoint_for(&["mcp-probe", "tools", "--stdio", "srv", "--header", "A=b"]).unwrap_err();
    assert!(err.to_string().contains("header"));
}

#[test]
fn env_file_entries_do_not_override_explicit_env() {
    let args = parse_args(&["mcp-probe", "tools", "--stdio", "srv", "--env", "TOKEN=flag"]);
    let env_file = BTreeMap::from([
        ("TOKEN".to_string(), "file".to_string()),
        ("REGION".to_string(), "eu".to_string()),
    ]);
    let EndpointDescriptor::Stdio { env, .. } = args.endpoint(None, &env_file).unwrap() else {
        panic!("expected stdio");
    };
    assert_eq!(env["TOKEN"], "flag");
    assert_eq!(env["REGION"], "eu");
}

#[test]
fn uv_local_takes_path_and_entry() {
    let endpoint = endpoint_for(&[
        "mcp-probe",
        "connect",
        "--uv-local",
        "./server",
        "serve",
    ])
    .unwrap();
    assert_eq!(endpoint.kind(), TransportKind::UvLocal);
}

#[test]
fn exit_codes_follow_error_categories() {
    assert_eq!(
        CliError::from(McpError::Connection("refused".to_string())).exit_code(),
        EXIT_CONNECTION
    );
    assert_eq!(
        CliError::from(McpError::HandshakeRejected("version".to_string())).exit_code(),
        EXIT_PROTOCOL
    );
    assert_eq!(
        CliError::from(McpError::Cancelled("closed".to_string())).exit_code(),
        EXIT_PROTOCOL
    );
    assert_eq!(
        CliError::from(McpError::Configuration("bad url".to_string())).exit_code(),
        EXIT_INVALID
    );
    assert_eq!(CliError::ToolFailed("echo".to_string()).exit_code(), EXIT_PROTOCOL);
}

#[test]
fn global_flags_feed_the_config_layer() {
    let args = parse_args(&[
        "mcp-probe",
        "ping",
        "--timeout",
        "9",
        "--log-level",
        "debug",
        "--output",
        "json",
        "--summary",
    ]);
    let overrides = args.config_overrides();
    assert_eq!(overrides.request_timeout_secs, Some(9));
    assert_eq!(overrides.log.level.as_deref(), Some("debug"));
    assert_eq!(args.output, OutputFormat::Json);
    assert!(args.summary);
}
