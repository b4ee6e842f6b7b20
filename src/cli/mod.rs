//! Command-line interface parsing and handling
//!
//! Every invocation builds one session, runs one command against it, closes
//! it, and maps the outcome to an exit code.

pub mod render;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use crate::core::config::env::{process_env_overrides, resolve_env_file};
use crate::core::config::{ClientConfig, ConfigError};
use crate::mcp::client::{McpSession, Root, StaticRoots, StaticSampling};
use crate::mcp::endpoint::EndpointDescriptor;
use crate::mcp::error::{ErrorCategory, McpError};
use crate::utils::logging::init_tracing;
use render::Renderer;

pub const EXIT_OK: u8 = 0;
pub const EXIT_LOCAL_FAILURE: u8 = 1;
pub const EXIT_INVALID: u8 = 2;
pub const EXIT_CONNECTION: u8 = 3;
pub const EXIT_PROTOCOL: u8 = 4;

#[derive(Parser, Debug)]
#[command(name = "mcp-probe", version)]
#[command(about = "Connect to a Model Context Protocol server and exercise it")]
#[command(
    long_about = "mcp-probe opens one MCP session over stdio, SSE, streamable HTTP or a uv \
managed package, performs the initialize handshake, runs a single command and prints the \
result.\n\n\
Put the subcommand first when using --stdio, since the server command takes every \
following value:\n\
  mcp-probe tools --stdio python server.py\n\n\
Exit codes:\n\
  0  success\n\
  1  local failure (e.g. writing the exported log)\n\
  2  invalid invocation or configuration\n\
  3  connection failure\n\
  4  protocol or call failure"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Configuration file (defaults to config.toml in the user config directory)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// .env file merged into the server environment (defaults to ./.env)
    #[arg(long, global = true, value_name = "PATH")]
    pub env_file: Option<PathBuf>,

    /// Log filter, e.g. "debug" or "mcp_probe=trace"
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Per-request timeout in seconds
    #[arg(long, global = true, value_name = "SECS")]
    pub timeout: Option<u64>,

    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    pub output: OutputFormat,

    /// Write the protocol log as JSON after the command finishes
    #[arg(long, global = true, value_name = "PATH")]
    pub export_log: Option<PathBuf>,

    /// Print a per-method summary of the exchange to stderr
    #[arg(long, global = true)]
    pub summary: bool,

    /// Spawn a server and talk over its stdin/stdout
    #[arg(long, global = true, num_args = 1.., value_names = ["CMD", "ARGS"])]
    pub stdio: Option<Vec<String>>,

    /// Connect to an SSE endpoint
    #[arg(long, global = true, value_name = "URL")]
    pub sse: Option<String>,

    /// Connect to a streamable HTTP endpoint
    #[arg(long, global = true, value_name = "URL")]
    pub http: Option<String>,

    /// Run an installed package with `uv run`
    #[arg(long, global = true, value_name = "PACKAGE")]
    pub uv: Option<String>,

    /// Run a local project with `uvx --from PATH ENTRY`
    #[arg(long, global = true, num_args = 2, value_names = ["PATH", "ENTRY"])]
    pub uv_local: Option<Vec<String>>,

    /// Python version for uv endpoints
    #[arg(long, global = true, value_name = "VERSION")]
    pub python: Option<String>,

    /// Extra package for uv endpoints (repeatable)
    #[arg(long = "with", global = true, value_name = "PACKAGE")]
    pub with_packages: Vec<String>,

    /// HTTP header for SSE/HTTP endpoints (repeatable)
    #[arg(long, global = true, value_name = "K=V")]
    pub header: Vec<String>,

    /// Environment variable for the server process (repeatable)
    #[arg(long, global = true, value_name = "K=V")]
    pub env: Vec<String>,

    /// Working directory for a stdio server
    #[arg(long, global = true, value_name = "DIR")]
    pub cwd: Option<PathBuf>,

    /// Appended verbatim: server argument, or query parameter for URLs (repeatable)
    #[arg(long, global = true, value_name = "ARG", allow_hyphen_values = true)]
    pub extra_arg: Vec<String>,

    /// Answer sampling requests with this fixed text
    #[arg(long, global = true, value_name = "TEXT")]
    pub sampling_text: Option<String>,

    /// Root offered to the server (repeatable)
    #[arg(long, global = true, value_name = "URI")]
    pub root: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Show server info, capabilities and instructions (default)
    Connect,
    /// Measure a ping round trip
    Ping,
    /// List tools
    Tools,
    /// Call a tool
    Call {
        tool: String,
        /// Tool arguments as a JSON object
        #[arg(long, value_name = "JSON")]
        args: Option<String>,
    },
    /// List resources
    Resources,
    /// List resource templates
    Templates,
    /// Read a resource
    Read { uri: String },
    /// List prompts
    Prompts,
    /// Render a prompt
    Prompt {
        name: String,
        /// Prompt arguments as a JSON object of strings
        #[arg(long, value_name = "JSON")]
        args: Option<String>,
    },
    /// Print the server instructions
    Instructions,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("{0}")]
    Usage(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Mcp(#[from] McpError),

    #[error("tool {0} reported an error")]
    ToolFailed(String),

    #[error("{0}")]
    Local(String),
}

impl CliError {
    pub fn exit_code(&self) -> u8 {
        match self {
            CliError::Usage(_) | CliError::Config(_) => EXIT_INVALID,
            CliError::Mcp(err) => match err.category() {
                ErrorCategory::Connection => EXIT_CONNECTION,
                ErrorCategory::Configuration => EXIT_INVALID,
                ErrorCategory::Protocol | ErrorCategory::Call => EXIT_PROTOCOL,
            },
            CliError::ToolFailed(_) => EXIT_PROTOCOL,
            CliError::Local(_) => EXIT_LOCAL_FAILURE,
        }
    }
}

fn parse_pairs(flag: &str, values: &[String]) -> Result<BTreeMap<String, String>, CliError> {
    values
        .iter()
        .map(|item| match item.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                Ok((key.trim().to_string(), value.to_string()))
            }
            _ => Err(CliError::Usage(format!(
                "--{flag} expects KEY=VALUE, got {item:?}"
            ))),
        })
        .collect()
}

/// Parses a `--args` value into a JSON object.
pub fn parse_json_object(raw: Option<&str>) -> Result<Option<Map<String, Value>>, CliError> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(Some(map)),
        Ok(_) => Err(CliError::Usage("--args must be a JSON object".to_string())),
        Err(err) => Err(CliError::Usage(format!("--args is not valid JSON: {err}"))),
    }
}

/// Prompt arguments are strings; other scalars are stringified.
pub fn prompt_arguments(raw: Option<&str>) -> Result<BTreeMap<String, String>, CliError> {
    let Some(map) = parse_json_object(raw)? else {
        return Ok(BTreeMap::new());
    };
    map.into_iter()
        .map(|(key, value)| match value {
            Value::String(text) => Ok((key, text)),
            Value::Number(_) | Value::Bool(_) => Ok((key, value.to_string())),
            _ => Err(CliError::Usage(format!(
                "prompt argument {key} must be a string"
            ))),
        })
        .collect()
}

impl Args {
    /// Config layer contributed by command-line flags.
    pub fn config_overrides(&self) -> ClientConfig {
        let mut config = ClientConfig {
            request_timeout_secs: self.timeout,
            ..Default::default()
        };
        config.log.level = self.log_level.clone();
        config
    }

    /// Picks the endpoint from the connection flags, falling back to the
    /// configured one, and applies the modifier flags.
    pub fn endpoint(
        &self,
        configured: Option<EndpointDescriptor>,
        env_file: &BTreeMap<String, String>,
    ) -> Result<EndpointDescriptor, CliError> {
        let chosen = [
            self.stdio.is_some(),
            self.sse.is_some(),
            self.http.is_some(),
            self.uv.is_some(),
            self.uv_local.is_some(),
        ]
        .into_iter()
        .filter(|set| *set)
        .count();
        if chosen > 1 {
            return Err(CliError::Usage(
                "--stdio, --sse, --http, --uv and --uv-local are mutually exclusive".to_string(),
            ));
        }

        let mut descriptor = if let Some(command) = &self.stdio {
            let (program, args) = command
                .split_first()
                .ok_or_else(|| CliError::Usage("--stdio needs a command".to_string()))?;
            EndpointDescriptor::stdio(program.clone(), args.to_vec())
        } else if let Some(url) = &self.sse {
            EndpointDescriptor::Sse {
                url: url.clone(),
                headers: BTreeMap::new(),
                timeout_secs: None,
            }
        } else if let Some(url) = &self.http {
            EndpointDescriptor::StreamableHttp {
                url: url.clone(),
                headers: BTreeMap::new(),
                timeout_secs: None,
            }
        } else if let Some(package) = &self.uv {
            EndpointDescriptor::UvInstalled {
                package: package.clone(),
                python: None,
                with: Vec::new(),
                args: Vec::new(),
                env: BTreeMap::new(),
            }
        } else if let Some([path, entry]) = self.uv_local.as_deref() {
            EndpointDescriptor::UvLocal {
                project_path: PathBuf::from(path),
                entry: entry.clone(),
                python: None,
                with: Vec::new(),
                args: Vec::new(),
                env: BTreeMap::new(),
            }
        } else if let Some(configured) = configured {
            configured
        } else {
            return Err(CliError::Usage(
                "no server given: use --stdio, --sse, --http, --uv, --uv-local or an [endpoint] config table"
                    .to_string(),
            ));
        };

        self.apply_modifiers(&mut descriptor)?;
        let descriptor = descriptor.with_extra_args(&self.extra_arg)?;
        Ok(descriptor.with_env(env_file))
    }

    fn apply_modifiers(&self, descriptor: &mut EndpointDescriptor) -> Result<(), CliError> {
        let headers = parse_pairs("header", &self.header)?;
        let env = parse_pairs("env", &self.env)?;
        let kind = descriptor.kind();
        let misplaced = |flag: &str| {
            CliError::Usage(format!("--{flag} does not apply to {kind} endpoints"))
        };

        match descriptor {
            EndpointDescriptor::Stdio {
                env: target_env,
                cwd,
                ..
            } => {
                if self.python.is_some() || !self.with_packages.is_empty() {
                    return Err(misplaced("python/--with"));
                }
                if !headers.is_empty() {
                    return Err(misplaced("header"));
                }
                target_env.extend(env);
                if let Some(dir) = &self.cwd {
                    *cwd = Some(dir.clone());
                }
            }
            EndpointDescriptor::Sse {
                headers: target, ..
            }
            | EndpointDescriptor::StreamableHttp {
                headers: target, ..
            } => {
                if self.python.is_some() || !self.with_packages.is_empty() {
                    return Err(misplaced("python/--with"));
                }
                if !env.is_empty() || self.cwd.is_some() {
                    return Err(misplaced("env/--cwd"));
                }
                target.extend(headers);
            }
            EndpointDescriptor::UvInstalled {
                python,
                with,
                env: target_env,
                ..
            }
            | EndpointDescriptor::UvLocal {
                python,
                with,
                env: target_env,
                ..
            } => {
                if !headers.is_empty() {
                    return Err(misplaced("header"));
                }
                if self.cwd.is_some() {
                    return Err(misplaced("cwd"));
                }
                if let Some(version) = &self.python {
                    *python = Some(version.clone());
                }
                with.extend(self.with_packages.iter().cloned());
                target_env.extend(env);
            }
        }
        Ok(())
    }
}

pub fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let _ = err.print();
            return if err.use_stderr() {
                ExitCode::from(EXIT_INVALID)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("❌ Failed to start async runtime: {err}");
            return ExitCode::from(EXIT_LOCAL_FAILURE);
        }
    };

    match runtime.block_on(run(args)) {
        Ok(()) => ExitCode::from(EXIT_OK),
        Err(err) => {
            eprintln!("❌ {err}");
            ExitCode::from(err.exit_code())
        }
    }
}

pub async fn run(args: Args) -> Result<(), CliError> {
    let mut config = ClientConfig::load(args.config.as_deref())?;
    config.merge(process_env_overrides()?);
    config.merge(args.config_overrides());
    config.validate()?;

    init_tracing(config.log_level(), config.log.log_file.as_deref())
        .map_err(|err| CliError::Usage(err.to_string()))?;

    let command = args.command.clone().unwrap_or(Commands::Connect);
    // Reject bad JSON before any server is started.
    match &command {
        Commands::Call { args: raw, .. } => {
            parse_json_object(raw.as_deref())?;
        }
        Commands::Prompt { args: raw, .. } => {
            prompt_arguments(raw.as_deref())?;
        }
        _ => {}
    }

    let env_file = resolve_env_file(args.env_file.as_deref())?;
    let descriptor = args.endpoint(config.endpoint.clone(), &env_file)?;
    let session = McpSession::new(&descriptor, config.session_options())?;
    if let Some(text) = &args.sampling_text {
        session.set_sampling_handler(Arc::new(StaticSampling::new(text.clone())));
    }
    if !args.root.is_empty() {
        let roots = args.root.iter().map(|uri| Root::new(uri.clone())).collect();
        session.set_roots_handler(Arc::new(StaticRoots(roots)));
    }

    let renderer = Renderer::new(args.output);
    let outcome = match session.connect().await {
        Ok(details) => execute(&session, &command, &details, &renderer).await,
        Err(err) => Err(err.into()),
    };

    if let Err(err) = session.close().await {
        debug!(error = %err, "Session close reported an error");
    }
    if let Some(path) = &args.export_log {
        session
            .protocol_log()
            .export_to_path(path)
            .map_err(|err| {
                CliError::Local(format!("failed to export log to {}: {err}", path.display()))
            })?;
    }
    if args.summary {
        eprintln!("{}", session.protocol_log().summary().render());
    }
    outcome
}

async fn execute(
    session: &McpSession,
    command: &Commands,
    details: &crate::mcp::client::ServerDetails,
    renderer: &Renderer,
) -> Result<(), CliError> {
    let output = match command {
        Commands::Connect => renderer.server_details(details),
        Commands::Ping => renderer.ping(session.ping().await?),
        Commands::Tools => renderer.tools(&session.list_tools().await?),
        Commands::Call { tool, args } => {
            let arguments = parse_json_object(args.as_deref())?;
            let result = session.call_tool(tool, arguments).await?;
            let output = renderer.tool_result(&result);
            if render::is_tool_error(&result) {
                println!("{output}");
                return Err(CliError::ToolFailed(tool.clone()));
            }
            output
        }
        Commands::Resources => renderer.resources(&session.list_resources().await?),
        Commands::Templates => renderer.templates(&session.list_resource_templates().await?),
        Commands::Read { uri } => renderer.resource_contents(&session.read_resource(uri).await?),
        Commands::Prompts => renderer.prompts(&session.list_prompts().await?),
        Commands::Prompt { name, args } => {
            let arguments = prompt_arguments(args.as_deref())?;
            renderer.prompt(&session.get_prompt(name, &arguments).await?)
        }
        Commands::Instructions => renderer.instructions(session.instructions()?.as_deref()),
    };
    println!("{output}");
    Ok(())
}

#[cfg(test)]
mod tests;
