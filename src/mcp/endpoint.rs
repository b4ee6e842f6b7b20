use crate::mcp::error::McpError;
use reqwest::header::{HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// Default bound on connection establishment for HTTP endpoints.
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// Where and how to reach an MCP server.
///
/// Descriptors are plain data; [`EndpointDescriptor::validate`] catches
/// configuration mistakes before any transport is opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "kebab-case")]
pub enum EndpointDescriptor {
    /// Spawn a subprocess and speak line-delimited JSON over its pipes.
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: BTreeMap<String, String>,
        #[serde(default)]
        cwd: Option<PathBuf>,
    },
    /// Long-lived event stream plus a POST endpoint announced by the server.
    Sse {
        url: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
    /// One POST per outbound frame.
    #[serde(rename = "http")]
    StreamableHttp {
        url: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
    /// A published package started through `uv run`.
    #[serde(rename = "uv")]
    UvInstalled {
        package: String,
        #[serde(default)]
        python: Option<String>,
        #[serde(default)]
        with: Vec<String>,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: BTreeMap<String, String>,
    },
    /// A local project started through `uvx --from <path>`.
    #[serde(rename = "uv-local")]
    UvLocal {
        project_path: PathBuf,
        entry: String,
        #[serde(default)]
        python: Option<String>,
        #[serde(default)]
        with: Vec<String>,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: BTreeMap<String, String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Stdio,
    Sse,
    StreamableHttp,
    UvInstalled,
    UvLocal,
}

impl TransportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::Stdio => "stdio",
            TransportKind::Sse => "sse",
            TransportKind::StreamableHttp => "http",
            TransportKind::UvInstalled => "uv",
            TransportKind::UvLocal => "uv-local",
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl EndpointDescriptor {
    pub fn stdio(command: impl Into<String>, args: Vec<String>) -> Self {
        EndpointDescriptor::Stdio {
            command: command.into(),
            args,
            env: BTreeMap::new(),
            cwd: None,
        }
    }

    pub fn kind(&self) -> TransportKind {
        match self {
            EndpointDescriptor::Stdio { .. } => TransportKind::Stdio,
            EndpointDescriptor::Sse { .. } => TransportKind::Sse,
            EndpointDescriptor::StreamableHttp { .. } => TransportKind::StreamableHttp,
            EndpointDescriptor::UvInstalled { .. } => TransportKind::UvInstalled,
            EndpointDescriptor::UvLocal { .. } => TransportKind::UvLocal,
        }
    }

    /// Connection bound for HTTP kinds; `None` for subprocess kinds.
    pub fn http_timeout(&self) -> Option<Duration> {
        match self {
            EndpointDescriptor::Sse { timeout_secs, .. }
            | EndpointDescriptor::StreamableHttp { timeout_secs, .. } => Some(
                Duration::from_secs(timeout_secs.unwrap_or(DEFAULT_HTTP_TIMEOUT_SECS)),
            ),
            _ => None,
        }
    }

    /// Short human label used in logs and CLI output.
    pub fn display_target(&self) -> String {
        match self {
            EndpointDescriptor::Stdio { command, args, .. } => {
                std::iter::once(command.as_str())
                    .chain(args.iter().map(String::as_str))
                    .collect::<Vec<_>>()
                    .join(" ")
            }
            EndpointDescriptor::Sse { url, .. }
            | EndpointDescriptor::StreamableHttp { url, .. } => {
                url.clone()
            }
            EndpointDescriptor::UvInstalled { package, .. } => format!("uv run {package}"),
            EndpointDescriptor::UvLocal {
                project_path, entry, ..
            } => format!("uvx --from {} {entry}", project_path.display()),
        }
    }

    pub fn validate(&self) -> Result<(), McpError> {
        match self {
            EndpointDescriptor::Stdio { command, .. } => {
                if command.trim().is_empty() {
                    return Err(McpError::Configuration(
                        "stdio endpoint requires a command".to_string(),
                    ));
                }
            }
            EndpointDescriptor::Sse { url, headers, .. }
            | EndpointDescriptor::StreamableHttp { url, headers, .. } => {
                parse_http_url(url)?;
                for (name, value) in headers {
                    validate_header(name, value)?;
                }
            }
            EndpointDescriptor::UvInstalled {
                package, python, ..
            } => {
                if package.trim().is_empty() {
                    return Err(McpError::Configuration(
                        "uv endpoint requires a package name".to_string(),
                    ));
                }
                validate_python_version(python.as_deref())?;
            }
            EndpointDescriptor::UvLocal {
                project_path,
                entry,
                python,
                ..
            } => {
                if project_path.as_os_str().is_empty() {
                    return Err(McpError::Configuration(
                        "uv-local endpoint requires a project path".to_string(),
                    ));
                }
                if entry.trim().is_empty() {
                    return Err(McpError::Configuration(
                        "uv-local endpoint requires an entry point".to_string(),
                    ));
                }
                validate_python_version(python.as_deref())?;
            }
        }
        Ok(())
    }

    /// Appends extra arguments verbatim: positional arguments for subprocess
    /// kinds, query parameters (`key=value` or bare `key`) for HTTP kinds.
    pub fn with_extra_args(mut self, extra: &[String]) -> Result<Self, McpError> {
        if extra.is_empty() {
            return Ok(self);
        }
        match &mut self {
            EndpointDescriptor::Stdio { args, .. }
            | EndpointDescriptor::UvInstalled { args, .. }
            | EndpointDescriptor::UvLocal { args, .. } => {
                args.extend(extra.iter().cloned());
            }
            EndpointDescriptor::Sse { url, .. }
            | EndpointDescriptor::StreamableHttp { url, .. } => {
                let mut parsed = parse_http_url(url)?;
                {
                    let mut pairs = parsed.query_pairs_mut();
                    for item in extra {
                        match item.split_once('=') {
                            Some((key, value)) => pairs.append_pair(key, value),
                            None => pairs.append_key_only(item),
                        };
                    }
                }
                *url = parsed.to_string();
            }
        }
        Ok(self)
    }

    /// Merges environment overrides into subprocess kinds. Entries already set
    /// on the descriptor win. HTTP kinds ignore the overrides.
    pub fn with_env(mut self, overrides: &BTreeMap<String, String>) -> Self {
        match &mut self {
            EndpointDescriptor::Stdio { env, .. }
            | EndpointDescriptor::UvInstalled { env, .. }
            | EndpointDescriptor::UvLocal { env, .. } => {
                for (key, value) in overrides {
                    env.entry(key.clone()).or_insert_with(|| value.clone());
                }
            }
            EndpointDescriptor::Sse { .. } | EndpointDescriptor::StreamableHttp { .. } => {}
        }
        self
    }
}

pub(crate) fn parse_http_url(raw: &str) -> Result<Url, McpError> {
    let url = Url::parse(raw.trim())
        .map_err(|err| McpError::Configuration(format!("invalid URL {raw:?}: {err}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(McpError::Configuration(format!(
            "unsupported URL scheme {other:?} (expected http or https)"
        ))),
    }
}

/// Accepts `3`, `3.12` or `3.12.1`.
fn validate_python_version(version: Option<&str>) -> Result<(), McpError> {
    let Some(version) = version else {
        return Ok(());
    };
    let parts: Vec<&str> = version.split('.').collect();
    let well_formed = (1..=3).contains(&parts.len())
        && parts
            .iter()
            .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_digit()));
    if well_formed {
        Ok(())
    } else {
        Err(McpError::Configuration(format!(
            "malformed python version {version:?}"
        )))
    }
}

/// Header names and values must be sendable as-is.
fn validate_header(name: &str, value: &str) -> Result<(), McpError> {
    HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
        McpError::Configuration(format!("invalid header name {name:?}"))
    })?;
    HeaderValue::from_str(value).map_err(|_| {
        McpError::Configuration(format!("invalid value for header {name}"))
    })?;
    Ok(())
}
