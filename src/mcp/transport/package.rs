//! Servers started through the `uv` package runner.
//!
//! Resolution (finding the runner, checking the project path) happens in
//! `open` so a bad setup fails before any protocol traffic; afterwards the
//! transport is a plain subprocess.

use super::stdio::{StdioTransport, SubprocessSpec};
use super::{Transport, TransportEvent};
use crate::mcp::endpoint::{EndpointDescriptor, TransportKind};
use crate::mcp::error::McpError;
use async_trait::async_trait;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tokio::sync::mpsc;
use tracing::debug;

pub const UV_PROGRAM: &str = "uv";
pub const UVX_PROGRAM: &str = "uvx";

pub struct PackageTransport {
    descriptor: EndpointDescriptor,
    inner: OnceLock<StdioTransport>,
}

impl PackageTransport {
    pub fn new(descriptor: EndpointDescriptor) -> Self {
        Self {
            descriptor,
            inner: OnceLock::new(),
        }
    }

    fn inner(&self) -> Result<&StdioTransport, McpError> {
        self.inner.get().ok_or_else(|| {
            McpError::ConnectionLost("package server has not been started".to_string())
        })
    }
}

/// Builds the runner command line. `locate` maps a program name to its path.
pub fn resolve_command(
    descriptor: &EndpointDescriptor,
    locate: impl Fn(&str) -> Option<PathBuf>,
) -> Result<SubprocessSpec, McpError> {
    let (runner, mut command, extra, env) = match descriptor {
        EndpointDescriptor::UvInstalled {
            package,
            python,
            with,
            args,
            env,
        } => {
            let mut command = vec!["run".to_string()];
            push_runner_options(&mut command, python.as_deref(), with);
            command.push(package.clone());
            (UV_PROGRAM, command, args, env.clone())
        }
        EndpointDescriptor::UvLocal {
            project_path,
            entry,
            python,
            with,
            args,
            env,
        } => {
            if !project_path.exists() {
                return Err(McpError::Connection(format!(
                    "project path {} does not exist",
                    project_path.display()
                )));
            }
            let mut command = Vec::new();
            push_runner_options(&mut command, python.as_deref(), with);
            command.push("--from".to_string());
            command.push(project_path.display().to_string());
            command.push(entry.clone());
            (UVX_PROGRAM, command, args, env.clone())
        }
        other => {
            return Err(McpError::Configuration(format!(
                "{} endpoints are not package resolved",
                other.kind()
            )))
        }
    };

    let program = locate(runner).ok_or_else(|| {
        McpError::Connection(format!("`{runner}` was not found on PATH; install uv first"))
    })?;

    command.extend(extra.iter().cloned());

    Ok(SubprocessSpec {
        program: program.display().to_string(),
        args: command,
        env,
        cwd: None,
    })
}

fn push_runner_options(command: &mut Vec<String>, python: Option<&str>, with: &[String]) {
    if let Some(python) = python {
        command.push("--python".to_string());
        command.push(python.to_string());
    }
    for package in with {
        command.push("--with".to_string());
        command.push(package.clone());
    }
}

/// Searches `PATH` for an executable named `program`.
pub fn find_on_path(program: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    find_in(program, &path)
}

fn find_in(program: &str, path: &OsStr) -> Option<PathBuf> {
    std::env::split_paths(path).find_map(|dir| {
        let candidate = dir.join(program);
        if is_executable(&candidate) {
            return Some(candidate);
        }
        if cfg!(windows) {
            let with_ext = dir.join(format!("{program}.exe"));
            if with_ext.is_file() {
                return Some(with_ext);
            }
        }
        None
    })
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[async_trait]
impl Transport for PackageTransport {
    fn kind(&self) -> TransportKind {
        self.descriptor.kind()
    }

    async fn open(&self) -> Result<(), McpError> {
        let spec = resolve_command(&self.descriptor, find_on_path)?;
        debug!(program = %spec.program, args = ?spec.args, "Resolved package server command");
        let transport = StdioTransport::with_kind(spec, self.descriptor.kind());
        if self.inner.set(transport).is_err() {
            return Err(McpError::Connection(
                "package server already started".to_string(),
            ));
        }
        self.inner()?.open().await
    }

    fn receive(&self) -> Result<mpsc::UnboundedReceiver<TransportEvent>, McpError> {
        self.inner()?.receive()
    }

    async fn send(&self, frame: String) -> Result<(), McpError> {
        self.inner()?.send(frame).await
    }

    async fn close(&self) -> Result<(), McpError> {
        match self.inner.get() {
            Some(inner) => inner.close().await,
            None => Ok(()),
        }
    }
}
