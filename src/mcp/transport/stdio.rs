use super::{EventChannel, Transport, TransportEvent};
use crate::mcp::endpoint::TransportKind;
use crate::mcp::error::McpError;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Upper bound on one stdout line. Longer lines are discarded as malformed.
pub const MAX_LINE_BYTES: usize = 16 * 1024 * 1024;
/// How long `close` waits for the child to exit after stdin is closed.
pub const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Fully resolved command line for a server subprocess.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubprocessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
}

pub struct StdioTransport {
    spec: SubprocessSpec,
    kind: TransportKind,
    events: EventChannel,
    stdin: Mutex<Option<ChildStdin>>,
    kill: CancellationToken,
    exit_rx: std::sync::Mutex<Option<watch::Receiver<Option<String>>>>,
}

impl StdioTransport {
    pub fn new(spec: SubprocessSpec) -> Self {
        Self::with_kind(spec, TransportKind::Stdio)
    }

    pub(crate) fn with_kind(spec: SubprocessSpec, kind: TransportKind) -> Self {
        Self {
            spec,
            kind,
            events: EventChannel::new(),
            stdin: Mutex::new(None),
            kill: CancellationToken::new(),
            exit_rx: std::sync::Mutex::new(None),
        }
    }

    fn exit_receiver(&self) -> Option<watch::Receiver<Option<String>>> {
        self.exit_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl Transport for StdioTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn open(&self) -> Result<(), McpError> {
        let spec = &self.spec;
        debug!(command = %spec.program, args = ?spec.args, "Starting MCP server subprocess");

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn().map_err(|err| {
            McpError::Connection(format!("failed to start {}: {err}", spec.program))
        })?;
        let missing = |pipe: &str| McpError::Connection(format!("unable to capture {pipe}"));
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;
        info!(pid = ?child.id(), command = %spec.program, "MCP server subprocess started");

        *self.stdin.lock().await = Some(stdin);

        let (exit_tx, exit_rx) = watch::channel(None);
        *self
            .exit_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(exit_rx.clone());

        let kill = self.kill.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill.cancelled() => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            let description = match status {
                Ok(status) => match status.code() {
                    Some(code) => format!("server process exited with status {code}"),
                    None => "server process terminated by signal".to_string(),
                },
                Err(err) => format!("failed to collect server exit status: {err}"),
            };
            debug!(status = %description, "MCP server subprocess finished");
            let _ = exit_tx.send(Some(description));
        });

        spawn_stdout_reader(stdout, self.events.sender(), exit_rx);
        spawn_stderr_reader(stderr, self.events.sender());
        Ok(())
    }

    fn receive(&self) -> Result<mpsc::UnboundedReceiver<TransportEvent>, McpError> {
        self.events.take()
    }

    async fn send(&self, frame: String) -> Result<(), McpError> {
        let mut guard = self.stdin.lock().await;
        let Some(stdin) = guard.as_mut() else {
            return Err(McpError::ConnectionLost(
                "server stdin is closed".to_string(),
            ));
        };
        let write_failed = |err: std::io::Error| {
            McpError::ConnectionLost(format!("write to server failed: {err}"))
        };
        stdin.write_all(frame.as_bytes()).await.map_err(write_failed)?;
        stdin.write_all(b"\n").await.map_err(write_failed)?;
        stdin.flush().await.map_err(write_failed)?;
        Ok(())
    }

    async fn close(&self) -> Result<(), McpError> {
        // Closing stdin asks a well-behaved server to exit on its own.
        drop(self.stdin.lock().await.take());

        let Some(mut exit_rx) = self.exit_receiver() else {
            return Ok(());
        };
        let exited = tokio::time::timeout(CLOSE_GRACE, exit_rx.wait_for(Option::is_some))
            .await
            .is_ok();
        if !exited {
            warn!(
                command = %self.spec.program,
                "MCP server did not exit after stdin closed; killing"
            );
            self.kill.cancel();
            let _ = exit_rx.wait_for(Option::is_some).await;
        }
        Ok(())
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        self.kill.cancel();
    }
}

fn spawn_stdout_reader(
    stdout: tokio::process::ChildStdout,
    tx: mpsc::UnboundedSender<TransportEvent>,
    mut exit_rx: watch::Receiver<Option<String>>,
) {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stdout);
        let mut line = Vec::new();
        let reason = loop {
            line.clear();
            match read_bounded_line(&mut reader, &mut line, MAX_LINE_BYTES).await {
                Ok(LineRead::Line) => {
                    if let Some(event) = line_event(std::mem::take(&mut line)) {
                        let _ = tx.send(event);
                    }
                }
                Ok(LineRead::Oversized(len)) => {
                    warn!(bytes = len, "Discarding oversized MCP stdout line");
                    let _ = tx.send(TransportEvent::Malformed {
                        raw: String::new(),
                        reason: format!(
                            "line of {len} bytes exceeds {MAX_LINE_BYTES} byte limit"
                        ),
                    });
                }
                Ok(LineRead::Eof) => {
                    let status =
                        tokio::time::timeout(CLOSE_GRACE, exit_rx.wait_for(Option::is_some))
                            .await
                            .ok()
                            .and_then(|waited| waited.ok().and_then(|status| (*status).clone()));
                    break status.unwrap_or_else(|| "server closed stdout".to_string());
                }
                Err(err) => break format!("failed reading server stdout: {err}"),
            }
        };
        let _ = tx.send(TransportEvent::Closed { reason });
    });
}

/// Turns one stdout line into a frame, or a malformed event when the bytes
/// are not UTF-8. Blank lines produce nothing.
fn line_event(line: Vec<u8>) -> Option<TransportEvent> {
    match String::from_utf8(line) {
        Ok(text) => {
            let text = text.trim();
            (!text.is_empty()).then(|| TransportEvent::Frame(text.to_string()))
        }
        Err(err) => {
            warn!(error = %err.utf8_error(), "Discarding non-UTF-8 MCP stdout line");
            Some(TransportEvent::Malformed {
                raw: String::from_utf8_lossy(err.as_bytes()).trim().to_string(),
                reason: format!("line is not valid UTF-8: {}", err.utf8_error()),
            })
        }
    }
}

fn spawn_stderr_reader(
    stderr: tokio::process::ChildStderr,
    tx: mpsc::UnboundedSender<TransportEvent>,
) {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            debug!(line = %line, "MCP server stderr");
            let _ = tx.send(TransportEvent::Diagnostic(line));
        }
    });
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum LineRead {
    Line,
    /// A line longer than the limit was skipped; carries its length.
    Oversized(usize),
    Eof,
}

/// Reads up to the next `\n` without ever buffering more than `limit` bytes.
pub(crate) async fn read_bounded_line<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    line: &mut Vec<u8>,
    limit: usize,
) -> std::io::Result<LineRead> {
    let mut discarded = 0usize;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(if discarded > 0 {
                LineRead::Oversized(discarded)
            } else if line.is_empty() {
                LineRead::Eof
            } else {
                LineRead::Line
            });
        }

        let (consumed, done) = match memchr::memchr(b'\n', available) {
            Some(pos) => (pos + 1, Some(pos)),
            None => (available.len(), None),
        };
        let chunk = &available[..done.unwrap_or(consumed)];
        if discarded > 0 || line.len() + chunk.len() > limit {
            discarded += line.len() + chunk.len();
            line.clear();
        } else {
            line.extend_from_slice(chunk);
        }
        reader.consume(consumed);

        if done.is_some() {
            return Ok(if discarded > 0 {
                LineRead::Oversized(discarded)
            } else {
                LineRead::Line
            });
        }
    }
}
