//! Isolated executor for candidate code artifacts.
//!
//! Each execution spawns a fresh interpreter child in a scratch directory
//! with a cleared environment, feeds it one [`ExecutionRequest`] line, and
//! supervises the frame protocol until a `result`, a failure, the deadline,
//! or cancellation. HTTP permits requested by the child are granted through
//! the process [`RateGovernor`], so sandbox-internal fan-out still honors
//! the org-wide budget.

mod protocol;

pub use protocol::{ChildFrame, ExecutionRequest, HostFrame};

use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ErrorKind;
use crate::govern::{RateGovernor, RatePermit};

const HARNESS_SOURCE: &str = include_str!("harness.py");
const STDERR_TAIL_BYTES: usize = 16 * 1024;

/// Progress reported by the artifact, forwarded onto the event stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SandboxProgress {
    pub percent: u8,
    pub message: String,
}

/// Why an execution failed; maps onto the stable error taxonomy.
#[derive(Debug, Error)]
pub enum SandboxFailure {
    #[error("execution exceeded {0:?}")]
    Timeout(Duration),
    #[error("artifact failed: {0}")]
    Runtime(String),
    #[error("rate limited, retry in {wait_seconds}s")]
    RateLimited { wait_seconds: u64 },
    #[error("variable contract violated: {0}")]
    ValidationFailed(String),
    #[error("cancelled")]
    Cancelled,
    #[error("output exceeded {limit} bytes")]
    OversizedOutput { limit: usize },
    #[error("sandbox spawn failed: {0}")]
    Spawn(String),
}

impl SandboxFailure {
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            SandboxFailure::Timeout(_) => ErrorKind::SandboxTimeout,
            SandboxFailure::Runtime(_) | SandboxFailure::Spawn(_) => ErrorKind::SandboxRuntime,
            SandboxFailure::RateLimited { .. } => ErrorKind::RateLimited,
            SandboxFailure::ValidationFailed(_) => ErrorKind::ValidationError,
            SandboxFailure::Cancelled => ErrorKind::Cancelled,
            SandboxFailure::OversizedOutput { .. } => ErrorKind::SandboxOversized,
        }
    }
}

/// Successful execution: the bound `result` plus observability extras.
#[derive(Clone, Debug)]
pub struct SandboxOutcome {
    pub result: serde_json::Value,
    pub execution_ms: u64,
    pub stderr_tail: String,
}

/// Spawns and supervises sandbox children; cheap to clone per process.
#[derive(Clone)]
pub struct SandboxExecutor {
    interpreter: String,
    harness_source: &'static str,
    max_output_bytes: usize,
    governor: Arc<RateGovernor>,
}

impl SandboxExecutor {
    pub fn new(
        interpreter: impl Into<String>,
        max_output_bytes: usize,
        governor: Arc<RateGovernor>,
    ) -> Self {
        Self {
            interpreter: interpreter.into(),
            harness_source: HARNESS_SOURCE,
            max_output_bytes,
            governor,
        }
    }

    /// Swaps the embedded harness; protocol tests drive the executor with a
    /// shell stand-in instead of a Python runtime.
    #[cfg(test)]
    pub(crate) fn with_harness_source(mut self, source: &'static str) -> Self {
        self.harness_source = source;
        self
    }

    /// Runs one artifact to completion under `timeout`. Cancellation is
    /// checked at every frame boundary; the child is killed on any exit
    /// path.
    pub async fn execute(
        &self,
        request: &ExecutionRequest,
        timeout: Duration,
        progress_tx: Option<mpsc::Sender<SandboxProgress>>,
        cancel: &CancellationToken,
    ) -> Result<SandboxOutcome, SandboxFailure> {
        let scratch =
            tempfile::tempdir().map_err(|e| SandboxFailure::Spawn(format!("scratch dir: {e}")))?;
        let harness_path = scratch.path().join("harness");
        std::fs::write(&harness_path, self.harness_source)
            .map_err(|e| SandboxFailure::Spawn(format!("harness write: {e}")))?;

        let mut child = tokio::process::Command::new(&self.interpreter)
            .arg(&harness_path)
            .current_dir(scratch.path())
            .env_clear()
            .env("PATH", std::env::var("PATH").unwrap_or_default())
            .env("HOME", scratch.path())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SandboxFailure::Spawn(format!("{}: {e}", self.interpreter)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| SandboxFailure::Spawn("child stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxFailure::Spawn("child stdout unavailable".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SandboxFailure::Spawn("child stderr unavailable".into()))?;

        let stderr_tail = Arc::new(Mutex::new(Vec::new()));
        let stderr_sink = Arc::clone(&stderr_tail);
        let stderr_task = tokio::spawn(async move {
            let mut reader = BufReader::new(stderr);
            let mut buf = [0u8; 1024];
            while let Ok(n) = reader.read(&mut buf).await {
                if n == 0 {
                    break;
                }
                let mut tail = stderr_sink.lock().unwrap();
                tail.extend_from_slice(&buf[..n]);
                let excess = tail.len().saturating_sub(STDERR_TAIL_BYTES);
                if excess > 0 {
                    tail.drain(..excess);
                }
            }
        });

        let request_line = serde_json::to_string(request)
            .map_err(|e| SandboxFailure::Spawn(format!("request encode: {e}")))?;
        if stdin
            .write_all(format!("{request_line}\n").as_bytes())
            .await
            .is_err()
        {
            let _ = child.kill().await;
            return Err(SandboxFailure::Runtime(
                "child exited before reading the request".into(),
            ));
        }

        let started = tokio::time::Instant::now();
        let result = self
            .supervise(
                &mut child,
                &mut stdin,
                stdout,
                timeout,
                progress_tx,
                cancel,
            )
            .await;
        let _ = child.kill().await;
        let _ = child.wait().await;
        // The pipe is closed now, so the drain task finishes on its own;
        // the timeout only guards a pathological reader stall.
        let _ = tokio::time::timeout(Duration::from_secs(2), stderr_task).await;
        let stderr_tail = String::from_utf8_lossy(&stderr_tail.lock().unwrap()).into_owned();

        match result {
            Ok(value) => Ok(SandboxOutcome {
                result: value,
                execution_ms: started.elapsed().as_millis() as u64,
                stderr_tail,
            }),
            Err(SandboxFailure::Runtime(msg)) if msg.is_empty() => Err(SandboxFailure::Runtime(
                if stderr_tail.is_empty() {
                    "child exited without a result".to_string()
                } else {
                    stderr_tail
                },
            )),
            Err(other) => Err(other),
        }
    }

    async fn supervise(
        &self,
        child: &mut Child,
        stdin: &mut ChildStdin,
        stdout: tokio::process::ChildStdout,
        timeout: Duration,
        progress_tx: Option<mpsc::Sender<SandboxProgress>>,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, SandboxFailure> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut lines = BufReader::new(stdout).lines();
        let mut held_permits: Vec<RatePermit> = Vec::new();
        let mut bytes_seen = 0usize;

        loop {
            let line = tokio::select! {
                _ = cancel.cancelled() => return Err(SandboxFailure::Cancelled),
                _ = tokio::time::sleep_until(deadline) => return Err(SandboxFailure::Timeout(timeout)),
                line = lines.next_line() => line,
            };

            let Some(line) = line
                .map_err(|e| SandboxFailure::Runtime(format!("stdout read: {e}")))?
            else {
                // Stdout closed without a result frame; the empty message is
                // replaced with the stderr tail by `execute`.
                let _ = child.wait().await;
                return Err(SandboxFailure::Runtime(String::new()));
            };

            bytes_seen += line.len();
            if bytes_seen > self.max_output_bytes {
                return Err(SandboxFailure::OversizedOutput {
                    limit: self.max_output_bytes,
                });
            }

            let frame: ChildFrame = match serde_json::from_str(&line) {
                Ok(f) => f,
                Err(_) => {
                    debug!(line = %line, "ignoring non-protocol sandbox output");
                    continue;
                }
            };

            match frame {
                ChildFrame::Progress { percent, message } => {
                    if let Some(tx) = &progress_tx {
                        let _ = tx.try_send(SandboxProgress { percent, message });
                    }
                }
                ChildFrame::Acquire => {
                    let permit = tokio::select! {
                        _ = cancel.cancelled() => return Err(SandboxFailure::Cancelled),
                        _ = tokio::time::sleep_until(deadline) => return Err(SandboxFailure::Timeout(timeout)),
                        permit = self.governor.acquire() => permit,
                    };
                    held_permits.push(permit);
                    let grant = serde_json::to_string(&HostFrame::Grant)
                        .map_err(|e| SandboxFailure::Runtime(format!("grant encode: {e}")))?;
                    if stdin.write_all(format!("{grant}\n").as_bytes()).await.is_err() {
                        return Err(SandboxFailure::Runtime("child closed stdin pipe".into()));
                    }
                }
                ChildFrame::Release => {
                    if held_permits.pop().is_none() {
                        warn!("sandbox released a permit it never acquired");
                    }
                }
                ChildFrame::RateLimited { wait_seconds } => {
                    return Err(SandboxFailure::RateLimited { wait_seconds });
                }
                ChildFrame::Error { message, kind } => {
                    return Err(match kind.as_deref() {
                        Some("validation_failed") => SandboxFailure::ValidationFailed(message),
                        _ => SandboxFailure::Runtime(message),
                    });
                }
                ChildFrame::Result { value } => {
                    let size = serde_json::to_string(&value).map(|s| s.len()).unwrap_or(0);
                    if size > self.max_output_bytes {
                        return Err(SandboxFailure::OversizedOutput {
                            limit: self.max_output_bytes,
                        });
                    }
                    return Ok(value);
                }
            }
        }
    }
}
