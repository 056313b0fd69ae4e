use std::process::Stdio;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use warden_common::{FailureReason, LimitsConfig};

use super::{Sandbox, SandboxError, SandboxOutcome, SandboxTask, SandboxWorker};

/// Runs each worker as a long-lived child process speaking line-delimited
/// JSON: one [`SandboxTask`] per stdin line, one response per stdout line.
///
/// The process is expected to apply the limits it receives (both in the
/// request and via `WARDEN_*` environment variables) inside whatever
/// isolation primitive it wraps.
#[derive(Debug, Clone)]
pub struct ProcessSandbox {
    program: String,
    args: Vec<String>,
    limits: LimitsConfig,
    max_response_bytes: usize,
}

/// Longest response line accepted from a worker.
pub const DEFAULT_MAX_RESPONSE_BYTES: usize = 16 * 1024 * 1024;

impl ProcessSandbox {
    pub fn new(program: String, args: Vec<String>, limits: LimitsConfig) -> Self {
        Self {
            program,
            args,
            limits,
            max_response_bytes: DEFAULT_MAX_RESPONSE_BYTES,
        }
    }

    pub fn with_max_response_bytes(mut self, max: usize) -> Self {
        self.max_response_bytes = max;
        self
    }
}

#[async_trait]
impl Sandbox for ProcessSandbox {
    fn kind(&self) -> &str {
        "process"
    }

    async fn spawn(&self, slot: usize) -> Result<Box<dyn SandboxWorker>, SandboxError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env("WARDEN_SLOT", slot.to_string())
            .env("WARDEN_MEMORY_BYTES", self.limits.memory_bytes.to_string())
            .env("WARDEN_CPU_SHARES", self.limits.cpu_shares.to_string())
            .env("WARDEN_TIMEOUT_MS", self.limits.timeout_ms.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| SandboxError::Spawn(format!("{}: {e}", self.program)))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SandboxError::Spawn("worker stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::Spawn("worker stdout not captured".to_string()))?;

        tracing::info!(slot, pid = ?child.id(), program = %self.program, "sandbox worker started");
        Ok(Box::new(ProcessWorker {
            slot,
            child,
            stdin,
            stdout: FramedRead::new(stdout, LinesCodec::new_with_max_length(self.max_response_bytes)),
            resident_bytes: 0,
            max_response_bytes: self.max_response_bytes,
        }))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ResponseStatus {
    Ok,
    Error,
    ResourceExceeded,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WorkerResponse {
    status: ResponseStatus,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    resource: Option<String>,
    #[serde(default)]
    memory_used_bytes: u64,
    #[serde(default)]
    resident_bytes: Option<u64>,
}

fn violation_reason(resource: Option<&str>) -> FailureReason {
    match resource {
        Some("cpu") => FailureReason::CpuExceeded,
        Some("network") => FailureReason::NetworkDenied,
        Some("timeout") => FailureReason::Timeout,
        _ => FailureReason::MemoryExceeded,
    }
}

fn parse_response(line: &str) -> Result<(SandboxOutcome, Option<u64>), SandboxError> {
    let resp: WorkerResponse = serde_json::from_str(line)
        .map_err(|e| SandboxError::Protocol(format!("malformed response: {e}")))?;
    let outcome = match resp.status {
        ResponseStatus::Ok => SandboxOutcome::Completed {
            payload: resp.payload,
            memory_used_bytes: resp.memory_used_bytes,
        },
        ResponseStatus::Error => SandboxOutcome::ApplicationError {
            message: resp.message.unwrap_or_else(|| "action failed".to_string()),
            memory_used_bytes: resp.memory_used_bytes,
        },
        ResponseStatus::ResourceExceeded => {
            let reason = violation_reason(resp.resource.as_deref());
            SandboxOutcome::ResourceViolation {
                reason,
                message: resp
                    .message
                    .unwrap_or_else(|| format!("{reason} reported by sandbox")),
            }
        }
    };
    Ok((outcome, resp.resident_bytes))
}

struct ProcessWorker {
    slot: usize,
    child: Child,
    stdin: ChildStdin,
    stdout: FramedRead<ChildStdout, LinesCodec>,
    resident_bytes: u64,
    max_response_bytes: usize,
}

#[async_trait]
impl SandboxWorker for ProcessWorker {
    async fn execute(&mut self, task: &SandboxTask) -> Result<SandboxOutcome, SandboxError> {
        let mut line = serde_json::to_vec(task)
            .map_err(|e| SandboxError::Protocol(format!("encode task: {e}")))?;
        line.push(b'\n');
        self.stdin.write_all(&line).await?;
        self.stdin.flush().await?;

        let reply = match self.stdout.next().await {
            Some(Ok(line)) => line,
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                return Err(SandboxError::Protocol(format!(
                    "response exceeded {} bytes",
                    self.max_response_bytes
                )));
            }
            Some(Err(LinesCodecError::Io(e))) => return Err(e.into()),
            None => {
                let status = self.child.try_wait().ok().flatten();
                return Err(SandboxError::Crashed(match status {
                    Some(s) => format!("worker exited: {s}"),
                    None => "worker closed stdout".to_string(),
                }));
            }
        };

        let (outcome, resident) = parse_response(&reply)?;
        if let Some(bytes) = resident {
            self.resident_bytes = bytes;
        }
        Ok(outcome)
    }

    fn resident_bytes(&self) -> u64 {
        self.resident_bytes
    }

    async fn terminate(&mut self) {
        if let Err(e) = self.child.kill().await {
            tracing::debug!(slot = self.slot, error = %e, "worker already gone");
        }
        tracing::info!(slot = self.slot, "sandbox worker terminated");
    }
}
