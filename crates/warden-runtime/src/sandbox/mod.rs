pub mod echo;
pub mod process;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use warden_common::{FailureReason, LimitsConfig, SandboxConfig, SandboxKind};

pub use echo::EchoSandbox;
pub use process::ProcessSandbox;

/// Limits the sandbox must enforce for one dispatch. The pool enforces the
/// wall-clock timeout itself as well.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    pub memory_bytes: u64,
    pub cpu_shares: u32,
    #[serde(rename = "timeoutMs", serialize_with = "serialize_millis")]
    pub timeout: Duration,
    pub allowed_domains: Vec<String>,
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

impl ResourceLimits {
    pub fn from_config(cfg: &LimitsConfig) -> Self {
        Self {
            memory_bytes: cfg.memory_bytes,
            cpu_shares: cfg.cpu_shares,
            timeout: Duration::from_millis(cfg.timeout_ms),
            allowed_domains: Vec::new(),
        }
    }
}

/// One unit of work handed to a worker.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxTask {
    pub request_id: String,
    pub tenant_id: String,
    pub action: String,
    pub version: String,
    pub attempt: u32,
    pub parameters: Value,
    pub limits: ResourceLimits,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SandboxOutcome {
    Completed {
        payload: Value,
        memory_used_bytes: u64,
    },
    /// The action ran and reported a business-logic failure.
    ApplicationError {
        message: String,
        memory_used_bytes: u64,
    },
    /// The sandbox stopped the action for breaching a limit.
    ResourceViolation {
        reason: FailureReason,
        message: String,
    },
}

/// Anything here means the worker is no longer trustworthy and gets replaced.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("failed to start worker: {0}")]
    Spawn(String),
    #[error("worker crashed: {0}")]
    Crashed(String),
    #[error("worker protocol error: {0}")]
    Protocol(String),
    #[error("worker io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Isolation backend. One worker per pool slot; a worker runs one task at a time.
#[async_trait]
pub trait Sandbox: Send + Sync {
    fn kind(&self) -> &str;

    async fn spawn(&self, slot: usize) -> Result<Box<dyn SandboxWorker>, SandboxError>;
}

#[async_trait]
pub trait SandboxWorker: Send {
    async fn execute(&mut self, task: &SandboxTask) -> Result<SandboxOutcome, SandboxError>;

    /// Memory the worker currently holds, as last reported.
    fn resident_bytes(&self) -> u64 {
        0
    }

    /// Forcefully stops the worker. Must be safe to call more than once.
    async fn terminate(&mut self);
}

pub fn create_sandbox(config: &SandboxConfig, limits: &LimitsConfig) -> Result<Arc<dyn Sandbox>, SandboxError> {
    match config.kind {
        SandboxKind::Echo => Ok(Arc::new(EchoSandbox::new())),
        SandboxKind::Process => {
            let program = config
                .program
                .clone()
                .ok_or_else(|| SandboxError::Spawn("sandbox.program is not set".to_string()))?;
            Ok(Arc::new(ProcessSandbox::new(program, config.args.clone(), limits.clone())))
        }
    }
}
