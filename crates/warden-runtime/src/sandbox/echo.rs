use async_trait::async_trait;
use serde_json::json;

use super::{Sandbox, SandboxError, SandboxOutcome, SandboxTask, SandboxWorker};

/// In-process sandbox that answers every task with its own input. No isolation;
/// meant for local runs and smoke checks.
#[derive(Debug, Default)]
pub struct EchoSandbox;

impl EchoSandbox {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Sandbox for EchoSandbox {
    fn kind(&self) -> &str {
        "echo"
    }

    async fn spawn(&self, slot: usize) -> Result<Box<dyn SandboxWorker>, SandboxError> {
        tracing::debug!(slot, "echo worker started");
        Ok(Box::new(EchoWorker { slot }))
    }
}

struct EchoWorker {
    slot: usize,
}

#[async_trait]
impl SandboxWorker for EchoWorker {
    async fn execute(&mut self, task: &SandboxTask) -> Result<SandboxOutcome, SandboxError> {
        Ok(SandboxOutcome::Completed {
            payload: json!({
                "action": task.action,
                "version": task.version,
                "parameters": task.parameters,
            }),
            memory_used_bytes: 0,
        })
    }

    async fn terminate(&mut self) {
        tracing::debug!(slot = self.slot, "echo worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::ResourceLimits;
    use warden_common::LimitsConfig;

    #[tokio::test]
    async fn test_echo_returns_parameters() {
        let sandbox = EchoSandbox::new();
        let mut worker = sandbox.spawn(0).await.unwrap();
        let task = SandboxTask {
            request_id: "r1".into(),
            tenant_id: "t1".into(),
            action: "summarize".into(),
            version: "v2".into(),
            attempt: 1,
            parameters: json!({"text": "hello"}),
            limits: ResourceLimits::from_config(&LimitsConfig::default()),
        };
        match worker.execute(&task).await.unwrap() {
            SandboxOutcome::Completed { payload, .. } => {
                assert_eq!(payload["parameters"]["text"], "hello");
                assert_eq!(payload["version"], "v2");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
