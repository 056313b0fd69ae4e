//! Scripted sandbox for tests. Behaviour is driven by task parameters:
//!
//! - `sleepMs`: delay before answering
//! - `hangFirst` / `crashFirst`: hang or crash the first N attempts of a request
//! - `crash`: always crash
//! - `appError`: report an application error with this message
//! - `violation`: report a resource violation (`MemoryExceeded`, `CpuExceeded`, `NetworkDenied`)
//! - `residentBytes`: residency the worker reports after the task

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use warden_common::FailureReason;

use crate::sandbox::{Sandbox, SandboxError, SandboxOutcome, SandboxTask, SandboxWorker};

#[derive(Debug, Default)]
pub struct ScriptCounters {
    pub spawned: AtomicUsize,
    pub terminated: AtomicUsize,
    pub executed: AtomicUsize,
    attempts: Mutex<HashMap<String, u64>>,
}

impl ScriptCounters {
    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    pub fn terminated(&self) -> usize {
        self.terminated.load(Ordering::SeqCst)
    }

    pub fn executed(&self) -> usize {
        self.executed.load(Ordering::SeqCst)
    }

    /// 1-based attempt number of this request as seen by the sandbox.
    fn next_attempt(&self, request_id: &str) -> u64 {
        let mut attempts = self.attempts.lock();
        let n = attempts.entry(request_id.to_string()).or_insert(0);
        *n += 1;
        *n
    }
}

#[derive(Debug, Default, Clone)]
pub struct ScriptedSandbox {
    pub counters: Arc<ScriptCounters>,
}

impl ScriptedSandbox {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Sandbox for ScriptedSandbox {
    fn kind(&self) -> &str {
        "scripted"
    }

    async fn spawn(&self, _slot: usize) -> Result<Box<dyn SandboxWorker>, SandboxError> {
        self.counters.spawned.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedWorker {
            counters: self.counters.clone(),
            resident: 0,
            terminated: false,
        }))
    }
}

struct ScriptedWorker {
    counters: Arc<ScriptCounters>,
    resident: u64,
    terminated: bool,
}

#[async_trait]
impl SandboxWorker for ScriptedWorker {
    async fn execute(&mut self, task: &SandboxTask) -> Result<SandboxOutcome, SandboxError> {
        self.counters.executed.fetch_add(1, Ordering::SeqCst);
        let p = &task.parameters;
        let attempt = self.counters.next_attempt(&task.request_id);

        if let Some(ms) = p["sleepMs"].as_u64() {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        if p["hangFirst"].as_u64().is_some_and(|n| attempt <= n) {
            std::future::pending::<()>().await;
        }
        if p["crash"].as_bool() == Some(true)
            || p["crashFirst"].as_u64().is_some_and(|n| attempt <= n)
        {
            return Err(SandboxError::Crashed("scripted crash".to_string()));
        }
        if let Some(bytes) = p["residentBytes"].as_u64() {
            self.resident = bytes;
        }
        if let Some(message) = p["appError"].as_str() {
            return Ok(SandboxOutcome::ApplicationError {
                message: message.to_string(),
                memory_used_bytes: 1024,
            });
        }
        if let Some(kind) = p["violation"].as_str() {
            let reason = match kind {
                "CpuExceeded" => FailureReason::CpuExceeded,
                "NetworkDenied" => FailureReason::NetworkDenied,
                _ => FailureReason::MemoryExceeded,
            };
            return Ok(SandboxOutcome::ResourceViolation {
                reason,
                message: format!("scripted {reason}"),
            });
        }
        Ok(SandboxOutcome::Completed {
            payload: json!({ "echo": task.parameters, "attempt": attempt }),
            memory_used_bytes: 2048,
        })
    }

    fn resident_bytes(&self) -> u64 {
        self.resident
    }

    async fn terminate(&mut self) {
        if !self.terminated {
            self.terminated = true;
            self.counters.terminated.fetch_add(1, Ordering::SeqCst);
        }
    }
}
