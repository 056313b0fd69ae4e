use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stable external error taxonomy. Names are part of the wire contract.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ValidationError,
    QuotaExceeded,
    CircuitOpen,
    WorkerFailure,
    ResourceExceeded,
    ApplicationError,
    Backpressure,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ValidationError => "ValidationError",
            ErrorKind::QuotaExceeded => "QuotaExceeded",
            ErrorKind::CircuitOpen => "CircuitOpen",
            ErrorKind::WorkerFailure => "WorkerFailure",
            ErrorKind::ResourceExceeded => "ResourceExceeded",
            ErrorKind::ApplicationError => "ApplicationError",
            ErrorKind::Backpressure => "Backpressure",
            ErrorKind::Internal => "Internal",
        }
    }

    /// Label used for the `outcome` dimension of execution metrics.
    pub fn metric_label(self) -> &'static str {
        match self {
            ErrorKind::ValidationError => "validation_error",
            ErrorKind::QuotaExceeded => "quota_exceeded",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::WorkerFailure => "worker_failure",
            ErrorKind::ResourceExceeded => "resource_exceeded",
            ErrorKind::ApplicationError => "application_error",
            ErrorKind::Backpressure => "backpressure",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a dispatch did not produce a result.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum FailureReason {
    Timeout,
    Crashed,
    MemoryExceeded,
    CpuExceeded,
    NetworkDenied,
}

impl FailureReason {
    /// Memory, CPU and network-policy violations; these weigh more toward circuit opening.
    pub fn is_resource_violation(self) -> bool {
        matches!(
            self,
            FailureReason::MemoryExceeded | FailureReason::CpuExceeded | FailureReason::NetworkDenied
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureReason::Timeout => "Timeout",
            FailureReason::Crashed => "Crashed",
            FailureReason::MemoryExceeded => "MemoryExceeded",
            FailureReason::CpuExceeded => "CpuExceeded",
            FailureReason::NetworkDenied => "NetworkDenied",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a completed execution: the action either returned a payload or
/// reported a business-logic failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub execution_time_ms: u64,
    pub memory_used_bytes: u64,
    pub from_cache: bool,
}

impl ExecutionResult {
    pub fn succeeded(payload: Value, execution_time_ms: u64, memory_used_bytes: u64) -> Self {
        Self {
            success: true,
            payload: Some(payload),
            error_kind: None,
            message: None,
            execution_time_ms,
            memory_used_bytes,
            from_cache: false,
        }
    }

    pub fn application_error(
        message: impl Into<String>,
        execution_time_ms: u64,
        memory_used_bytes: u64,
    ) -> Self {
        Self {
            success: false,
            payload: None,
            error_kind: Some(ErrorKind::ApplicationError),
            message: Some(message.into()),
            execution_time_ms,
            memory_used_bytes,
            from_cache: false,
        }
    }

    /// The same result, marked as served from the cache.
    pub fn as_cached(&self) -> Self {
        Self {
            from_cache: true,
            ..self.clone()
        }
    }
}
