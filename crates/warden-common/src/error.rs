use std::fmt;

use serde::{Deserialize, Serialize};

use crate::result::{ErrorKind, FailureReason};

/// Which quota counter rejected an admission.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum QuotaScope {
    Daily,
    Concurrent,
}

impl QuotaScope {
    pub fn as_str(self) -> &'static str {
        match self {
            QuotaScope::Daily => "daily",
            QuotaScope::Concurrent => "concurrent",
        }
    }
}

impl fmt::Display for QuotaScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every way a request can end without an [`ExecutionResult`](crate::ExecutionResult).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutionError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("{scope} quota exceeded")]
    QuotaExceeded { scope: QuotaScope, retry_after_ms: u64 },

    #[error("circuit open for {target}")]
    CircuitOpen { target: String, retry_after_ms: u64 },

    #[error("worker failure ({reason}) after {attempts} attempt(s): {message}")]
    WorkerFailure {
        reason: FailureReason,
        message: String,
        attempts: u32,
    },

    #[error("resource limit exceeded ({reason}) after {attempts} attempt(s): {message}")]
    ResourceExceeded {
        reason: FailureReason,
        message: String,
        attempts: u32,
    },

    #[error("worker pool saturated, try again later")]
    Backpressure { retry_after_ms: u64 },

    #[error("internal error: {0}")]
    Internal(String),
}

impl ExecutionError {
    /// Builds the terminal error for a failed dispatch.
    pub fn from_failure(reason: FailureReason, message: impl Into<String>, attempts: u32) -> Self {
        let message = message.into();
        if reason.is_resource_violation() {
            ExecutionError::ResourceExceeded {
                reason,
                message,
                attempts,
            }
        } else {
            ExecutionError::WorkerFailure {
                reason,
                message,
                attempts,
            }
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ExecutionError::Validation(_) => ErrorKind::ValidationError,
            ExecutionError::QuotaExceeded { .. } => ErrorKind::QuotaExceeded,
            ExecutionError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            ExecutionError::WorkerFailure { .. } => ErrorKind::WorkerFailure,
            ExecutionError::ResourceExceeded { .. } => ErrorKind::ResourceExceeded,
            ExecutionError::Backpressure { .. } => ErrorKind::Backpressure,
            ExecutionError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Machine-readable back-off hint for rejections a caller can retry later.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            ExecutionError::QuotaExceeded { retry_after_ms, .. }
            | ExecutionError::CircuitOpen { retry_after_ms, .. }
            | ExecutionError::Backpressure { retry_after_ms } => Some(*retry_after_ms),
            _ => None,
        }
    }

    pub fn reason(&self) -> Option<FailureReason> {
        match self {
            ExecutionError::WorkerFailure { reason, .. }
            | ExecutionError::ResourceExceeded { reason, .. } => Some(*reason),
            _ => None,
        }
    }

    /// Whether the supervisor re-dispatches this failure internally.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExecutionError::WorkerFailure { .. } | ExecutionError::ResourceExceeded { .. }
        )
    }
}
