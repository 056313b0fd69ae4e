use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::result::FailureReason;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventOutcome {
    Success,
    CacheHit,
    ApplicationError,
    WorkerFailure,
    ResourceExceeded,
    Cancelled,
}

/// One record per dispatch attempt (or cache hit), handed to the audit sink.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionEvent {
    pub request_id: String,
    pub tenant_id: String,
    pub action: String,
    pub version: String,
    pub attempt: u32,
    pub outcome: EventOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
    pub duration_ms: u64,
    pub from_cache: bool,
    pub timestamp: DateTime<Utc>,
}
