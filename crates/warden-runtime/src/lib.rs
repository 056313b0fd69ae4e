pub mod cache;
pub mod circuit;
pub mod events;
pub mod metrics;
pub mod pool;
pub mod quota;
pub mod retry;
pub mod sandbox;
pub mod supervisor;

#[cfg(test)]
mod testing;

pub use cache::{CacheStats, Fingerprint, ResultCache};
pub use circuit::{CircuitCounts, CircuitRegistry, CircuitSnapshot, CircuitState};
pub use events::{EventSink, TracingEventSink};
pub use metrics::{Outcome, OutcomeCount, RuntimeMetrics};
pub use pool::{ExecutionOutcome, PoolSettings, PoolSnapshot, SubmitError, WorkerPool};
pub use quota::{QuotaLedger, TierQuotaStats, UsageSnapshot};
pub use retry::RetryPolicy;
pub use sandbox::{create_sandbox, ResourceLimits, Sandbox, SandboxError, SandboxTask, SandboxWorker};
pub use supervisor::{HealthReport, MaintenanceReport, RuntimeStats, Supervisor};
