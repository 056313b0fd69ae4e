pub mod action;
pub mod config;
pub mod error;
pub mod event;
pub mod request;
pub mod result;
pub mod target;

pub use action::ActionDescriptor;
pub use config::{
    CacheConfig, CircuitConfig, ConfigError, LimitsConfig, PoolConfig, QuotaConfig,
    RegistryConfig, RetryConfig, SandboxConfig, SandboxKind, TierLimits, WardenConfig,
};
pub use error::{ExecutionError, QuotaScope};
pub use event::{EventOutcome, ExecutionEvent};
pub use request::{ExecutionRequest, Tier};
pub use result::{ErrorKind, ExecutionResult, FailureReason};
pub use target::{ActionTarget, TargetParseError};

pub mod telemetry;
