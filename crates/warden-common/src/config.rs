use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::action::ActionDescriptor;
use crate::request::Tier;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct PoolConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    pub queue_depth: usize,
    /// Recycle a worker after this many executions; 0 disables.
    pub recycle_after: u64,
    /// Recycle a worker whose reported residency exceeds this; 0 disables.
    /// Must sit below `limits.memoryBytes` to ever fire.
    pub recycle_memory_bytes: u64,
    pub idle_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 2,
            max_workers: 10,
            queue_depth: 64,
            recycle_after: 100,
            recycle_memory_bytes: 384 * 1024 * 1024,
            idle_timeout_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct LimitsConfig {
    pub memory_bytes: u64,
    pub cpu_shares: u32,
    pub timeout_ms: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            memory_bytes: 512 * 1024 * 1024,
            cpu_shares: 1024,
            timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheConfig {
    pub ttl_ms: u64,
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 5 * 60 * 1000,
            max_entries: 10_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TierLimits {
    /// `None` means unlimited.
    pub daily_limit: Option<u64>,
    pub concurrent_limit: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct QuotaConfig {
    pub free: TierLimits,
    pub pro: TierLimits,
    pub enterprise: TierLimits,
    /// Tenant id -> tier. Tenants not listed get `default_tier`.
    pub tenants: HashMap<String, Tier>,
    pub default_tier: Tier,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            free: TierLimits {
                daily_limit: Some(100),
                concurrent_limit: 1,
            },
            pro: TierLimits {
                daily_limit: Some(10_000),
                concurrent_limit: 5,
            },
            enterprise: TierLimits {
                daily_limit: None,
                concurrent_limit: 20,
            },
            tenants: HashMap::new(),
            default_tier: Tier::Free,
        }
    }
}

impl QuotaConfig {
    pub fn tier_for(&self, tenant_id: &str) -> Tier {
        self.tenants
            .get(tenant_id)
            .copied()
            .unwrap_or(self.default_tier)
    }

    pub fn limits_for(&self, tier: Tier) -> TierLimits {
        match tier {
            Tier::Free => self.free,
            Tier::Pro => self.pro,
            Tier::Enterprise => self.enterprise,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct CircuitConfig {
    pub failure_threshold: u32,
    pub window_ms: u64,
    pub cooldown_ms: u64,
    pub max_cooldown_ms: u64,
    /// How many failures a resource violation counts as.
    pub resource_failure_weight: u32,
    /// Closed circuits with no failure for this long are dropped.
    pub gc_after_ms: u64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window_ms: 60_000,
            cooldown_ms: 30_000,
            max_cooldown_ms: 300_000,
            resource_failure_weight: 2,
            gc_after_ms: 600_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct RegistryConfig {
    /// Serve pinned versions of actions the registry has never seen.
    pub allow_unregistered: bool,
    pub actions: Vec<ActionDescriptor>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SandboxKind {
    Process,
    #[default]
    Echo,
}

impl SandboxKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SandboxKind::Process => "process",
            SandboxKind::Echo => "echo",
        }
    }
}

impl FromStr for SandboxKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "process" => Ok(SandboxKind::Process),
            "echo" => Ok(SandboxKind::Echo),
            other => Err(format!("unknown sandbox kind '{other}', available: process, echo")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct SandboxConfig {
    pub kind: SandboxKind,
    /// Worker executable for the process sandbox.
    pub program: Option<String>,
    pub args: Vec<String>,
}

/// Complete service configuration. Every section falls back to its defaults
/// when absent from the file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct WardenConfig {
    pub pool: PoolConfig,
    pub limits: LimitsConfig,
    pub cache: CacheConfig,
    pub quota: QuotaConfig,
    pub circuit: CircuitConfig,
    pub retry: RetryConfig,
    pub registry: RegistryConfig,
    pub sandbox: SandboxConfig,
}

impl WardenConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.pool.max_workers == 0 {
            return invalid("pool.maxWorkers must be at least 1");
        }
        if self.pool.min_workers > self.pool.max_workers {
            return invalid("pool.minWorkers must not exceed pool.maxWorkers");
        }
        if self.pool.queue_depth == 0 {
            return invalid("pool.queueDepth must be at least 1");
        }
        if self.limits.timeout_ms == 0 {
            return invalid("limits.timeoutMs must be positive");
        }
        if self.limits.memory_bytes == 0 {
            return invalid("limits.memoryBytes must be positive");
        }
        if self.pool.recycle_memory_bytes > self.limits.memory_bytes {
            return invalid("pool.recycleMemoryBytes must not exceed limits.memoryBytes");
        }
        if self.cache.max_entries == 0 {
            return invalid("cache.maxEntries must be at least 1");
        }
        for tier in Tier::ALL {
            if self.quota.limits_for(tier).concurrent_limit == 0 {
                return Err(ConfigError::Invalid(format!(
                    "quota.{tier}.concurrentLimit must be at least 1"
                )));
            }
        }
        if self.circuit.failure_threshold == 0 {
            return invalid("circuit.failureThreshold must be at least 1");
        }
        if self.circuit.cooldown_ms > self.circuit.max_cooldown_ms {
            return invalid("circuit.cooldownMs must not exceed circuit.maxCooldownMs");
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry.maxAttempts must be at least 1");
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return invalid("retry.baseDelayMs must not exceed retry.maxDelayMs");
        }
        if self.sandbox.kind == SandboxKind::Process && self.sandbox.program.is_none() {
            return invalid("sandbox.program is required for the process sandbox");
        }
        Ok(())
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.cache.ttl_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = WardenConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.pool.queue_depth, 64);
        assert_eq!(cfg.limits.timeout_ms, 30_000);
        assert_eq!(cfg.quota.limits_for(Tier::Free).daily_limit, Some(100));
        assert_eq!(cfg.quota.limits_for(Tier::Enterprise).daily_limit, None);
        assert_eq!(cfg.default_ttl(), Duration::from_secs(300));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let cfg: WardenConfig = serde_json::from_str(
            r#"{
                "pool": {"maxWorkers": 4},
                "quota": {"tenants": {"acme": "pro"}},
                "registry": {"actions": [{"action": "summarize", "version": "v2"}]}
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.pool.max_workers, 4);
        assert_eq!(cfg.pool.min_workers, 2);
        assert_eq!(cfg.quota.tier_for("acme"), Tier::Pro);
        assert_eq!(cfg.quota.tier_for("nobody"), Tier::Free);
        assert_eq!(cfg.registry.actions.len(), 1);
        assert_eq!(cfg.circuit.failure_threshold, 5);
    }

    #[test]
    fn test_validate_rejects_bad_bounds() {
        let mut cfg = WardenConfig::default();
        cfg.pool.min_workers = 20;
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));

        let mut cfg = WardenConfig::default();
        cfg.sandbox.kind = SandboxKind::Process;
        assert!(cfg.validate().is_err());

        let mut cfg = WardenConfig::default();
        cfg.quota.pro.concurrent_limit = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_residency_recycle_sits_below_memory_ceiling() {
        let cfg = WardenConfig::default();
        assert!(cfg.pool.recycle_memory_bytes > 0);
        assert!(cfg.pool.recycle_memory_bytes < cfg.limits.memory_bytes);

        let mut cfg = WardenConfig::default();
        cfg.pool.recycle_memory_bytes = cfg.limits.memory_bytes + 1;
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(ref m)) if m.contains("recycleMemoryBytes")));

        cfg.pool.recycle_memory_bytes = 0;
        cfg.validate().unwrap();
    }
}
