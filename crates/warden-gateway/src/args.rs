use std::path::PathBuf;

use clap::Parser;
use warden_common::telemetry::LogFormat;
use warden_common::{ConfigError, SandboxKind, WardenConfig};

#[derive(Debug, Parser)]
#[command(author, version, about = "Isolated task execution gateway")]
pub struct Args {
    #[arg(long, env = "WARDEN_GATEWAY_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: String,

    /// JSON config file. Flags below override values from the file.
    #[arg(long, env = "WARDEN_CONFIG")]
    pub config: Option<PathBuf>,

    #[arg(long, env = "WARDEN_MIN_WORKERS")]
    pub min_workers: Option<usize>,

    #[arg(long, env = "WARDEN_MAX_WORKERS")]
    pub max_workers: Option<usize>,

    #[arg(long, env = "WARDEN_QUEUE_DEPTH")]
    pub queue_depth: Option<usize>,

    #[arg(long, env = "WARDEN_TIMEOUT_MS")]
    pub timeout_ms: Option<u64>,

    #[arg(long, env = "WARDEN_MEMORY_BYTES")]
    pub memory_bytes: Option<u64>,

    #[arg(long, env = "WARDEN_CACHE_TTL_MS")]
    pub cache_ttl_ms: Option<u64>,

    #[arg(long, env = "WARDEN_CACHE_MAX_ENTRIES")]
    pub cache_max_entries: Option<usize>,

    /// `echo` or `process`.
    #[arg(long, env = "WARDEN_SANDBOX")]
    pub sandbox: Option<SandboxKind>,

    /// Worker executable for the process sandbox.
    #[arg(long, env = "WARDEN_SANDBOX_PROGRAM")]
    pub sandbox_program: Option<String>,

    #[arg(long, env = "WARDEN_ALLOW_UNREGISTERED")]
    pub allow_unregistered: Option<bool>,

    /// How often expired cache entries and idle circuits are swept.
    #[arg(long, env = "WARDEN_MAINTENANCE_INTERVAL_MS", default_value_t = 10_000)]
    pub maintenance_interval_ms: u64,

    /// Ingest URL for execution events. Events are only logged when unset.
    #[arg(long, env = "WARDEN_AUDIT_URL")]
    pub audit_url: Option<String>,

    #[arg(long, env = "WARDEN_AUDIT_TOKEN")]
    pub audit_token: Option<String>,

    /// OTLP endpoint for exporting traces.
    #[arg(long, env = "WARDEN_OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,

    /// Bearer token for the OTLP endpoint.
    #[arg(long, env = "WARDEN_OTLP_TOKEN")]
    pub otlp_token: Option<String>,

    /// `text` or `json`.
    #[arg(long, env = "WARDEN_LOG_FORMAT", default_value = "text")]
    pub log_format: LogFormat,
}

impl Args {
    /// File (or defaults), then flag overrides, then validation.
    pub fn resolve_config(&self) -> Result<WardenConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => WardenConfig::load(path)?,
            None => WardenConfig::default(),
        };

        if let Some(v) = self.min_workers {
            config.pool.min_workers = v;
        }
        if let Some(v) = self.max_workers {
            config.pool.max_workers = v;
        }
        if let Some(v) = self.queue_depth {
            config.pool.queue_depth = v;
        }
        if let Some(v) = self.timeout_ms {
            config.limits.timeout_ms = v;
        }
        if let Some(v) = self.memory_bytes {
            config.limits.memory_bytes = v;
        }
        if let Some(v) = self.cache_ttl_ms {
            config.cache.ttl_ms = v;
        }
        if let Some(v) = self.cache_max_entries {
            config.cache.max_entries = v;
        }
        if let Some(kind) = self.sandbox {
            config.sandbox.kind = kind;
        }
        if let Some(program) = &self.sandbox_program {
            config.sandbox.program = Some(program.clone());
        }
        if let Some(v) = self.allow_unregistered {
            config.registry.allow_unregistered = v;
        }

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_defaults() {
        let args = Args::try_parse_from([
            "warden-gateway",
            "--max-workers",
            "4",
            "--queue-depth",
            "8",
            "--sandbox",
            "echo",
            "--log-format",
            "json",
        ])
        .unwrap();
        assert_eq!(args.log_format, LogFormat::Json);

        let config = args.resolve_config().unwrap();
        assert_eq!(config.pool.max_workers, 4);
        assert_eq!(config.pool.queue_depth, 8);
        assert_eq!(config.pool.min_workers, 2);
        assert_eq!(config.sandbox.kind, SandboxKind::Echo);
    }

    #[test]
    fn test_invalid_override_is_rejected() {
        let args = Args::try_parse_from(["warden-gateway", "--min-workers", "5", "--max-workers", "3"])
            .unwrap();
        assert!(matches!(args.resolve_config(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_process_sandbox_needs_program() {
        let args = Args::try_parse_from(["warden-gateway", "--sandbox", "process"]).unwrap();
        assert!(args.resolve_config().is_err());

        let args = Args::try_parse_from([
            "warden-gateway",
            "--sandbox",
            "process",
            "--sandbox-program",
            "/usr/local/bin/warden-worker",
        ])
        .unwrap();
        let config = args.resolve_config().unwrap();
        assert_eq!(config.sandbox.kind, SandboxKind::Process);
    }

    #[test]
    fn test_unknown_sandbox_kind_fails_parsing() {
        assert!(Args::try_parse_from(["warden-gateway", "--sandbox", "vm"]).is_err());
    }
}
