use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::time::Instant;
use warden_common::request::validate_tenant_id;
use warden_common::{
    ActionDescriptor, ErrorKind, EventOutcome, ExecutionError, ExecutionEvent, ExecutionRequest,
    ExecutionResult, FailureReason, LimitsConfig, WardenConfig,
};
use warden_registry::{ActionRegistry, RegistryError};

use crate::cache::{CacheScope, CacheStats, Fingerprint, ResultCache};
use crate::circuit::{CircuitCounts, CircuitRegistry, CircuitSnapshot};
use crate::events::EventSink;
use crate::metrics::{Outcome, OutcomeCount, RuntimeMetrics};
use crate::pool::{ExecutionOutcome, PoolSettings, PoolSnapshot, SubmitError, WorkerPool};
use crate::quota::{QuotaLedger, TierQuotaStats};
use crate::retry::RetryPolicy;
use crate::sandbox::{ResourceLimits, Sandbox, SandboxTask};

/// Hint returned with `Backpressure`; the pool has no better estimate.
const BACKPRESSURE_RETRY_MS: u64 = 1_000;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeStats {
    pub pool: PoolSnapshot,
    pub cache: CacheStats,
    pub quota: Vec<TierQuotaStats>,
    pub quota_tenants: usize,
    pub circuit_counts: CircuitCounts,
    pub circuits: Vec<CircuitSnapshot>,
    pub circuits_opened_total: u64,
    pub circuit_rejections_total: u64,
    pub outcomes: Vec<OutcomeCount>,
    pub attempts_total: u64,
    pub retries_total: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: &'static str,
    pub sandbox: String,
    pub workers: usize,
    pub busy: usize,
    pub idle: usize,
    pub queued: usize,
    pub queue_depth: usize,
    pub open_circuits: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub circuits_swept: usize,
    pub cache_expired: usize,
    pub quota_swept: usize,
}

impl MaintenanceReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Emits a `Cancelled` event if the attempt is dropped before it resolves.
struct AttemptGuard<'a> {
    sink: &'a dyn EventSink,
    event: Option<ExecutionEvent>,
    started: Instant,
}

impl AttemptGuard<'_> {
    fn disarm(mut self) {
        self.event = None;
    }
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        if let Some(mut event) = self.event.take() {
            event.duration_ms = self.started.elapsed().as_millis() as u64;
            self.sink.emit(event);
        }
    }
}

/// Runs one request end to end: cache, circuit, quota, dispatch with retry,
/// write-back.
pub struct Supervisor {
    registry: Arc<dyn ActionRegistry>,
    cache: Arc<ResultCache>,
    quota: Arc<QuotaLedger>,
    circuits: Arc<CircuitRegistry>,
    pool: Arc<WorkerPool>,
    retry: RetryPolicy,
    limits: LimitsConfig,
    events: Arc<dyn EventSink>,
    metrics: Arc<RuntimeMetrics>,
}

impl Supervisor {
    /// Builds every component from config and starts the worker pool.
    pub fn new(
        config: &WardenConfig,
        registry: Arc<dyn ActionRegistry>,
        sandbox: Arc<dyn Sandbox>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            registry,
            cache: Arc::new(ResultCache::new(
                config.cache.max_entries,
                config.default_ttl(),
            )),
            quota: Arc::new(QuotaLedger::new(config.quota.clone())),
            circuits: Arc::new(CircuitRegistry::new(config.circuit.clone())),
            pool: Arc::new(WorkerPool::start(sandbox, PoolSettings::from(&config.pool))),
            retry: RetryPolicy::from(&config.retry),
            limits: config.limits.clone(),
            events,
            metrics: Arc::new(RuntimeMetrics::default()),
        }
    }

    pub fn registry(&self) -> &Arc<dyn ActionRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    pub fn quota(&self) -> &QuotaLedger {
        &self.quota
    }

    pub fn circuits(&self) -> &CircuitRegistry {
        &self.circuits
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn metrics(&self) -> &RuntimeMetrics {
        &self.metrics
    }

    pub async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult, ExecutionError> {
        let started = Instant::now();
        let result = self.run(&request).await;

        let outcome = match &result {
            Ok(r) if r.success => Outcome::Success,
            Ok(_) => Outcome::Failed(ErrorKind::ApplicationError),
            Err(e) => Outcome::Failed(e.kind()),
        };
        self.metrics.record_outcome(outcome);

        match &result {
            Ok(r) => tracing::debug!(
                request_id = %request.request_id,
                tenant_id = %request.tenant_id,
                target = %request.action_target,
                success = r.success,
                from_cache = r.from_cache,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "execution finished"
            ),
            Err(ExecutionError::Validation(msg)) => tracing::debug!(
                request_id = %request.request_id,
                tenant_id = %request.tenant_id,
                error = %msg,
                "request rejected"
            ),
            Err(e) => tracing::info!(
                request_id = %request.request_id,
                tenant_id = %request.tenant_id,
                target = %request.action_target,
                kind = %e.kind(),
                error = %e,
                "execution failed"
            ),
        }
        result
    }

    async fn run(&self, request: &ExecutionRequest) -> Result<ExecutionResult, ExecutionError> {
        validate_tenant_id(&request.tenant_id).map_err(ExecutionError::Validation)?;
        if !request.parameters.is_object() {
            return Err(ExecutionError::Validation(
                "parameters must be a JSON object".to_string(),
            ));
        }

        let descriptor = self
            .registry
            .resolve(&request.action_target)
            .await
            .map_err(|e| match e {
                RegistryError::NotFound(_) | RegistryError::VersionNotFound { .. } => {
                    ExecutionError::Validation(e.to_string())
                }
                RegistryError::Unavailable(_) => ExecutionError::Internal(e.to_string()),
            })?;

        let fingerprint = Fingerprint::compute(
            &request.tenant_id,
            &descriptor.action,
            &descriptor.version,
            &request.parameters,
        );
        if descriptor.cacheable {
            if let Some(hit) = self.cache.get(&fingerprint, &request.tenant_id) {
                self.metrics.cache_hits_served.fetch_add(1, Ordering::Relaxed);
                self.events.emit(self.event(request, &descriptor, 0, EventOutcome::CacheHit, None, 0));
                return Ok(hit);
            }
        }

        let target = descriptor.target();
        let circuit = self
            .circuits
            .try_acquire(&request.tenant_id, &target)
            .map_err(|r| ExecutionError::CircuitOpen {
                target: target.clone(),
                retry_after_ms: r.retry_after_ms,
            })?;

        let _quota = self
            .quota
            .try_admit(&request.tenant_id, request.tier)
            .map_err(|r| ExecutionError::QuotaExceeded {
                scope: r.scope,
                retry_after_ms: r.retry_after_ms,
            })?;

        let limits = self.limits_for(&descriptor);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            self.metrics.attempts_total.fetch_add(1, Ordering::Relaxed);

            let task = SandboxTask {
                request_id: request.request_id.clone(),
                tenant_id: request.tenant_id.clone(),
                action: descriptor.action.clone(),
                version: descriptor.version.clone(),
                attempt,
                parameters: request.parameters.clone(),
                limits: limits.clone(),
            };

            let guard = AttemptGuard {
                sink: self.events.as_ref(),
                event: Some(self.event(request, &descriptor, attempt, EventOutcome::Cancelled, None, 0)),
                started: Instant::now(),
            };
            let submitted = self.pool.submit(task).await;
            guard.disarm();

            let outcome = match submitted {
                Ok(outcome) => outcome,
                Err(SubmitError::Backpressure) => {
                    return Err(ExecutionError::Backpressure {
                        retry_after_ms: BACKPRESSURE_RETRY_MS,
                    })
                }
                Err(SubmitError::ShutDown) => {
                    return Err(ExecutionError::Internal("worker pool is shut down".to_string()))
                }
            };

            match outcome {
                ExecutionOutcome::Completed {
                    payload,
                    execution_time_ms,
                    memory_used_bytes,
                } => {
                    circuit.success();
                    let result = ExecutionResult::succeeded(payload, execution_time_ms, memory_used_bytes);
                    if descriptor.cacheable {
                        self.cache.put(
                            fingerprint,
                            CacheScope {
                                tenant_id: &request.tenant_id,
                                action: &descriptor.action,
                                version: &descriptor.version,
                            },
                            &result,
                            descriptor.cache_ttl_ms.map(Duration::from_millis),
                        );
                    }
                    self.metrics.record_execution_time(execution_time_ms);
                    self.events.emit(self.event(
                        request,
                        &descriptor,
                        attempt,
                        EventOutcome::Success,
                        None,
                        execution_time_ms,
                    ));
                    return Ok(result);
                }
                ExecutionOutcome::ApplicationError {
                    message,
                    execution_time_ms,
                    memory_used_bytes,
                } => {
                    // The action ran fine from the platform's point of view.
                    circuit.success();
                    self.metrics.record_execution_time(execution_time_ms);
                    self.events.emit(self.event(
                        request,
                        &descriptor,
                        attempt,
                        EventOutcome::ApplicationError,
                        None,
                        execution_time_ms,
                    ));
                    return Ok(ExecutionResult::application_error(
                        message,
                        execution_time_ms,
                        memory_used_bytes,
                    ));
                }
                ExecutionOutcome::Failed {
                    reason,
                    message,
                    execution_time_ms,
                } => {
                    let event_outcome = if reason.is_resource_violation() {
                        EventOutcome::ResourceExceeded
                    } else {
                        EventOutcome::WorkerFailure
                    };
                    self.events.emit(self.event(
                        request,
                        &descriptor,
                        attempt,
                        event_outcome,
                        Some(reason),
                        execution_time_ms,
                    ));

                    if self.retry.should_retry(attempt) {
                        let delay = self.retry.delay_after(attempt);
                        self.metrics.retries_total.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(
                            request_id = %request.request_id,
                            tenant_id = %request.tenant_id,
                            target = %target,
                            attempt,
                            reason = %reason,
                            error = %message,
                            delay_ms = delay.as_millis() as u64,
                            "attempt failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    circuit.failure(self.circuits.failure_weight(reason));
                    return Err(ExecutionError::from_failure(reason, message, attempt));
                }
            }
        }
    }

    fn limits_for(&self, descriptor: &ActionDescriptor) -> ResourceLimits {
        let mut limits = ResourceLimits::from_config(&self.limits);
        if let Some(bytes) = descriptor.memory_bytes {
            limits.memory_bytes = bytes;
        }
        if let Some(ms) = descriptor.timeout_ms {
            limits.timeout = Duration::from_millis(ms);
        }
        limits.allowed_domains = descriptor.allowed_domains.clone();
        limits
    }

    fn event(
        &self,
        request: &ExecutionRequest,
        descriptor: &ActionDescriptor,
        attempt: u32,
        outcome: EventOutcome,
        reason: Option<FailureReason>,
        duration_ms: u64,
    ) -> ExecutionEvent {
        ExecutionEvent {
            request_id: request.request_id.clone(),
            tenant_id: request.tenant_id.clone(),
            action: descriptor.action.clone(),
            version: descriptor.version.clone(),
            attempt,
            outcome,
            reason,
            duration_ms,
            from_cache: outcome == EventOutcome::CacheHit,
            timestamp: Utc::now(),
        }
    }

    /// Removes cached results of an action, optionally only one version.
    pub fn invalidate(&self, action: &str, version: Option<&str>) -> usize {
        let removed = self.cache.invalidate(action, version);
        tracing::info!(action, version = ?version, removed, "cache invalidated");
        removed
    }

    /// Periodic housekeeping: drop healthy circuits, expired cache entries
    /// and idle quota entries from earlier days.
    pub fn maintenance(&self) -> MaintenanceReport {
        MaintenanceReport {
            circuits_swept: self.circuits.sweep(),
            cache_expired: self.cache.purge_expired(),
            quota_swept: self.quota.sweep(),
        }
    }

    pub fn health(&self) -> HealthReport {
        let pool = self.pool.snapshot();
        let counts = self.circuits.counts();
        let saturated = pool.queued >= pool.queue_depth;
        HealthReport {
            status: if saturated { "degraded" } else { "ok" },
            sandbox: pool.sandbox,
            workers: pool.size,
            busy: pool.busy,
            idle: pool.idle,
            queued: pool.queued,
            queue_depth: pool.queue_depth,
            open_circuits: counts.open + counts.half_open,
        }
    }

    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            pool: self.pool.snapshot(),
            cache: self.cache.stats(),
            quota: self.quota.stats(),
            quota_tenants: self.quota.tenants(),
            circuit_counts: self.circuits.counts(),
            circuits: self.circuits.snapshot(),
            circuits_opened_total: self.circuits.opened_total(),
            circuit_rejections_total: self.circuits.rejected_total(),
            outcomes: self.metrics.outcomes(),
            attempts_total: self.metrics.attempts_total.load(Ordering::Relaxed),
            retries_total: self.metrics.retries_total.load(Ordering::Relaxed),
        }
    }

    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::CircuitState;
    use crate::events::recording::RecordingSink;
    use crate::testing::ScriptedSandbox;
    use serde_json::{json, Value};
    use warden_common::{QuotaScope, Tier};
    use warden_registry::MemoryRegistry;

    struct Harness {
        supervisor: Arc<Supervisor>,
        sandbox: ScriptedSandbox,
        events: Arc<RecordingSink>,
        registry: MemoryRegistry,
    }

    async fn harness_with(config: WardenConfig) -> Harness {
        let registry = MemoryRegistry::with_actions(
            false,
            [
                ActionDescriptor::new("summarize", "v2"),
                ActionDescriptor::new("translate", "v1"),
            ],
        )
        .await;
        let sandbox = ScriptedSandbox::new();
        let events = Arc::new(RecordingSink::default());
        let supervisor = Supervisor::new(
            &config,
            Arc::new(registry.clone()),
            Arc::new(sandbox.clone()),
            events.clone(),
        );
        Harness {
            supervisor: Arc::new(supervisor),
            sandbox,
            events,
            registry,
        }
    }

    async fn harness() -> Harness {
        harness_with(WardenConfig::default()).await
    }

    fn request(tenant: &str, target: &str, params: Value, tier: Tier) -> ExecutionRequest {
        ExecutionRequest::new(tenant, target.parse().unwrap(), params, tier, None)
    }

    #[tokio::test(start_paused = true)]
    async fn test_happy_path_then_cache_hit() {
        let h = harness().await;
        let params = json!({"text": "hello world", "lang": "en"});

        let first = h
            .supervisor
            .execute(request("acme", "summarize@v2", params.clone(), Tier::Pro))
            .await
            .unwrap();
        assert!(first.success);
        assert!(!first.from_cache);
        assert_eq!(first.payload.as_ref().unwrap()["echo"]["text"], "hello world");

        // Same params with keys reordered and unversioned target: still a hit.
        let second = h
            .supervisor
            .execute(request(
                "acme",
                "summarize",
                json!({"lang": "en", "text": "hello world"}),
                Tier::Pro,
            ))
            .await
            .unwrap();
        assert!(second.from_cache);
        assert_eq!(second.payload, first.payload);

        assert_eq!(h.sandbox.counters.executed(), 1);
        assert_eq!(h.supervisor.quota().usage("acme").unwrap().daily_count, 1);

        let outcomes: Vec<EventOutcome> = h.events.events().iter().map(|e| e.outcome).collect();
        assert_eq!(outcomes, vec![EventOutcome::Success, EventOutcome::CacheHit]);
        h.supervisor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_cache_sharing_across_tenants() {
        let h = harness().await;
        let params = json!({"text": "same"});
        h.supervisor
            .execute(request("a", "summarize@v2", params.clone(), Tier::Pro))
            .await
            .unwrap();
        let other = h
            .supervisor
            .execute(request("b", "summarize@v2", params, Tier::Pro))
            .await
            .unwrap();
        assert!(!other.from_cache);
        assert_eq!(h.sandbox.counters.executed(), 2);
        h.supervisor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_free_tier_quota_exhaustion() {
        let h = harness().await;
        for i in 0..100 {
            let r = h
                .supervisor
                .execute(request("free-t", "translate", json!({ "i": i }), Tier::Free))
                .await
                .unwrap();
            assert!(r.success);
        }
        let err = h
            .supervisor
            .execute(request("free-t", "translate", json!({"i": 100}), Tier::Free))
            .await
            .unwrap_err();
        match err {
            ExecutionError::QuotaExceeded {
                scope,
                retry_after_ms,
            } => {
                assert_eq!(scope, QuotaScope::Daily);
                assert!(retry_after_ms > 0 && retry_after_ms <= 86_400_000);
            }
            other => panic!("expected quota rejection, got {other:?}"),
        }
        // A cached request is still served at zero cost.
        let cached = h
            .supervisor
            .execute(request("free-t", "translate", json!({"i": 5}), Tier::Free))
            .await
            .unwrap();
        assert!(cached.from_cache);
        assert_eq!(h.sandbox.counters.executed(), 100);
        h.supervisor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_then_success_on_second_attempt() {
        let h = harness().await;
        let flaky = {
            let sup = h.supervisor.clone();
            tokio::spawn(async move {
                sup.execute(request("t1", "summarize", json!({"hangFirst": 1}), Tier::Pro))
                    .await
            })
        };
        let bystander = h
            .supervisor
            .execute(request("t2", "summarize", json!({"x": 1}), Tier::Pro))
            .await
            .unwrap();
        assert!(bystander.success);

        let result = flaky.await.unwrap().unwrap();
        assert!(result.success);
        assert_eq!(result.payload.unwrap()["attempt"], 2);

        let t1_events: Vec<(u32, EventOutcome, Option<FailureReason>)> = h
            .events
            .events()
            .into_iter()
            .filter(|e| e.tenant_id == "t1")
            .map(|e| (e.attempt, e.outcome, e.reason))
            .collect();
        assert_eq!(
            t1_events,
            vec![
                (1, EventOutcome::WorkerFailure, Some(FailureReason::Timeout)),
                (2, EventOutcome::Success, None),
            ]
        );
        assert_eq!(h.supervisor.circuits().state("t1", "summarize@v2"), CircuitState::Closed);
        assert_eq!(h.supervisor.pool().snapshot().timeouts, 1);
        assert_eq!(h.supervisor.metrics().retries_total.load(Ordering::Relaxed), 1);
        h.supervisor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_opens_after_repeated_failures_without_consuming_quota() {
        let h = harness().await;
        for i in 0..5 {
            let err = h
                .supervisor
                .execute(request("t1", "summarize", json!({"crash": true, "i": i}), Tier::Pro))
                .await
                .unwrap_err();
            assert!(matches!(
                err,
                ExecutionError::WorkerFailure {
                    reason: FailureReason::Crashed,
                    attempts: 3,
                    ..
                }
            ));
        }
        assert_eq!(h.sandbox.counters.executed(), 15);

        let err = h
            .supervisor
            .execute(request("t1", "summarize", json!({"ok": true}), Tier::Pro))
            .await
            .unwrap_err();
        match err {
            ExecutionError::CircuitOpen { retry_after_ms, .. } => {
                assert!(retry_after_ms > 0 && retry_after_ms <= 30_000)
            }
            other => panic!("expected open circuit, got {other:?}"),
        }
        assert_eq!(h.supervisor.quota().usage("t1").unwrap().daily_count, 5);
        assert_eq!(h.sandbox.counters.executed(), 15);

        // The same action for another tenant is unaffected.
        assert!(h
            .supervisor
            .execute(request("t2", "summarize", json!({}), Tier::Pro))
            .await
            .unwrap()
            .success);
        h.supervisor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_recovers_after_cooldown() {
        let h = harness().await;
        for i in 0..5 {
            let _ = h
                .supervisor
                .execute(request("t1", "translate", json!({"crash": true, "i": i}), Tier::Pro))
                .await;
        }
        tokio::time::sleep(Duration::from_secs(30)).await;
        let r = h
            .supervisor
            .execute(request("t1", "translate", json!({"fixed": true}), Tier::Pro))
            .await
            .unwrap();
        assert!(r.success);
        assert_eq!(h.supervisor.circuits().state("t1", "translate@v1"), CircuitState::Closed);
        h.supervisor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_resource_violations_count_double() {
        let h = harness().await;
        for i in 0..3 {
            let err = h
                .supervisor
                .execute(request(
                    "t1",
                    "summarize",
                    json!({"violation": "MemoryExceeded", "i": i}),
                    Tier::Pro,
                ))
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::ResourceExceeded);
        }
        assert_eq!(h.supervisor.circuits().state("t1", "summarize@v2"), CircuitState::Open);
        h.supervisor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_application_error_is_terminal_and_not_cached() {
        let h = harness().await;
        let params = json!({"appError": "unsupported language"});
        for _ in 0..2 {
            let r = h
                .supervisor
                .execute(request("t1", "translate", params.clone(), Tier::Pro))
                .await
                .unwrap();
            assert!(!r.success);
            assert_eq!(r.error_kind, Some(ErrorKind::ApplicationError));
            assert_eq!(r.message.as_deref(), Some("unsupported language"));
            assert!(!r.from_cache);
        }
        assert_eq!(h.sandbox.counters.executed(), 2);
        assert_eq!(
            h.supervisor
                .metrics()
                .outcome_count(Outcome::Failed(ErrorKind::ApplicationError)),
            2
        );
        h.supervisor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_targets_are_validation_errors() {
        let h = harness().await;
        for target in ["nope", "summarize@v9"] {
            let err = h
                .supervisor
                .execute(request("t1", target, json!({}), Tier::Pro))
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::ValidationError);
        }
        let err = h
            .supervisor
            .execute(request("bad tenant", "summarize", json!({}), Tier::Pro))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationError);
        assert!(h.supervisor.quota().usage("t1").is_none());
        h.supervisor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_releases_quota_and_worker() {
        let h = harness().await;
        let handle = {
            let sup = h.supervisor.clone();
            tokio::spawn(async move {
                sup.execute(request("free-t", "summarize", json!({"hangFirst": 1}), Tier::Free))
                    .await
            })
        };
        for _ in 0..100 {
            if h.supervisor.pool().snapshot().busy == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(h.supervisor.quota().usage("free-t").unwrap().concurrent, 1);
        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());
        assert_eq!(h.supervisor.quota().usage("free-t").unwrap().concurrent, 0);

        let r = h
            .supervisor
            .execute(request("free-t", "summarize", json!({"next": 1}), Tier::Free))
            .await
            .unwrap();
        assert!(r.success);
        assert!(h
            .events
            .events()
            .iter()
            .any(|e| e.outcome == EventOutcome::Cancelled));
        h.supervisor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_backpressure_when_pool_saturated() {
        let mut config = WardenConfig::default();
        config.pool.min_workers = 1;
        config.pool.max_workers = 1;
        config.pool.queue_depth = 1;
        let h = harness_with(config).await;

        let spawn_slow = |tenant: &'static str| {
            let sup = h.supervisor.clone();
            tokio::spawn(async move {
                sup.execute(request(tenant, "summarize", json!({"sleepMs": 5_000}), Tier::Enterprise))
                    .await
            })
        };

        let first = spawn_slow("e1");
        while h.supervisor.pool().snapshot().busy < 1 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        let second = spawn_slow("e2");
        while h.supervisor.pool().queued() < 1 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let err = h
            .supervisor
            .execute(request("e3", "summarize", json!({}), Tier::Enterprise))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ExecutionError::Backpressure {
                retry_after_ms: BACKPRESSURE_RETRY_MS
            }
        );
        assert_eq!(h.supervisor.health().status, "degraded");
        // Backpressure does not count against the circuit or hold quota.
        assert_eq!(h.supervisor.circuits().state("e3", "summarize@v2"), CircuitState::Closed);
        assert_eq!(h.supervisor.quota().usage("e3").unwrap().concurrent, 0);

        assert!(first.await.unwrap().unwrap().success);
        assert!(second.await.unwrap().unwrap().success);
        h.supervisor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_version_change_and_invalidation() {
        let h = harness().await;
        let params = json!({"text": "x"});
        h.supervisor
            .execute(request("t1", "summarize", params.clone(), Tier::Pro))
            .await
            .unwrap();

        h.registry.upsert(ActionDescriptor::new("summarize", "v3")).await;
        let r = h
            .supervisor
            .execute(request("t1", "summarize", params.clone(), Tier::Pro))
            .await
            .unwrap();
        assert!(!r.from_cache);

        assert_eq!(h.supervisor.invalidate("summarize", Some("v2")), 1);
        assert_eq!(h.supervisor.invalidate("summarize", None), 1);
        assert!(h.supervisor.cache().is_empty());
        h.supervisor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_maintenance_purges_expired_entries() {
        let h = harness().await;
        h.supervisor
            .execute(request("t1", "summarize", json!({"text": "x"}), Tier::Pro))
            .await
            .unwrap();
        assert_eq!(h.supervisor.maintenance().cache_expired, 0);

        tokio::time::advance(Duration::from_secs(301)).await;
        let report = h.supervisor.maintenance();
        assert_eq!(report.cache_expired, 1);
        // Today's usage is kept; only earlier days are forgotten.
        assert_eq!(report.quota_swept, 0);
        assert_eq!(h.supervisor.quota().tenants(), 1);
        h.supervisor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_action_overrides_reach_the_sandbox() {
        let h = harness().await;
        let mut d = ActionDescriptor::new("fetch", "1");
        d.timeout_ms = Some(50);
        d.cacheable = false;
        d.allowed_domains = vec!["api.example.com".into()];
        h.registry.upsert(d.clone()).await;

        let limits = h.supervisor.limits_for(&d);
        assert_eq!(limits.timeout, Duration::from_millis(50));
        assert_eq!(limits.allowed_domains, vec!["api.example.com".to_string()]);

        let err = h
            .supervisor
            .execute(request("t1", "fetch", json!({"sleepMs": 100}), Tier::Pro))
            .await
            .unwrap_err();
        assert_eq!(err.reason(), Some(FailureReason::Timeout));

        h.supervisor
            .execute(request("t1", "fetch", json!({}), Tier::Pro))
            .await
            .unwrap();
        assert!(h.supervisor.cache().is_empty());
        h.supervisor.shutdown().await;
    }
}
