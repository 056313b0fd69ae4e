use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;
use warden_common::{CircuitConfig, FailureReason};

/// Retry hint handed out while a half-open trial is already running.
const TRIAL_BUSY_RETRY_MS: u64 = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CircuitKey {
    tenant_id: String,
    target: String,
}

#[derive(Debug)]
struct CircuitEntry {
    state: CircuitState,
    window: VecDeque<(Instant, u32)>,
    last_failure_at: Option<Instant>,
    opened_at: Option<Instant>,
    cooldown: Duration,
    trial_in_flight: bool,
}

impl CircuitEntry {
    fn new(cooldown: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            window: VecDeque::new(),
            last_failure_at: None,
            opened_at: None,
            cooldown,
            trial_in_flight: false,
        }
    }

    fn failure_count(&self) -> u32 {
        self.window.iter().map(|(_, w)| *w).sum()
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some((at, _)) = self.window.front() {
            if now.duration_since(*at) > window {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.trial_in_flight = false;
        self.window.clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitRejection {
    pub state: CircuitState,
    pub retry_after_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitSnapshot {
    pub tenant_id: String,
    pub target: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub cooldown_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CircuitCounts {
    pub closed: usize,
    pub open: usize,
    pub half_open: usize,
}

/// Per-(tenant, action@version) breakers. Entries are created on first
/// failure and swept after sustained health.
#[derive(Debug)]
pub struct CircuitRegistry {
    config: CircuitConfig,
    circuits: DashMap<CircuitKey, CircuitEntry>,
    opened_total: AtomicU64,
    rejected_total: AtomicU64,
}

impl CircuitRegistry {
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            config,
            circuits: DashMap::new(),
            opened_total: AtomicU64::new(0),
            rejected_total: AtomicU64::new(0),
        }
    }

    fn base_cooldown(&self) -> Duration {
        Duration::from_millis(self.config.cooldown_ms)
    }

    /// How much a failure of this kind counts toward the threshold.
    pub fn failure_weight(&self, reason: FailureReason) -> u32 {
        if reason.is_resource_violation() {
            self.config.resource_failure_weight.max(1)
        } else {
            1
        }
    }

    /// Asks whether a dispatch may proceed. A half-open circuit admits exactly
    /// one trial; the returned permit carries it.
    pub fn try_acquire(
        &self,
        tenant_id: &str,
        target: &str,
    ) -> Result<CircuitPermit<'_>, CircuitRejection> {
        let key = CircuitKey {
            tenant_id: tenant_id.to_string(),
            target: target.to_string(),
        };
        let now = Instant::now();

        let trial = match self.circuits.get_mut(&key) {
            None => false,
            Some(mut entry) => match entry.state {
                CircuitState::Closed => false,
                CircuitState::Open => {
                    let reopen_at = entry.opened_at.unwrap_or(now) + entry.cooldown;
                    if now < reopen_at {
                        self.rejected_total.fetch_add(1, Ordering::Relaxed);
                        return Err(CircuitRejection {
                            state: CircuitState::Open,
                            retry_after_ms: (reopen_at - now).as_millis() as u64,
                        });
                    }
                    entry.state = CircuitState::HalfOpen;
                    entry.trial_in_flight = true;
                    tracing::info!(tenant_id, target, "circuit half-open, admitting trial");
                    true
                }
                CircuitState::HalfOpen => {
                    if entry.trial_in_flight {
                        self.rejected_total.fetch_add(1, Ordering::Relaxed);
                        return Err(CircuitRejection {
                            state: CircuitState::HalfOpen,
                            retry_after_ms: TRIAL_BUSY_RETRY_MS,
                        });
                    }
                    entry.trial_in_flight = true;
                    true
                }
            },
        };

        Ok(CircuitPermit {
            registry: self,
            key: Some(key),
            trial,
        })
    }

    fn on_success(&self, key: &CircuitKey, trial: bool) {
        let Some(mut entry) = self.circuits.get_mut(key) else {
            return;
        };
        match entry.state {
            CircuitState::Closed => entry.window.clear(),
            CircuitState::HalfOpen if trial => {
                entry.state = CircuitState::Closed;
                entry.window.clear();
                entry.opened_at = None;
                entry.trial_in_flight = false;
                entry.cooldown = self.base_cooldown();
                tracing::info!(tenant_id = %key.tenant_id, target = %key.target, "circuit closed");
            }
            _ => {}
        }
    }

    fn on_failure(&self, key: &CircuitKey, weight: u32, trial: bool) {
        let now = Instant::now();
        let window = Duration::from_millis(self.config.window_ms);
        let max_cooldown = Duration::from_millis(self.config.max_cooldown_ms);
        let base = self.base_cooldown();

        let mut entry = self
            .circuits
            .entry(key.clone())
            .or_insert_with(|| CircuitEntry::new(base));
        entry.last_failure_at = Some(now);

        match entry.state {
            CircuitState::Closed => {
                entry.window.push_back((now, weight));
                entry.prune(now, window);
                let failures = entry.failure_count();
                if failures >= self.config.failure_threshold {
                    entry.open(now);
                    self.opened_total.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        tenant_id = %key.tenant_id,
                        target = %key.target,
                        failures,
                        cooldown_ms = entry.cooldown.as_millis() as u64,
                        "circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen if trial => {
                entry.cooldown = (entry.cooldown * 2).min(max_cooldown);
                entry.open(now);
                self.opened_total.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    tenant_id = %key.tenant_id,
                    target = %key.target,
                    cooldown_ms = entry.cooldown.as_millis() as u64,
                    "circuit trial failed, reopened"
                );
            }
            _ => {}
        }
    }

    fn release_trial(&self, key: &CircuitKey) {
        if let Some(mut entry) = self.circuits.get_mut(key) {
            if entry.state == CircuitState::HalfOpen {
                entry.trial_in_flight = false;
            }
        }
    }

    pub fn state(&self, tenant_id: &str, target: &str) -> CircuitState {
        let key = CircuitKey {
            tenant_id: tenant_id.to_string(),
            target: target.to_string(),
        };
        self.circuits
            .get(&key)
            .map(|e| e.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Drops closed circuits whose last failure is older than `gcAfterMs`.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let gc_after = Duration::from_millis(self.config.gc_after_ms);
        let before = self.circuits.len();
        self.circuits.retain(|_, entry| {
            entry.state != CircuitState::Closed
                || entry
                    .last_failure_at
                    .is_some_and(|at| now.duration_since(at) < gc_after)
        });
        before.saturating_sub(self.circuits.len())
    }

    pub fn counts(&self) -> CircuitCounts {
        let mut counts = CircuitCounts::default();
        for entry in self.circuits.iter() {
            match entry.state {
                CircuitState::Closed => counts.closed += 1,
                CircuitState::Open => counts.open += 1,
                CircuitState::HalfOpen => counts.half_open += 1,
            }
        }
        counts
    }

    pub fn snapshot(&self) -> Vec<CircuitSnapshot> {
        let mut out: Vec<CircuitSnapshot> = self
            .circuits
            .iter()
            .map(|e| CircuitSnapshot {
                tenant_id: e.key().tenant_id.clone(),
                target: e.key().target.clone(),
                state: e.state,
                failure_count: e.failure_count(),
                cooldown_ms: e.cooldown.as_millis() as u64,
            })
            .collect();
        out.sort_by(|a, b| (&a.tenant_id, &a.target).cmp(&(&b.tenant_id, &b.target)));
        out
    }

    pub fn opened_total(&self) -> u64 {
        self.opened_total.load(Ordering::Relaxed)
    }

    pub fn rejected_total(&self) -> u64 {
        self.rejected_total.load(Ordering::Relaxed)
    }
}

/// Permission to dispatch. Report the outcome with [`success`](Self::success)
/// or [`failure`](Self::failure); dropping an unreported trial permit frees
/// the half-open slot for the next caller.
#[derive(Debug)]
pub struct CircuitPermit<'a> {
    registry: &'a CircuitRegistry,
    key: Option<CircuitKey>,
    trial: bool,
}

impl CircuitPermit<'_> {
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        if let Some(key) = self.key.take() {
            self.registry.on_success(&key, self.trial);
        }
    }

    pub fn failure(mut self, weight: u32) {
        if let Some(key) = self.key.take() {
            self.registry.on_failure(&key, weight, self.trial);
        }
    }
}

impl Drop for CircuitPermit<'_> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            if self.trial {
                self.registry.release_trial(&key);
            }
        }
    }
}
