use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use warden_common::{FailureReason, PoolConfig};

use crate::sandbox::{Sandbox, SandboxError, SandboxOutcome, SandboxTask, SandboxWorker};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    pub min_workers: usize,
    pub max_workers: usize,
    pub queue_depth: usize,
    pub recycle_after: u64,
    pub recycle_memory_bytes: u64,
    pub idle_timeout: Duration,
}

impl From<&PoolConfig> for PoolSettings {
    fn from(cfg: &PoolConfig) -> Self {
        let max_workers = cfg.max_workers.max(1);
        Self {
            min_workers: cfg.min_workers.min(max_workers),
            max_workers,
            queue_depth: cfg.queue_depth.max(1),
            recycle_after: cfg.recycle_after,
            recycle_memory_bytes: cfg.recycle_memory_bytes,
            idle_timeout: Duration::from_millis(cfg.idle_timeout_ms),
        }
    }
}

/// What a dispatch produced, as seen by the pool.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Completed {
        payload: Value,
        execution_time_ms: u64,
        memory_used_bytes: u64,
    },
    ApplicationError {
        message: String,
        execution_time_ms: u64,
        memory_used_bytes: u64,
    },
    /// Timeout, crash or limit violation. The worker has been discarded.
    Failed {
        reason: FailureReason,
        message: String,
        execution_time_ms: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error("worker pool queue is full")]
    Backpressure,
    #[error("worker pool is shut down")]
    ShutDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotStatus {
    /// Elastic slot with no worker running.
    Vacant,
    Idle,
    Busy,
    Crashed,
    Recycling,
}

impl SlotStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => SlotStatus::Idle,
            2 => SlotStatus::Busy,
            3 => SlotStatus::Crashed,
            4 => SlotStatus::Recycling,
            _ => SlotStatus::Vacant,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            SlotStatus::Vacant => 0,
            SlotStatus::Idle => 1,
            SlotStatus::Busy => 2,
            SlotStatus::Crashed => 3,
            SlotStatus::Recycling => 4,
        }
    }
}

#[derive(Debug, Default)]
struct SlotCell {
    status: AtomicU8,
    executions_since_recycle: AtomicU64,
    live: AtomicBool,
}

impl SlotCell {
    fn set(&self, status: SlotStatus) {
        self.status.store(status.as_u8(), Ordering::Relaxed);
    }

    fn status(&self) -> SlotStatus {
        SlotStatus::from_u8(self.status.load(Ordering::Relaxed))
    }
}

#[derive(Debug, Default)]
struct PoolCounters {
    spawned: AtomicU64,
    completed: AtomicU64,
    crashes: AtomicU64,
    timeouts: AtomicU64,
    violations: AtomicU64,
    recycles: AtomicU64,
    cancelled: AtomicU64,
    rejected: AtomicU64,
    retired_idle: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotSnapshot {
    pub slot: usize,
    pub status: SlotStatus,
    pub executions_since_recycle: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolSnapshot {
    pub sandbox: String,
    pub size: usize,
    pub min_workers: usize,
    pub max_workers: usize,
    pub busy: usize,
    pub idle: usize,
    pub queued: usize,
    pub queue_depth: usize,
    pub spawned: u64,
    pub completed: u64,
    pub crashes: u64,
    pub timeouts: u64,
    pub violations: u64,
    pub recycles: u64,
    pub cancelled: u64,
    pub rejected: u64,
    pub retired_idle: u64,
    pub slots: Vec<SlotSnapshot>,
}

struct Job {
    task: SandboxTask,
    reply: oneshot::Sender<ExecutionOutcome>,
    /// One of `max_workers + queue_depth` admission slots, held until the
    /// slot that took the job is done with it.
    admission: OwnedSemaphorePermit,
}

struct PoolShared {
    sandbox: Arc<dyn Sandbox>,
    settings: PoolSettings,
    rx: Mutex<mpsc::Receiver<Job>>,
    slots: Vec<SlotCell>,
    counters: PoolCounters,
}

enum NextJob {
    Job(Job),
    Idle,
    Closed,
}

/// Bounded set of sandbox workers fed from a bounded FIFO queue.
///
/// Each slot runs in its own task and takes one job at a time from the shared
/// queue. A submission is admitted while fewer than `max_workers +
/// queue_depth` jobs are running or waiting; anything beyond that is rejected
/// immediately, so jobs only count against the queue once every slot is busy.
pub struct WorkerPool {
    tx: mpsc::Sender<Job>,
    admission: Arc<Semaphore>,
    shared: Arc<PoolShared>,
    cancel: CancellationToken,
    runners: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Starts the slot runners. Must be called inside a tokio runtime.
    pub fn start(sandbox: Arc<dyn Sandbox>, settings: PoolSettings) -> Self {
        let capacity = settings.max_workers + settings.queue_depth;
        let (tx, rx) = mpsc::channel(capacity);
        let shared = Arc::new(PoolShared {
            sandbox,
            settings,
            rx: Mutex::new(rx),
            slots: (0..settings.max_workers).map(|_| SlotCell::default()).collect(),
            counters: PoolCounters::default(),
        });
        let cancel = CancellationToken::new();

        let runners = (0..settings.max_workers)
            .map(|idx| tokio::spawn(run_slot(shared.clone(), idx, cancel.clone())))
            .collect();

        tracing::info!(
            sandbox = shared.sandbox.kind(),
            min_workers = settings.min_workers,
            max_workers = settings.max_workers,
            queue_depth = settings.queue_depth,
            "worker pool started"
        );

        Self {
            tx,
            admission: Arc::new(Semaphore::new(capacity)),
            shared,
            cancel,
            runners: parking_lot::Mutex::new(runners),
        }
    }

    /// Queues a task and waits for its outcome. Never waits for queue space:
    /// with every slot busy and the queue full the result is an immediate
    /// [`SubmitError::Backpressure`].
    ///
    /// Dropping the returned future cancels the task; a worker still running
    /// it is terminated and replaced.
    pub async fn submit(&self, task: SandboxTask) -> Result<ExecutionOutcome, SubmitError> {
        if self.tx.is_closed() {
            return Err(SubmitError::ShutDown);
        }
        let admission = match self.admission.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => {
                self.shared.counters.rejected.fetch_add(1, Ordering::Relaxed);
                return Err(SubmitError::Backpressure);
            }
            Err(TryAcquireError::Closed) => return Err(SubmitError::ShutDown),
        };
        let (reply, rx) = oneshot::channel();
        match self.tx.try_send(Job {
            task,
            reply,
            admission,
        }) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.shared.counters.rejected.fetch_add(1, Ordering::Relaxed);
                return Err(SubmitError::Backpressure);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => return Err(SubmitError::ShutDown),
        }
        rx.await.map_err(|_| SubmitError::ShutDown)
    }

    /// Jobs waiting in the queue that no slot has taken yet.
    pub fn queued(&self) -> usize {
        self.tx.max_capacity().saturating_sub(self.tx.capacity())
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let s = &self.shared;
        let c = &s.counters;
        let slots: Vec<SlotSnapshot> = s
            .slots
            .iter()
            .enumerate()
            .map(|(slot, cell)| SlotSnapshot {
                slot,
                status: cell.status(),
                executions_since_recycle: cell.executions_since_recycle.load(Ordering::Relaxed),
            })
            .collect();
        let size = s
            .slots
            .iter()
            .filter(|cell| cell.live.load(Ordering::Relaxed))
            .count();
        let busy = slots
            .iter()
            .filter(|slot| slot.status == SlotStatus::Busy)
            .count();

        PoolSnapshot {
            sandbox: s.sandbox.kind().to_string(),
            size,
            min_workers: s.settings.min_workers,
            max_workers: s.settings.max_workers,
            busy,
            idle: size.saturating_sub(busy),
            queued: self.queued(),
            queue_depth: s.settings.queue_depth,
            spawned: c.spawned.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            crashes: c.crashes.load(Ordering::Relaxed),
            timeouts: c.timeouts.load(Ordering::Relaxed),
            violations: c.violations.load(Ordering::Relaxed),
            recycles: c.recycles.load(Ordering::Relaxed),
            cancelled: c.cancelled.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            retired_idle: c.retired_idle.load(Ordering::Relaxed),
            slots,
        }
    }

    /// Stops taking work, lets in-flight tasks finish, terminates every worker.
    /// Tasks still queued are dropped and their callers see `ShutDown`.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.admission.close();
        self.shared.rx.lock().await.close();
        let runners: Vec<JoinHandle<()>> = std::mem::take(&mut *self.runners.lock());
        for handle in runners {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "pool runner ended abnormally");
            }
        }
        let mut rx = self.shared.rx.lock().await;
        let mut dropped = 0usize;
        while rx.try_recv().is_ok() {
            dropped += 1;
        }
        tracing::info!(dropped, "worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn next_job(rx: &Mutex<mpsc::Receiver<Job>>, idle_limit: Option<Duration>) -> NextJob {
    let recv = async { rx.lock().await.recv().await };
    let received = match idle_limit {
        Some(limit) => match tokio::time::timeout(limit, recv).await {
            Ok(job) => job,
            Err(_) => return NextJob::Idle,
        },
        None => recv.await,
    };
    match received {
        Some(job) => NextJob::Job(job),
        None => NextJob::Closed,
    }
}

async fn spawn_worker(shared: &PoolShared, idx: usize) -> Result<Box<dyn SandboxWorker>, SandboxError> {
    let cell = &shared.slots[idx];
    let worker = shared.sandbox.spawn(idx).await?;
    shared.counters.spawned.fetch_add(1, Ordering::Relaxed);
    cell.executions_since_recycle.store(0, Ordering::Relaxed);
    cell.live.store(true, Ordering::Relaxed);
    cell.set(SlotStatus::Idle);
    Ok(worker)
}

async fn discard_worker(shared: &PoolShared, idx: usize, worker: &mut Option<Box<dyn SandboxWorker>>, status: SlotStatus) {
    let cell = &shared.slots[idx];
    cell.set(status);
    if let Some(mut w) = worker.take() {
        w.terminate().await;
    }
    cell.live.store(false, Ordering::Relaxed);
    cell.set(SlotStatus::Vacant);
}

/// Warm slots get their replacement right away; elastic slots respawn on demand.
async fn replenish(shared: &PoolShared, idx: usize, worker: &mut Option<Box<dyn SandboxWorker>>) {
    if idx >= shared.settings.min_workers || worker.is_some() {
        return;
    }
    match spawn_worker(shared, idx).await {
        Ok(w) => *worker = Some(w),
        Err(e) => tracing::warn!(slot = idx, error = %e, "failed to replace worker"),
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}

async fn run_slot(shared: Arc<PoolShared>, idx: usize, cancel: CancellationToken) {
    let warm = idx < shared.settings.min_workers;
    let mut worker: Option<Box<dyn SandboxWorker>> = None;
    replenish(&shared, idx, &mut worker).await;

    loop {
        let idle_limit = (!warm && worker.is_some()).then_some(shared.settings.idle_timeout);
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = next_job(&shared.rx, idle_limit) => next,
        };

        let job = match next {
            NextJob::Job(job) => job,
            NextJob::Idle => {
                tracing::debug!(slot = idx, "retiring idle elastic worker");
                shared.counters.retired_idle.fetch_add(1, Ordering::Relaxed);
                discard_worker(&shared, idx, &mut worker, SlotStatus::Recycling).await;
                continue;
            }
            NextJob::Closed => break,
        };

        // The admission slot is given back when this iteration ends.
        let Job {
            task,
            mut reply,
            admission: _admission,
        } = job;
        if reply.is_closed() {
            shared.counters.cancelled.fetch_add(1, Ordering::Relaxed);
            continue;
        }

        let mut current = match worker.take() {
            Some(w) => w,
            None => match spawn_worker(&shared, idx).await {
                Ok(w) => w,
                Err(e) => {
                    tracing::warn!(slot = idx, error = %e, "worker spawn failed");
                    shared.counters.crashes.fetch_add(1, Ordering::Relaxed);
                    shared.slots[idx].set(SlotStatus::Crashed);
                    let _ = reply.send(ExecutionOutcome::Failed {
                        reason: FailureReason::Crashed,
                        message: e.to_string(),
                        execution_time_ms: 0,
                    });
                    shared.slots[idx].set(SlotStatus::Vacant);
                    continue;
                }
            },
        };

        let cell = &shared.slots[idx];
        cell.set(SlotStatus::Busy);
        let started = Instant::now();

        let result = tokio::select! {
            r = tokio::time::timeout(task.limits.timeout, current.execute(&task)) => Some(r),
            _ = reply.closed() => None,
        };
        let execution_time_ms = elapsed_ms(started);
        worker = Some(current);

        let (outcome, healthy) = match result {
            None => {
                tracing::info!(slot = idx, request_id = %task.request_id, "caller went away, terminating worker");
                shared.counters.cancelled.fetch_add(1, Ordering::Relaxed);
                discard_worker(&shared, idx, &mut worker, SlotStatus::Crashed).await;
                replenish(&shared, idx, &mut worker).await;
                continue;
            }
            Some(Err(_elapsed)) => {
                shared.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                (
                    ExecutionOutcome::Failed {
                        reason: FailureReason::Timeout,
                        message: format!(
                            "execution exceeded {} ms",
                            task.limits.timeout.as_millis()
                        ),
                        execution_time_ms,
                    },
                    false,
                )
            }
            Some(Ok(Err(e))) => {
                shared.counters.crashes.fetch_add(1, Ordering::Relaxed);
                (
                    ExecutionOutcome::Failed {
                        reason: FailureReason::Crashed,
                        message: e.to_string(),
                        execution_time_ms,
                    },
                    false,
                )
            }
            Some(Ok(Ok(SandboxOutcome::ResourceViolation { reason, message }))) => {
                shared.counters.violations.fetch_add(1, Ordering::Relaxed);
                (
                    ExecutionOutcome::Failed {
                        reason,
                        message,
                        execution_time_ms,
                    },
                    false,
                )
            }
            Some(Ok(Ok(SandboxOutcome::Completed {
                payload,
                memory_used_bytes,
            }))) => (
                ExecutionOutcome::Completed {
                    payload,
                    execution_time_ms,
                    memory_used_bytes,
                },
                true,
            ),
            Some(Ok(Ok(SandboxOutcome::ApplicationError {
                message,
                memory_used_bytes,
            }))) => (
                ExecutionOutcome::ApplicationError {
                    message,
                    execution_time_ms,
                    memory_used_bytes,
                },
                true,
            ),
        };

        if healthy {
            shared.counters.completed.fetch_add(1, Ordering::Relaxed);
            let executions = cell.executions_since_recycle.fetch_add(1, Ordering::Relaxed) + 1;
            let resident = worker.as_ref().map_or(0, |w| w.resident_bytes());
            let settings = &shared.settings;
            let worn_out = settings.recycle_after > 0 && executions >= settings.recycle_after;
            let bloated = settings.recycle_memory_bytes > 0 && resident > settings.recycle_memory_bytes;

            let _ = reply.send(outcome);

            if worn_out || bloated {
                tracing::info!(slot = idx, executions, resident, "recycling worker");
                shared.counters.recycles.fetch_add(1, Ordering::Relaxed);
                discard_worker(&shared, idx, &mut worker, SlotStatus::Recycling).await;
                replenish(&shared, idx, &mut worker).await;
            } else {
                cell.set(SlotStatus::Idle);
            }
        } else {
            if let ExecutionOutcome::Failed { reason, message, .. } = &outcome {
                tracing::warn!(
                    slot = idx,
                    request_id = %task.request_id,
                    tenant_id = %task.tenant_id,
                    action = %task.action,
                    reason = %reason,
                    error = %message,
                    "worker failed, replacing"
                );
            }
            let _ = reply.send(outcome);
            discard_worker(&shared, idx, &mut worker, SlotStatus::Crashed).await;
            replenish(&shared, idx, &mut worker).await;
        }
    }

    discard_worker(&shared, idx, &mut worker, SlotStatus::Recycling).await;
}
