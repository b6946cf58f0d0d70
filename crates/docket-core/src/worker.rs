//! Worker slots and the execution engine.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{error, info, warn};

use crate::domain::{ProgressSnapshot, TaskEnvelope, TaskId, TaskName};
use crate::error::DocketError;
use crate::progress::ProgressTracker;
use crate::queue::{Broker, FailDecision, TaskLease};
use crate::runtime::{HandlerRegistry, TaskContext};
use crate::store::ResultStore;

/// Per-task time limits.
///
/// The soft limit raises a cooperative signal inside the handler (observable
/// through `TaskContext::soft_limit_reached`); the hard limit aborts the
/// invocation outright.
#[derive(Debug, Clone, Copy)]
pub struct TimeLimits {
    pub soft: Duration,
    pub hard: Duration,
}

impl Default for TimeLimits {
    fn default() -> Self {
        Self {
            soft: Duration::from_secs(300),
            hard: Duration::from_secs(600),
        }
    }
}

/// What a task ended as, for completion hooks.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    Success(serde_json::Value),
    Failure(String),
}

/// Observer of terminal task transitions. The pipeline composer registers
/// one of these so a finished stage can enqueue the next.
#[async_trait]
pub trait CompletionHook: Send + Sync {
    async fn on_terminal(&self, task_id: TaskId, outcome: &TaskOutcome);
}

/// A currently-executing task, as reported by the monitor.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveTask {
    pub task_id: TaskId,
    pub name: TaskName,
    pub attempt: u32,
    pub running_ms: u64,
}

struct RunningEntry {
    name: TaskName,
    attempt: u32,
    abort: AbortHandle,
    started_at: Instant,
}

/// Shared registry of in-flight invocations. The engine registers each
/// invocation; the controller uses it for `active` and forcible cancel.
#[derive(Clone, Default)]
pub struct RunningTasks {
    inner: Arc<Mutex<HashMap<TaskId, RunningEntry>>>,
}

impl RunningTasks {
    pub fn new() -> Self {
        Self::default()
    }

    async fn insert(&self, task_id: TaskId, entry: RunningEntry) {
        self.inner.lock().await.insert(task_id, entry);
    }

    async fn remove(&self, task_id: TaskId) {
        self.inner.lock().await.remove(&task_id);
    }

    /// Abort a running invocation. In-flight side effects may be lost.
    pub async fn abort(&self, task_id: TaskId) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.remove(&task_id) {
            Some(entry) => {
                entry.abort.abort();
                true
            }
            None => false,
        }
    }

    pub async fn snapshot(&self) -> Vec<ActiveTask> {
        let inner = self.inner.lock().await;
        inner
            .iter()
            .map(|(task_id, entry)| ActiveTask {
                task_id: *task_id,
                name: entry.name.clone(),
                attempt: entry.attempt,
                running_ms: entry.started_at.elapsed().as_millis() as u64,
            })
            .collect()
    }
}

/// Executes one lease end to end.
///
/// Contract:
/// - every invocation gets a freshly spawned tokio task, torn down after the
///   attempt; no async state is shared or reused across tasks;
/// - handler errors are classified, logged with id and args, mirrored as a
///   0% pre-failure snapshot, then handed to the broker so retry policy
///   applies;
/// - exhaustion (or a permanent error) goes terminal FAILURE and fires the
///   completion hooks with the final 0% "failed" snapshot in place.
pub struct ExecutionEngine {
    registry: Arc<HandlerRegistry>,
    store: Arc<ResultStore>,
    tracker: Arc<ProgressTracker>,
    hooks: Mutex<Vec<Arc<dyn CompletionHook>>>,
    limits: TimeLimits,
    running: RunningTasks,
}

impl ExecutionEngine {
    pub fn new(
        registry: Arc<HandlerRegistry>,
        store: Arc<ResultStore>,
        tracker: Arc<ProgressTracker>,
        limits: TimeLimits,
    ) -> Self {
        Self {
            registry,
            store,
            tracker,
            hooks: Mutex::new(Vec::new()),
            limits,
            running: RunningTasks::new(),
        }
    }

    pub fn running(&self) -> RunningTasks {
        self.running.clone()
    }

    pub async fn add_hook(&self, hook: Arc<dyn CompletionHook>) {
        self.hooks.lock().await.push(hook);
    }

    /// Execute one leased task to a reported outcome.
    pub async fn execute(&self, lease: Box<dyn TaskLease>) {
        let envelope = lease.envelope().clone();
        let task_id = envelope.task_id();
        let attempt = lease.attempt();
        self.store.mark_received(task_id).await;

        let Some(handler) = self.registry.get(envelope.name()).cloned() else {
            let err = DocketError::HandlerNotFound(envelope.name().clone());
            self.fail_attempt(lease, &envelope, err).await;
            return;
        };

        self.store.mark_started(task_id).await;
        info!(task_id = %task_id, task = %envelope.name(), attempt, "executing");

        // Isolated unit of execution: one fresh tokio task per invocation.
        let (soft_tx, soft_rx) = watch::channel(false);
        let ctx = TaskContext::new(task_id, Arc::clone(&self.tracker), soft_rx);
        let handler_envelope = envelope.clone();
        let mut invocation: JoinHandle<Result<serde_json::Value, DocketError>> =
            tokio::spawn(async move { handler.run(&handler_envelope, ctx).await });

        self.running
            .insert(
                task_id,
                RunningEntry {
                    name: envelope.name().clone(),
                    attempt,
                    abort: invocation.abort_handle(),
                    started_at: Instant::now(),
                },
            )
            .await;

        let soft = self.limits.soft;
        let soft_timer = tokio::spawn(async move {
            tokio::time::sleep(soft).await;
            let _ = soft_tx.send(true);
        });

        let result = tokio::select! {
            joined = &mut invocation => match joined {
                Ok(r) => r,
                Err(e) if e.is_cancelled() => {
                    Err(DocketError::Other("invocation aborted".into()))
                }
                Err(e) => Err(DocketError::Other(format!("invocation panicked: {e}"))),
            },
            _ = tokio::time::sleep(self.limits.hard) => {
                invocation.abort();
                Err(DocketError::HardTimeLimit(self.limits.hard))
            }
        };
        soft_timer.abort();
        self.running.remove(task_id).await;

        match result {
            Ok(value) => {
                self.store.set_success(task_id, value.clone()).await;
                if let Err(e) = lease.ack().await {
                    error!(task_id = %task_id, error = %e, "ack failed");
                }
                self.tracker.clear_route(task_id).await;
                self.notify_hooks(task_id, &TaskOutcome::Success(value)).await;
            }
            Err(err) => self.fail_attempt(lease, &envelope, err).await,
        }
    }

    async fn fail_attempt(
        &self,
        lease: Box<dyn TaskLease>,
        envelope: &TaskEnvelope,
        err: DocketError,
    ) {
        let task_id = envelope.task_id();
        let kind = err.kind();
        let message = err.to_string();
        error!(
            task_id = %task_id,
            task = %envelope.name(),
            args = %envelope.args(),
            category = ?err.category(),
            error = %message,
            "task attempt failed"
        );

        // Pre-failure snapshot, best-effort, before the broker decides.
        let snapshot = ProgressSnapshot::new(task_id, 0, 100, format!("failed: {message}"));
        self.store.record_progress(task_id, snapshot.clone()).await;
        self.tracker.propagate(snapshot.clone()).await;

        match lease.fail(message.clone(), kind).await {
            Ok(FailDecision::Scheduled { delay, attempt }) => {
                warn!(task_id = %task_id, attempt, ?delay, "retry scheduled");
            }
            Ok(FailDecision::Dead) => {
                self.store
                    .set_failure(
                        task_id,
                        message.clone(),
                        Some(format!("{err:?}")),
                        Some(snapshot),
                    )
                    .await;
                self.tracker.clear_route(task_id).await;
                self.notify_hooks(task_id, &TaskOutcome::Failure(message)).await;
            }
            Err(e) => error!(task_id = %task_id, error = %e, "fail report failed"),
        }
    }

    async fn notify_hooks(&self, task_id: TaskId, outcome: &TaskOutcome) {
        let hooks: Vec<_> = self.hooks.lock().await.clone();
        for hook in hooks {
            hook.on_terminal(task_id, outcome).await;
        }
    }
}

/// Worker group handle.
/// - dropping/flipping `shutdown_tx` stops all slots from taking new leases
/// - `shutdown_and_join` waits for in-flight attempts to finish
pub struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
    slots: usize,
}

impl WorkerGroup {
    /// Spawn `slots` concurrent worker slots against a broker.
    pub fn spawn(slots: usize, broker: Arc<dyn Broker>, engine: Arc<ExecutionEngine>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut joins = Vec::with_capacity(slots);
        for slot_id in 0..slots {
            let b = Arc::clone(&broker);
            let e = Arc::clone(&engine);
            let mut rx = shutdown_rx.clone();

            let join = tokio::spawn(async move {
                slot_loop(slot_id, b, e, &mut rx).await;
            });
            joins.push(join);
        }

        Self {
            shutdown_tx,
            joins,
            slots,
        }
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    /// Request shutdown. This does not cancel in-flight attempts; slots just
    /// stop taking new leases.
    pub fn request_shutdown(&self) {
        // ignore send error: receivers may already be dropped
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for j in self.joins {
            let _ = j.await;
        }
    }
}

async fn slot_loop(
    slot_id: usize,
    broker: Arc<dyn Broker>,
    engine: Arc<ExecutionEngine>,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        // lease() は「待つ」可能性があるので select で shutdown と競合させる
        let lease = tokio::select! {
            _ = shutdown_rx.changed() => {
                continue;
            }
            lease = broker.lease() => lease,
        };

        let Some(lease) = lease else {
            tokio::task::yield_now().await;
            continue;
        };

        // One task per slot: the slot blocks until this attempt resolves.
        tracing::debug!(slot_id, task_id = %lease.envelope().task_id(), "slot leased");
        engine.execute(lease).await;
    }
}
