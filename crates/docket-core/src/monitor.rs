//! Introspection and control surface over tasks, queues and workers.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::info;

use crate::domain::{ProgressSnapshot, TaskId, TaskState};
use crate::error::DocketError;
use crate::queue::{Broker, PurgeScope, QueueName, ScheduledEntry};
use crate::store::ResultStore;
use crate::worker::{ActiveTask, RunningTasks};

/// Bound on every introspection call: a wedged backend degrades the answer
/// instead of hanging the caller.
const INTROSPECTION_TIMEOUT: Duration = Duration::from_secs(5);

/// State as reported to status callers. `Error` is the degraded view when
/// introspection itself failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusView {
    Pending,
    Received,
    Started,
    Progress,
    Success,
    Failure,
    Revoked,
    Error,
}

impl From<TaskState> for StatusView {
    fn from(state: TaskState) -> Self {
        match state {
            TaskState::Pending => StatusView::Pending,
            TaskState::Received => StatusView::Received,
            TaskState::Started => StatusView::Started,
            TaskState::Progress => StatusView::Progress,
            TaskState::Success => StatusView::Success,
            TaskState::Failure => StatusView::Failure,
            TaskState::Revoked => StatusView::Revoked,
        }
    }
}

/// State-dependent status payload. Always well-formed: an unknown (or
/// expired, observably the same) id reads as PENDING, and an introspection
/// failure reads as ERROR. Never an exception.
#[derive(Debug, Clone, Serialize)]
pub struct StatusPayload {
    pub task_id: TaskId,
    pub state: StatusView,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<ProgressSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

impl StatusPayload {
    fn pending(task_id: TaskId) -> Self {
        Self {
            task_id,
            state: StatusView::Pending,
            progress: None,
            result: None,
            error: None,
            traceback: None,
        }
    }

    fn degraded(task_id: TaskId, message: impl Into<String>) -> Self {
        Self {
            task_id,
            state: StatusView::Error,
            progress: None,
            result: None,
            error: Some(message.into()),
            traceback: None,
        }
    }
}

/// What a cancel request amounted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// Marked revoked; an unstarted delivery will be skipped. A running
    /// execution is *not* stopped; that asymmetry is the contract.
    Revoked,

    /// The running invocation was forcibly aborted. In-flight side effects
    /// may be lost.
    Terminated,

    /// The task was already terminal; nothing was touched.
    AlreadyFinished,
}

/// A spawned worker group, as reported by `workers`.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerInfo {
    pub group_id: usize,
    pub slots: usize,
}

/// Read/control surface consumed by the admin layer.
pub struct TaskMonitor {
    broker: Arc<dyn Broker>,
    store: Arc<ResultStore>,
    running: RunningTasks,
    fleet: Mutex<Vec<WorkerInfo>>,
}

impl TaskMonitor {
    pub fn new(broker: Arc<dyn Broker>, store: Arc<ResultStore>, running: RunningTasks) -> Self {
        Self {
            broker,
            store,
            running,
            fleet: Mutex::new(Vec::new()),
        }
    }

    /// State-dependent payload for one task. Degrades, never throws.
    pub async fn status(&self, task_id: TaskId) -> StatusPayload {
        let looked_up =
            tokio::time::timeout(INTROSPECTION_TIMEOUT, self.store.get(task_id)).await;
        let meta = match looked_up {
            Ok(meta) => meta,
            Err(_) => return StatusPayload::degraded(task_id, "introspection timed out"),
        };

        match meta {
            None => StatusPayload::pending(task_id),
            Some(meta) => StatusPayload {
                task_id,
                state: meta.state.into(),
                progress: meta.progress,
                result: meta.result,
                error: meta.error,
                traceback: meta.traceback,
            },
        }
    }

    /// Tasks currently executing. Empty, never an error, when no workers
    /// are up or none respond in time.
    pub async fn active(&self) -> Vec<ActiveTask> {
        tokio::time::timeout(INTROSPECTION_TIMEOUT, self.running.snapshot())
            .await
            .unwrap_or_default()
    }

    /// Tasks waiting out a retry backoff. Same degraded-to-empty contract.
    pub async fn scheduled(&self) -> Vec<ScheduledEntry> {
        tokio::time::timeout(INTROSPECTION_TIMEOUT, self.broker.scheduled())
            .await
            .unwrap_or_default()
    }

    /// Spawned worker groups. Empty when none registered.
    pub async fn workers(&self) -> Vec<WorkerInfo> {
        self.fleet.lock().await.clone()
    }

    pub async fn register_workers(&self, slots: usize) {
        let mut fleet = self.fleet.lock().await;
        let group_id = fleet.len();
        fleet.push(WorkerInfo { group_id, slots });
    }

    /// Cancel a task.
    ///
    /// terminate=false marks it revoked: a worker that has not started it
    /// will skip it, but a running execution keeps running. terminate=true
    /// aborts the running invocation outright. Terminal tasks are untouched
    /// either way.
    pub async fn cancel(&self, task_id: TaskId, terminate: bool) -> CancelOutcome {
        if let Some(meta) = self.store.get(task_id).await
            && meta.state.is_terminal()
        {
            return CancelOutcome::AlreadyFinished;
        }

        let skipped_before_start = self.broker.revoke(task_id).await;

        if terminate {
            let aborted = self.running.abort(task_id).await;
            self.store.set_revoked(task_id).await;
            info!(task_id = %task_id, aborted, "task terminated");
            return CancelOutcome::Terminated;
        }

        if skipped_before_start {
            // Only an unstarted task flips to REVOKED; a running one keeps
            // its state and reports whatever it finishes as.
            self.store.set_revoked(task_id).await;
        }
        info!(task_id = %task_id, skipped_before_start, "task revoked");
        CancelOutcome::Revoked
    }

    /// Irreversibly drop unexecuted messages in scope. Returns how many.
    pub async fn purge(&self, scope: PurgeScope) -> usize {
        let dropped = self.broker.purge(scope).await;
        info!(dropped, "queue purge");
        dropped
    }

    /// Ready-message count, or -1 when the queue is unknown or the broker
    /// did not answer; callers can tell "zero" from "unknown".
    pub async fn queue_length(&self, queue: &QueueName) -> i64 {
        tokio::time::timeout(INTROSPECTION_TIMEOUT, self.broker.queue_length(queue))
            .await
            .unwrap_or(-1)
    }

    /// Re-enqueue a permanently failed task with a fresh attempt budget.
    pub async fn retry_failed(&self, task_id: TaskId) -> Result<(), DocketError> {
        self.broker.retry_failed(task_id).await?;
        self.store.reset(task_id).await;
        info!(task_id = %task_id, "failed task requeued");
        Ok(())
    }
}
