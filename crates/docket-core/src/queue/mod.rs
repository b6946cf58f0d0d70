//! Queue layer: routing, delivery state, retry policy, in-memory broker.

mod memory;
mod record;
mod retry;
mod router;

pub use memory::InMemoryBroker;
pub use record::{DeliveryState, QueueRecord};
pub use retry::RetryPolicy;
pub use router::{QueueName, Router};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::domain::{TaskEnvelope, TaskId};
use crate::error::{DocketError, ErrorKind};

/// What the broker decided about a failed lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailDecision {
    /// Requeued after a backoff; attempt number of the retry.
    Scheduled { delay: Duration, attempt: u32 },

    /// Terminal: budget exhausted or permanent failure.
    Dead,
}

/// A leased task. The worker owns this lease and must either `ack` or `fail`.
///
/// Design intent:
/// - The broker manages delivery transitions (Queued -> Running -> ...).
/// - The worker executes side effects and reports the result.
/// - Ack-late: the message is only removed once `ack` lands, so a crashed
///   slot causes redelivery. Handlers must be idempotent or check-before-act.
#[async_trait]
pub trait TaskLease: Send {
    fn envelope(&self) -> &TaskEnvelope;

    /// Attempt number of this lease (1 for the first delivery).
    fn attempt(&self) -> u32;

    /// Mark success.
    async fn ack(self: Box<Self>) -> Result<(), DocketError>;

    /// Mark failure; the broker decides retry or dead from `kind` and budget.
    async fn fail(self: Box<Self>, error: String, kind: ErrorKind)
        -> Result<FailDecision, DocketError>;
}

/// Scope of a purge operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PurgeScope {
    Queue(QueueName),
    All,
}

/// Delivery counts for observability.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueCounts {
    pub queued: usize,
    pub running: usize,
    pub succeeded: usize,
    pub retry_scheduled: usize,
    pub dead: usize,
    pub revoked: usize,
}

/// A retry-scheduled task, as reported to the monitor.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduledEntry {
    pub task_id: TaskId,
    pub queue: QueueName,
    pub attempts: u32,
    pub eta_ms: u64,
}

/// Broker port. The in-memory implementation backs tests and the demo
/// binary; the trait is the seam for an external broker.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Enqueue onto a named queue.
    async fn enqueue(&self, envelope: TaskEnvelope, queue: QueueName) -> Result<(), DocketError>;

    /// Lease one ready task (waits until available).
    async fn lease(&self) -> Option<Box<dyn TaskLease>>;

    /// Mark a task revoked so an unstarted delivery is skipped. Returns true
    /// when the task had not been leased yet (so the revoke is effective).
    async fn revoke(&self, task_id: TaskId) -> bool;

    /// Irreversibly drop unexecuted messages in scope. Returns how many.
    async fn purge(&self, scope: PurgeScope) -> usize;

    /// Ready-message count, or -1 when the queue is unknown. Callers can
    /// tell "empty" from "unknown" without handling an error path.
    async fn queue_length(&self, queue: &QueueName) -> i64;

    /// Re-enqueue a Dead task with a fresh attempt budget.
    async fn retry_failed(&self, task_id: TaskId) -> Result<(), DocketError>;

    /// Retry-scheduled tasks, for the monitor.
    async fn scheduled(&self) -> Vec<ScheduledEntry>;

    /// Observability hook.
    async fn counts_by_state(&self) -> QueueCounts;
}
