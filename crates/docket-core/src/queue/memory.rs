//! In-memory broker implementation.

use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use super::record::{DeliveryState, QueueRecord};
use super::{
    Broker, FailDecision, PurgeScope, QueueCounts, QueueName, RetryPolicy, Router, ScheduledEntry,
    TaskLease,
};
use crate::domain::{TaskEnvelope, TaskId};
use crate::error::{DocketError, ErrorKind};

/// Scheduled retry entry for the backoff heap.
///
/// Reverse ordering so BinaryHeap acts as a min-heap (earliest first).
#[derive(Debug, Clone, PartialEq, Eq)]
struct ScheduledRetry {
    next_run_at: Instant,
    task_id: TaskId,
}

impl PartialOrd for ScheduledRetry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledRetry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other.next_run_at.cmp(&self.next_run_at)
    }
}

/// In-memory broker state.
struct BrokerState {
    /// All records (single source of truth for delivery state).
    records: HashMap<TaskId, QueueRecord>,

    /// Ready lists per queue (TaskIds only).
    ready: HashMap<QueueName, VecDeque<TaskId>>,

    /// Drain order across queues.
    queue_order: Vec<QueueName>,

    /// Retry backoff heap.
    scheduled: BinaryHeap<ScheduledRetry>,

    /// Revoke requests, including for tasks currently running. A skipped
    /// delivery is finalized at lease time; a running task keeps running
    /// (terminate=false never stops an execution) but any redelivery of it
    /// is skipped too.
    revoked: HashSet<TaskId>,

    retry_policy: RetryPolicy,
}

impl BrokerState {
    fn new(retry_policy: RetryPolicy) -> Self {
        let queue_order: Vec<QueueName> = Router::queues().into();
        let ready = queue_order
            .iter()
            .map(|q| (q.clone(), VecDeque::new()))
            .collect();
        Self {
            records: HashMap::new(),
            ready,
            queue_order,
            scheduled: BinaryHeap::new(),
            revoked: HashSet::new(),
            retry_policy,
        }
    }

    /// Move tasks from scheduled to ready once their backoff elapsed.
    fn promote_scheduled(&mut self) {
        let now = Instant::now();
        while let Some(entry) = self.scheduled.peek() {
            if entry.next_run_at > now {
                break; // heap is sorted, nothing else is due
            }
            let entry = self.scheduled.pop().unwrap();
            if let Some(record) = self.records.get_mut(&entry.task_id)
                && record.state == DeliveryState::RetryScheduled
            {
                record.requeue();
                let queue = record.queue.clone();
                self.push_ready(&queue, entry.task_id);
            }
        }
    }

    fn push_ready(&mut self, queue: &QueueName, task_id: TaskId) {
        if !self.ready.contains_key(queue) {
            self.queue_order.push(queue.clone());
        }
        self.ready.entry(queue.clone()).or_default().push_back(task_id);
    }

    /// Pop the next leasable task across queues in drain order, finalizing
    /// revoked deliveries on the way.
    fn pop_ready(&mut self) -> Option<TaskId> {
        for queue in self.queue_order.clone() {
            let Some(deque) = self.ready.get_mut(&queue) else {
                continue;
            };
            while let Some(task_id) = deque.pop_front() {
                let Some(record) = self.records.get_mut(&task_id) else {
                    continue; // purged
                };
                if record.state != DeliveryState::Queued {
                    continue;
                }
                if self.revoked.contains(&task_id) {
                    record.mark_revoked();
                    continue;
                }
                return Some(task_id);
            }
        }
        None
    }

    fn counts_by_state(&self) -> QueueCounts {
        let mut counts = QueueCounts::default();
        for record in self.records.values() {
            match record.state {
                DeliveryState::Queued => counts.queued += 1,
                DeliveryState::Running => counts.running += 1,
                DeliveryState::Succeeded => counts.succeeded += 1,
                DeliveryState::RetryScheduled => counts.retry_scheduled += 1,
                DeliveryState::Dead => counts.dead += 1,
                DeliveryState::Revoked => counts.revoked += 1,
            }
        }
        counts
    }
}

/// In-memory broker: per-queue ready lists + a shared backoff heap.
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
}

impl InMemoryBroker {
    pub fn new(retry_policy: RetryPolicy) -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState::new(retry_policy))),
            notify: Arc::new(Notify::new()),
        }
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn enqueue(&self, envelope: TaskEnvelope, queue: QueueName) -> Result<(), DocketError> {
        let task_id = envelope.task_id();
        {
            let mut state = self.state.lock().await;
            let record = QueueRecord::new(envelope, queue.clone());
            state.records.insert(task_id, record);
            state.push_ready(&queue, task_id);
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn lease(&self) -> Option<Box<dyn TaskLease>> {
        loop {
            let next_wake = {
                let mut state = self.state.lock().await;
                state.promote_scheduled();

                if let Some(task_id) = state.pop_ready() {
                    let record = state.records.get_mut(&task_id).expect("record exists");
                    record.start_attempt();
                    let lease = InMemoryLease {
                        task_id,
                        envelope: record.envelope.clone(),
                        attempt: record.attempts,
                        state: Arc::clone(&self.state),
                        notify: Arc::clone(&self.notify),
                    };
                    return Some(Box::new(lease));
                }

                state.scheduled.peek().map(|entry| entry.next_run_at)
            };

            // Wait for an enqueue OR the next scheduled retry becoming due.
            if let Some(wake_time) = next_wake {
                tokio::select! {
                    _ = self.notify.notified() => {},
                    _ = tokio::time::sleep_until(wake_time.into()) => {},
                }
            } else {
                self.notify.notified().await;
            }
        }
    }

    async fn revoke(&self, task_id: TaskId) -> bool {
        let mut state = self.state.lock().await;
        state.revoked.insert(task_id);
        match state.records.get_mut(&task_id) {
            Some(record)
                if matches!(
                    record.state,
                    DeliveryState::Queued | DeliveryState::RetryScheduled
                ) =>
            {
                record.mark_revoked();
                true
            }
            _ => false,
        }
    }

    async fn purge(&self, scope: PurgeScope) -> usize {
        let mut state = self.state.lock().await;
        let queues: Vec<QueueName> = match &scope {
            PurgeScope::Queue(q) => vec![q.clone()],
            PurgeScope::All => state.queue_order.clone(),
        };

        let mut dropped = 0;
        for queue in queues {
            let Some(deque) = state.ready.get_mut(&queue) else {
                continue;
            };
            let ids: Vec<TaskId> = deque.drain(..).collect();
            for task_id in ids {
                let is_queued = state
                    .records
                    .get(&task_id)
                    .is_some_and(|r| r.state == DeliveryState::Queued);
                if is_queued {
                    state.records.remove(&task_id);
                    dropped += 1;
                }
            }
        }
        dropped
    }

    async fn queue_length(&self, queue: &QueueName) -> i64 {
        let state = self.state.lock().await;
        let Some(deque) = state.ready.get(queue) else {
            return -1;
        };
        deque
            .iter()
            .filter(|id| {
                state
                    .records
                    .get(id)
                    .is_some_and(|r| r.state == DeliveryState::Queued)
            })
            .count() as i64
    }

    async fn retry_failed(&self, task_id: TaskId) -> Result<(), DocketError> {
        {
            let mut state = self.state.lock().await;
            let Some(record) = state.records.get_mut(&task_id) else {
                return Err(DocketError::UnknownTask(task_id.to_string()));
            };
            if record.state != DeliveryState::Dead {
                return Err(DocketError::Other(format!(
                    "task {task_id} is not in a failed state"
                )));
            }
            record.reset_for_retry();
            let queue = record.queue.clone();
            state.revoked.remove(&task_id);
            state.push_ready(&queue, task_id);
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn scheduled(&self) -> Vec<ScheduledEntry> {
        let state = self.state.lock().await;
        let now = Instant::now();
        state
            .scheduled
            .iter()
            .filter_map(|entry| {
                let record = state.records.get(&entry.task_id)?;
                if record.state != DeliveryState::RetryScheduled {
                    return None;
                }
                Some(ScheduledEntry {
                    task_id: entry.task_id,
                    queue: record.queue.clone(),
                    attempts: record.attempts,
                    eta_ms: entry.next_run_at.saturating_duration_since(now).as_millis() as u64,
                })
            })
            .collect()
    }

    async fn counts_by_state(&self) -> QueueCounts {
        let state = self.state.lock().await;
        state.counts_by_state()
    }
}

/// Lease implementation for InMemoryBroker.
struct InMemoryLease {
    task_id: TaskId,
    envelope: TaskEnvelope,
    attempt: u32,
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
}

#[async_trait]
impl TaskLease for InMemoryLease {
    fn envelope(&self) -> &TaskEnvelope {
        &self.envelope
    }

    fn attempt(&self) -> u32 {
        self.attempt
    }

    async fn ack(self: Box<Self>) -> Result<(), DocketError> {
        let mut state = self.state.lock().await;
        if let Some(record) = state.records.get_mut(&self.task_id) {
            record.mark_succeeded();
        }
        Ok(())
    }

    async fn fail(
        self: Box<Self>,
        error: String,
        kind: ErrorKind,
    ) -> Result<FailDecision, DocketError> {
        let decision = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let Some(record) = state.records.get_mut(&self.task_id) else {
                return Ok(FailDecision::Dead);
            };

            let revoked = state.revoked.contains(&self.task_id);
            let attempts = record.attempts;
            if revoked || !state.retry_policy.should_retry(attempts, kind) {
                record.mark_dead(error);
                FailDecision::Dead
            } else {
                let delay = state.retry_policy.next_delay();
                let next_run_at = Instant::now() + delay;
                record.schedule_retry(next_run_at, error);
                state.scheduled.push(ScheduledRetry {
                    next_run_at,
                    task_id: self.task_id,
                });
                FailDecision::Scheduled {
                    delay,
                    attempt: attempts + 1,
                }
            }
        }; // lock released here

        // Notify outside the lock so a waiting worker can pick the retry up.
        if matches!(decision, FailDecision::Scheduled { .. }) {
            self.notify.notify_one();
        }
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskName;
    use std::time::Duration;

    fn envelope(name: &str) -> TaskEnvelope {
        TaskEnvelope::new(
            TaskId::generate(),
            TaskName::new(name),
            serde_json::json!({}),
        )
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            backoff: Duration::from_millis(10),
            max_attempts: 3,
            jitter: None,
        }
    }

    #[tokio::test]
    async fn enqueue_and_counts() {
        let broker = InMemoryBroker::new(fast_policy());
        broker
            .enqueue(envelope("detect_jurisdiction"), QueueName::jurisdiction_analysis())
            .await
            .unwrap();

        let counts = broker.counts_by_state().await;
        assert_eq!(counts.queued, 1);
        assert_eq!(counts.running, 0);
    }

    #[tokio::test]
    async fn lease_transitions_to_running() {
        let broker = InMemoryBroker::new(fast_policy());
        broker
            .enqueue(envelope("process_document"), QueueName::document_processing())
            .await
            .unwrap();

        let lease = tokio::time::timeout(Duration::from_millis(100), broker.lease())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(lease.envelope().name().as_str(), "process_document");
        assert_eq!(lease.attempt(), 1);

        let counts = broker.counts_by_state().await;
        assert_eq!(counts.queued, 0);
        assert_eq!(counts.running, 1);
    }

    #[tokio::test]
    async fn ack_marks_succeeded() {
        let broker = InMemoryBroker::new(fast_policy());
        broker
            .enqueue(envelope("process_document"), QueueName::document_processing())
            .await
            .unwrap();
        let lease = broker.lease().await.unwrap();
        lease.ack().await.unwrap();

        let counts = broker.counts_by_state().await;
        assert_eq!(counts.succeeded, 1);
        assert_eq!(counts.running, 0);
    }

    #[tokio::test]
    async fn transient_failure_schedules_retry_then_redelivers() {
        let broker = InMemoryBroker::new(fast_policy());
        broker
            .enqueue(envelope("analyze_document"), QueueName::ai_analysis())
            .await
            .unwrap();

        let lease = broker.lease().await.unwrap();
        let decision = lease
            .fail("broker unreachable".into(), ErrorKind::Transient)
            .await
            .unwrap();
        assert!(matches!(decision, FailDecision::Scheduled { attempt: 2, .. }));

        // Second delivery of the same envelope after the backoff.
        let lease = tokio::time::timeout(Duration::from_millis(500), broker.lease())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(lease.attempt(), 2);
    }

    #[tokio::test]
    async fn budget_exhaustion_goes_dead() {
        let policy = RetryPolicy {
            backoff: Duration::from_millis(1),
            max_attempts: 1,
            jitter: None,
        };
        let broker = InMemoryBroker::new(policy);
        broker
            .enqueue(envelope("analyze_document"), QueueName::ai_analysis())
            .await
            .unwrap();

        let lease = broker.lease().await.unwrap();
        let decision = lease
            .fail("err".into(), ErrorKind::Transient)
            .await
            .unwrap();
        assert_eq!(decision, FailDecision::Dead);
        assert_eq!(broker.counts_by_state().await.dead, 1);
    }

    #[tokio::test]
    async fn permanent_failure_skips_remaining_budget() {
        let broker = InMemoryBroker::new(fast_policy());
        broker
            .enqueue(envelope("process_document"), QueueName::document_processing())
            .await
            .unwrap();

        let lease = broker.lease().await.unwrap();
        let decision = lease
            .fail("document not found".into(), ErrorKind::Permanent)
            .await
            .unwrap();
        assert_eq!(decision, FailDecision::Dead);
    }

    #[tokio::test]
    async fn revoked_task_is_skipped_at_lease_time() {
        let broker = InMemoryBroker::new(fast_policy());
        let env = envelope("process_document");
        let task_id = env.task_id();
        broker
            .enqueue(env, QueueName::document_processing())
            .await
            .unwrap();

        assert!(broker.revoke(task_id).await);

        broker
            .enqueue(envelope("process_document"), QueueName::document_processing())
            .await
            .unwrap();
        let lease = broker.lease().await.unwrap();
        // The revoked task never reaches a worker; the second one does.
        assert_ne!(lease.envelope().task_id(), task_id);
        assert_eq!(broker.counts_by_state().await.revoked, 1);
    }

    #[tokio::test]
    async fn purge_then_queue_length_is_zero() {
        let broker = InMemoryBroker::new(fast_policy());
        for _ in 0..3 {
            broker
                .enqueue(
                    envelope("detect_jurisdiction"),
                    QueueName::jurisdiction_analysis(),
                )
                .await
                .unwrap();
        }
        assert_eq!(
            broker.queue_length(&QueueName::jurisdiction_analysis()).await,
            3
        );

        let dropped = broker
            .purge(PurgeScope::Queue(QueueName::jurisdiction_analysis()))
            .await;
        assert_eq!(dropped, 3);
        assert_eq!(
            broker.queue_length(&QueueName::jurisdiction_analysis()).await,
            0
        );
    }

    #[tokio::test]
    async fn queue_length_sentinel_for_unknown_queue() {
        let broker = InMemoryBroker::new(fast_policy());
        assert_eq!(broker.queue_length(&QueueName::new("nope")).await, -1);
        assert_eq!(broker.queue_length(&QueueName::default_queue()).await, 0);
    }

    #[tokio::test]
    async fn retry_failed_requeues_dead_task() {
        let policy = RetryPolicy {
            backoff: Duration::from_millis(1),
            max_attempts: 1,
            jitter: None,
        };
        let broker = InMemoryBroker::new(policy);
        let env = envelope("analyze_document");
        let task_id = env.task_id();
        broker.enqueue(env, QueueName::ai_analysis()).await.unwrap();

        let lease = broker.lease().await.unwrap();
        lease.fail("err".into(), ErrorKind::Transient).await.unwrap();
        assert_eq!(broker.counts_by_state().await.dead, 1);

        broker.retry_failed(task_id).await.unwrap();
        let lease = broker.lease().await.unwrap();
        assert_eq!(lease.envelope().task_id(), task_id);
        assert_eq!(lease.attempt(), 1);
    }
}
