//! Result store: task_id -> lifecycle state / result / error, with expiry.

mod cache;

pub use cache::{InMemoryProgressCache, ProgressCache};

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::warn;

use crate::domain::{ProgressSnapshot, TaskId, TaskState};

/// Stored record for one task.
///
/// Terminal records (Success/Failure/Revoked) are immutable until their TTL
/// expires and the record is deleted; after that a query is indistinguishable
/// from a query for an id that never existed.
#[derive(Debug, Clone)]
pub struct TaskMeta {
    pub state: TaskState,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub traceback: Option<String>,
    pub progress: Option<ProgressSnapshot>,
    pub created_at: Instant,
    expires_at: Option<Instant>,
}

impl TaskMeta {
    fn new() -> Self {
        Self {
            state: TaskState::Pending,
            result: None,
            error: None,
            traceback: None,
            progress: None,
            created_at: Instant::now(),
            expires_at: None,
        }
    }
}

/// In-memory result store with TTL eviction.
pub struct ResultStore {
    entries: Mutex<HashMap<TaskId, TaskMeta>>,
    ttl: Duration,
}

impl ResultStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Create the PENDING record at submission time.
    pub async fn create_pending(&self, task_id: TaskId) {
        let mut entries = self.entries.lock().await;
        entries.entry(task_id).or_insert_with(TaskMeta::new);
    }

    /// Worker claimed the task.
    pub async fn mark_received(&self, task_id: TaskId) {
        self.transition(task_id, TaskState::Received).await;
    }

    /// Handler execution began.
    pub async fn mark_started(&self, task_id: TaskId) {
        self.transition(task_id, TaskState::Started).await;
    }

    /// Record the latest progress snapshot (replaces any previous one).
    pub async fn record_progress(&self, task_id: TaskId, snapshot: ProgressSnapshot) {
        let mut entries = self.entries.lock().await;
        let meta = entries.entry(task_id).or_insert_with(TaskMeta::new);
        if meta.state.is_terminal() {
            warn!(task_id = %task_id, "ignoring progress update for terminal task");
            return;
        }
        meta.state = TaskState::Progress;
        meta.progress = Some(snapshot);
    }

    /// Terminal: success with a result payload.
    pub async fn set_success(&self, task_id: TaskId, result: serde_json::Value) {
        let mut entries = self.entries.lock().await;
        let meta = entries.entry(task_id).or_insert_with(TaskMeta::new);
        if meta.state.is_terminal() {
            warn!(task_id = %task_id, state = ?meta.state, "refusing to overwrite terminal record");
            return;
        }
        meta.state = TaskState::Success;
        meta.result = Some(result);
        meta.expires_at = Some(Instant::now() + self.ttl);
    }

    /// Terminal: failure. The failure snapshot lands with the same write so
    /// the record never shows FAILURE without its final 0% snapshot.
    pub async fn set_failure(
        &self,
        task_id: TaskId,
        error: String,
        traceback: Option<String>,
        snapshot: Option<ProgressSnapshot>,
    ) {
        let mut entries = self.entries.lock().await;
        let meta = entries.entry(task_id).or_insert_with(TaskMeta::new);
        if meta.state.is_terminal() {
            warn!(task_id = %task_id, state = ?meta.state, "refusing to overwrite terminal record");
            return;
        }
        meta.state = TaskState::Failure;
        meta.error = Some(error);
        meta.traceback = traceback;
        if snapshot.is_some() {
            meta.progress = snapshot;
        }
        meta.expires_at = Some(Instant::now() + self.ttl);
    }

    /// Terminal: revoked. No-op on an already-terminal record; returns
    /// whether the transition applied.
    pub async fn set_revoked(&self, task_id: TaskId) -> bool {
        let mut entries = self.entries.lock().await;
        let meta = entries.entry(task_id).or_insert_with(TaskMeta::new);
        if meta.state.is_terminal() {
            return false;
        }
        meta.state = TaskState::Revoked;
        meta.expires_at = Some(Instant::now() + self.ttl);
        true
    }

    /// Current record, or None for unknown *and* expired ids (observably the
    /// same, by design). Expired entries are evicted on the way out.
    pub async fn get(&self, task_id: TaskId) -> Option<TaskMeta> {
        let mut entries = self.entries.lock().await;
        let expired = entries
            .get(&task_id)
            .and_then(|m| m.expires_at)
            .is_some_and(|at| Instant::now() >= at);
        if expired {
            entries.remove(&task_id);
            return None;
        }
        entries.get(&task_id).cloned()
    }

    /// Admin retry path: drop the (usually terminal) record and start a
    /// fresh PENDING one, as if the task had just been resubmitted.
    pub async fn reset(&self, task_id: TaskId) {
        let mut entries = self.entries.lock().await;
        entries.insert(task_id, TaskMeta::new());
    }

    async fn transition(&self, task_id: TaskId, state: TaskState) {
        let mut entries = self.entries.lock().await;
        let meta = entries.entry(task_id).or_insert_with(TaskMeta::new);
        if meta.state.is_terminal() {
            warn!(task_id = %task_id, ?state, "ignoring transition on terminal record");
            return;
        }
        meta.state = state;
    }
}
