//! Write-through progress cache port.
//!
//! A status process answering `get` should not need the broker: progress is
//! mirrored into a cache keyed by task_id with a TTL. The trait is the seam
//! for a cross-process cache; the in-memory implementation backs tests and
//! single-process deployments.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{ProgressSnapshot, TaskId};
use crate::error::DocketError;

#[async_trait]
pub trait ProgressCache: Send + Sync {
    /// Store the latest snapshot under its task_id with a TTL.
    async fn put(&self, snapshot: &ProgressSnapshot, ttl: Duration) -> Result<(), DocketError>;

    /// Latest snapshot, or None when missing/expired.
    async fn get(&self, task_id: TaskId) -> Result<Option<ProgressSnapshot>, DocketError>;
}

/// In-memory TTL cache.
#[derive(Default)]
pub struct InMemoryProgressCache {
    entries: Mutex<HashMap<TaskId, (ProgressSnapshot, Instant)>>,
}

impl InMemoryProgressCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProgressCache for InMemoryProgressCache {
    async fn put(&self, snapshot: &ProgressSnapshot, ttl: Duration) -> Result<(), DocketError> {
        let mut entries = self.entries.lock().await;
        entries.insert(snapshot.task_id, (snapshot.clone(), Instant::now() + ttl));
        Ok(())
    }

    async fn get(&self, task_id: TaskId) -> Result<Option<ProgressSnapshot>, DocketError> {
        let mut entries = self.entries.lock().await;
        match entries.get(&task_id) {
            Some((_, expires_at)) if Instant::now() >= *expires_at => {
                entries.remove(&task_id);
                Ok(None)
            }
            Some((snapshot, _)) => Ok(Some(snapshot.clone())),
            None => Ok(None),
        }
    }
}
