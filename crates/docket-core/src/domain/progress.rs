//! Progress snapshots: the single latest {current, total, message} per task.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::TaskId;

/// The latest reported progress for a task.
///
/// Only the newest snapshot is retained anywhere (store, cache, hub push);
/// history is an external collaborator's concern. The store trusts whatever
/// the caller last reported: monotonicity is caller discipline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub task_id: TaskId,
    pub current: u64,
    pub total: u64,

    /// current / total * 100, floored. 0 when total is 0.
    pub percentage: u64,

    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl ProgressSnapshot {
    pub fn new(task_id: TaskId, current: u64, total: u64, message: impl Into<String>) -> Self {
        Self {
            task_id,
            current,
            total,
            percentage: percentage(current, total),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    /// Well-defined "no progress yet" value for unknown ids.
    pub fn none(task_id: TaskId) -> Self {
        Self::new(task_id, 0, 0, "")
    }
}

fn percentage(current: u64, total: u64) -> u64 {
    if total == 0 {
        return 0;
    }
    current.saturating_mul(100) / total
}
