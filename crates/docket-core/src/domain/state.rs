//! Task lifecycle state machine as observed by status callers.

use serde::{Deserialize, Serialize};

/// Observable task state.
///
/// State transitions:
/// - Pending -> Received -> Started -> Success
/// - Pending -> Received -> Started -> (Progress)* -> Success | Failure
/// - Pending | Received -> Revoked (cancel before start)
/// - Started -> Revoked (cancel with terminate)
///
/// Once a record reaches Success/Failure/Revoked it is immutable until its
/// TTL expires and the record is deleted. A query for an expired id is
/// indistinguishable from a query for an unknown id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    /// Submitted, not yet claimed by a worker. Also the view for unknown ids.
    Pending,

    /// Claimed by a worker slot, execution not started.
    Received,

    /// Handler is executing.
    Started,

    /// Handler is executing and has reported at least one progress snapshot.
    Progress,

    /// Completed successfully.
    Success,

    /// Failed permanently (retries exhausted or permanent error).
    Failure,

    /// Cancelled before completion.
    Revoked,
}

impl TaskState {
    /// Is this a terminal state (record frozen until TTL expiry)?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Success | TaskState::Failure | TaskState::Revoked
        )
    }
}
