use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::TaskId;

/// Name of a registered task ("process_document", "detect_jurisdiction", ...).
/// The router maps names to queues; the registry maps names to handlers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskName(String);

impl TaskName {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Name + arguments (+ TaskId) carried from submission to execution.
///
/// Args stay as raw JSON: each handler decodes what it needs, and redelivered
/// messages deserialize identically regardless of handler version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEnvelope {
    task_id: TaskId,
    name: TaskName,
    args: serde_json::Value,
    submitted_at: DateTime<Utc>,
}

impl TaskEnvelope {
    pub fn new(task_id: TaskId, name: TaskName, args: serde_json::Value) -> Self {
        Self {
            task_id,
            name,
            args,
            submitted_at: Utc::now(),
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn name(&self) -> &TaskName {
        &self.name
    }

    pub fn args(&self) -> &serde_json::Value {
        &self.args
    }

    pub fn submitted_at(&self) -> DateTime<Utc> {
        self.submitted_at
    }
}
