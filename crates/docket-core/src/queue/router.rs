//! Static task-name -> queue routing table.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::TaskName;

/// Name of a broker queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueName(String);

impl QueueName {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn document_processing() -> Self {
        Self::new("document_processing")
    }

    pub fn ai_analysis() -> Self {
        Self::new("ai_analysis")
    }

    pub fn jurisdiction_analysis() -> Self {
        Self::new("jurisdiction_analysis")
    }

    pub fn default_queue() -> Self {
        Self::new("default")
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Maps a task name to exactly one queue.
///
/// The table is static: routing never depends on runtime state, so a status
/// process and a worker process always agree on where a task lives.
#[derive(Debug, Clone, Default)]
pub struct Router;

impl Router {
    pub fn new() -> Self {
        Self
    }

    /// Every known queue, in the order workers drain them.
    pub fn queues() -> [QueueName; 4] {
        [
            QueueName::document_processing(),
            QueueName::ai_analysis(),
            QueueName::jurisdiction_analysis(),
            QueueName::default_queue(),
        ]
    }

    pub fn route(&self, name: &TaskName) -> QueueName {
        match name.as_str() {
            "process_document" | "extract_text" => QueueName::document_processing(),
            "analyze_document" | "generate_ai_response" => QueueName::ai_analysis(),
            "detect_jurisdiction"
            | "analyze_india"
            | "analyze_us"
            | "analyze_cross_border" => QueueName::jurisdiction_analysis(),
            _ => QueueName::default_queue(),
        }
    }
}
