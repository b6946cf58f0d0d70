//! Handler registry and the per-invocation task context.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::domain::{TaskEnvelope, TaskId, TaskName};
use crate::error::DocketError;
use crate::progress::ProgressTracker;

/// A handler for a named task.
///
/// Handlers take the whole envelope and decode args as they like. The return
/// value is the task's result payload, stored verbatim. Delivery is ack-late:
/// a handler may run more than once for one submission, so it must be
/// idempotent or check persisted state before acting.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(
        &self,
        envelope: &TaskEnvelope,
        ctx: TaskContext,
    ) -> Result<serde_json::Value, DocketError>;
}

/// Explicit per-invocation context handed to a handler.
///
/// Constructed fresh for every attempt: nothing here is shared between
/// invocations. Handlers report checkpoints and observe the soft time limit
/// through it instead of reaching for process-wide singletons.
pub struct TaskContext {
    task_id: TaskId,
    tracker: Arc<ProgressTracker>,
    soft_limit: watch::Receiver<bool>,
}

impl TaskContext {
    pub fn new(
        task_id: TaskId,
        tracker: Arc<ProgressTracker>,
        soft_limit: watch::Receiver<bool>,
    ) -> Self {
        Self {
            task_id,
            tracker,
            soft_limit,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Report a progress checkpoint.
    pub async fn progress(&self, current: u64, total: u64, message: impl Into<String>) {
        self.tracker
            .update(self.task_id, current, total, message)
            .await;
    }

    /// Has the soft time limit fired? Handlers poll this at convenient
    /// points and wind down gracefully; the hard limit aborts outright.
    pub fn soft_limit_reached(&self) -> bool {
        *self.soft_limit.borrow()
    }
}

/// Registry of handlers (task name -> handler).
///
/// Design:
/// - Built during initialization (mutable).
/// - Used during runtime (immutable).
/// This avoids locks on the hot path.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskName, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register(&mut self, handler: Arc<dyn TaskHandler>) -> Result<(), DocketError> {
        let name = TaskName::new(handler.name());
        if self.handlers.contains_key(&name) {
            return Err(DocketError::DuplicateHandler(name));
        }
        self.handlers.insert(name, handler);
        Ok(())
    }

    pub fn get(&self, name: &TaskName) -> Option<&Arc<dyn TaskHandler>> {
        self.handlers.get(name)
    }

    pub fn registered_names(&self) -> Vec<TaskName> {
        self.handlers.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct OkHandler;

    #[async_trait]
    impl TaskHandler for OkHandler {
        fn name(&self) -> &'static str {
            "ok"
        }

        async fn run(
            &self,
            _envelope: &TaskEnvelope,
            _ctx: TaskContext,
        ) -> Result<serde_json::Value, DocketError> {
            Ok(serde_json::json!({}))
        }
    }

    #[test]
    fn register_and_get() {
        let mut reg = HandlerRegistry::new();
        reg.register(Arc::new(OkHandler)).unwrap();
        assert!(reg.get(&TaskName::new("ok")).is_some());
        assert!(reg.get(&TaskName::new("missing")).is_none());
    }

    #[test]
    fn duplicate_registration_is_an_error() {
        let mut reg = HandlerRegistry::new();
        reg.register(Arc::new(OkHandler)).unwrap();
        let err = reg.register(Arc::new(OkHandler)).unwrap_err();
        assert!(matches!(err, DocketError::DuplicateHandler(_)));
    }
}
