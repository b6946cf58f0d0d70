//! Progress tracking: snapshot recording plus best-effort propagation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::warn;

use crate::domain::{ProgressSnapshot, ServerEvent, SessionId, TaskId, UserId};
use crate::hub::NotificationHub;
use crate::store::{ProgressCache, ResultStore};

/// Where progress for a task should be pushed in real time.
#[derive(Debug, Clone, Default)]
pub struct ProgressRoute {
    pub session: Option<SessionId>,
    pub user: Option<UserId>,
}

/// Records progress snapshots and propagates them.
///
/// The store write is the source of truth. The cache write-through and the
/// hub push are best-effort side channels: failures are logged and swallowed,
/// never surfaced to the task: progress reporting must not be able to fail
/// the work it reports on.
pub struct ProgressTracker {
    store: Arc<ResultStore>,
    cache: Arc<dyn ProgressCache>,
    hub: Arc<NotificationHub>,
    routes: Mutex<HashMap<TaskId, ProgressRoute>>,
    cache_ttl: Duration,
}

impl ProgressTracker {
    pub fn new(
        store: Arc<ResultStore>,
        cache: Arc<dyn ProgressCache>,
        hub: Arc<NotificationHub>,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            store,
            cache,
            hub,
            routes: Mutex::new(HashMap::new()),
            cache_ttl,
        }
    }

    /// Register a session/user to receive live progress for a task.
    pub async fn register_route(&self, task_id: TaskId, route: ProgressRoute) {
        self.routes.lock().await.insert(task_id, route);
    }

    /// Drop the route once a task goes terminal.
    pub async fn clear_route(&self, task_id: TaskId) {
        self.routes.lock().await.remove(&task_id);
    }

    /// Record a checkpoint: write the snapshot, then mirror it outward.
    pub async fn update(
        &self,
        task_id: TaskId,
        current: u64,
        total: u64,
        message: impl Into<String>,
    ) {
        let snapshot = ProgressSnapshot::new(task_id, current, total, message);
        self.store.record_progress(task_id, snapshot.clone()).await;
        self.propagate(snapshot).await;
    }

    /// Mirror a snapshot to the cache and the hub without touching the store.
    /// Used for the final "failed" snapshot, which lands in the store as part
    /// of the terminal FAILURE write.
    pub async fn propagate(&self, snapshot: ProgressSnapshot) {
        let task_id = snapshot.task_id;

        if let Err(e) = self.cache.put(&snapshot, self.cache_ttl).await {
            warn!(task_id = %task_id, error = %e, "progress cache write failed");
        }

        let route = self.routes.lock().await.get(&task_id).cloned();
        let Some(route) = route else {
            return;
        };
        let event = ServerEvent::TaskProgress { snapshot };
        if let Some(session) = &route.session {
            self.hub.broadcast(session, event.clone(), None).await;
        }
        if let Some(user) = &route.user {
            self.hub.send_to_user(user, event).await;
        }
    }

    /// Latest snapshot for a task: cache first, store on miss, and a
    /// well-defined zero snapshot for ids nobody has reported on.
    pub async fn get(&self, task_id: TaskId) -> ProgressSnapshot {
        match self.cache.get(task_id).await {
            Ok(Some(snapshot)) => return snapshot,
            Ok(None) => {}
            Err(e) => warn!(task_id = %task_id, error = %e, "progress cache read failed"),
        }

        if let Some(meta) = self.store.get(task_id).await
            && let Some(snapshot) = meta.progress
        {
            return snapshot;
        }
        ProgressSnapshot::none(task_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DocketError;
    use crate::store::InMemoryProgressCache;
    use async_trait::async_trait;

    fn tracker() -> ProgressTracker {
        tracker_with_cache(Arc::new(InMemoryProgressCache::new()))
    }

    fn tracker_with_cache(cache: Arc<dyn ProgressCache>) -> ProgressTracker {
        ProgressTracker::new(
            Arc::new(ResultStore::new(Duration::from_secs(3600))),
            cache,
            Arc::new(NotificationHub::new(Duration::from_millis(200))),
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn checkpoints_return_latest_only() {
        let tracker = tracker();
        let id = TaskId::generate();
        tracker.store.create_pending(id).await;

        for current in [0u64, 10, 30, 60, 80, 100] {
            tracker.update(id, current, 100, format!("step {current}")).await;
            let got = tracker.get(id).await;
            assert_eq!(got.current, current);
            assert_eq!(got.percentage, current);
            assert_eq!(got.message, format!("step {current}"));
        }
    }

    #[tokio::test]
    async fn zero_total_is_zero_percent() {
        let tracker = tracker();
        let id = TaskId::generate();
        tracker.update(id, 5, 0, "indeterminate").await;
        assert_eq!(tracker.get(id).await.percentage, 0);
    }

    #[tokio::test]
    async fn unknown_task_gets_zero_snapshot() {
        let tracker = tracker();
        let id = TaskId::generate();
        let got = tracker.get(id).await;
        assert_eq!(got, ProgressSnapshot::none(id));
    }

    #[tokio::test]
    async fn cache_failure_does_not_fail_the_update() {
        struct BrokenCache;

        #[async_trait]
        impl ProgressCache for BrokenCache {
            async fn put(
                &self,
                _snapshot: &ProgressSnapshot,
                _ttl: Duration,
            ) -> Result<(), DocketError> {
                Err(DocketError::Other("cache down".into()))
            }

            async fn get(&self, _task_id: TaskId) -> Result<Option<ProgressSnapshot>, DocketError> {
                Err(DocketError::Other("cache down".into()))
            }
        }

        let tracker = tracker_with_cache(Arc::new(BrokenCache));
        let id = TaskId::generate();
        tracker.update(id, 30, 100, "still fine").await;

        // The store still has the snapshot even with the cache down.
        let got = tracker.get(id).await;
        assert_eq!(got.current, 30);
    }

    #[tokio::test]
    async fn registered_session_receives_progress_events() {
        use crate::domain::ConnectionId;
        use crate::hub::ConnectionSink;

        struct Recorder {
            id: ConnectionId,
            received: Mutex<Vec<ServerEvent>>,
        }

        #[async_trait]
        impl ConnectionSink for Recorder {
            fn id(&self) -> ConnectionId {
                self.id
            }

            async fn send(&self, event: ServerEvent) -> Result<(), DocketError> {
                self.received.lock().await.push(event);
                Ok(())
            }
        }

        let hub = Arc::new(NotificationHub::new(Duration::from_millis(200)));
        let conn = Arc::new(Recorder {
            id: ConnectionId::generate(),
            received: Mutex::new(Vec::new()),
        });
        let session = SessionId::new("s1");
        hub.join(conn.clone(), session.clone(), UserId::new("u1")).await;

        let tracker = ProgressTracker::new(
            Arc::new(ResultStore::new(Duration::from_secs(3600))),
            Arc::new(InMemoryProgressCache::new()),
            Arc::clone(&hub),
            Duration::from_secs(60),
        );
        let id = TaskId::generate();
        tracker
            .register_route(
                id,
                ProgressRoute {
                    session: Some(session),
                    user: None,
                },
            )
            .await;

        tracker.update(id, 60, 100, "analyzing clauses").await;

        let got = conn.received.lock().await.clone();
        let snapshot = got
            .iter()
            .find_map(|e| match e {
                ServerEvent::TaskProgress { snapshot } => Some(snapshot.clone()),
                _ => None,
            })
            .expect("task_progress event");
        assert_eq!(snapshot.percentage, 60);
        assert_eq!(snapshot.message, "analyzing clauses");
    }

    #[tokio::test]
    async fn cache_is_preferred_over_store() {
        let cache = Arc::new(InMemoryProgressCache::new());
        let tracker = tracker_with_cache(cache.clone());
        let id = TaskId::generate();

        tracker.update(id, 10, 100, "from store path").await;
        // Simulate a fresher value written by another process.
        cache
            .put(&ProgressSnapshot::new(id, 90, 100, "from cache"), Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(tracker.get(id).await.current, 90);
    }
}
