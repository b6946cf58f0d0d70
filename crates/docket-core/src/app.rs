//! App wiring: one explicit context object built at process start.
//!
//! Every component (broker, store, hub, tracker, engine, composer, monitor)
//! hangs off the `App` built here and is passed where it is needed: no
//! module-level mutable singletons, so tests construct isolated apps freely.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::domain::{PipelineId, TaskId, TaskName};
use crate::error::DocketError;
use crate::hub::NotificationHub;
use crate::monitor::TaskMonitor;
use crate::pipeline::{PipelineComposer, TaskSubmitter};
use crate::progress::ProgressTracker;
use crate::queue::{Broker, InMemoryBroker, RetryPolicy, Router};
use crate::runtime::{HandlerRegistry, TaskHandler};
use crate::store::{InMemoryProgressCache, ProgressCache, ResultStore};
use crate::worker::{ExecutionEngine, TimeLimits, WorkerGroup};

/// Tunables, with the defaults the queue contract names.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// TTL on terminal task records (default 1h).
    pub result_ttl: Duration,

    /// TTL on cache-mirrored progress snapshots.
    pub cache_ttl: Duration,

    pub retry: RetryPolicy,
    pub limits: TimeLimits,

    /// Concurrent task slots per worker group.
    pub worker_slots: usize,

    /// Per-connection send bound for hub fan-out.
    pub send_timeout: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            result_ttl: Duration::from_secs(3600),
            cache_ttl: Duration::from_secs(3600),
            retry: RetryPolicy::default(),
            limits: TimeLimits::default(),
            worker_slots: 4,
            send_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("missing task handlers: {0:?}. These tasks were expected but not registered.")]
    MissingHandlers(Vec<String>),

    #[error("{0}")]
    Registration(#[from] DocketError),
}

/// Builds an `App`, fail-fast.
///
/// `expect_tasks` declares the task names the deployment depends on; `build`
/// verifies every one of them has a registered handler before anything runs.
pub struct AppBuilder {
    config: AppConfig,
    registry: HandlerRegistry,
    expected_tasks: Option<Vec<String>>,
    broker: Option<Arc<dyn Broker>>,
    cache: Option<Arc<dyn ProgressCache>>,
}

impl AppBuilder {
    pub fn new() -> Self {
        Self {
            config: AppConfig::default(),
            registry: HandlerRegistry::new(),
            expected_tasks: None,
            broker: None,
            cache: None,
        }
    }

    pub fn config(mut self, config: AppConfig) -> Self {
        self.config = config;
        self
    }

    pub fn broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn cache(mut self, cache: Arc<dyn ProgressCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn register(mut self, handler: Arc<dyn TaskHandler>) -> Result<Self, BuildError> {
        self.registry.register(handler)?;
        Ok(self)
    }

    pub fn expect_tasks(mut self, names: &[&str]) -> Self {
        self.expected_tasks = Some(names.iter().map(|s| s.to_string()).collect());
        self
    }

    pub async fn build(self) -> Result<Arc<App>, BuildError> {
        if let Some(expected) = &self.expected_tasks {
            let registered: Vec<String> = self
                .registry
                .registered_names()
                .iter()
                .map(|n| n.as_str().to_string())
                .collect();
            let missing: Vec<String> = expected
                .iter()
                .filter(|name| !registered.contains(name))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingHandlers(missing));
            }
        }

        let config = self.config;
        let broker = self
            .broker
            .unwrap_or_else(|| Arc::new(InMemoryBroker::new(config.retry.clone())));
        let cache = self
            .cache
            .unwrap_or_else(|| Arc::new(InMemoryProgressCache::new()));
        let store = Arc::new(ResultStore::new(config.result_ttl));
        let hub = Arc::new(NotificationHub::new(config.send_timeout));
        let tracker = Arc::new(ProgressTracker::new(
            Arc::clone(&store),
            cache,
            Arc::clone(&hub),
            config.cache_ttl,
        ));
        let engine = Arc::new(ExecutionEngine::new(
            Arc::new(self.registry),
            Arc::clone(&store),
            Arc::clone(&tracker),
            config.limits,
        ));

        let submitter: Arc<dyn TaskSubmitter> = Arc::new(CoreSubmitter {
            router: Router::new(),
            broker: Arc::clone(&broker),
            store: Arc::clone(&store),
        });
        let composer = Arc::new(PipelineComposer::new(Arc::clone(&submitter)));
        engine.add_hook(composer.clone()).await;

        let monitor = Arc::new(TaskMonitor::new(
            Arc::clone(&broker),
            Arc::clone(&store),
            engine.running(),
        ));

        Ok(Arc::new(App {
            config,
            broker,
            store,
            hub,
            tracker,
            engine,
            composer,
            monitor,
            submitter,
        }))
    }
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Routes a submission and records its PENDING state before the broker sees
/// the message, so a status query never races the enqueue.
struct CoreSubmitter {
    router: Router,
    broker: Arc<dyn Broker>,
    store: Arc<ResultStore>,
}

#[async_trait]
impl TaskSubmitter for CoreSubmitter {
    async fn submit(
        &self,
        name: TaskName,
        args: serde_json::Value,
    ) -> Result<TaskId, DocketError> {
        let task_id = TaskId::generate();
        let queue = self.router.route(&name);
        let envelope = crate::domain::TaskEnvelope::new(task_id, name.clone(), args);

        self.store.create_pending(task_id).await;
        self.broker.enqueue(envelope, queue.clone()).await?;
        info!(task_id = %task_id, task = %name, queue = %queue, "task submitted");
        Ok(task_id)
    }
}

/// The assembled application context.
pub struct App {
    config: AppConfig,
    broker: Arc<dyn Broker>,
    store: Arc<ResultStore>,
    hub: Arc<NotificationHub>,
    tracker: Arc<ProgressTracker>,
    engine: Arc<ExecutionEngine>,
    composer: Arc<PipelineComposer>,
    monitor: Arc<TaskMonitor>,
    submitter: Arc<dyn TaskSubmitter>,
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App").finish_non_exhaustive()
    }
}

impl App {
    pub fn builder() -> AppBuilder {
        AppBuilder::new()
    }

    /// Submit a task by name; the router picks the queue.
    pub async fn submit(
        &self,
        name: impl Into<String>,
        args: serde_json::Value,
    ) -> Result<TaskId, DocketError> {
        self.submitter.submit(TaskName::new(name), args).await
    }

    /// Start a detect -> analyze pipeline for a document.
    pub async fn comprehensive_analysis(
        &self,
        document_id: &str,
    ) -> Result<PipelineId, DocketError> {
        self.composer.comprehensive_analysis(document_id).await
    }

    /// Spawn a worker group with the configured slot count.
    pub async fn spawn_workers(&self) -> WorkerGroup {
        self.spawn_workers_with(self.config.worker_slots).await
    }

    pub async fn spawn_workers_with(&self, slots: usize) -> WorkerGroup {
        self.monitor.register_workers(slots).await;
        WorkerGroup::spawn(slots, Arc::clone(&self.broker), Arc::clone(&self.engine))
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn monitor(&self) -> &Arc<TaskMonitor> {
        &self.monitor
    }

    pub fn hub(&self) -> &Arc<NotificationHub> {
        &self.hub
    }

    pub fn tracker(&self) -> &Arc<ProgressTracker> {
        &self.tracker
    }

    pub fn composer(&self) -> &Arc<PipelineComposer> {
        &self.composer
    }

    pub fn store(&self) -> &Arc<ResultStore> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::handlers::{
        DetectJurisdictionHandler, JurisdictionAnalysisHandler, ProcessDocumentHandler,
    };
    use crate::analysis::{
        Document, DocumentRepository, InMemoryDocuments, KeywordDetector, PlainTextExtractor,
        StaticAnalyzer,
    };
    use crate::monitor::StatusView;

    async fn demo_app(repo: Arc<InMemoryDocuments>) -> Arc<App> {
        let repository = repo as Arc<dyn DocumentRepository>;
        let config = AppConfig {
            retry: RetryPolicy {
                backoff: Duration::from_millis(10),
                max_attempts: 3,
                jitter: None,
            },
            ..AppConfig::default()
        };
        App::builder()
            .config(config)
            .register(ProcessDocumentHandler::new(
                Arc::clone(&repository),
                Arc::new(PlainTextExtractor),
            ))
            .unwrap()
            .register(DetectJurisdictionHandler::new(
                Arc::clone(&repository),
                Arc::new(KeywordDetector),
            ))
            .unwrap()
            .register(JurisdictionAnalysisHandler::new(
                "analyze_india",
                "INDIA",
                Arc::clone(&repository),
                StaticAnalyzer::india(),
            ))
            .unwrap()
            .register(JurisdictionAnalysisHandler::new(
                "analyze_us",
                "US",
                Arc::clone(&repository),
                StaticAnalyzer::us(),
            ))
            .unwrap()
            .register(JurisdictionAnalysisHandler::new(
                "analyze_cross_border",
                "CROSS_BORDER",
                Arc::clone(&repository),
                StaticAnalyzer::cross_border(),
            ))
            .unwrap()
            .expect_tasks(&[
                "process_document",
                "detect_jurisdiction",
                "analyze_india",
                "analyze_us",
                "analyze_cross_border",
            ])
            .build()
            .await
            .unwrap()
    }

    fn indian_contract() -> Document {
        Document::uploaded(
            "d-1",
            "services.txt",
            b"Consideration of ten lakh rupees; disputes before the High Court of Delhi.".to_vec(),
        )
    }

    #[tokio::test]
    async fn status_is_pending_until_a_worker_claims_it() {
        let repo = Arc::new(InMemoryDocuments::new());
        repo.insert(indian_contract()).await;
        let app = demo_app(repo).await;

        // No workers spawned: the task can only ever be PENDING.
        let id = app
            .submit("process_document", serde_json::json!({"document_id": "d-1"}))
            .await
            .unwrap();
        assert_eq!(app.monitor().status(id).await.state, StatusView::Pending);
    }

    #[tokio::test]
    async fn full_pipeline_detects_india_and_analyzes_once() {
        let repo = Arc::new(InMemoryDocuments::new());
        repo.insert(indian_contract()).await;
        let app = demo_app(repo.clone()).await;
        let workers = app.spawn_workers().await;

        let pipeline_id = app.comprehensive_analysis("d-1").await.unwrap();
        let combined = app
            .composer()
            .wait(pipeline_id, Duration::from_secs(10))
            .await
            .unwrap();

        assert_eq!(combined["document_id"], "d-1");
        assert_eq!(combined["detection"]["jurisdiction"], "INDIA");
        assert_eq!(combined["analysis"]["jurisdiction"], "INDIA");

        // Exactly one jurisdiction-specific analysis ran: the Indian one.
        let analyses = repo.analyses_for("d-1").await.unwrap();
        assert_eq!(analyses.len(), 1);
        assert_eq!(analyses[0].jurisdiction, "INDIA");

        workers.shutdown_and_join().await;
    }

    #[tokio::test]
    async fn missing_document_fails_the_pipeline_fast() {
        let repo = Arc::new(InMemoryDocuments::new());
        let app = demo_app(repo).await;
        let workers = app.spawn_workers().await;

        let pipeline_id = app.comprehensive_analysis("d-404").await.unwrap();
        let err = app
            .composer()
            .wait(pipeline_id, Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("document not found"));

        workers.shutdown_and_join().await;
    }

    #[tokio::test]
    async fn build_fails_fast_on_missing_handlers() {
        let err = App::builder()
            .expect_tasks(&["process_document"])
            .build()
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::MissingHandlers(_)));
    }

    #[tokio::test]
    async fn task_progress_reaches_the_status_surface() {
        let repo = Arc::new(InMemoryDocuments::new());
        repo.insert(indian_contract()).await;
        let app = demo_app(repo).await;
        let workers = app.spawn_workers().await;

        let id = app
            .submit("process_document", serde_json::json!({"document_id": "d-1"}))
            .await
            .unwrap();

        // Wait for terminal, then the latest snapshot must be the 100% one.
        for _ in 0..200 {
            let payload = app.monitor().status(id).await;
            if payload.state == StatusView::Success {
                let snap = app.tracker().get(id).await;
                assert_eq!(snap.percentage, 100);
                workers.shutdown_and_join().await;
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task never succeeded");
    }
}
