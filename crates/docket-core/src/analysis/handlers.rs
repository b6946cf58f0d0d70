//! Built-in task handlers for the document-analysis pipeline.
//!
//! Delivery is ack-late, so every handler here is written check-before-act:
//! a redelivered message finds the persisted state and returns the existing
//! outcome instead of redoing (or double-recording) the work.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use super::{
    AnalysisRecord, Detection, Document, DocumentRepository, DocumentStatus, JurisdictionDetector,
    LegalAnalyzer, TextExtractor,
};
use crate::domain::TaskEnvelope;
use crate::error::{DocketError, ErrorCategory};
use crate::runtime::{TaskContext, TaskHandler};

#[derive(Debug, Deserialize)]
struct DocumentArgs {
    document_id: String,
}

fn parse_args(envelope: &TaskEnvelope) -> Result<DocumentArgs, DocketError> {
    serde_json::from_value(envelope.args().clone()).map_err(|e| {
        DocketError::permanent(
            ErrorCategory::DocumentProcessing,
            format!("bad task args: {e}"),
        )
    })
}

async fn load_document(
    repository: &Arc<dyn DocumentRepository>,
    document_id: &str,
) -> Result<Document, DocketError> {
    repository
        .load(document_id)
        .await?
        .ok_or_else(|| DocketError::DocumentNotFound(document_id.to_string()))
}

/// Text a later stage should analyze: the extracted text when processing ran
/// first, a lossy decode of the raw bytes otherwise.
fn analyzable_text(document: &Document) -> String {
    match &document.extracted_text {
        Some(text) => text.clone(),
        None => String::from_utf8_lossy(&document.content).into_owned(),
    }
}

/// `process_document`: extract text and persist it on the document.
pub struct ProcessDocumentHandler {
    repository: Arc<dyn DocumentRepository>,
    extractor: Arc<dyn TextExtractor>,
}

impl ProcessDocumentHandler {
    pub fn new(
        repository: Arc<dyn DocumentRepository>,
        extractor: Arc<dyn TextExtractor>,
    ) -> Arc<Self> {
        Arc::new(Self {
            repository,
            extractor,
        })
    }
}

#[async_trait]
impl TaskHandler for ProcessDocumentHandler {
    fn name(&self) -> &'static str {
        "process_document"
    }

    async fn run(
        &self,
        envelope: &TaskEnvelope,
        ctx: TaskContext,
    ) -> Result<serde_json::Value, DocketError> {
        let args = parse_args(envelope)?;
        let mut document = load_document(&self.repository, &args.document_id).await?;

        // Redelivery: the work already landed, report the stored outcome.
        if document.status == DocumentStatus::Completed {
            info!(document_id = %document.id, "document already processed, skipping");
            return Ok(serde_json::json!({
                "document_id": document.id,
                "page_count": document.page_count,
                "already_processed": true,
            }));
        }

        ctx.progress(0, 100, "starting document processing").await;
        document.status = DocumentStatus::Processing;
        self.repository.save(&document).await?;

        ctx.progress(10, 100, "extracting text").await;
        let extracted = match self.extractor.extract(&document.content).await {
            Ok(extracted) => extracted,
            Err(e) => {
                // The document must land in a terminal status with whatever
                // partial state exists before the error propagates.
                document.status = DocumentStatus::Failed;
                document.error = Some(e.to_string());
                self.repository.save(&document).await?;
                return Err(e);
            }
        };

        ctx.progress(60, 100, "persisting extracted text").await;
        document.extracted_text = Some(extracted.text.clone());
        document.page_count = Some(extracted.page_count);
        document.status = DocumentStatus::Completed;
        document.error = None;
        self.repository.save(&document).await?;

        ctx.progress(100, 100, "document processed").await;
        Ok(serde_json::json!({
            "document_id": document.id,
            "page_count": extracted.page_count,
            "characters": extracted.text.len(),
            "extraction_errors": extracted.errors,
        }))
    }
}

/// `detect_jurisdiction`: classify which legal system a document belongs to.
pub struct DetectJurisdictionHandler {
    repository: Arc<dyn DocumentRepository>,
    detector: Arc<dyn JurisdictionDetector>,
}

impl DetectJurisdictionHandler {
    pub fn new(
        repository: Arc<dyn DocumentRepository>,
        detector: Arc<dyn JurisdictionDetector>,
    ) -> Arc<Self> {
        Arc::new(Self {
            repository,
            detector,
        })
    }
}

#[async_trait]
impl TaskHandler for DetectJurisdictionHandler {
    fn name(&self) -> &'static str {
        "detect_jurisdiction"
    }

    async fn run(
        &self,
        envelope: &TaskEnvelope,
        ctx: TaskContext,
    ) -> Result<serde_json::Value, DocketError> {
        let args = parse_args(envelope)?;
        let document = load_document(&self.repository, &args.document_id).await?;

        ctx.progress(30, 100, "scanning jurisdiction markers").await;
        let text = analyzable_text(&document);
        let detection = self
            .detector
            .detect(&text)
            .await
            .map_err(|e| match e.category() {
                Some(_) => e,
                None => DocketError::transient(ErrorCategory::JurisdictionAnalysis, e.to_string()),
            })?;

        ctx.progress(100, 100, "jurisdiction detected").await;
        info!(
            document_id = %document.id,
            jurisdiction = %detection.jurisdiction,
            confidence = detection.confidence,
            "detection finished"
        );
        serde_json::to_value(&detection)
            .map_err(|e| DocketError::permanent(ErrorCategory::JurisdictionAnalysis, e.to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct AnalysisArgs {
    document_id: String,
    detection: Option<Detection>,
}

/// One jurisdiction-specific analysis task. Registered once per supported
/// jurisdiction ("analyze_india", "analyze_us", "analyze_cross_border").
pub struct JurisdictionAnalysisHandler {
    task_name: &'static str,
    jurisdiction: &'static str,
    repository: Arc<dyn DocumentRepository>,
    analyzer: Arc<dyn LegalAnalyzer>,
}

impl JurisdictionAnalysisHandler {
    pub fn new(
        task_name: &'static str,
        jurisdiction: &'static str,
        repository: Arc<dyn DocumentRepository>,
        analyzer: Arc<dyn LegalAnalyzer>,
    ) -> Arc<Self> {
        Arc::new(Self {
            task_name,
            jurisdiction,
            repository,
            analyzer,
        })
    }
}

#[async_trait]
impl TaskHandler for JurisdictionAnalysisHandler {
    fn name(&self) -> &'static str {
        self.task_name
    }

    async fn run(
        &self,
        envelope: &TaskEnvelope,
        ctx: TaskContext,
    ) -> Result<serde_json::Value, DocketError> {
        let args: AnalysisArgs = serde_json::from_value(envelope.args().clone()).map_err(|e| {
            DocketError::permanent(
                ErrorCategory::JurisdictionAnalysis,
                format!("bad task args: {e}"),
            )
        })?;
        let document = load_document(&self.repository, &args.document_id).await?;

        // Redelivery: an analysis for this jurisdiction already exists.
        let existing = self.repository.analyses_for(&document.id).await?;
        if let Some(record) = existing.iter().find(|r| r.jurisdiction == self.jurisdiction) {
            info!(document_id = %document.id, jurisdiction = self.jurisdiction, "analysis already stored, skipping");
            return Ok(record.findings.clone());
        }

        ctx.progress(20, 100, "loading document text").await;
        let text = analyzable_text(&document);

        ctx.progress(60, 100, "running legal analysis").await;
        let findings = self
            .analyzer
            .analyze(&text, args.detection.as_ref())
            .await
            .map_err(|e| match e.category() {
                Some(_) => e,
                None => DocketError::transient(ErrorCategory::AiAnalysis, e.to_string()),
            })?;

        ctx.progress(90, 100, "persisting findings").await;
        self.repository
            .save_analysis(&AnalysisRecord {
                document_id: document.id.clone(),
                jurisdiction: self.jurisdiction.to_string(),
                findings: findings.clone(),
            })
            .await?;

        ctx.progress(100, 100, "analysis complete").await;
        Ok(findings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{InMemoryDocuments, KeywordDetector, PlainTextExtractor, StaticAnalyzer};
    use crate::domain::{TaskId, TaskName};
    use crate::hub::NotificationHub;
    use crate::progress::ProgressTracker;
    use crate::store::{InMemoryProgressCache, ResultStore};
    use std::time::Duration;
    use tokio::sync::watch;

    fn test_ctx(task_id: TaskId) -> TaskContext {
        let store = Arc::new(ResultStore::new(Duration::from_secs(3600)));
        let tracker = Arc::new(ProgressTracker::new(
            store,
            Arc::new(InMemoryProgressCache::new()),
            Arc::new(NotificationHub::new(Duration::from_millis(200))),
            Duration::from_secs(60),
        ));
        let (_tx, rx) = watch::channel(false);
        TaskContext::new(task_id, tracker, rx)
    }

    fn envelope(name: &str, document_id: &str) -> TaskEnvelope {
        TaskEnvelope::new(
            TaskId::generate(),
            TaskName::new(name),
            serde_json::json!({ "document_id": document_id }),
        )
    }

    async fn repo_with(text: &str) -> Arc<InMemoryDocuments> {
        let repo = Arc::new(InMemoryDocuments::new());
        repo.insert(Document::uploaded("d-1", "contract.txt", text.as_bytes().to_vec()))
            .await;
        repo
    }

    #[tokio::test]
    async fn process_document_extracts_and_completes() {
        let repo = repo_with("governed by the High Court of Delhi").await;
        let handler = ProcessDocumentHandler::new(
            repo.clone() as Arc<dyn DocumentRepository>,
            Arc::new(PlainTextExtractor),
        );

        let env = envelope("process_document", "d-1");
        let result = handler.run(&env, test_ctx(env.task_id())).await.unwrap();
        assert_eq!(result["page_count"], 1);

        let doc = repo.load("d-1").await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Completed);
        assert!(doc.extracted_text.is_some());
    }

    #[tokio::test]
    async fn redelivered_process_document_skips_the_work() {
        let repo = repo_with("some text").await;
        let handler = ProcessDocumentHandler::new(
            repo.clone() as Arc<dyn DocumentRepository>,
            Arc::new(PlainTextExtractor),
        );

        let env = envelope("process_document", "d-1");
        handler.run(&env, test_ctx(env.task_id())).await.unwrap();
        // Ack was lost, the broker redelivers: the handler must notice.
        let again = handler.run(&env, test_ctx(env.task_id())).await.unwrap();
        assert_eq!(again["already_processed"], true);
    }

    #[tokio::test]
    async fn missing_document_is_a_permanent_error() {
        let repo = Arc::new(InMemoryDocuments::new());
        let handler = ProcessDocumentHandler::new(
            repo as Arc<dyn DocumentRepository>,
            Arc::new(PlainTextExtractor),
        );

        let env = envelope("process_document", "d-404");
        let err = handler.run(&env, test_ctx(env.task_id())).await.unwrap_err();
        assert!(matches!(err, DocketError::DocumentNotFound(_)));
    }

    #[tokio::test]
    async fn extraction_failure_leaves_document_inspectable() {
        let repo = Arc::new(InMemoryDocuments::new());
        repo.insert(Document::uploaded("d-bin", "blob.bin", vec![0xff, 0xfe]))
            .await;
        let handler = ProcessDocumentHandler::new(
            repo.clone() as Arc<dyn DocumentRepository>,
            Arc::new(PlainTextExtractor),
        );

        let env = envelope("process_document", "d-bin");
        let err = handler.run(&env, test_ctx(env.task_id())).await.unwrap_err();
        assert!(matches!(err, DocketError::UnsupportedFormat(_)));

        // Failed, not stuck in Processing, with the error recorded.
        let doc = repo.load("d-bin").await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Failed);
        assert!(doc.error.unwrap().contains("utf-8"));
    }

    #[tokio::test]
    async fn detect_jurisdiction_returns_structured_detection() {
        let repo = repo_with("ten lakh rupees before the High Court").await;
        let handler = DetectJurisdictionHandler::new(
            repo as Arc<dyn DocumentRepository>,
            Arc::new(KeywordDetector),
        );

        let env = envelope("detect_jurisdiction", "d-1");
        let result = handler.run(&env, test_ctx(env.task_id())).await.unwrap();
        assert_eq!(result["jurisdiction"], "INDIA");
        assert!(result["confidence"].as_f64().unwrap() > 0.0);
        assert!(result["scores"].is_object());
    }

    #[tokio::test]
    async fn analysis_is_idempotent_per_jurisdiction() {
        let repo = repo_with("contract text").await;
        let handler = JurisdictionAnalysisHandler::new(
            "analyze_india",
            "INDIA",
            repo.clone() as Arc<dyn DocumentRepository>,
            StaticAnalyzer::india(),
        );

        let env = envelope("analyze_india", "d-1");
        let first = handler.run(&env, test_ctx(env.task_id())).await.unwrap();
        let second = handler.run(&env, test_ctx(env.task_id())).await.unwrap();
        assert_eq!(first, second);

        // Only one record was stored despite two deliveries.
        assert_eq!(repo.analyses_for("d-1").await.unwrap().len(), 1);
    }
}
