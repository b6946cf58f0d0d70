//! Collaborator seams for the legal-analysis domain.
//!
//! The actual heuristics (text extraction, jurisdiction detection, clause
//! analysis) are black boxes behind these ports: text in, structured
//! findings out. The in-memory implementations here exist for tests and the
//! demo binary; production wires real collaborators into the same traits.

pub mod handlers;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::DocketError;

/// Output of text extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedText {
    pub text: String,
    pub page_count: u32,
    pub errors: Vec<String>,
}

/// Output of jurisdiction detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    pub jurisdiction: String,
    pub confidence: f64,
    pub scores: HashMap<String, f64>,
    pub detected_elements: Vec<String>,
}

/// Persisted document status. A handler that flips a document to
/// `Processing` must drive it to `Completed` or `Failed` before returning,
/// even on the error path, so failed runs stay inspectable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Uploaded,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub filename: String,
    pub content: Vec<u8>,
    pub status: DocumentStatus,
    pub extracted_text: Option<String>,
    pub page_count: Option<u32>,
    pub error: Option<String>,
}

impl Document {
    pub fn uploaded(id: impl Into<String>, filename: impl Into<String>, content: Vec<u8>) -> Self {
        Self {
            id: id.into(),
            filename: filename.into(),
            content,
            status: DocumentStatus::Uploaded,
            extracted_text: None,
            page_count: None,
            error: None,
        }
    }
}

/// One stored analysis outcome for a document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub document_id: String,
    pub jurisdiction: String,
    pub findings: serde_json::Value,
}

#[async_trait]
pub trait TextExtractor: Send + Sync {
    async fn extract(&self, content: &[u8]) -> Result<ExtractedText, DocketError>;
}

#[async_trait]
pub trait JurisdictionDetector: Send + Sync {
    async fn detect(&self, text: &str) -> Result<Detection, DocketError>;
}

#[async_trait]
pub trait LegalAnalyzer: Send + Sync {
    async fn analyze(
        &self,
        text: &str,
        detection: Option<&Detection>,
    ) -> Result<serde_json::Value, DocketError>;
}

/// Persistence port for documents and their analyses.
#[async_trait]
pub trait DocumentRepository: Send + Sync {
    async fn load(&self, id: &str) -> Result<Option<Document>, DocketError>;

    async fn save(&self, document: &Document) -> Result<(), DocketError>;

    async fn save_analysis(&self, record: &AnalysisRecord) -> Result<(), DocketError>;

    async fn analyses_for(&self, document_id: &str) -> Result<Vec<AnalysisRecord>, DocketError>;
}

/// In-memory repository for tests and the demo binary.
#[derive(Default)]
pub struct InMemoryDocuments {
    documents: Mutex<HashMap<String, Document>>,
    analyses: Mutex<Vec<AnalysisRecord>>,
}

impl InMemoryDocuments {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, document: Document) {
        self.documents
            .lock()
            .await
            .insert(document.id.clone(), document);
    }
}

#[async_trait]
impl DocumentRepository for InMemoryDocuments {
    async fn load(&self, id: &str) -> Result<Option<Document>, DocketError> {
        Ok(self.documents.lock().await.get(id).cloned())
    }

    async fn save(&self, document: &Document) -> Result<(), DocketError> {
        self.documents
            .lock()
            .await
            .insert(document.id.clone(), document.clone());
        Ok(())
    }

    async fn save_analysis(&self, record: &AnalysisRecord) -> Result<(), DocketError> {
        self.analyses.lock().await.push(record.clone());
        Ok(())
    }

    async fn analyses_for(&self, document_id: &str) -> Result<Vec<AnalysisRecord>, DocketError> {
        Ok(self
            .analyses
            .lock()
            .await
            .iter()
            .filter(|r| r.document_id == document_id)
            .cloned()
            .collect())
    }
}

/// Plain-text "extraction": UTF-8 decode, pages split on form feeds.
pub struct PlainTextExtractor;

#[async_trait]
impl TextExtractor for PlainTextExtractor {
    async fn extract(&self, content: &[u8]) -> Result<ExtractedText, DocketError> {
        let text = std::str::from_utf8(content)
            .map_err(|_| DocketError::UnsupportedFormat("not valid utf-8".into()))?
            .to_string();
        if text.trim().is_empty() {
            return Err(DocketError::UnsupportedFormat("document is empty".into()));
        }
        let page_count = text.split('\u{c}').count() as u32;
        Ok(ExtractedText {
            text,
            page_count,
            errors: Vec::new(),
        })
    }
}

/// Keyword-scoring detector. Counts jurisdiction markers and picks the
/// winner; near-equal Indian and US scores read as cross-border.
pub struct KeywordDetector;

const INDIA_MARKERS: &[&str] = &["high court", "supreme court of india", "rupee", "lakh", "crore"];
const US_MARKERS: &[&str] = &["delaware", "united states", "u.s.", "federal court", "sec "];

#[async_trait]
impl JurisdictionDetector for KeywordDetector {
    async fn detect(&self, text: &str) -> Result<Detection, DocketError> {
        let lowered = text.to_lowercase();
        let count = |markers: &[&str]| -> (f64, Vec<String>) {
            let mut score = 0.0;
            let mut hits = Vec::new();
            for marker in markers {
                let n = lowered.matches(marker).count();
                if n > 0 {
                    score += n as f64;
                    hits.push(marker.to_string());
                }
            }
            (score, hits)
        };

        let (india, india_hits) = count(INDIA_MARKERS);
        let (us, us_hits) = count(US_MARKERS);
        let total = india + us;

        let (jurisdiction, confidence) = if total == 0.0 {
            ("UNKNOWN".to_string(), 0.0)
        } else if india > 0.0 && us > 0.0 && (india - us).abs() / total < 0.5 {
            ("CROSS_BORDER".to_string(), (india + us).min(10.0) / 10.0)
        } else if india >= us {
            ("INDIA".to_string(), india / total)
        } else {
            ("US".to_string(), us / total)
        };

        let mut scores = HashMap::new();
        scores.insert("INDIA".to_string(), india);
        scores.insert("US".to_string(), us);

        Ok(Detection {
            jurisdiction,
            confidence,
            scores,
            detected_elements: india_hits.into_iter().chain(us_hits).collect(),
        })
    }
}

/// Canned analyzer used by tests and the demo binary: one per jurisdiction,
/// returning a fixed findings shape.
pub struct StaticAnalyzer {
    jurisdiction: &'static str,
    framework: &'static str,
}

impl StaticAnalyzer {
    pub fn india() -> Arc<Self> {
        Arc::new(Self {
            jurisdiction: "INDIA",
            framework: "Indian Contract Act, 1872",
        })
    }

    pub fn us() -> Arc<Self> {
        Arc::new(Self {
            jurisdiction: "US",
            framework: "UCC / state common law",
        })
    }

    pub fn cross_border() -> Arc<Self> {
        Arc::new(Self {
            jurisdiction: "CROSS_BORDER",
            framework: "CISG / conflict-of-laws",
        })
    }
}

#[async_trait]
impl LegalAnalyzer for StaticAnalyzer {
    async fn analyze(
        &self,
        text: &str,
        detection: Option<&Detection>,
    ) -> Result<serde_json::Value, DocketError> {
        Ok(serde_json::json!({
            "jurisdiction": self.jurisdiction,
            "framework": self.framework,
            "characters_analyzed": text.len(),
            "detection_confidence": detection.map(|d| d.confidence),
            "findings": [],
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn plain_text_extractor_counts_pages() {
        let out = PlainTextExtractor
            .extract("page one\u{c}page two".as_bytes())
            .await
            .unwrap();
        assert_eq!(out.page_count, 2);
        assert!(out.errors.is_empty());
    }

    #[tokio::test]
    async fn extractor_rejects_binary_and_empty() {
        assert!(matches!(
            PlainTextExtractor.extract(&[0xff, 0xfe, 0x00]).await,
            Err(DocketError::UnsupportedFormat(_))
        ));
        assert!(matches!(
            PlainTextExtractor.extract(b"   ").await,
            Err(DocketError::UnsupportedFormat(_))
        ));
    }

    #[tokio::test]
    async fn keyword_detector_spots_india() {
        let detection = KeywordDetector
            .detect("Disputes go to the High Court; consideration of five lakh rupees.")
            .await
            .unwrap();
        assert_eq!(detection.jurisdiction, "INDIA");
        assert!(detection.confidence > 0.5);
        assert!(!detection.detected_elements.is_empty());
    }

    #[tokio::test]
    async fn keyword_detector_spots_cross_border() {
        let detection = KeywordDetector
            .detect("Incorporated in Delaware under United States law; payable in rupees.")
            .await
            .unwrap();
        assert_eq!(detection.jurisdiction, "CROSS_BORDER");
    }

    #[tokio::test]
    async fn unmarked_text_is_unknown() {
        let detection = KeywordDetector.detect("lorem ipsum dolor").await.unwrap();
        assert_eq!(detection.jurisdiction, "UNKNOWN");
        assert_eq!(detection.confidence, 0.0);
    }

    #[tokio::test]
    async fn repository_roundtrip() {
        let repo = InMemoryDocuments::new();
        repo.insert(Document::uploaded("d-1", "nda.txt", b"text".to_vec()))
            .await;
        let doc = repo.load("d-1").await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Uploaded);
        assert!(repo.load("d-404").await.unwrap().is_none());
    }
}
