use std::time::Duration;

use thiserror::Error;

use crate::domain::TaskName;

/// Operational classification of a failure.
///
/// The broker consults this when deciding what to do with a failed lease:
/// - `Transient`: worth retrying (broker/DB/external API hiccup, timeout).
/// - `Permanent`: retrying can never succeed (bad input, missing entity).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Transient,
    Permanent,
}

/// Domain category for handler failures.
///
/// Used in logs and failure payloads so operators can tell which stage of the
/// analysis pipeline blew up without reading the message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    DocumentProcessing,
    AiAnalysis,
    JurisdictionAnalysis,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCategory::DocumentProcessing => "document_processing",
            ErrorCategory::AiAnalysis => "ai_analysis",
            ErrorCategory::JurisdictionAnalysis => "jurisdiction_analysis",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum DocketError {
    #[error("handler not found for task={0}")]
    HandlerNotFound(TaskName),

    #[error("duplicate handler for task={0}")]
    DuplicateHandler(TaskName),

    #[error("unknown queue: {0}")]
    UnknownQueue(String),

    #[error("unknown task: {0}")]
    UnknownTask(String),

    #[error("document not found: {0}")]
    DocumentNotFound(String),

    #[error("unsupported document format: {0}")]
    UnsupportedFormat(String),

    #[error("hard time limit exceeded ({0:?})")]
    HardTimeLimit(Duration),

    #[error("timed out waiting for result ({0:?})")]
    WaitTimeout(Duration),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("{category}: {message}")]
    Handler {
        category: ErrorCategory,
        kind: ErrorKind,
        message: String,
    },

    #[error("{0}")]
    Other(String),
}

impl DocketError {
    /// Transient handler failure (retried by the broker).
    pub fn transient(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self::Handler {
            category,
            kind: ErrorKind::Transient,
            message: message.into(),
        }
    }

    /// Permanent handler failure (goes terminal without burning retries).
    pub fn permanent(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self::Handler {
            category,
            kind: ErrorKind::Permanent,
            message: message.into(),
        }
    }

    /// How the broker should treat this failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DocketError::Handler { kind, .. } => *kind,
            DocketError::DocumentNotFound(_)
            | DocketError::UnsupportedFormat(_)
            | DocketError::HandlerNotFound(_)
            | DocketError::UnknownTask(_)
            | DocketError::UnknownQueue(_)
            | DocketError::DuplicateHandler(_) => ErrorKind::Permanent,
            _ => ErrorKind::Transient,
        }
    }

    /// Domain category, where one applies.
    pub fn category(&self) -> Option<ErrorCategory> {
        match self {
            DocketError::Handler { category, .. } => Some(*category),
            DocketError::DocumentNotFound(_) | DocketError::UnsupportedFormat(_) => {
                Some(ErrorCategory::DocumentProcessing)
            }
            _ => None,
        }
    }
}
