//! Multi-stage analysis pipelines: detect, then analyze per jurisdiction.
//!
//! Composed as a saga: each stage is an ordinary queued task, and the
//! engine's completion hook drives the next step. No worker slot is ever
//! held hostage waiting for a child task: callers that want a blocking
//! answer use `wait`, outside any slot, with a bounded timeout.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tracing::{info, warn};

use crate::domain::{PipelineId, TaskId, TaskName};
use crate::error::DocketError;
use crate::worker::{CompletionHook, TaskOutcome};

/// Submits tasks on behalf of the composer. Implemented by the app context.
#[async_trait]
pub trait TaskSubmitter: Send + Sync {
    async fn submit(
        &self,
        name: TaskName,
        args: serde_json::Value,
    ) -> Result<TaskId, DocketError>;
}

/// Where a pipeline currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Detecting,
    Analyzing,
    Completed,
    Failed,
}

/// Serializable view of one pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub pipeline_id: PipelineId,
    pub document_id: String,
    pub stage: PipelineStage,
    pub detect_task: TaskId,
    pub analysis_task: Option<TaskId>,
}

type PipelineResult = Result<serde_json::Value, String>;

struct PipelineEntry {
    document_id: String,
    stage: PipelineStage,
    detect_task: TaskId,
    analysis_task: Option<TaskId>,
    detection: Option<serde_json::Value>,
    done_tx: watch::Sender<Option<PipelineResult>>,
    done_rx: watch::Receiver<Option<PipelineResult>>,
}

#[derive(Default)]
struct ComposerState {
    pipelines: HashMap<PipelineId, PipelineEntry>,
    by_task: HashMap<TaskId, PipelineId>,
}

/// Chains `detect_jurisdiction` into exactly one jurisdiction-specific
/// analysis task, fail-fast on either stage.
pub struct PipelineComposer {
    submitter: Arc<dyn TaskSubmitter>,
    state: Mutex<ComposerState>,
}

impl PipelineComposer {
    pub fn new(submitter: Arc<dyn TaskSubmitter>) -> Self {
        Self {
            submitter,
            state: Mutex::new(ComposerState::default()),
        }
    }

    /// Start a detect -> analyze saga for one document.
    pub async fn comprehensive_analysis(
        &self,
        document_id: &str,
    ) -> Result<PipelineId, DocketError> {
        let detect_task = self
            .submitter
            .submit(
                TaskName::new("detect_jurisdiction"),
                serde_json::json!({ "document_id": document_id }),
            )
            .await?;

        let pipeline_id = PipelineId::generate();
        let (done_tx, done_rx) = watch::channel(None);
        let mut state = self.state.lock().await;
        state.pipelines.insert(
            pipeline_id,
            PipelineEntry {
                document_id: document_id.to_string(),
                stage: PipelineStage::Detecting,
                detect_task,
                analysis_task: None,
                detection: None,
                done_tx,
                done_rx,
            },
        );
        state.by_task.insert(detect_task, pipeline_id);

        info!(pipeline_id = %pipeline_id, document_id, detect_task = %detect_task, "pipeline started");
        Ok(pipeline_id)
    }

    /// Block (outside any worker slot) until the pipeline resolves, bounded
    /// by `timeout`. A stage-2 failure surfaces its error verbatim.
    pub async fn wait(
        &self,
        pipeline_id: PipelineId,
        timeout: Duration,
    ) -> Result<serde_json::Value, DocketError> {
        let mut rx = {
            let state = self.state.lock().await;
            let entry = state
                .pipelines
                .get(&pipeline_id)
                .ok_or_else(|| DocketError::Other(format!("unknown pipeline {pipeline_id}")))?;
            entry.done_rx.clone()
        };

        let outcome = tokio::time::timeout(timeout, async move {
            loop {
                let done = rx.borrow().clone();
                if let Some(result) = done {
                    return result;
                }
                if rx.changed().await.is_err() {
                    return Err("pipeline dropped before completion".to_string());
                }
            }
        })
        .await;

        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(DocketError::Other(message)),
            Err(_) => Err(DocketError::WaitTimeout(timeout)),
        }
    }

    pub async fn status(&self, pipeline_id: PipelineId) -> Option<PipelineStatus> {
        let state = self.state.lock().await;
        state.pipelines.get(&pipeline_id).map(|entry| PipelineStatus {
            pipeline_id,
            document_id: entry.document_id.clone(),
            stage: entry.stage,
            detect_task: entry.detect_task,
            analysis_task: entry.analysis_task,
        })
    }

    /// The one branch point: which analysis task serves this jurisdiction.
    fn analysis_task_for(jurisdiction: &str) -> Option<TaskName> {
        match jurisdiction.to_ascii_uppercase().as_str() {
            "INDIA" => Some(TaskName::new("analyze_india")),
            "US" | "USA" => Some(TaskName::new("analyze_us")),
            "CROSS_BORDER" => Some(TaskName::new("analyze_cross_border")),
            _ => None,
        }
    }

    async fn finish(&self, pipeline_id: PipelineId, result: PipelineResult) {
        let mut state = self.state.lock().await;
        let Some(entry) = state.pipelines.get_mut(&pipeline_id) else {
            return;
        };
        entry.stage = if result.is_ok() {
            PipelineStage::Completed
        } else {
            PipelineStage::Failed
        };
        let _ = entry.done_tx.send(Some(result));
    }

    async fn on_detect_done(&self, pipeline_id: PipelineId, outcome: &TaskOutcome) {
        let detection = match outcome {
            // Fail-fast: a failed detection never dispatches stage 2.
            TaskOutcome::Failure(message) => {
                warn!(pipeline_id = %pipeline_id, error = %message, "detection failed, aborting pipeline");
                self.finish(pipeline_id, Err(message.clone())).await;
                return;
            }
            TaskOutcome::Success(detection) => detection.clone(),
        };

        let (document_id, jurisdiction) = {
            let mut state = self.state.lock().await;
            let Some(entry) = state.pipelines.get_mut(&pipeline_id) else {
                return;
            };
            entry.detection = Some(detection.clone());
            let jurisdiction = detection
                .get("jurisdiction")
                .and_then(|j| j.as_str())
                .unwrap_or_default()
                .to_string();
            (entry.document_id.clone(), jurisdiction)
        };

        let Some(task_name) = Self::analysis_task_for(&jurisdiction) else {
            self.finish(
                pipeline_id,
                Err(format!("unsupported jurisdiction: {jurisdiction:?}")),
            )
            .await;
            return;
        };

        let args = serde_json::json!({
            "document_id": document_id,
            "detection": detection,
        });
        let analysis_task = match self.submitter.submit(task_name.clone(), args).await {
            Ok(task_id) => task_id,
            Err(e) => {
                self.finish(pipeline_id, Err(format!("dispatch failed: {e}"))).await;
                return;
            }
        };

        info!(pipeline_id = %pipeline_id, task = %task_name, analysis_task = %analysis_task, "stage 2 dispatched");
        let mut state = self.state.lock().await;
        if let Some(entry) = state.pipelines.get_mut(&pipeline_id) {
            entry.stage = PipelineStage::Analyzing;
            entry.analysis_task = Some(analysis_task);
        }
        state.by_task.insert(analysis_task, pipeline_id);
    }

    async fn on_analysis_done(&self, pipeline_id: PipelineId, outcome: &TaskOutcome) {
        match outcome {
            // The sub-task's error is the composer's error, verbatim.
            TaskOutcome::Failure(message) => {
                self.finish(pipeline_id, Err(message.clone())).await;
            }
            TaskOutcome::Success(analysis) => {
                let combined = {
                    let state = self.state.lock().await;
                    let Some(entry) = state.pipelines.get(&pipeline_id) else {
                        return;
                    };
                    serde_json::json!({
                        "document_id": entry.document_id,
                        "detection": entry.detection,
                        "analysis": analysis,
                    })
                };
                self.finish(pipeline_id, Ok(combined)).await;
            }
        }
    }
}

#[async_trait]
impl CompletionHook for PipelineComposer {
    async fn on_terminal(&self, task_id: TaskId, outcome: &TaskOutcome) {
        let role = {
            let state = self.state.lock().await;
            let Some(pipeline_id) = state.by_task.get(&task_id).copied() else {
                return; // not a pipeline task
            };
            let Some(entry) = state.pipelines.get(&pipeline_id) else {
                return;
            };
            if entry.detect_task == task_id {
                Some((pipeline_id, true))
            } else if entry.analysis_task == Some(task_id) {
                Some((pipeline_id, false))
            } else {
                None
            }
        };

        match role {
            Some((pipeline_id, true)) => self.on_detect_done(pipeline_id, outcome).await,
            Some((pipeline_id, false)) => self.on_analysis_done(pipeline_id, outcome).await,
            None => {}
        }
    }
}
