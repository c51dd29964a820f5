//! Transport-facing entry point: validate a chunk upload, hand it to the
//! aggregator, and map the outcome to a caller-facing response.

use crate::aggregator::{BatchAggregator, ChunkSubmission, CompletedBatch, SubmitOutcome};
use crate::config::BatchpipeConfig;
use crate::error::{BatchError, ValidationError};
use crate::janitor::JanitorSweep;
use crate::pipeline::{Pipeline, ProcessPipeline};
use crate::store::{ChunkStore, InMemoryChunkStore};
use crate::types::{Progress, Row};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Longest accepted batch id, in characters.
pub const MAX_BATCH_ID_CHARS: usize = 200;

/// One chunk upload as it arrives from the caller.
///
/// Every field is optional so missing values surface as validation errors
/// rather than deserialization failures.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitChunkRequest {
    #[serde(default)]
    pub batch_id: Option<String>,
    #[serde(default, alias = "batchNumber")]
    pub chunk_index: Option<i64>,
    #[serde(default, alias = "totalBatches")]
    pub total_chunks: Option<i64>,
    #[serde(default)]
    pub rows: Option<Vec<Row>>,
    #[serde(default)]
    pub sources: Option<Vec<String>>,
    #[serde(default, alias = "fileName")]
    pub dataset_label: Option<String>,
    #[serde(default)]
    pub is_final: bool,
}

/// Caller-facing result of a chunk upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SubmitResponse {
    Progress {
        percent: u8,
        received: u32,
        total: u32,
    },
    Completed {
        artifact_url: String,
        artifact_name: String,
        processing_time_seconds: f64,
        total_rows: usize,
    },
    Failed {
        code: String,
        error_message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<String>,
        status_code: u16,
    },
}

impl SubmitResponse {
    pub fn is_failure(&self) -> bool {
        matches!(self, SubmitResponse::Failed { .. })
    }
}

impl From<Progress> for SubmitResponse {
    fn from(progress: Progress) -> Self {
        SubmitResponse::Progress {
            percent: progress.percent,
            received: progress.received,
            total: progress.total,
        }
    }
}

impl From<&BatchError> for SubmitResponse {
    fn from(err: &BatchError) -> Self {
        let details = match err {
            BatchError::Pipeline(e) => match (e.excerpt(), e.hint()) {
                (Some(excerpt), Some(hint)) => Some(format!("{excerpt}\n\n{hint}")),
                (Some(excerpt), None) => Some(excerpt.to_string()),
                (None, hint) => hint.map(str::to_string),
            },
            _ => None,
        };
        SubmitResponse::Failed {
            code: err.code().to_string(),
            error_message: err.to_string(),
            details,
            status_code: err.status_code(),
        }
    }
}

pub struct BatchController {
    aggregator: Arc<BatchAggregator>,
    artifact_url_prefix: String,
}

impl BatchController {
    pub fn new(aggregator: Arc<BatchAggregator>, artifact_url_prefix: impl Into<String>) -> Self {
        Self {
            aggregator,
            artifact_url_prefix: artifact_url_prefix.into(),
        }
    }

    /// Wire an in-memory store and the process pipeline from configuration.
    pub fn from_config(config: &BatchpipeConfig, cancel: CancellationToken) -> Self {
        let store: Arc<dyn ChunkStore> = Arc::new(InMemoryChunkStore::new());
        let pipeline: Arc<dyn Pipeline> = Arc::new(ProcessPipeline::new(config.pipeline.clone()));
        Self::with_parts(config, store, pipeline, cancel)
    }

    /// Like [`from_config`](Self::from_config) with caller-supplied backends.
    pub fn with_parts(
        config: &BatchpipeConfig,
        store: Arc<dyn ChunkStore>,
        pipeline: Arc<dyn Pipeline>,
        cancel: CancellationToken,
    ) -> Self {
        let aggregator = BatchAggregator::new(store, pipeline, config.ingest.clone())
            .with_cancellation(cancel);
        Self::new(
            Arc::new(aggregator),
            config.pipeline.artifact_url_prefix.clone(),
        )
    }

    pub fn aggregator(&self) -> &Arc<BatchAggregator> {
        &self.aggregator
    }

    /// Start the periodic sweep over this controller's store, if enabled.
    pub fn spawn_janitor(
        &self,
        config: &BatchpipeConfig,
        cancel: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        if !config.janitor.enabled {
            debug!("Janitor disabled");
            return None;
        }
        let sweep = Arc::new(JanitorSweep::for_aggregator(&self.aggregator, &config.janitor));
        Some(sweep.spawn(config.janitor.interval(), cancel))
    }

    /// Handle one chunk upload. Never fails: errors become `Failed` responses.
    pub async fn submit_chunk(&self, request: SubmitChunkRequest) -> SubmitResponse {
        let batch_id = request.batch_id.clone().unwrap_or_default();
        match self.try_submit(request).await {
            Ok(SubmitOutcome::InProgress(progress)) => progress.into(),
            Ok(SubmitOutcome::Completed(done)) => self.completed_response(done),
            Err(e) => {
                if e.is_rejection() {
                    debug!(batch_id = %batch_id, code = e.code(), error = %e, "Rejected chunk");
                } else {
                    warn!(batch_id = %batch_id, code = e.code(), error = %e, "Batch submission failed");
                }
                SubmitResponse::from(&e)
            }
        }
    }

    async fn try_submit(&self, request: SubmitChunkRequest) -> Result<SubmitOutcome, BatchError> {
        let submission = self.validate(request)?;
        self.aggregator.submit(submission).await
    }

    /// Check a request without touching any batch state.
    pub fn validate(&self, request: SubmitChunkRequest) -> Result<ChunkSubmission, ValidationError> {
        let batch_id = request
            .batch_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or(ValidationError::MissingBatchId)?;
        if batch_id.chars().count() > MAX_BATCH_ID_CHARS {
            return Err(ValidationError::InvalidBatchId {
                reason: format!("longer than {MAX_BATCH_ID_CHARS} characters"),
            });
        }
        if batch_id.chars().any(char::is_control) {
            return Err(ValidationError::InvalidBatchId {
                reason: "contains control characters".into(),
            });
        }

        let rows = request.rows.ok_or(ValidationError::MissingRows)?;

        let chunk_index = match request.chunk_index {
            Some(index) if index >= 1 => u32::try_from(index)
                .map_err(|_| ValidationError::InvalidChunkIndex { index: Some(index) })?,
            other => return Err(ValidationError::InvalidChunkIndex { index: other }),
        };

        let limit = self.aggregator.ingest().max_rows_per_chunk;
        if rows.len() > limit {
            return Err(ValidationError::ChunkTooLarge {
                rows: rows.len(),
                limit,
            });
        }

        let total_chunks = request
            .total_chunks
            .filter(|total| *total > 0)
            .map(|total| u32::try_from(total).unwrap_or(u32::MAX));

        Ok(ChunkSubmission {
            batch_id: batch_id.to_string(),
            chunk_index,
            rows,
            total_chunks,
            sources: request.sources,
            dataset_label: request.dataset_label,
            is_final: request.is_final,
        })
    }

    fn completed_response(&self, done: CompletedBatch) -> SubmitResponse {
        let elapsed_ms = (Utc::now() - done.started_at).num_milliseconds().max(0);
        SubmitResponse::Completed {
            artifact_url: format!(
                "{}/{}",
                self.artifact_url_prefix.trim_end_matches('/'),
                done.artifact.artifact_name
            ),
            artifact_name: done.artifact.artifact_name,
            processing_time_seconds: round_tenths(elapsed_ms as f64 / 1000.0),
            total_rows: done.total_rows,
        }
    }
}

fn round_tenths(seconds: f64) -> f64 {
    (seconds * 10.0).round() / 10.0
}
