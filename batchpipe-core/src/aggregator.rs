//! Chunk aggregation, readiness, and dispatch.
//!
//! A batch is ready when the caller marks a chunk as final **or** when as many
//! distinct chunks as announced have arrived. A final marker never waits on
//! missing chunks: gaps are logged and processing goes ahead with the data
//! that is present.
//!
//! Readiness is decided under the batch's own lock. The record is sealed and
//! removed from the store in the same critical section, which is the single
//! point that guarantees a batch is processed at most once.

use crate::assembler::DatasetAssembler;
use crate::config::IngestConfig;
use crate::error::{BatchError, ValidationError};
use crate::pipeline::{Pipeline, PipelineRequest, PipelineSuccess};
use crate::store::ChunkStore;
use crate::types::{BatchDefaults, Chunk, ChunkInsert, MissingChunks, Progress, ReadyBatch, Row};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A validated chunk upload.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkSubmission {
    pub batch_id: String,
    /// 1-based chunk position.
    pub chunk_index: u32,
    pub rows: Vec<Row>,
    pub total_chunks: Option<u32>,
    pub sources: Option<Vec<String>>,
    pub dataset_label: Option<String>,
    pub is_final: bool,
}

/// Result of storing one chunk.
#[derive(Debug)]
pub enum Accepted {
    /// More chunks are expected.
    Pending(Progress),
    /// The batch left the store and must be processed by the caller.
    Ready(ReadyBatch),
}

/// Outcome of a full submission.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    InProgress(Progress),
    Completed(CompletedBatch),
}

/// A batch whose artifact was produced.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedBatch {
    pub batch_id: String,
    pub artifact: PipelineSuccess,
    pub total_rows: usize,
    pub started_at: DateTime<Utc>,
    pub missing: MissingChunks,
}

/// Where a dispatched batch stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchPhase {
    Processing { since: DateTime<Utc> },
    Completed { at: DateTime<Utc> },
}

/// Batch ids that left the store for processing.
///
/// Chunks for an id in the ledger are rejected, so a late or repeated final
/// chunk cannot start a second run. Failed batches are cleared right away so
/// the caller can resubmit; completed ones expire through the janitor.
#[derive(Debug, Default)]
pub struct DispatchLedger {
    entries: DashMap<String, DispatchPhase>,
}

impl DispatchLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self, batch_id: &str) -> Option<DispatchPhase> {
        self.entries.get(batch_id).map(|entry| *entry.value())
    }

    pub fn begin(&self, batch_id: &str) {
        self.entries.insert(
            batch_id.to_string(),
            DispatchPhase::Processing { since: Utc::now() },
        );
    }

    pub fn complete(&self, batch_id: &str) {
        self.entries.insert(
            batch_id.to_string(),
            DispatchPhase::Completed { at: Utc::now() },
        );
    }

    pub fn release(&self, batch_id: &str) {
        self.entries.remove(batch_id);
    }

    /// Forget completed batches finished before `cutoff`. Returns how many were dropped.
    pub fn evict_completed_before(&self, cutoff: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, phase| match phase {
            DispatchPhase::Completed { at } => *at >= cutoff,
            DispatchPhase::Processing { .. } => true,
        });
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Clears the ledger entry unless the batch completed, including when the
/// processing future is dropped midway.
struct DispatchGuard<'a> {
    ledger: &'a DispatchLedger,
    batch_id: String,
    completed: bool,
}

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        if self.completed {
            self.ledger.complete(&self.batch_id);
        } else {
            self.ledger.release(&self.batch_id);
        }
    }
}

/// Receives chunks and drives ready batches through assembly and the pipeline.
pub struct BatchAggregator {
    store: Arc<dyn ChunkStore>,
    ledger: Arc<DispatchLedger>,
    pipeline: Arc<dyn Pipeline>,
    assembler: DatasetAssembler,
    ingest: IngestConfig,
    cancel: CancellationToken,
}

impl BatchAggregator {
    pub fn new(
        store: Arc<dyn ChunkStore>,
        pipeline: Arc<dyn Pipeline>,
        ingest: IngestConfig,
    ) -> Self {
        Self {
            store,
            ledger: Arc::new(DispatchLedger::new()),
            pipeline,
            assembler: DatasetAssembler::new(),
            ingest,
            cancel: CancellationToken::new(),
        }
    }

    /// Use `token` to cancel in-flight pipeline runs on shutdown.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn store(&self) -> &Arc<dyn ChunkStore> {
        &self.store
    }

    pub fn ledger(&self) -> &Arc<DispatchLedger> {
        &self.ledger
    }

    pub fn ingest(&self) -> &IngestConfig {
        &self.ingest
    }

    /// Store a chunk and process the batch if it became ready.
    pub async fn submit(&self, submission: ChunkSubmission) -> Result<SubmitOutcome, BatchError> {
        match self.accept(submission)? {
            Accepted::Pending(progress) => Ok(SubmitOutcome::InProgress(progress)),
            Accepted::Ready(ready) => self.process(ready).await.map(SubmitOutcome::Completed),
        }
    }

    /// Store a chunk and decide readiness. Never blocks on I/O.
    pub fn accept(&self, submission: ChunkSubmission) -> Result<Accepted, BatchError> {
        if submission.chunk_index == 0 {
            return Err(ValidationError::InvalidChunkIndex { index: Some(0) }.into());
        }
        let batch_id = submission.batch_id.clone();
        let defaults = self.defaults_for(&submission);
        let mut chunk = Some(Chunk::new(submission.chunk_index, submission.rows));

        loop {
            let handle = self.store.get_or_create(&batch_id, defaults.clone());
            let mut record = handle.lock();

            // Sealed by a concurrent readiness or sweep after we fetched the
            // handle. The store no longer holds it, so look again.
            if record.is_sealed() {
                continue;
            }

            if self.ledger.phase(&batch_id).is_some() {
                if record.is_empty() {
                    record.seal();
                    self.store.remove(&batch_id);
                }
                debug!(batch_id = %batch_id, "Rejecting chunk for dispatched batch");
                return Err(BatchError::AlreadyDispatched { batch_id });
            }

            if let Some(total) = submission.total_chunks {
                if total.max(1) != record.total_chunks_expected() {
                    warn!(
                        batch_id = %batch_id,
                        announced = total,
                        expected = record.total_chunks_expected(),
                        "Chunk disagrees with the batch's expected chunk count"
                    );
                }
            }

            let Some(chunk) = chunk.take() else {
                unreachable!("chunk is only consumed once per submission");
            };
            let chunk_rows = chunk.rows.len();
            if let ChunkInsert::Replaced { previous_rows } = record.insert_chunk(chunk) {
                warn!(
                    batch_id = %batch_id,
                    chunk_index = submission.chunk_index,
                    previous_rows,
                    rows = chunk_rows,
                    "Duplicate chunk index; replaced earlier chunk"
                );
            }

            debug!(
                batch_id = %batch_id,
                chunk_index = submission.chunk_index,
                rows = chunk_rows,
                received = record.received_chunk_count(),
                total = record.total_chunks_expected(),
                is_final = submission.is_final,
                "Stored chunk"
            );

            let ready = submission.is_final
                || record.received_chunk_count() >= record.total_chunks_expected();
            if !ready {
                return Ok(Accepted::Pending(record.progress()));
            }

            self.ledger.begin(&batch_id);
            let ready = record.take_ready();
            self.store.remove(&batch_id);
            drop(record);

            if !ready.missing.is_empty() {
                warn!(
                    batch_id = %batch_id,
                    missing = ready.missing.count,
                    first_missing = ?ready.missing.first,
                    received = ready.received_chunk_count,
                    expected = ready.total_chunks_expected,
                    "Processing batch with missing chunks"
                );
            }
            info!(
                batch_id = %batch_id,
                chunks = ready.received_chunk_count,
                rows = ready.row_count,
                is_final = submission.is_final,
                "Batch ready for processing"
            );
            return Ok(Accepted::Ready(ready));
        }
    }

    /// Assemble a ready batch and run the pipeline over it.
    pub async fn process(&self, ready: ReadyBatch) -> Result<CompletedBatch, BatchError> {
        let mut guard = DispatchGuard {
            ledger: &self.ledger,
            batch_id: ready.batch_id.clone(),
            completed: false,
        };
        let batch_id = ready.batch_id.clone();

        match self.run_ready(ready).await {
            Ok(completed) => {
                guard.completed = true;
                info!(
                    batch_id = %batch_id,
                    artifact = %completed.artifact.artifact_name,
                    rows = completed.total_rows,
                    "Batch completed"
                );
                Ok(completed)
            }
            Err(e) => {
                warn!(batch_id = %batch_id, code = e.code(), error = %e, "Batch failed");
                Err(e)
            }
        }
    }

    async fn run_ready(&self, ready: ReadyBatch) -> Result<CompletedBatch, BatchError> {
        let ReadyBatch {
            batch_id,
            chunks,
            row_count,
            sources,
            dataset_label,
            start_time,
            missing,
            ..
        } = ready;

        if row_count > self.ingest.max_total_rows {
            return Err(BatchError::TooManyRows {
                rows: row_count,
                limit: self.ingest.max_total_rows,
            });
        }

        let dataset = self.assembler.assemble(&chunks)?;
        drop(chunks);
        let request = PipelineRequest {
            batch_id: batch_id.clone(),
            dataset_label,
            sources,
            serialized: dataset.to_csv(),
            row_count: dataset.row_count(),
        };
        drop(dataset);

        let total_rows = request.row_count;
        let artifact = self.pipeline.run(request, &self.cancel).await?;

        Ok(CompletedBatch {
            batch_id,
            artifact,
            total_rows,
            started_at: start_time,
            missing,
        })
    }

    fn defaults_for(&self, submission: &ChunkSubmission) -> BatchDefaults {
        let sources = submission
            .sources
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| self.ingest.default_sources.clone());
        let dataset_label = submission
            .dataset_label
            .as_deref()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .unwrap_or(&self.ingest.default_dataset_label)
            .to_string();
        BatchDefaults {
            total_chunks_expected: submission.total_chunks.unwrap_or(1).max(1),
            sources,
            dataset_label,
        }
    }
}
