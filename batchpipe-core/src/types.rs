//! Core data types: rows, chunks, batch records, and progress.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How many missing chunk indices a [`MissingChunks`] report lists.
pub const MISSING_SAMPLE: usize = 10;

/// One loosely shaped record. Keys keep their insertion order.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// One numbered slice of a batch's rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// 1-based position among the expected chunks.
    pub index: u32,
    pub rows: Vec<Row>,
}

impl Chunk {
    pub fn new(index: u32, rows: Vec<Row>) -> Self {
        Self { index, rows }
    }
}

/// Values captured from the first submission of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchDefaults {
    pub total_chunks_expected: u32,
    pub sources: Vec<String>,
    pub dataset_label: String,
}

/// Accumulated state for one batch while its chunks arrive.
///
/// Owned by a [`ChunkStore`](crate::store::ChunkStore) and only mutated while
/// the record's lock is held.
#[derive(Debug)]
pub struct BatchRecord {
    batch_id: String,
    chunks: BTreeMap<u32, Chunk>,
    total_chunks_expected: u32,
    row_count: usize,
    sources: Vec<String>,
    dataset_label: String,
    start_time: DateTime<Utc>,
    sealed: bool,
}

/// What happened to a chunk handed to [`BatchRecord::insert_chunk`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkInsert {
    New,
    /// An earlier chunk with the same index was replaced.
    Replaced { previous_rows: usize },
}

impl BatchRecord {
    pub fn new(batch_id: impl Into<String>, defaults: BatchDefaults) -> Self {
        Self::started_at(batch_id, defaults, Utc::now())
    }

    pub fn started_at(
        batch_id: impl Into<String>,
        defaults: BatchDefaults,
        start_time: DateTime<Utc>,
    ) -> Self {
        Self {
            batch_id: batch_id.into(),
            chunks: BTreeMap::new(),
            total_chunks_expected: defaults.total_chunks_expected.max(1),
            row_count: 0,
            sources: defaults.sources,
            dataset_label: defaults.dataset_label,
            start_time,
            sealed: false,
        }
    }

    pub fn batch_id(&self) -> &str {
        &self.batch_id
    }

    pub fn total_chunks_expected(&self) -> u32 {
        self.total_chunks_expected
    }

    /// Number of distinct chunk indices stored.
    pub fn received_chunk_count(&self) -> u32 {
        self.chunks.len() as u32
    }

    pub fn row_count(&self) -> usize {
        self.row_count
    }

    pub fn sources(&self) -> &[String] {
        &self.sources
    }

    pub fn dataset_label(&self) -> &str {
        &self.dataset_label
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// True once the record has left the store. A sealed record never changes again.
    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Store a chunk, replacing any earlier chunk with the same index.
    pub fn insert_chunk(&mut self, chunk: Chunk) -> ChunkInsert {
        debug_assert!(!self.sealed, "chunk inserted into sealed batch");
        self.row_count += chunk.rows.len();
        match self.chunks.insert(chunk.index, chunk) {
            Some(previous) => {
                self.row_count -= previous.rows.len();
                ChunkInsert::Replaced {
                    previous_rows: previous.rows.len(),
                }
            }
            None => ChunkInsert::New,
        }
    }

    /// Indices in `1..=total_chunks_expected` that have not arrived.
    ///
    /// Work is bounded by the stored chunks, not by the announced total.
    pub fn missing(&self) -> MissingChunks {
        let total = self.total_chunks_expected;
        let present = self.chunks.range(1..=total).count() as u32;
        let count = total - present;

        let wanted = (count as usize).min(MISSING_SAMPLE);
        let mut first = Vec::with_capacity(wanted);
        let mut candidate = 1u32;
        while first.len() < wanted {
            if !self.chunks.contains_key(&candidate) {
                first.push(candidate);
            }
            candidate += 1;
        }
        MissingChunks { count, first }
    }

    pub fn progress(&self) -> Progress {
        Progress::new(self.received_chunk_count(), self.total_chunks_expected)
    }

    /// Mark the record as gone without handing out its chunks.
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    /// Seal the record and move its chunks out for processing.
    pub fn take_ready(&mut self) -> ReadyBatch {
        let missing = self.missing();
        let received = self.received_chunk_count();
        self.sealed = true;
        let chunks = std::mem::take(&mut self.chunks).into_values().collect();
        ReadyBatch {
            batch_id: self.batch_id.clone(),
            chunks,
            total_chunks_expected: self.total_chunks_expected,
            received_chunk_count: received,
            row_count: std::mem::take(&mut self.row_count),
            sources: self.sources.clone(),
            dataset_label: self.dataset_label.clone(),
            start_time: self.start_time,
            missing,
        }
    }
}

/// A batch detached from the store, ready for assembly.
#[derive(Debug, Clone)]
pub struct ReadyBatch {
    pub batch_id: String,
    /// Chunks in ascending index order.
    pub chunks: Vec<Chunk>,
    pub total_chunks_expected: u32,
    pub received_chunk_count: u32,
    pub row_count: usize,
    pub sources: Vec<String>,
    pub dataset_label: String,
    pub start_time: DateTime<Utc>,
    pub missing: MissingChunks,
}

/// Expected chunks that never arrived.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MissingChunks {
    pub count: u32,
    /// The lowest missing indices, at most [`MISSING_SAMPLE`] of them.
    pub first: Vec<u32>,
}

impl MissingChunks {
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// Upload progress of a batch that is not ready yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub received: u32,
    pub total: u32,
    pub percent: u8,
}

impl Progress {
    pub fn new(received: u32, total: u32) -> Self {
        let percent = if total == 0 {
            100
        } else {
            ((received as f64 / total as f64) * 100.0).round().min(100.0) as u8
        };
        Self {
            received,
            total,
            percent,
        }
    }
}
