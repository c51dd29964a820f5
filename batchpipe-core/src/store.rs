//! Chunk storage for in-flight batches.
//!
//! Provides a trait-based abstraction over batch record storage so the
//! aggregation algorithm does not depend on where records live:
//! - `InMemoryChunkStore`: sharded concurrent map, the default backend.
//!
//! Stores are passive. Each record sits behind its own lock, and callers take
//! that lock to serialize work on one batch without blocking other batches.

use crate::types::{BatchDefaults, BatchRecord};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;

/// Shared handle to one batch record. The mutex is the per-batch exclusion.
pub type BatchHandle = Arc<Mutex<BatchRecord>>;

/// Trait for batch record storage backends.
pub trait ChunkStore: Send + Sync {
    /// Look up the record for a batch.
    fn get(&self, batch_id: &str) -> Option<BatchHandle>;

    /// Return the record for a batch, creating it from `defaults` if absent.
    fn get_or_create(&self, batch_id: &str, defaults: BatchDefaults) -> BatchHandle;

    /// Drop the record for a batch, returning it if it was present.
    fn remove(&self, batch_id: &str) -> Option<BatchHandle>;

    /// Snapshot of every stored record.
    fn entries(&self) -> Vec<(String, BatchHandle)>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory store backed by a sharded concurrent map.
#[derive(Debug, Default)]
pub struct InMemoryChunkStore {
    batches: DashMap<String, BatchHandle>,
}

impl InMemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a prepared record, replacing any existing one.
    ///
    /// Used to seed records with a chosen start time.
    pub fn insert(&self, record: BatchRecord) -> BatchHandle {
        let handle = Arc::new(Mutex::new(record));
        let batch_id = handle.lock().batch_id().to_string();
        self.batches.insert(batch_id, Arc::clone(&handle));
        handle
    }
}

impl ChunkStore for InMemoryChunkStore {
    fn get(&self, batch_id: &str) -> Option<BatchHandle> {
        // Clone the handle out so no shard guard outlives this call.
        self.batches.get(batch_id).map(|entry| Arc::clone(entry.value()))
    }

    fn get_or_create(&self, batch_id: &str, defaults: BatchDefaults) -> BatchHandle {
        let entry = self
            .batches
            .entry(batch_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(BatchRecord::new(batch_id, defaults))));
        Arc::clone(entry.value())
    }

    fn remove(&self, batch_id: &str) -> Option<BatchHandle> {
        self.batches.remove(batch_id).map(|(_, handle)| handle)
    }

    fn entries(&self) -> Vec<(String, BatchHandle)> {
        self.batches
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect()
    }

    fn len(&self) -> usize {
        self.batches.len()
    }
}
