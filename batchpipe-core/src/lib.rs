//! # Batchpipe Core
//!
//! Core library for chunked batch aggregation.
//! Receives a large tabular dataset as numbered chunks, reassembles it once
//! the batch is ready, runs an external transformation over it exactly once,
//! and returns a reference to the produced artifact.

pub mod aggregator;
pub mod assembler;
pub mod config;
pub mod controller;
pub mod error;
pub mod janitor;
pub mod pipeline;
pub mod store;
pub mod types;

// Re-export commonly used types at the crate root.
pub use aggregator::{
    Accepted, BatchAggregator, ChunkSubmission, CompletedBatch, DispatchLedger, DispatchPhase,
    SubmitOutcome,
};
pub use assembler::{AssembledDataset, DatasetAssembler};
pub use config::{BatchpipeConfig, IngestConfig, JanitorConfig, PipelineConfig, load_config};
pub use controller::{BatchController, SubmitChunkRequest, SubmitResponse};
pub use error::{
    AssemblyError, BatchError, ConfigError, PipelineError, Result, ValidationError,
};
pub use janitor::{JanitorSweep, SweepReport};
pub use pipeline::{Pipeline, PipelineRequest, PipelineResult, PipelineSuccess, ProcessPipeline};
pub use store::{BatchHandle, ChunkStore, InMemoryChunkStore};
pub use types::{BatchDefaults, BatchRecord, Chunk, MissingChunks, Progress, ReadyBatch, Row};
