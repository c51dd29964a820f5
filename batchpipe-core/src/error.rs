//! Error types for the batchpipe core.
//!
//! Uses `thiserror` for public API error types with structured variants
//! covering request validation, dataset assembly, and pipeline execution.
//! Every error raised after a batch became ready is terminal: the batch has
//! already been purged and the caller must resubmit every chunk.

use std::path::PathBuf;

/// Top-level error type for batch submission.
#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error("Invalid submission: {0}")]
    Validation(#[from] ValidationError),

    #[error("Batch '{batch_id}' has already been dispatched for processing")]
    AlreadyDispatched { batch_id: String },

    #[error(
        "Batch has too many rows ({rows}). At most {limit} rows are supported; split the dataset and submit it as separate batches"
    )]
    TooManyRows { rows: usize, limit: usize },

    #[error("Assembly error: {0}")]
    Assembly(#[from] AssemblyError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

impl BatchError {
    /// Stable machine-readable code for the caller-facing response.
    pub fn code(&self) -> &'static str {
        match self {
            BatchError::Validation(ValidationError::ChunkTooLarge { .. }) => "CHUNK_TOO_LARGE",
            BatchError::Validation(_) => "INVALID_REQUEST",
            BatchError::AlreadyDispatched { .. } => "BATCH_ALREADY_DISPATCHED",
            BatchError::TooManyRows { .. } => "TOO_MANY_ROWS",
            BatchError::Assembly(AssemblyError::EmptyDataset) => "EMPTY_DATASET",
            BatchError::Assembly(AssemblyError::NoColumns) => "NO_COLUMNS",
            BatchError::Pipeline(e) => e.code(),
        }
    }

    /// HTTP status a transport layer should use for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            BatchError::Validation(ValidationError::ChunkTooLarge { .. }) => 413,
            BatchError::Validation(_) => 400,
            BatchError::AlreadyDispatched { .. } => 409,
            BatchError::TooManyRows { .. } => 413,
            BatchError::Assembly(_) => 422,
            BatchError::Pipeline(PipelineError::Timeout { .. }) => 504,
            BatchError::Pipeline(_) => 500,
        }
    }

    /// Whether the error was raised before any batch state was touched.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            BatchError::Validation(_) | BatchError::AlreadyDispatched { .. }
        )
    }
}

/// Malformed submissions, rejected before the chunk store is touched.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("batchId is required")]
    MissingBatchId,

    #[error("batchId is invalid: {reason}")]
    InvalidBatchId { reason: String },

    #[error("rows array is required")]
    MissingRows,

    #[error("chunk index must be a positive integer, got {index:?}")]
    InvalidChunkIndex { index: Option<i64> },

    #[error(
        "chunk has too many rows ({rows}). Maximum {limit} rows per chunk; use a smaller chunk size"
    )]
    ChunkTooLarge { rows: usize, limit: usize },
}

/// Failures while merging chunks into one dataset.
#[derive(Debug, thiserror::Error)]
pub enum AssemblyError {
    #[error("dataset contains no rows")]
    EmptyDataset,

    #[error("no valid column headers found in data rows")]
    NoColumns,
}

/// Failures of the external transformation.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("failed to launch pipeline '{program}': {message}")]
    Spawn { program: String, message: String },

    #[error("pipeline exited with code {exit_code}: {summary}")]
    Execution {
        exit_code: i32,
        summary: String,
        excerpt: String,
    },

    #[error(
        "pipeline process was killed (it likely ran out of memory); use a smaller dataset or split it into several batches"
    )]
    Killed { excerpt: String },

    #[error("pipeline finished but no artifact was written to {}", path.display())]
    ArtifactMissing { path: PathBuf, excerpt: String },

    #[error("pipeline timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("pipeline output exceeded {limit_bytes} bytes")]
    OutputLimitExceeded { limit_bytes: usize },

    #[error("pipeline was cancelled")]
    Cancelled,

    #[error("pipeline I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::Spawn { .. } => "PIPELINE_UNAVAILABLE",
            PipelineError::Execution { .. } => "PIPELINE_FAILED",
            PipelineError::Killed { .. } => "PIPELINE_KILLED",
            PipelineError::ArtifactMissing { .. } => "ARTIFACT_MISSING",
            PipelineError::Timeout { .. } => "PIPELINE_TIMEOUT",
            PipelineError::OutputLimitExceeded { .. } => "PIPELINE_OUTPUT_LIMIT",
            PipelineError::Cancelled => "PIPELINE_CANCELLED",
            PipelineError::Io(_) => "PIPELINE_IO",
        }
    }

    /// Operator guidance when the output points at a known environment problem.
    pub fn hint(&self) -> Option<&'static str> {
        let output = match self {
            PipelineError::Execution { excerpt, .. } | PipelineError::Killed { excerpt } => excerpt,
            PipelineError::Spawn { .. } => return Some(MISSING_INTERPRETER_HINT),
            _ => return None,
        };
        if output.contains("ModuleNotFoundError") || output.contains("No module named") {
            Some(MISSING_MODULE_HINT)
        } else {
            None
        }
    }

    /// Bounded excerpt of the process's own output, when one was captured.
    pub fn excerpt(&self) -> Option<&str> {
        match self {
            PipelineError::Execution { excerpt, .. }
            | PipelineError::Killed { excerpt }
            | PipelineError::ArtifactMissing { excerpt, .. } => {
                if excerpt.is_empty() {
                    None
                } else {
                    Some(excerpt)
                }
            }
            _ => None,
        }
    }
}

const MISSING_MODULE_HINT: &str = "Pipeline environment setup required: install the pipeline's dependencies into the interpreter set by pipeline.program or pipeline.venv_path";

const MISSING_INTERPRETER_HINT: &str =
    "Check that pipeline.program (or pipeline.venv_path) points at an installed interpreter";

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Configuration parse error: {0}")]
    Parse(#[from] Box<figment::Error>),
}

/// A type alias for results using the top-level `BatchError`.
pub type Result<T> = std::result::Result<T, BatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_validation() {
        let err = BatchError::Validation(ValidationError::MissingBatchId);
        assert_eq!(err.to_string(), "Invalid submission: batchId is required");
        assert_eq!(err.code(), "INVALID_REQUEST");
        assert_eq!(err.status_code(), 400);
        assert!(err.is_rejection());
    }

    #[test]
    fn test_missing_module_hint() {
        let err = PipelineError::Execution {
            exit_code: 1,
            summary: "No module named 'pandas'".into(),
            excerpt: "ModuleNotFoundError: No module named 'pandas'".into(),
        };
        assert_eq!(err.hint(), Some(MISSING_MODULE_HINT));

        let err = PipelineError::Execution {
            exit_code: 1,
            summary: "bad input".into(),
            excerpt: "Error: bad input".into(),
        };
        assert_eq!(err.hint(), None);
        assert_eq!(PipelineError::Cancelled.hint(), None);
    }

    #[test]
    fn test_chunk_too_large_maps_to_413() {
        let err = BatchError::Validation(ValidationError::ChunkTooLarge {
            rows: 30_000,
            limit: 25_000,
        });
        assert_eq!(err.code(), "CHUNK_TOO_LARGE");
        assert_eq!(err.status_code(), 413);
    }

    #[test]
    fn test_error_display_assembly() {
        let err: BatchError = AssemblyError::EmptyDataset.into();
        assert_eq!(err.to_string(), "Assembly error: dataset contains no rows");
        assert_eq!(err.code(), "EMPTY_DATASET");
        assert!(!err.is_rejection());
    }

    #[test]
    fn test_error_display_pipeline() {
        let err: BatchError = PipelineError::Timeout { timeout_secs: 300 }.into();
        assert_eq!(err.to_string(), "Pipeline error: pipeline timed out after 300s");
        assert_eq!(err.code(), "PIPELINE_TIMEOUT");
        assert_eq!(err.status_code(), 504);
    }

    #[test]
    fn test_pipeline_excerpt() {
        let err = PipelineError::Execution {
            exit_code: 1,
            summary: "boom".into(),
            excerpt: "Traceback...\nError: boom".into(),
        };
        assert_eq!(err.to_string(), "pipeline exited with code 1: boom");
        assert_eq!(err.excerpt(), Some("Traceback...\nError: boom"));

        let err = PipelineError::ArtifactMissing {
            path: PathBuf::from("/tmp/out.xlsx"),
            excerpt: String::new(),
        };
        assert_eq!(err.excerpt(), None);
        assert_eq!(
            err.to_string(),
            "pipeline finished but no artifact was written to /tmp/out.xlsx"
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: PipelineError = io_err.into();
        assert!(matches!(err, PipelineError::Io(_)));
        assert_eq!(err.code(), "PIPELINE_IO");
    }
}
