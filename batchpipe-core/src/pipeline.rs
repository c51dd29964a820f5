//! External pipeline invocation.
//!
//! The serialized dataset is written to a scratch file and handed to a
//! separate process together with the desired artifact path and the batch's
//! sources. Process isolation keeps a crashing transformation from touching
//! aggregator state. Runs are bounded by a wall-clock timeout and a per-stream
//! output limit, and can be cancelled through a [`CancellationToken`].

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::LazyLock;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Exit code reported by shells for a SIGKILLed child (128 + 9).
const KILLED_EXIT_CODE: i32 = 137;

/// Longest one-line failure summary, in characters.
pub const SUMMARY_MAX_CHARS: usize = 300;

static ERROR_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?im)error[:\s]+(.+?)\s*$").expect("valid error pattern"));

/// Everything the pipeline needs for one batch.
#[derive(Debug, Clone)]
pub struct PipelineRequest {
    pub batch_id: String,
    pub dataset_label: String,
    pub sources: Vec<String>,
    /// CSV produced by the assembler.
    pub serialized: String,
    pub row_count: usize,
}

/// A successful pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSuccess {
    pub artifact_path: PathBuf,
    pub artifact_name: String,
    pub rows_processed: usize,
    pub duration_seconds: f64,
}

/// Tagged outcome of a pipeline run.
pub type PipelineResult = Result<PipelineSuccess, PipelineError>;

/// Trait for the external transformation. Abstracted for testability.
#[async_trait]
pub trait Pipeline: Send + Sync {
    async fn run(&self, request: PipelineRequest, cancel: &CancellationToken) -> PipelineResult;
}

/// Runs the transformation as a child process.
#[derive(Debug, Clone)]
pub struct ProcessPipeline {
    config: PipelineConfig,
}

impl ProcessPipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    async fn launch(
        &self,
        request: &PipelineRequest,
        input: &Path,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutput, PipelineError> {
        let program = self.config.resolved_program();
        let sources = serde_json::to_string(&request.sources).map_err(|e| PipelineError::Spawn {
            program: program.display().to_string(),
            message: format!("failed to encode sources: {e}"),
        })?;

        let mut command = Command::new(&program);
        command
            .args(&self.config.args)
            .arg(input)
            .arg(output)
            .arg(sources)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_dir {
            command.current_dir(dir);
        }

        debug!(
            batch_id = %request.batch_id,
            program = %program.display(),
            input = %input.display(),
            output = %output.display(),
            "Launching pipeline process"
        );

        let mut child = command.spawn().map_err(|e| PipelineError::Spawn {
            program: program.display().to_string(),
            message: e.to_string(),
        })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let limit = self.config.max_output_bytes;
        let timeout = self.config.timeout();

        let run = async {
            let (stdout, stderr) =
                tokio::try_join!(read_bounded(stdout, limit), read_bounded(stderr, limit))?;
            let status = child.wait().await.map_err(CaptureError::Io)?;
            Ok::<_, CaptureError>(ProcessOutput {
                status,
                stdout,
                stderr,
            })
        };

        let state = tokio::select! {
            _ = cancel.cancelled() => RunState::Cancelled,
            result = tokio::time::timeout(timeout, run) => match result {
                Ok(Ok(output)) => RunState::Exited(output),
                Ok(Err(CaptureError::Overflow)) => RunState::OutputOverflow,
                Ok(Err(CaptureError::Io(e))) => RunState::Failed(e),
                Err(_) => RunState::TimedOut,
            },
        };

        let err = match state {
            RunState::Exited(output) => return Ok(output),
            RunState::OutputOverflow => PipelineError::OutputLimitExceeded { limit_bytes: limit },
            RunState::TimedOut => PipelineError::Timeout {
                timeout_secs: timeout.as_secs(),
            },
            RunState::Cancelled => PipelineError::Cancelled,
            RunState::Failed(e) => PipelineError::Io(e),
        };
        if let Err(e) = child.kill().await {
            debug!(error = %e, "Pipeline process already gone");
        }
        Err(err)
    }
}

#[async_trait]
impl Pipeline for ProcessPipeline {
    async fn run(&self, request: PipelineRequest, cancel: &CancellationToken) -> PipelineResult {
        let started = Instant::now();
        tokio::fs::create_dir_all(&self.config.scratch_dir).await?;
        tokio::fs::create_dir_all(&self.config.output_dir).await?;

        let stamp = Utc::now().timestamp_millis();
        let scratch = ScratchFile::new(self.config.scratch_dir.join(format!(
            "{}_{stamp}_data.csv",
            sanitize_file_component(&request.batch_id)
        )));
        tokio::fs::write(scratch.path(), request.serialized.as_bytes()).await?;

        let artifact_name = artifact_name(
            &request.dataset_label,
            stamp,
            &self.config.artifact_extension,
        );
        let artifact_path = self.config.output_dir.join(&artifact_name);

        let output = self
            .launch(&request, scratch.path(), &artifact_path, cancel)
            .await;
        drop(scratch);
        let output = output?;

        let combined = output.combined();
        let excerpt = excerpt(&combined, self.config.error_excerpt_chars);

        if !output.status.success() {
            if was_killed(&output.status) {
                warn!(batch_id = %request.batch_id, "Pipeline process was killed");
                return Err(PipelineError::Killed { excerpt });
            }
            let exit_code = output.status.code().unwrap_or(-1);
            warn!(
                batch_id = %request.batch_id,
                exit_code,
                "Pipeline exited with non-zero status"
            );
            return Err(PipelineError::Execution {
                exit_code,
                summary: failure_summary(&combined),
                excerpt,
            });
        }

        if !tokio::fs::try_exists(&artifact_path).await.unwrap_or(false) {
            warn!(
                batch_id = %request.batch_id,
                path = %artifact_path.display(),
                "Pipeline exited cleanly without writing an artifact"
            );
            return Err(PipelineError::ArtifactMissing {
                path: artifact_path,
                excerpt,
            });
        }

        let duration_seconds = started.elapsed().as_secs_f64();
        info!(
            batch_id = %request.batch_id,
            artifact = %artifact_name,
            rows = request.row_count,
            duration_secs = duration_seconds,
            "Pipeline produced artifact"
        );

        Ok(PipelineSuccess {
            artifact_path,
            artifact_name,
            rows_processed: request.row_count,
            duration_seconds,
        })
    }
}

enum RunState {
    Exited(ProcessOutput),
    OutputOverflow,
    TimedOut,
    Cancelled,
    Failed(std::io::Error),
}

struct ProcessOutput {
    status: ExitStatus,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl ProcessOutput {
    /// Stdout followed by stderr, lossily decoded.
    fn combined(&self) -> String {
        let stdout = String::from_utf8_lossy(&self.stdout);
        let stderr = String::from_utf8_lossy(&self.stderr);
        match (stdout.trim().is_empty(), stderr.trim().is_empty()) {
            (false, false) => format!("{}\n{}", stdout.trim_end(), stderr.trim_end()),
            (false, true) => stdout.trim_end().to_string(),
            (true, false) => stderr.trim_end().to_string(),
            (true, true) => String::new(),
        }
    }
}

enum CaptureError {
    Io(std::io::Error),
    Overflow,
}

/// Read a pipe to its end. Fails fast once more than `limit` bytes arrive.
async fn read_bounded<R>(pipe: Option<R>, limit: usize) -> Result<Vec<u8>, CaptureError>
where
    R: AsyncRead + Unpin,
{
    let mut bytes = Vec::new();
    let Some(mut pipe) = pipe else {
        return Ok(bytes);
    };

    let mut buf = [0u8; 8192];
    loop {
        let n = pipe.read(&mut buf).await.map_err(CaptureError::Io)?;
        if n == 0 {
            return Ok(bytes);
        }
        if bytes.len() + n > limit {
            return Err(CaptureError::Overflow);
        }
        bytes.extend_from_slice(&buf[..n]);
    }
}

#[cfg(unix)]
fn was_killed(status: &ExitStatus) -> bool {
    use std::os::unix::process::ExitStatusExt;
    status.signal() == Some(9) || status.code() == Some(KILLED_EXIT_CODE)
}

#[cfg(not(unix))]
fn was_killed(status: &ExitStatus) -> bool {
    status.code() == Some(KILLED_EXIT_CODE)
}

/// Removes the scratch input when dropped, whatever the outcome.
struct ScratchFile {
    path: PathBuf,
}

impl ScratchFile {
    fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Failed to remove scratch file");
            }
        }
    }
}

/// Deterministic artifact name: label stem, timestamp, extension.
pub fn artifact_name(dataset_label: &str, stamp: i64, extension: &str) -> String {
    let stem = Path::new(dataset_label.trim())
        .file_stem()
        .and_then(|s| s.to_str())
        .map(sanitize_file_component)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "dataset".to_string());
    format!("{stem}_{stamp}.{}", extension.trim_start_matches('.'))
}

/// Replace characters that are unsafe in file names.
pub fn sanitize_file_component(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect::<String>()
        .trim_matches('.')
        .to_string()
}

/// First `Error: ...` line in the process output.
pub fn error_summary(output: &str) -> Option<String> {
    ERROR_LINE
        .captures_iter(output)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .find(|s| !s.is_empty())
}

/// The line right after a `Traceback` header.
pub fn traceback_summary(output: &str) -> Option<String> {
    let mut lines = output.lines().skip_while(|l| !l.contains("Traceback"));
    lines.next()?;
    lines
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string)
}

/// Bounded one-line description of a failed run.
fn failure_summary(output: &str) -> String {
    let summary = error_summary(output)
        .or_else(|| traceback_summary(output))
        .unwrap_or_else(|| first_line(output));
    excerpt(&summary, SUMMARY_MAX_CHARS)
}

/// Bound process output for callers, marking truncation.
pub fn excerpt(output: &str, max_chars: usize) -> String {
    let trimmed = output.trim();
    if trimmed.chars().count() <= max_chars {
        return trimmed.to_string();
    }
    let head: String = trimmed.chars().take(max_chars).collect();
    format!("{head}... (truncated)")
}

fn first_line(text: &str) -> String {
    text.lines()
        .find(|l| !l.trim().is_empty())
        .map(|l| l.trim().to_string())
        .unwrap_or_else(|| "no output".to_string())
}
