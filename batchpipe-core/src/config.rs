//! Configuration system for batchpipe.
//!
//! Uses `figment` for layered configuration: defaults -> config file -> environment -> overrides.
//! Configuration is loaded from `~/.config/batchpipe/config.toml` and/or
//! `.batchpipe/config.toml` in the workspace directory.

use crate::error::ConfigError;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchpipeConfig {
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub janitor: JanitorConfig,
}

/// Limits and defaults applied to incoming chunks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Reject a single chunk carrying more rows than this.
    pub max_rows_per_chunk: usize,
    /// Fail a ready batch whose rows sum above this.
    pub max_total_rows: usize,
    /// Sources used when the first chunk of a batch names none.
    pub default_sources: Vec<String>,
    /// Label used when the first chunk of a batch names none.
    pub default_dataset_label: String,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_rows_per_chunk: 25_000,
            max_total_rows: 400_000,
            default_sources: Vec::new(),
            default_dataset_label: "dataset".to_string(),
        }
    }
}

/// How the external transformation is launched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Program to execute (e.g. `python3`).
    pub program: PathBuf,
    /// Arguments placed before the input path, output path and sources.
    pub args: Vec<String>,
    /// Virtual environment whose `bin/` directory is preferred for `program`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub venv_path: Option<PathBuf>,
    /// Working directory for the process. Defaults to the current directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    /// Directory for serialized datasets handed to the process.
    pub scratch_dir: PathBuf,
    /// Directory the process writes artifacts into.
    pub output_dir: PathBuf,
    pub artifact_extension: String,
    /// Prefix joined with the artifact name to form the caller-facing URL.
    pub artifact_url_prefix: String,
    /// Hard wall-clock limit per run.
    pub timeout_secs: u64,
    /// Captured output limit per stream.
    pub max_output_bytes: usize,
    /// Maximum characters of process output surfaced on failure.
    pub error_excerpt_chars: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("python3"),
            args: Vec::new(),
            venv_path: None,
            working_dir: None,
            scratch_dir: PathBuf::from("uploads/batch-scratch"),
            output_dir: PathBuf::from("uploads/batch-outputs"),
            artifact_extension: "xlsx".to_string(),
            artifact_url_prefix: "/uploads/batch-outputs".to_string(),
            timeout_secs: 300,
            max_output_bytes: 10 * 1024 * 1024,
            error_excerpt_chars: 2000,
        }
    }
}

impl PipelineConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Resolve the program, preferring the configured virtualenv's interpreter.
    pub fn resolved_program(&self) -> PathBuf {
        if let Some(venv) = &self.venv_path {
            let bin_dir = if cfg!(windows) { "Scripts" } else { "bin" };
            let candidate = venv.join(bin_dir).join(&self.program);
            if candidate.exists() {
                return candidate;
            }
        }
        self.program.clone()
    }

    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.program.as_os_str().is_empty() {
            problems.push("pipeline.program must not be empty".to_string());
        }
        if self.timeout_secs == 0 {
            problems.push("pipeline.timeout_secs must be greater than zero".to_string());
        }
        if self.max_output_bytes == 0 {
            problems.push("pipeline.max_output_bytes must be greater than zero".to_string());
        }
        if self.artifact_extension.trim().is_empty() {
            problems.push("pipeline.artifact_extension must not be empty".to_string());
        }
        if self.scratch_dir.as_os_str().is_empty() || self.output_dir.as_os_str().is_empty() {
            problems.push("pipeline.scratch_dir and pipeline.output_dir must be set".to_string());
        }
        problems
    }
}

/// Longest accepted janitor retention window: ten years.
pub const MAX_RETENTION_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// Stale batch eviction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JanitorConfig {
    pub enabled: bool,
    /// Seconds between sweeps.
    pub interval_secs: u64,
    /// Batches started longer ago than this are evicted.
    pub retention_secs: u64,
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 3600,
            retention_secs: 3600,
        }
    }
}

impl JanitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Retention window, clamped to [`MAX_RETENTION_SECS`].
    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.retention_secs.min(MAX_RETENTION_SECS) as i64)
    }
}

impl BatchpipeConfig {
    /// Collect human-readable configuration problems.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.ingest.max_rows_per_chunk == 0 {
            problems.push("ingest.max_rows_per_chunk must be greater than zero".to_string());
        }
        if self.ingest.max_total_rows < self.ingest.max_rows_per_chunk {
            problems.push(
                "ingest.max_total_rows must be at least ingest.max_rows_per_chunk".to_string(),
            );
        }
        problems.extend(self.pipeline.validate());
        if self.janitor.enabled && self.janitor.interval_secs == 0 {
            problems.push("janitor.interval_secs must be greater than zero".to_string());
        }
        if self.janitor.retention_secs > MAX_RETENTION_SECS {
            problems.push(format!(
                "janitor.retention_secs must be at most {MAX_RETENTION_SECS}"
            ));
        }
        problems
    }
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides file (passed as argument)
/// 2. Environment variables (prefixed with `BATCHPIPE_`)
/// 3. Workspace-local config (`.batchpipe/config.toml`)
/// 4. User config (`~/.config/batchpipe/config.toml`)
/// 5. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    override_file: Option<&Path>,
) -> Result<BatchpipeConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(BatchpipeConfig::default()));

    if let Some(user_config) = user_config_path() {
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = workspace_config_path(ws);
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // BATCHPIPE_PIPELINE__TIMEOUT_SECS, BATCHPIPE_JANITOR__ENABLED, etc.
    figment = figment.merge(Env::prefixed("BATCHPIPE_").split("__"));

    if let Some(path) = override_file {
        // Toml::file skips missing files, which would hide a typo here.
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        figment = figment.merge(Toml::file(path));
    }

    figment
        .extract()
        .map_err(|e| ConfigError::Parse(Box::new(e)))
}

/// Location of the user-level config file, when a home directory is known.
pub fn user_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "batchpipe", "batchpipe")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

pub fn workspace_config_path(workspace: &Path) -> PathBuf {
    workspace.join(".batchpipe").join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = BatchpipeConfig::default();
        assert_eq!(config.ingest.max_rows_per_chunk, 25_000);
        assert_eq!(config.ingest.max_total_rows, 400_000);
        assert_eq!(config.pipeline.timeout(), Duration::from_secs(300));
        assert_eq!(config.pipeline.max_output_bytes, 10 * 1024 * 1024);
        assert_eq!(config.janitor.interval(), Duration::from_secs(3600));
        assert_eq!(config.janitor.retention(), chrono::Duration::hours(1));
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_oversized_retention_is_reported_and_clamped() {
        let mut config = BatchpipeConfig::default();
        config.janitor.retention_secs = u64::MAX;
        let problems = config.validate();
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("janitor.retention_secs"));
        assert_eq!(
            config.janitor.retention(),
            chrono::Duration::seconds(MAX_RETENTION_SECS as i64)
        );
    }

    #[test]
    fn test_workspace_config_overrides_defaults() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(".batchpipe")).unwrap();
        std::fs::write(
            workspace_config_path(dir.path()),
            "[pipeline]\nprogram = \"sh\"\ntimeout_secs = 12\n\n[janitor]\nretention_secs = 60\n",
        )
        .unwrap();

        let config = load_config(Some(dir.path()), None).unwrap();
        assert_eq!(config.pipeline.program, PathBuf::from("sh"));
        assert_eq!(config.pipeline.timeout_secs, 12);
        assert_eq!(config.janitor.retention_secs, 60);
        // Untouched sections keep their defaults.
        assert_eq!(config.ingest.max_rows_per_chunk, 25_000);
        assert_eq!(config.pipeline.artifact_extension, "xlsx");
    }

    #[test]
    fn test_override_file_wins_over_workspace() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(".batchpipe")).unwrap();
        std::fs::write(
            workspace_config_path(dir.path()),
            "[ingest]\nmax_total_rows = 1000\n",
        )
        .unwrap();
        let override_path = dir.path().join("override.toml");
        std::fs::write(&override_path, "[ingest]\nmax_total_rows = 50\n").unwrap();

        let config = load_config(Some(dir.path()), Some(&override_path)).unwrap();
        assert_eq!(config.ingest.max_total_rows, 50);
    }

    #[test]
    fn test_missing_override_file_is_reported() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope.toml");
        let err = load_config(None, Some(&missing)).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn test_malformed_value_is_parse_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[pipeline]\ntimeout_secs = \"soon\"\n").unwrap();
        let err = load_config(None, Some(&path)).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_validate_reports_problems() {
        let mut config = BatchpipeConfig::default();
        config.pipeline.timeout_secs = 0;
        config.ingest.max_total_rows = 10;
        let problems = config.validate();
        assert_eq!(problems.len(), 2);
        assert!(problems.iter().any(|p| p.contains("timeout_secs")));
        assert!(problems.iter().any(|p| p.contains("max_total_rows")));
    }

    #[test]
    fn test_resolved_program_prefers_venv() {
        let dir = TempDir::new().unwrap();
        let bin = dir.path().join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        std::fs::write(bin.join("python3"), "").unwrap();

        let mut config = PipelineConfig {
            venv_path: Some(dir.path().to_path_buf()),
            ..PipelineConfig::default()
        };
        if cfg!(unix) {
            assert_eq!(config.resolved_program(), bin.join("python3"));
        }

        config.program = PathBuf::from("missing-interpreter");
        assert_eq!(
            config.resolved_program(),
            PathBuf::from("missing-interpreter")
        );
    }

    #[test]
    fn test_config_toml_roundtrip_keeps_sections() {
        let config = BatchpipeConfig::default();
        let text = toml::to_string_pretty(&config).unwrap();
        assert!(text.contains("[ingest]"));
        assert!(text.contains("[pipeline]"));
        assert!(text.contains("[janitor]"));
    }
}
