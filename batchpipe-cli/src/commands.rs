//! CLI subcommand handlers.

use crate::Commands;
use crate::ConfigAction;
use anyhow::Context;
use batchpipe_core::config::{load_config, workspace_config_path};
use batchpipe_core::{
    BatchController, BatchpipeConfig, ConfigError, SubmitChunkRequest, SubmitResponse,
};
use serde::Serialize;
use std::io::BufRead;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Handle a CLI subcommand.
pub async fn handle_command(
    command: Commands,
    workspace: &Path,
    config_file: Option<&Path>,
) -> anyhow::Result<()> {
    match command {
        Commands::Replay { file } => {
            let config = load_checked(workspace, config_file)?;
            let mut stdout = tokio::io::stdout();
            let failures = replay(&config, &file, &mut stdout).await?;
            if failures > 0 {
                info!(failures, "Replay finished with failed submissions");
            }
            Ok(())
        }
        Commands::Serve => serve(load_checked(workspace, config_file)?).await,
        Commands::Config { action } => handle_config(action, workspace, config_file),
    }
}

fn handle_config(
    action: ConfigAction,
    workspace: &Path,
    config_file: Option<&Path>,
) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_path = workspace_config_path(workspace);
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }
            if let Some(parent) = config_path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let toml_str = toml::to_string_pretty(&BatchpipeConfig::default())?;
            std::fs::write(&config_path, &toml_str)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            let config = load_config(Some(workspace), config_file)
                .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
            let toml_str = toml::to_string_pretty(&config)?;
            println!("{}", toml_str);
            Ok(())
        }
        ConfigAction::Validate => {
            let config = load_config(Some(workspace), config_file)
                .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
            let problems = config.validate();
            if problems.is_empty() {
                println!("Configuration is valid.");
                return Ok(());
            }
            for problem in &problems {
                println!("  - {}", problem);
            }
            anyhow::bail!("{} configuration problem(s) found", problems.len())
        }
    }
}

/// Load the configuration and refuse to run with known problems.
fn load_checked(workspace: &Path, config_file: Option<&Path>) -> anyhow::Result<BatchpipeConfig> {
    let config = load_config(Some(workspace), config_file)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    let problems = config.validate();
    if !problems.is_empty() {
        return Err(ConfigError::Invalid {
            message: problems.join("; "),
        }
        .into());
    }
    Ok(config)
}

/// Parse a JSON array of submissions, or one submission per line.
fn parse_submissions(text: &str) -> anyhow::Result<Vec<SubmitChunkRequest>> {
    if text.trim_start().starts_with('[') {
        return serde_json::from_str(text).context("Failed to parse submission array");
    }
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            serde_json::from_str(line).with_context(|| format!("Invalid submission on line {}", n + 1))
        })
        .collect()
}

/// Submit every chunk in `path` in file order. Returns the number of failed responses.
async fn replay<W>(config: &BatchpipeConfig, path: &Path, output: &mut W) -> anyhow::Result<usize>
where
    W: AsyncWrite + Unpin,
{
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let submissions = parse_submissions(&text)?;
    info!(count = submissions.len(), file = %path.display(), "Replaying submissions");

    let controller = BatchController::from_config(config, CancellationToken::new());
    let mut failures = 0;
    for request in submissions {
        let response = controller.submit_chunk(request).await;
        if response.is_failure() {
            failures += 1;
        }
        let mut line = serde_json::to_string(&response)?;
        line.push('\n');
        output.write_all(line.as_bytes()).await?;
    }
    output.flush().await?;
    Ok(failures)
}

/// One line of `serve` output.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ServeReply {
    batch_id: Option<String>,
    response: SubmitResponse,
}

fn malformed(err: &serde_json::Error) -> SubmitResponse {
    SubmitResponse::Failed {
        code: "INVALID_REQUEST".into(),
        error_message: format!("Malformed submission: {}", err),
        details: None,
        status_code: 400,
    }
}

async fn serve(config: BatchpipeConfig) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let controller = Arc::new(BatchController::from_config(&config, cancel.clone()));
    let janitor_cancel = cancel.child_token();
    let janitor = controller.spawn_janitor(&config, janitor_cancel.clone());

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, cancelling in-flight batches");
            shutdown.cancel();
        }
    });

    info!("Reading submissions from stdin");
    serve_lines(controller, stdin_lines(), tokio::io::stdout(), cancel).await?;

    janitor_cancel.cancel();
    if let Some(handle) = janitor {
        let _ = handle.await;
    }
    Ok(())
}

/// Forward stdin lines from a plain thread, so a pending read never holds up shutdown.
fn stdin_lines() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Failed to read stdin");
                    break;
                }
            }
        }
    });
    rx
}

/// Handle each input line concurrently and write one reply line per submission.
async fn serve_lines<W>(
    controller: Arc<BatchController>,
    mut input: mpsc::UnboundedReceiver<String>,
    output: W,
    cancel: CancellationToken,
) -> anyhow::Result<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<ServeReply>();
    let writer = tokio::spawn(async move {
        let mut output = output;
        while let Some(reply) = rx.recv().await {
            let mut line = serde_json::to_string(&reply)?;
            line.push('\n');
            output.write_all(line.as_bytes()).await?;
            output.flush().await?;
        }
        Ok::<_, std::io::Error>(output)
    });

    let mut in_flight = JoinSet::new();
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => {
                info!("Shutdown requested, no longer reading submissions");
                break;
            }
            line = input.recv() => line,
        };
        let Some(line) = line else {
            debug!("Input closed");
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        let tx = tx.clone();
        match serde_json::from_str::<SubmitChunkRequest>(&line) {
            Ok(request) => {
                let controller = Arc::clone(&controller);
                in_flight.spawn(async move {
                    let batch_id = request.batch_id.clone();
                    let response = controller.submit_chunk(request).await;
                    let _ = tx.send(ServeReply { batch_id, response });
                });
            }
            Err(e) => {
                warn!(error = %e, "Malformed submission line");
                let _ = tx.send(ServeReply {
                    batch_id: None,
                    response: malformed(&e),
                });
            }
        }
    }

    while let Some(joined) = in_flight.join_next().await {
        if let Err(e) = joined {
            warn!(error = %e, "Submission task failed");
        }
    }
    drop(tx);

    let output = writer.await.context("Output writer panicked")??;
    Ok(output)
}
