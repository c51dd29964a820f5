//! End-to-end tests: chunk uploads through the controller, a real child
//! process as the pipeline, and the artifact on disk.

#![cfg(unix)]

use batchpipe_core::{BatchController, BatchpipeConfig, SubmitChunkRequest, SubmitResponse};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::path::PathBuf;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Config whose pipeline runs `script` via `sh -c` with input, output and
/// sources as `$1`, `$2`, `$3`.
fn config(dir: &TempDir, script: &str) -> BatchpipeConfig {
    let mut config = BatchpipeConfig::default();
    config.pipeline.program = PathBuf::from("sh");
    config.pipeline.args = vec!["-c".into(), script.into(), "pipeline".into()];
    config.pipeline.scratch_dir = dir.path().join("scratch");
    config.pipeline.output_dir = dir.path().join("out");
    config.pipeline.artifact_extension = "csv".into();
    config.pipeline.timeout_secs = 10;
    config
}

fn request(value: serde_json::Value) -> SubmitChunkRequest {
    serde_json::from_value(value).unwrap()
}

fn scratch_is_empty(dir: &TempDir) -> bool {
    std::fs::read_dir(dir.path().join("scratch"))
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(true)
}

#[tokio::test]
async fn two_chunk_batch_produces_ordered_artifact() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, r#"cp "$1" "$2""#);
    let controller = BatchController::from_config(&config, CancellationToken::new());

    let first = controller
        .submit_chunk(request(json!({
            "batchId": "b1",
            "chunkIndex": 1,
            "totalChunks": 2,
            "datasetLabel": "names.xlsx",
            "rows": [{"name": "a"}]
        })))
        .await;
    assert_eq!(
        first,
        SubmitResponse::Progress {
            percent: 50,
            received: 1,
            total: 2
        }
    );

    let second = controller
        .submit_chunk(request(json!({
            "batchId": "b1",
            "chunkIndex": 2,
            "totalChunks": 2,
            "isFinal": true,
            "rows": [{"name": "b"}]
        })))
        .await;

    let SubmitResponse::Completed {
        artifact_url,
        artifact_name,
        total_rows,
        ..
    } = second
    else {
        panic!("expected completion, got {second:?}");
    };
    assert_eq!(total_rows, 2);
    assert!(artifact_name.starts_with("names_"));
    assert!(artifact_name.ends_with(".csv"));
    assert_eq!(artifact_url, format!("/uploads/batch-outputs/{artifact_name}"));

    let artifact = std::fs::read_to_string(dir.path().join("out").join(&artifact_name)).unwrap();
    assert_eq!(artifact, "name\na\nb\n");
    assert!(scratch_is_empty(&dir));
    assert!(controller.aggregator().store().is_empty());
}

#[tokio::test]
async fn resubmitted_final_chunk_runs_pipeline_once() {
    let dir = TempDir::new().unwrap();
    let counter = dir.path().join("runs");
    let script = format!(r#"echo run >> "{}"; cp "$1" "$2""#, counter.display());
    let config = config(&dir, &script);
    let controller = BatchController::from_config(&config, CancellationToken::new());

    let chunk = json!({
        "batchId": "b1",
        "chunkIndex": 1,
        "totalChunks": 1,
        "isFinal": true,
        "rows": [{"name": "a"}]
    });
    let first = controller.submit_chunk(request(chunk.clone())).await;
    assert!(matches!(first, SubmitResponse::Completed { .. }));

    let second = controller.submit_chunk(request(chunk)).await;
    match second {
        SubmitResponse::Failed {
            code, status_code, ..
        } => {
            assert_eq!(code, "BATCH_ALREADY_DISPATCHED");
            assert_eq!(status_code, 409);
        }
        other => panic!("expected rejection, got {other:?}"),
    }

    let runs = std::fs::read_to_string(&counter).unwrap();
    assert_eq!(runs.lines().count(), 1);
}

#[tokio::test]
async fn failing_pipeline_surfaces_excerpt_and_purges_batch() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, "echo 'Error: column Asset not found' >&2; exit 3");
    let controller = BatchController::from_config(&config, CancellationToken::new());

    let response = controller
        .submit_chunk(request(json!({
            "batchId": "b1",
            "batchNumber": 1,
            "totalBatches": 1,
            "rows": [{"name": "a"}]
        })))
        .await;

    match response {
        SubmitResponse::Failed {
            code,
            error_message,
            details,
            status_code,
        } => {
            assert_eq!(code, "PIPELINE_FAILED");
            assert_eq!(status_code, 500);
            assert!(error_message.contains("column Asset not found"));
            assert_eq!(details.as_deref(), Some("Error: column Asset not found"));
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert!(controller.aggregator().store().is_empty());
    assert!(controller.aggregator().ledger().is_empty());
    assert!(scratch_is_empty(&dir));
}

#[tokio::test]
async fn interleaved_batches_complete_independently() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, r#"cp "$1" "$2""#);
    let controller = BatchController::from_config(&config, CancellationToken::new());

    for (batch, index, value) in [("x", 1, "x1"), ("y", 1, "y1"), ("y", 2, "y2"), ("x", 2, "x2")] {
        let response = controller
            .submit_chunk(request(json!({
                "batchId": batch,
                "chunkIndex": index,
                "totalChunks": 2,
                "datasetLabel": batch,
                "rows": [{"v": value}]
            })))
            .await;
        assert!(!response.is_failure(), "{response:?}");
    }

    let mut artifacts: Vec<String> = std::fs::read_dir(dir.path().join("out"))
        .unwrap()
        .map(|entry| std::fs::read_to_string(entry.unwrap().path()).unwrap())
        .collect();
    artifacts.sort();
    assert_eq!(artifacts, vec!["v\nx1\nx2\n", "v\ny1\ny2\n"]);
}

#[tokio::test]
async fn shutdown_cancels_running_pipeline() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, "sleep 30");
    let cancel = CancellationToken::new();
    let controller = BatchController::from_config(&config, cancel.clone());

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let response = controller
        .submit_chunk(request(json!({
            "batchId": "b1",
            "chunkIndex": 1,
            "isFinal": true,
            "rows": [{"name": "a"}]
        })))
        .await;

    match response {
        SubmitResponse::Failed { code, .. } => assert_eq!(code, "PIPELINE_CANCELLED"),
        other => panic!("expected cancellation, got {other:?}"),
    }
    assert!(scratch_is_empty(&dir));
}
