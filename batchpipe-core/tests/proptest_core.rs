//! Property-based tests for core components using proptest.

use proptest::prelude::*;

use batchpipe_core::aggregator::Accepted;
use batchpipe_core::assembler::DatasetAssembler;
use batchpipe_core::types::{BatchDefaults, BatchRecord, Chunk, Progress, Row};
use batchpipe_core::{
    BatchAggregator, ChunkSubmission, IngestConfig, InMemoryChunkStore, Pipeline,
    PipelineRequest, PipelineResult, PipelineSuccess,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

struct UnusedPipeline;

#[async_trait::async_trait]
impl Pipeline for UnusedPipeline {
    async fn run(&self, request: PipelineRequest, _cancel: &CancellationToken) -> PipelineResult {
        Ok(PipelineSuccess {
            artifact_path: "/dev/null".into(),
            artifact_name: request.dataset_label,
            rows_processed: request.row_count,
            duration_seconds: 0.0,
        })
    }
}

fn row(value: String) -> Row {
    let mut row = Row::new();
    row.insert("v".into(), serde_json::Value::String(value));
    row
}

fn chunk_rows(index: u32, len: usize) -> Vec<Row> {
    (0..len).map(|i| row(format!("{index}-{i}"))).collect()
}

// --- Ordering properties ---

proptest! {
    #[test]
    fn any_arrival_order_assembles_in_index_order(
        order in Just(vec![1u32, 2, 3, 4, 5]).prop_shuffle(),
        sizes in prop::collection::vec(1usize..4, 5),
    ) {
        let aggregator = BatchAggregator::new(
            Arc::new(InMemoryChunkStore::new()),
            Arc::new(UnusedPipeline),
            IngestConfig::default(),
        );

        let mut ready = None;
        for index in &order {
            let accepted = aggregator
                .accept(ChunkSubmission {
                    batch_id: "b1".into(),
                    chunk_index: *index,
                    rows: chunk_rows(*index, sizes[(*index - 1) as usize]),
                    total_chunks: Some(5),
                    sources: None,
                    dataset_label: None,
                    is_final: false,
                })
                .unwrap();
            if let Accepted::Ready(batch) = accepted {
                prop_assert!(ready.is_none(), "batch became ready twice");
                ready = Some(batch);
            }
        }

        let ready = ready.expect("batch should be ready after all chunks");
        let dataset = DatasetAssembler::new().assemble(&ready.chunks).unwrap();
        let values: Vec<String> = dataset
            .rows()
            .iter()
            .map(|r| r["v"].as_str().unwrap().to_string())
            .collect();
        let expected: Vec<String> = (1..=5u32)
            .flat_map(|index| chunk_rows(index, sizes[(index - 1) as usize]))
            .map(|r| r["v"].as_str().unwrap().to_string())
            .collect();
        prop_assert_eq!(values, expected);
    }

    #[test]
    fn received_count_matches_distinct_indices(
        indices in prop::collection::vec(1u32..20, 1..40),
    ) {
        let mut record = BatchRecord::new(
            "b1",
            BatchDefaults {
                total_chunks_expected: 20,
                sources: Vec::new(),
                dataset_label: "dataset".into(),
            },
        );
        for index in &indices {
            record.insert_chunk(Chunk::new(*index, chunk_rows(*index, 1)));
        }
        let distinct: std::collections::BTreeSet<u32> = indices.iter().copied().collect();
        prop_assert_eq!(record.received_chunk_count() as usize, distinct.len());
        prop_assert_eq!(record.row_count(), distinct.len());
        let missing = record.missing();
        prop_assert_eq!(missing.count as usize + distinct.len(), 20);
        prop_assert!(missing.first.iter().all(|i| !distinct.contains(i)));
        prop_assert!(missing.first.windows(2).all(|w| w[0] < w[1]));
    }
}

// --- Progress properties ---

proptest! {
    #[test]
    fn progress_percent_is_bounded(received in 0u32..1000, total in 0u32..1000) {
        let progress = Progress::new(received, total);
        prop_assert!(progress.percent <= 100);
        if total > 0 && received >= total {
            prop_assert_eq!(progress.percent, 100);
        }
    }
}

// --- CSV properties ---

proptest! {
    #[test]
    fn csv_has_one_line_per_row_for_plain_values(
        values in prop::collection::vec("[a-z0-9]{0,12}", 1..50),
    ) {
        let rows: Vec<Row> = values.iter().cloned().map(row).collect();
        let csv = DatasetAssembler::new()
            .assemble(&[Chunk::new(1, rows)])
            .unwrap()
            .to_csv();
        prop_assert_eq!(csv.lines().count(), values.len() + 1);
        prop_assert!(csv.ends_with('\n'));
    }
}
