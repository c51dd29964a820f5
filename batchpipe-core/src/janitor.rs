//! Periodic eviction of abandoned batches.
//!
//! A batch whose final chunk never arrives would sit in the store forever.
//! The sweep drops records older than the retention window and forgets
//! completed dispatches of the same age.

use crate::aggregator::{BatchAggregator, DispatchLedger};
use crate::config::JanitorConfig;
use crate::store::ChunkStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// What one sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub evicted_batches: usize,
    pub expired_dispatches: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.evicted_batches == 0 && self.expired_dispatches == 0
    }
}

pub struct JanitorSweep {
    store: Arc<dyn ChunkStore>,
    ledger: Arc<DispatchLedger>,
    retention: chrono::Duration,
}

impl JanitorSweep {
    pub fn new(
        store: Arc<dyn ChunkStore>,
        ledger: Arc<DispatchLedger>,
        retention: chrono::Duration,
    ) -> Self {
        Self {
            store,
            ledger,
            retention,
        }
    }

    /// Sweep the aggregator's store and ledger.
    pub fn for_aggregator(aggregator: &BatchAggregator, config: &JanitorConfig) -> Self {
        Self::new(
            Arc::clone(aggregator.store()),
            Arc::clone(aggregator.ledger()),
            config.retention(),
        )
    }

    pub fn sweep(&self) -> SweepReport {
        self.sweep_at(Utc::now())
    }

    /// Sweep as if the current time were `now`.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();
        // A window reaching past the earliest representable time keeps everything.
        let Some(cutoff) = now.checked_sub_signed(self.retention) else {
            debug!(retention = %self.retention, "Retention window exceeds clock range");
            return report;
        };

        for (batch_id, handle) in self.store.entries() {
            let mut record = handle.lock();
            if record.is_sealed() || record.start_time() >= cutoff {
                continue;
            }
            let age_secs = (now - record.start_time()).num_seconds();
            info!(
                batch_id = %batch_id,
                received = record.received_chunk_count(),
                expected = record.total_chunks_expected(),
                age_secs,
                "Evicting abandoned batch"
            );
            // Sealing under the lock keeps a concurrent chunk from landing in
            // a record that is about to disappear.
            record.seal();
            self.store.remove(&batch_id);
            report.evicted_batches += 1;
        }

        report.expired_dispatches = self.ledger.evict_completed_before(cutoff);
        report
    }

    /// Run [`sweep`](Self::sweep) every `interval` until `cancel` fires.
    pub fn spawn(self: Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Janitor stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        let report = self.sweep();
                        if report.is_empty() {
                            debug!("Janitor sweep found nothing to evict");
                        } else {
                            info!(
                                evicted_batches = report.evicted_batches,
                                expired_dispatches = report.expired_dispatches,
                                "Janitor sweep finished"
                            );
                        }
                    }
                }
            }
        })
    }
}
