//! Migration Engine
//!
//! A sweep computes `cutoff = now - archive_after` (rounded up to the next
//! whole millisecond), pages through inline
//! records older than the cutoff and runs archive-one on each candidate with
//! a bounded worker pool. One failed candidate never affects the others: it
//! is counted, published to the dead-letter sink and left inline for the
//! next sweep.
//!
//! The page token is checkpointed after every page. A sweep that runs out of
//! its wall-clock budget stops between pages and the next sweep resumes from
//! the checkpoint; a sweep that reaches the end clears it.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::archiver::{ArchiveOutcome, Archiver};
use super::checkpoint::{CheckpointStore, MemoryCheckpointStore, SweepCheckpoint};
use super::dead_letter::{DeadLetter, DeadLetterSink, TracingDeadLetterSink};
use super::error::TierError;
use super::metrics::TieringMetrics;
use super::traits::{BulkStore, IndexStore, PageToken, StorageClass};
use crate::types::RecordId;
use crate::utils::{call_with_retry, ceil_to_millis, Clock, RetryPolicy};

/// Counters for one sweep
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub scanned: u64,
    pub archived: u64,
    pub failed: u64,
    pub skipped: u64,
    /// Archived records whose bulk copy was left by an earlier attempt
    pub uploads_reused: u64,
    pub pages: u64,
    /// False when the sweep stopped on its time budget
    pub completed: bool,
    /// True when the sweep started from a saved checkpoint
    pub resumed: bool,
    pub cutoff: DateTime<Utc>,
    pub duration_ms: u64,
}

impl SweepReport {
    pub fn empty(cutoff: DateTime<Utc>) -> Self {
        Self {
            scanned: 0,
            archived: 0,
            failed: 0,
            skipped: 0,
            uploads_reused: 0,
            pages: 0,
            completed: true,
            resumed: false,
            cutoff,
            duration_ms: 0,
        }
    }
}

pub struct MigrationEngine {
    index: Arc<dyn IndexStore>,
    archiver: Archiver,
    clock: Arc<dyn Clock>,
    dead_letters: Arc<dyn DeadLetterSink>,
    checkpoints: Arc<dyn CheckpointStore>,
    index_retry: RetryPolicy,
    concurrency: usize,
    budget: Option<Duration>,
    metrics: Option<TieringMetrics>,
    sweep_lock: Mutex<()>,
}

impl MigrationEngine {
    pub fn new(
        index: Arc<dyn IndexStore>,
        bulk: Arc<dyn BulkStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            archiver: Archiver::new(index.clone(), bulk),
            index,
            clock,
            dead_letters: Arc::new(TracingDeadLetterSink),
            checkpoints: Arc::new(MemoryCheckpointStore::new()),
            index_retry: RetryPolicy::index_default(),
            concurrency: 8,
            budget: None,
            metrics: None,
            sweep_lock: Mutex::new(()),
        }
    }

    pub fn with_retry(mut self, index_retry: RetryPolicy, bulk_retry: RetryPolicy) -> Self {
        self.archiver = self.archiver.with_retry(index_retry.clone(), bulk_retry);
        self.index_retry = index_retry;
        self
    }

    pub fn with_storage_class(mut self, storage_class: StorageClass) -> Self {
        self.archiver = self.archiver.with_storage_class(storage_class);
        self
    }

    pub fn with_dead_letters(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = sink;
        self
    }

    pub fn with_checkpoints(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = store;
        self
    }

    /// Maximum number of archive-one calls in flight
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Wall-clock budget per sweep; `None` runs to completion
    pub fn with_budget(mut self, budget: Option<Duration>) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_metrics(mut self, metrics: TieringMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn archiver(&self) -> &Archiver {
        &self.archiver
    }

    /// Run one sweep.
    ///
    /// Sweeps of the same engine are serialized. Per-record failures are
    /// counted in the report; only a failed index scan returns an error, and
    /// the pages before it stay checkpointed.
    #[instrument(skip(self), fields(archive_after_days = archive_after.num_days()))]
    pub async fn run_sweep(
        &self,
        batch_size: usize,
        archive_after: chrono::Duration,
    ) -> Result<SweepReport, TierError> {
        let _guard = self.sweep_lock.lock().await;

        let started = Instant::now();
        let batch_size = batch_size.max(1);
        // Stores compare whole milliseconds
        let cutoff = self
            .clock
            .now()
            .checked_sub_signed(archive_after)
            .and_then(ceil_to_millis)
            .ok_or(TierError::CutoffOutOfRange(archive_after))?;
        let mut report = SweepReport::empty(cutoff);

        let mut token = match self.checkpoints.load().await {
            Ok(checkpoint) => checkpoint.map(|c| c.token),
            Err(e) => {
                warn!("Ignoring unreadable sweep checkpoint: {}", e);
                None
            }
        };
        report.resumed = token.is_some();

        debug!(
            "Sweep starting: cutoff {}, batch size {}, resumed {}",
            cutoff, batch_size, report.resumed
        );

        loop {
            let index = &self.index;
            let after = token.as_ref();
            let page = call_with_retry(&self.index_retry, "index.scan_archivable", move || {
                index.scan_archivable(cutoff, after, batch_size)
            })
            .await
            .map_err(TierError::ScanFailed)?;

            if page.entries.is_empty() && page.next.is_none() && report.pages == 0 {
                self.clear_checkpoint().await;
                break;
            }

            report.pages += 1;
            report.scanned += page.entries.len() as u64;

            let archiver = &self.archiver;
            let results: Vec<(RecordId, Result<ArchiveOutcome, TierError>)> =
                stream::iter(page.entries.iter())
                    .map(|entry| async move { (entry.id.clone(), archiver.archive_one(entry).await) })
                    .buffer_unordered(self.concurrency)
                    .collect::<Vec<_>>()
                    .boxed()
                    .await;

            for (id, result) in results {
                match result {
                    Ok(ArchiveOutcome::Archived { uploaded, .. }) => {
                        report.archived += 1;
                        if !uploaded {
                            report.uploads_reused += 1;
                        }
                    }
                    Ok(ArchiveOutcome::Skipped) => report.skipped += 1,
                    Err(e) => {
                        report.failed += 1;
                        warn!("Failed to archive {}: {}", id, e);
                        self.publish_dead_letter(id, &e).await;
                    }
                }
            }

            match page.next {
                Some(next) => {
                    self.save_checkpoint(&next).await;
                    token = Some(next);
                }
                None => {
                    self.clear_checkpoint().await;
                    break;
                }
            }

            if let Some(budget) = self.budget {
                if started.elapsed() >= budget {
                    report.completed = false;
                    info!(
                        "Sweep budget of {:?} exhausted after {} pages, will resume from checkpoint",
                        budget, report.pages
                    );
                    break;
                }
            }
        }

        report.duration_ms = started.elapsed().as_millis() as u64;

        if report.scanned == 0 {
            debug!("Sweep found no archivable records");
        } else {
            info!(
                "Sweep finished: {} scanned, {} archived, {} failed, {} skipped ({} pages, {}ms)",
                report.scanned,
                report.archived,
                report.failed,
                report.skipped,
                report.pages,
                report.duration_ms
            );
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_sweep(&report);
        }

        Ok(report)
    }

    async fn publish_dead_letter(&self, id: RecordId, error: &TierError) {
        let letter = DeadLetter::from_error(id, error, self.clock.now());
        let id = letter.id.clone();

        if let Err(e) = self.dead_letters.publish(letter).await {
            warn!("Could not publish dead letter for {}: {}", id, e);
            return;
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_dead_letter();
        }
    }

    async fn save_checkpoint(&self, token: &PageToken) {
        let checkpoint = SweepCheckpoint {
            token: token.clone(),
            saved_at: self.clock.now(),
        };
        if let Err(e) = self.checkpoints.save(&checkpoint).await {
            warn!("Could not save sweep checkpoint: {}", e);
        }
    }

    async fn clear_checkpoint(&self) {
        if let Err(e) = self.checkpoints.clear().await {
            warn!("Could not clear sweep checkpoint: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tiering::{MemoryBulkStore, MemoryDeadLetterSink, MemoryIndexStore};
    use crate::types::{Metadata, NewRecord, TierKind};
    use crate::utils::ManualClock;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    async fn seed(index: &MemoryIndexStore, id: &str, age: chrono::Duration) {
        let record = NewRecord::new(
            RecordId::parse(id).unwrap(),
            now() - age,
            Metadata::new(),
            id.as_bytes().to_vec(),
        );
        index.put(&record.into_entry()).await.unwrap();
    }

    fn engine(index: Arc<MemoryIndexStore>, bulk: Arc<MemoryBulkStore>) -> MigrationEngine {
        MigrationEngine::new(index, bulk, Arc::new(ManualClock::new(now())))
            .with_retry(RetryPolicy::no_retry(), RetryPolicy::no_retry())
    }

    #[tokio::test]
    async fn test_empty_sweep_is_silent() {
        let index = Arc::new(MemoryIndexStore::new());
        let bulk = Arc::new(MemoryBulkStore::new());
        seed(&index, "fresh", chrono::Duration::days(1)).await;

        let report = engine(index, bulk.clone())
            .run_sweep(10, chrono::Duration::days(90))
            .await
            .unwrap();

        assert_eq!(report.scanned, 0);
        assert_eq!(report.pages, 0);
        assert!(report.completed);
        assert_eq!(bulk.put_count(), 0);
    }

    #[tokio::test]
    async fn test_sweep_archives_old_records() {
        let index = Arc::new(MemoryIndexStore::new());
        let bulk = Arc::new(MemoryBulkStore::new());
        seed(&index, "young", chrono::Duration::days(10)).await;
        seed(&index, "old", chrono::Duration::days(91)).await;
        seed(&index, "ancient", chrono::Duration::days(200)).await;

        let report = engine(index.clone(), bulk)
            .run_sweep(2, chrono::Duration::days(90))
            .await
            .unwrap();

        assert_eq!(report.scanned, 2);
        assert_eq!(report.archived, 2);
        assert_eq!(report.failed, 0);

        let tiers: Vec<_> = index
            .entries()
            .await
            .iter()
            .map(|e| (e.id.to_string(), e.tier()))
            .collect();
        assert!(tiers.contains(&("young".to_string(), TierKind::Inline)));
        assert!(tiers.contains(&("old".to_string(), TierKind::Archived)));
        assert!(tiers.contains(&("ancient".to_string(), TierKind::Archived)));
    }

    #[tokio::test]
    async fn test_sweep_budget_resumes_from_checkpoint() {
        let index = Arc::new(MemoryIndexStore::new());
        let bulk = Arc::new(MemoryBulkStore::new());
        for i in 0..5 {
            seed(&index, &format!("r{}", i), chrono::Duration::days(100 + i)).await;
        }
        let dead_letters = Arc::new(MemoryDeadLetterSink::new());
        let engine = engine(index.clone(), bulk)
            .with_budget(Some(Duration::ZERO))
            .with_dead_letters(dead_letters.clone());

        let first = engine.run_sweep(2, chrono::Duration::days(90)).await.unwrap();
        assert!(!first.completed);
        assert!(!first.resumed);
        assert_eq!(first.archived, 2);

        let second = engine.run_sweep(2, chrono::Duration::days(90)).await.unwrap();
        assert!(second.resumed);
        assert_eq!(second.archived, 2);

        let third = engine.run_sweep(2, chrono::Duration::days(90)).await.unwrap();
        assert!(third.completed);
        assert_eq!(third.archived, 1);

        assert_eq!(index.tier_counts().await.unwrap().archived, 5);
        assert!(dead_letters.letters().await.is_empty());
    }

    #[tokio::test]
    async fn test_out_of_range_threshold_is_an_error() {
        let index = Arc::new(MemoryIndexStore::new());
        let bulk = Arc::new(MemoryBulkStore::new());
        seed(&index, "old", chrono::Duration::days(120)).await;
        let engine = engine(index.clone(), bulk);

        let err = engine
            .run_sweep(10, chrono::Duration::days(100_000_000))
            .await
            .unwrap_err();
        assert!(matches!(err, TierError::CutoffOutOfRange(_)));
        assert_eq!(err.kind(), "cutoff_out_of_range");

        // The engine stays usable after the rejected sweep
        let report = engine.run_sweep(10, chrono::Duration::days(90)).await.unwrap();
        assert_eq!(report.archived, 1);
    }
}
