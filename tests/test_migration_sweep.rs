//! Integration tests for the migration sweep
//!
//! Covers age-based selection, the cutoff boundary, pagination, partial
//! failures with dead letters, and budgeted sweeps resuming from a
//! persisted checkpoint.

mod common;

use billing_tiering::tiering::{
    BulkStore, CheckpointStore, FileCheckpointStore, IndexStore, MemoryBulkStore,
    MemoryDeadLetterSink, MemoryIndexStore, MigrationEngine,
};
use billing_tiering::types::TierKind;
use billing_tiering::utils::{Clock, ManualClock};
use chrono::{DateTime, Duration, Utc};
use common::*;
use std::sync::Arc;

/// Clock pinned to an instant, including sub-millisecond precision
struct FixedClock(DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

fn engine(index: Arc<dyn IndexStore>, bulk: Arc<dyn BulkStore>) -> MigrationEngine {
    MigrationEngine::new(index, bulk, Arc::new(ManualClock::new(now())))
        .with_retry(fast_retry(2), fast_retry(2))
}

#[tokio::test]
async fn test_sweep_archives_only_records_past_threshold() {
    let index = Arc::new(MemoryIndexStore::new());
    let bulk = Arc::new(MemoryBulkStore::new());
    seed(&*index, "inv-young", Duration::days(10)).await;
    seed(&*index, "inv-old", Duration::days(91)).await;
    seed(&*index, "inv-ancient", Duration::days(200)).await;

    let report = engine(index.clone(), bulk.clone())
        .run_sweep(100, Duration::days(90))
        .await
        .unwrap();

    assert_eq!(report.scanned, 2);
    assert_eq!(report.archived, 2);
    assert_eq!(report.failed, 0);
    assert!(report.completed);
    assert_eq!(report.cutoff, now() - Duration::days(90));

    let young = index.get(&id("inv-young")).await.unwrap().unwrap();
    assert_eq!(young.tier(), TierKind::Inline);
    for archived in ["inv-old", "inv-ancient"] {
        let entry = index.get(&id(archived)).await.unwrap().unwrap();
        assert_eq!(entry.tier(), TierKind::Archived);
        assert_eq!(entry.blob().unwrap().key.as_str(), format!("{}.bin", archived));
    }

    assert_eq!(bulk.len().await, 2);
    assert_single_tier_invariant(&index, &*bulk).await;
}

#[tokio::test]
async fn test_cutoff_is_exclusive() {
    let index = Arc::new(MemoryIndexStore::new());
    let bulk = Arc::new(MemoryBulkStore::new());
    let threshold = Duration::days(90);
    seed(&*index, "at-cutoff", threshold).await;
    seed(&*index, "just-past", threshold + Duration::milliseconds(1)).await;

    let report = engine(index.clone(), bulk)
        .run_sweep(10, threshold)
        .await
        .unwrap();

    assert_eq!(report.archived, 1);
    let at_cutoff = index.get(&id("at-cutoff")).await.unwrap().unwrap();
    let just_past = index.get(&id("just-past")).await.unwrap().unwrap();
    assert_eq!(at_cutoff.tier(), TierKind::Inline);
    assert_eq!(just_past.tier(), TierKind::Archived);
}

#[tokio::test]
async fn test_sub_millisecond_clock_keeps_cutoff_exclusive() {
    let index = Arc::new(MemoryIndexStore::new());
    let bulk = Arc::new(MemoryBulkStore::new());
    let threshold = Duration::days(90);
    // `on-floor` sits 500us before the raw cutoff, `next-milli` 500us after it
    seed(&*index, "on-floor", threshold).await;
    seed(&*index, "next-milli", threshold - Duration::milliseconds(1)).await;

    let clock = Arc::new(FixedClock(now() + Duration::microseconds(500)));
    let report = MigrationEngine::new(index.clone(), bulk.clone(), clock)
        .with_retry(fast_retry(2), fast_retry(2))
        .run_sweep(10, threshold)
        .await
        .unwrap();

    assert_eq!(report.archived, 1);
    assert_eq!(
        report.cutoff,
        now() - threshold + Duration::milliseconds(1)
    );

    let on_floor = index.get(&id("on-floor")).await.unwrap().unwrap();
    let next_milli = index.get(&id("next-milli")).await.unwrap().unwrap();
    assert_eq!(on_floor.tier(), TierKind::Archived);
    assert_eq!(next_milli.tier(), TierKind::Inline);
}

#[tokio::test]
async fn test_sweep_pages_through_large_candidate_set() {
    let index = Arc::new(MemoryIndexStore::new());
    let bulk = Arc::new(MemoryBulkStore::new());
    for i in 0..25 {
        seed(&*index, &format!("inv-{:03}", i), Duration::days(100) + Duration::minutes(i)).await;
    }

    let report = engine(index.clone(), bulk.clone())
        .with_concurrency(3)
        .run_sweep(4, Duration::days(90))
        .await
        .unwrap();

    assert_eq!(report.pages, 7);
    assert_eq!(report.scanned, 25);
    assert_eq!(report.archived, 25);
    assert_eq!(bulk.put_count(), 25);

    let counts = index.tier_counts().await.unwrap();
    assert_eq!(counts.archived, 25);
    assert_eq!(counts.inline, 0);
}

#[tokio::test]
async fn test_failed_uploads_are_dead_lettered_and_left_inline() {
    let index = Arc::new(MemoryIndexStore::new());
    let bulk = Arc::new(FlakyBulkStore::new());
    let dead_letters = Arc::new(MemoryDeadLetterSink::new());
    for i in 0..3 {
        seed(&*index, &format!("inv-{}", i), Duration::days(120)).await;
    }
    bulk.fail_all_puts();

    let engine = engine(index.clone(), bulk.clone()).with_dead_letters(dead_letters.clone());
    let report = engine.run_sweep(10, Duration::days(90)).await.unwrap();

    assert_eq!(report.scanned, 3);
    assert_eq!(report.failed, 3);
    assert_eq!(report.archived, 0);
    assert!(report.completed);

    let letters = dead_letters.letters().await;
    assert_eq!(letters.len(), 3);
    assert!(letters.iter().all(|l| l.error_kind == "bulk_write_failed"));
    assert_eq!(index.tier_counts().await.unwrap().inline, 3);
    assert!(bulk.inner.is_empty().await);

    // Next sweep retries once the bulk store recovers
    bulk.heal();
    let retry = engine.run_sweep(10, Duration::days(90)).await.unwrap();
    assert_eq!(retry.archived, 3);
    assert_eq!(retry.failed, 0);
    assert_single_tier_invariant(&index, &*bulk).await;
}

#[tokio::test]
async fn test_transient_upload_failures_are_retried_within_a_sweep() {
    let index = Arc::new(MemoryIndexStore::new());
    let bulk = Arc::new(FlakyBulkStore::new());
    seed(&*index, "inv-1", Duration::days(120)).await;
    bulk.fail_next_puts(1);

    let report = engine(index.clone(), bulk.clone())
        .run_sweep(10, Duration::days(90))
        .await
        .unwrap();

    assert_eq!(report.archived, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(bulk.put_calls.load(std::sync::atomic::Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_budgeted_sweep_resumes_after_restart() {
    let checkpoint_path = std::env::temp_dir().join(format!(
        "sweep_checkpoint_{}.json",
        rand::random::<u64>()
    ));
    let index = Arc::new(MemoryIndexStore::new());
    let bulk = Arc::new(MemoryBulkStore::new());
    for i in 0..5 {
        seed(&*index, &format!("inv-{}", i), Duration::days(100 + i)).await;
    }

    let build = || {
        engine(index.clone(), bulk.clone())
            .with_checkpoints(Arc::new(FileCheckpointStore::new(&checkpoint_path)))
            .with_budget(Some(std::time::Duration::ZERO))
    };

    let first = build().run_sweep(2, Duration::days(90)).await.unwrap();
    assert!(!first.completed);
    assert_eq!(first.pages, 1);
    assert_eq!(first.archived, 2);
    assert!(checkpoint_path.exists());

    // A fresh engine picks up the persisted token
    let second = build().run_sweep(2, Duration::days(90)).await.unwrap();
    assert!(second.resumed);
    assert_eq!(second.archived, 2);

    let third = build().run_sweep(2, Duration::days(90)).await.unwrap();
    assert!(third.completed);
    assert_eq!(third.archived, 1);
    assert!(!checkpoint_path.exists());

    let store = FileCheckpointStore::new(&checkpoint_path);
    assert!(store.load().await.unwrap().is_none());
    assert_eq!(index.tier_counts().await.unwrap().archived, 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_sweeps_archive_each_record_once() {
    let index = Arc::new(MemoryIndexStore::new());
    let bulk = Arc::new(MemoryBulkStore::new());
    for i in 0..12 {
        seed(&*index, &format!("inv-{}", i), Duration::days(95)).await;
    }

    // Separate engines share no sweep lock, so their archive-one calls race
    let first = engine(index.clone(), bulk.clone()).with_concurrency(4);
    let second = engine(index.clone(), bulk.clone()).with_concurrency(4);
    let a = tokio::spawn(async move { first.run_sweep(5, Duration::days(90)).await });
    let b = tokio::spawn(async move { second.run_sweep(5, Duration::days(90)).await });
    let (a, b) = (a.await.unwrap().unwrap(), b.await.unwrap().unwrap());

    assert_eq!(a.failed + b.failed, 0);
    assert_eq!(a.archived + b.archived, 12);
    assert_eq!(index.tier_counts().await.unwrap().archived, 12);
    assert_eq!(bulk.len().await, 12);
    assert_single_tier_invariant(&index, &*bulk).await;
}
