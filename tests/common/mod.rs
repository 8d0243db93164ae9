//! Shared fixtures for the integration tests: failure-injecting wrappers
//! around the in-memory stores and record builders.

#![allow(dead_code)]

use async_trait::async_trait;
use billing_tiering::tiering::{
    BlobInfo, BulkStore, IndexStore, MemoryBulkStore, MemoryIndexStore, PageToken, ScanPage,
    StorageClass, StoreError, TierCounts, UpdateOutcome,
};
use billing_tiering::types::{BlobKey, IndexEntry, Metadata, NewRecord, RecordId, RecordSummary, TierKind};
use billing_tiering::utils::RetryPolicy;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

/// Fixed "now" shared by every scenario
pub fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
}

pub fn id(raw: &str) -> RecordId {
    RecordId::parse(raw).unwrap()
}

pub fn payload_for(id: &str) -> Vec<u8> {
    format!("usage lines for {}", id).into_bytes()
}

pub fn record(raw_id: &str, age: Duration) -> NewRecord {
    let mut metadata = Metadata::new();
    metadata.insert("customer".to_string(), serde_json::json!("acme"));
    metadata.insert("amount_cents".to_string(), serde_json::json!(1299));
    NewRecord::new(id(raw_id), now() - age, metadata, payload_for(raw_id))
}

pub async fn seed(index: &dyn IndexStore, raw_id: &str, age: Duration) -> IndexEntry {
    let entry = record(raw_id, age).into_entry();
    index.put(&entry).await.unwrap();
    entry
}

/// Short, deterministic retries so failure paths finish quickly
pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay_ms: 1,
        max_delay_ms: 2,
        call_timeout_ms: 1000,
        jitter: false,
    }
}

/// Pops one unit from a failure budget; `u32::MAX` means fail forever
fn take_failure(remaining: &AtomicU32) -> bool {
    remaining
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
            0 => None,
            u32::MAX => Some(u32::MAX),
            n => Some(n - 1),
        })
        .is_ok()
}

/// Bulk store that fails a configurable number of calls before delegating
#[derive(Default)]
pub struct FlakyBulkStore {
    pub inner: MemoryBulkStore,
    put_failures: AtomicU32,
    get_failures: AtomicU32,
    pub put_calls: AtomicU64,
    pub get_calls: AtomicU64,
}

impl FlakyBulkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_puts(&self, n: u32) {
        self.put_failures.store(n, Ordering::SeqCst);
    }

    pub fn fail_all_puts(&self) {
        self.put_failures.store(u32::MAX, Ordering::SeqCst);
    }

    pub fn fail_next_gets(&self, n: u32) {
        self.get_failures.store(n, Ordering::SeqCst);
    }

    pub fn fail_all_gets(&self) {
        self.get_failures.store(u32::MAX, Ordering::SeqCst);
    }

    pub fn heal(&self) {
        self.put_failures.store(0, Ordering::SeqCst);
        self.get_failures.store(0, Ordering::SeqCst);
    }
}

#[async_trait]
impl BulkStore for FlakyBulkStore {
    async fn put(
        &self,
        key: &BlobKey,
        bytes: &[u8],
        class: StorageClass,
    ) -> Result<BlobInfo, StoreError> {
        self.put_calls.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.put_failures) {
            return Err(StoreError::Unavailable("injected put failure".to_string()));
        }
        self.inner.put(key, bytes, class).await
    }

    async fn head(&self, key: &BlobKey) -> Result<Option<BlobInfo>, StoreError> {
        self.inner.head(key).await
    }

    async fn get(&self, key: &BlobKey) -> Result<Vec<u8>, StoreError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.get_failures) {
            return Err(StoreError::Timeout(std::time::Duration::from_millis(5)));
        }
        self.inner.get(key).await
    }

    async fn delete(&self, key: &BlobKey) -> Result<bool, StoreError> {
        self.inner.delete(key).await
    }

    fn backend_name(&self) -> &'static str {
        "flaky-memory"
    }
}

/// Index store whose point reads or conditional updates can be made to fail
#[derive(Default)]
pub struct FlakyIndexStore {
    pub inner: MemoryIndexStore,
    update_failures: AtomicU32,
    gets_down: AtomicBool,
    pub update_calls: AtomicU64,
}

impl FlakyIndexStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_updates(&self, n: u32) {
        self.update_failures.store(n, Ordering::SeqCst);
    }

    pub fn fail_all_updates(&self) {
        self.update_failures.store(u32::MAX, Ordering::SeqCst);
    }

    pub fn set_gets_down(&self, down: bool) {
        self.gets_down.store(down, Ordering::SeqCst);
    }
}

#[async_trait]
impl IndexStore for FlakyIndexStore {
    async fn get(&self, id: &RecordId) -> Result<Option<IndexEntry>, StoreError> {
        if self.gets_down.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected index outage".to_string()));
        }
        self.inner.get(id).await
    }

    async fn put(&self, entry: &IndexEntry) -> Result<(), StoreError> {
        self.inner.put(entry).await
    }

    async fn conditional_update(
        &self,
        id: &RecordId,
        expected: TierKind,
        new_entry: &IndexEntry,
    ) -> Result<UpdateOutcome, StoreError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.update_failures) {
            return Err(StoreError::Unavailable("injected update failure".to_string()));
        }
        self.inner.conditional_update(id, expected, new_entry).await
    }

    async fn scan_archivable(
        &self,
        cutoff: DateTime<Utc>,
        after: Option<&PageToken>,
        limit: usize,
    ) -> Result<ScanPage, StoreError> {
        self.inner.scan_archivable(cutoff, after, limit).await
    }

    async fn list_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RecordSummary>, StoreError> {
        self.inner.list_range(from, to, limit).await
    }

    async fn tier_counts(&self) -> Result<TierCounts, StoreError> {
        self.inner.tier_counts().await
    }

    fn backend_name(&self) -> &'static str {
        "flaky-memory"
    }
}

/// Check that every entry has its payload in exactly one reachable place:
/// inline entries carry it, archived entries point at a matching bulk object.
pub async fn assert_single_tier_invariant(index: &MemoryIndexStore, bulk: &dyn BulkStore) {
    for entry in index.entries().await {
        match entry.blob() {
            None => assert!(entry.inline_payload().is_some(), "{} has no payload", entry.id),
            Some(blob) => {
                assert!(entry.inline_payload().is_none());
                let bytes = bulk.get(&blob.key).await.unwrap();
                assert!(blob.matches_bytes(&bytes), "{} points at a bad object", entry.id);
                assert_eq!(bytes, payload_for(entry.id.as_str()));
            }
        }
    }
}
