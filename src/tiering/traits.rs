//! Store traits - the two external collaborators of the tiering engine
//!
//! The index store is the single source of truth for where a record's
//! payload lives. The bulk store holds archived payloads and is only ever
//! reached through an index entry's blob pointer.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::StoreError;
use crate::types::{BlobKey, BlobPointer, Checksum, IndexEntry, RecordId, RecordSummary, TierKind};

/// Resume position for paginated scans.
///
/// Scans are ordered by `(timestamp, id)`; the token names the last entry
/// returned so the next page starts strictly after it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageToken {
    pub after_timestamp_ms: i64,
    pub after_id: RecordId,
}

impl PageToken {
    pub fn after(entry: &IndexEntry) -> Self {
        Self {
            after_timestamp_ms: entry.timestamp.timestamp_millis(),
            after_id: entry.id.clone(),
        }
    }

    /// True if `(timestamp_ms, id)` sorts after this token
    pub fn precedes(&self, timestamp_ms: i64, id: &RecordId) -> bool {
        (timestamp_ms, id) > (self.after_timestamp_ms, &self.after_id)
    }
}

/// One page of archival candidates
#[derive(Debug, Clone, Default)]
pub struct ScanPage {
    pub entries: Vec<IndexEntry>,
    /// `None` once the candidate set is exhausted
    pub next: Option<PageToken>,
}

/// Result of a conditional index update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Applied,
    /// The entry was no longer in the expected tier
    ConditionFailed,
}

/// Access-frequency hint passed to the bulk store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageClass {
    Frequent,
    #[default]
    Infrequent,
}

impl StorageClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageClass::Frequent => "frequent",
            StorageClass::Infrequent => "infrequent",
        }
    }
}

/// Description of an object held by the bulk store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobInfo {
    pub key: BlobKey,
    pub size: u64,
    pub sha256: Checksum,
    /// Class the object was written with, when the backend tracks it
    pub storage_class: Option<StorageClass>,
}

impl BlobInfo {
    /// True if this object is exactly the payload `pointer` describes
    pub fn matches(&self, pointer: &BlobPointer) -> bool {
        self.key == pointer.key && self.size == pointer.size && self.sha256 == pointer.sha256
    }
}

/// Count of records per tier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TierCounts {
    pub inline: u64,
    pub archived: u64,
}

impl TierCounts {
    pub fn total(&self) -> u64 {
        self.inline + self.archived
    }
}

/// Low-latency index of every record
#[async_trait]
pub trait IndexStore: Send + Sync {
    /// Point read; `None` if no entry exists
    async fn get(&self, id: &RecordId) -> Result<Option<IndexEntry>, StoreError>;

    /// Create an entry. Ids are never reused, so an existing id is
    /// rejected with `StoreError::AlreadyExists`.
    async fn put(&self, entry: &IndexEntry) -> Result<(), StoreError>;

    /// Replace the entry for `id` only if it is still in tier `expected`.
    ///
    /// This is the sole concurrency-control primitive of the engine. A
    /// missing entry is `StoreError::NotFound`.
    async fn conditional_update(
        &self,
        id: &RecordId,
        expected: TierKind,
        new_entry: &IndexEntry,
    ) -> Result<UpdateOutcome, StoreError>;

    /// Inline entries with `timestamp < cutoff`, ordered by `(timestamp, id)`,
    /// starting strictly after `after`, at most `limit` entries.
    async fn scan_archivable(
        &self,
        cutoff: DateTime<Utc>,
        after: Option<&PageToken>,
        limit: usize,
    ) -> Result<ScanPage, StoreError>;

    /// Metadata listing for `from <= timestamp < to`, ordered by `(timestamp, id)`
    async fn list_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RecordSummary>, StoreError>;

    async fn tier_counts(&self) -> Result<TierCounts, StoreError>;

    /// Backend name for logging and monitoring
    fn backend_name(&self) -> &'static str;
}

/// Cheap bulk object store for archived payloads
#[async_trait]
pub trait BulkStore: Send + Sync {
    /// Write (or overwrite) an object and describe what was stored
    async fn put(
        &self,
        key: &BlobKey,
        bytes: &[u8],
        class: StorageClass,
    ) -> Result<BlobInfo, StoreError>;

    /// Describe an object without returning it; `None` if absent
    async fn head(&self, key: &BlobKey) -> Result<Option<BlobInfo>, StoreError>;

    /// Fetch an object; `StoreError::NotFound` if absent
    async fn get(&self, key: &BlobKey) -> Result<Vec<u8>, StoreError>;

    /// Remove an object; returns whether it existed
    async fn delete(&self, key: &BlobKey) -> Result<bool, StoreError>;

    fn backend_name(&self) -> &'static str;
}

/// Build the next-page token for a scan that returned `entries` out of `limit`
pub(crate) fn next_token(entries: &[IndexEntry], limit: usize) -> Option<PageToken> {
    if entries.len() < limit {
        return None;
    }
    entries.last().map(PageToken::after)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_token_ordering() {
        let token = PageToken {
            after_timestamp_ms: 1_000,
            after_id: RecordId::parse("b").unwrap(),
        };
        let a = RecordId::parse("a").unwrap();
        let c = RecordId::parse("c").unwrap();

        assert!(!token.precedes(1_000, &a));
        assert!(!token.precedes(1_000, &RecordId::parse("b").unwrap()));
        assert!(token.precedes(1_000, &c));
        assert!(token.precedes(1_001, &a));
        assert!(!token.precedes(999, &c));
    }

    #[test]
    fn test_tier_counts_total() {
        let counts = TierCounts {
            inline: 3,
            archived: 4,
        };
        assert_eq!(counts.total(), 7);
    }
}
