//! Archive-one: move a single inline payload into the bulk store.
//!
//! Ordering is blob-before-pointer. The bulk copy is written and verified
//! before the index entry is flipped, and the flip is a conditional update
//! that only applies while the entry is still inline. A payload is therefore
//! always reachable from at least one store, and running archive-one twice
//! for the same record (in sequence or concurrently) has the same effect as
//! running it once.

use std::sync::Arc;
use tracing::{debug, instrument, warn};

use super::error::{StoreError, TierError};
use super::traits::{BulkStore, IndexStore, StorageClass, UpdateOutcome};
use crate::types::{BlobPointer, IndexEntry, TierKind};
use crate::utils::{call_with_retry, RetryPolicy};

/// What archive-one did for a record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveOutcome {
    /// The index now points at `blob`. `uploaded` is false when a verified
    /// copy from an earlier attempt was reused.
    Archived { blob: BlobPointer, uploaded: bool },
    /// The record was already archived, by an earlier sweep or a concurrent one
    Skipped,
}

pub struct Archiver {
    index: Arc<dyn IndexStore>,
    bulk: Arc<dyn BulkStore>,
    index_retry: RetryPolicy,
    bulk_retry: RetryPolicy,
    storage_class: StorageClass,
}

impl Archiver {
    pub fn new(index: Arc<dyn IndexStore>, bulk: Arc<dyn BulkStore>) -> Self {
        Self {
            index,
            bulk,
            index_retry: RetryPolicy::index_default(),
            bulk_retry: RetryPolicy::bulk_default(),
            storage_class: StorageClass::Infrequent,
        }
    }

    pub fn with_retry(mut self, index_retry: RetryPolicy, bulk_retry: RetryPolicy) -> Self {
        self.index_retry = index_retry;
        self.bulk_retry = bulk_retry;
        self
    }

    pub fn with_storage_class(mut self, storage_class: StorageClass) -> Self {
        self.storage_class = storage_class;
        self
    }

    #[instrument(skip(self, entry), fields(record_id = %entry.id))]
    pub async fn archive_one(&self, entry: &IndexEntry) -> Result<ArchiveOutcome, TierError> {
        let payload = match entry.inline_payload() {
            Some(payload) => payload,
            None => return Ok(ArchiveOutcome::Skipped),
        };
        let pointer = BlobPointer::for_payload(&entry.id, payload);

        let bulk = &self.bulk;
        let key = &pointer.key;
        let class = self.storage_class;

        // 1. Upload, unless a verified copy from an earlier attempt is already there
        let existing = call_with_retry(&self.bulk_retry, "bulk.head", move || bulk.head(key))
            .await
            .map_err(|source| TierError::BulkWriteFailed {
                id: entry.id.clone(),
                source,
            })?;

        let uploaded = match existing {
            Some(info) if info.matches(&pointer) => {
                debug!("Reusing existing bulk object {}", key);
                false
            }
            _ => {
                call_with_retry(&self.bulk_retry, "bulk.put", move || {
                    bulk.put(key, payload, class)
                })
                .await
                .map_err(|source| TierError::BulkWriteFailed {
                    id: entry.id.clone(),
                    source,
                })?;

                // 2. Verify what actually landed
                self.verify(entry, &pointer).await?;
                true
            }
        };

        // 3. Flip the pointer, only if nobody beat us to it
        let archived = entry.archived_with(pointer.clone());
        let index = &self.index;
        let id = &entry.id;
        let new_entry = &archived;

        let outcome = call_with_retry(&self.index_retry, "index.conditional_update", move || {
            index.conditional_update(id, TierKind::Inline, new_entry)
        })
        .await;

        match outcome {
            Ok(UpdateOutcome::Applied) => {
                debug!("Archived {} ({} bytes)", key, pointer.size);
                Ok(ArchiveOutcome::Archived {
                    blob: pointer,
                    uploaded,
                })
            }
            Ok(UpdateOutcome::ConditionFailed) => {
                debug!("Record already archived elsewhere");
                Ok(ArchiveOutcome::Skipped)
            }
            // 4. The bulk copy stays; the next sweep finds it and retries the flip alone
            Err(source) => {
                warn!("Index update failed after bulk write, keeping {}: {}", key, source);
                Err(TierError::IndexUpdateFailed {
                    id: entry.id.clone(),
                    source,
                })
            }
        }
    }

    async fn verify(&self, entry: &IndexEntry, pointer: &BlobPointer) -> Result<(), TierError> {
        let bulk = &self.bulk;
        let key = &pointer.key;

        let head = call_with_retry(&self.bulk_retry, "bulk.head", move || bulk.head(key))
            .await
            .map_err(|source| TierError::BulkVerifyFailed {
                id: entry.id.clone(),
                reason: format!("head failed: {}", source),
            })?;

        match head {
            Some(info) if info.matches(pointer) => Ok(()),
            Some(info) => Err(TierError::BulkVerifyFailed {
                id: entry.id.clone(),
                reason: format!(
                    "stored object is {} bytes / sha256 {}, expected {} bytes / sha256 {}",
                    info.size, info.sha256, pointer.size, pointer.sha256
                ),
            }),
            None => Err(TierError::BulkVerifyFailed {
                id: entry.id.clone(),
                reason: StoreError::NotFound(key.to_string()).to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tiering::{MemoryBulkStore, MemoryIndexStore};
    use crate::types::{Metadata, NewRecord, RecordId};
    use chrono::Utc;

    fn setup() -> (Arc<MemoryIndexStore>, Arc<MemoryBulkStore>, Archiver) {
        let index = Arc::new(MemoryIndexStore::new());
        let bulk = Arc::new(MemoryBulkStore::new());
        let archiver = Archiver::new(index.clone(), bulk.clone())
            .with_retry(RetryPolicy::no_retry(), RetryPolicy::no_retry());
        (index, bulk, archiver)
    }

    async fn seed(index: &MemoryIndexStore, id: &str) -> IndexEntry {
        let entry = NewRecord::new(
            RecordId::parse(id).unwrap(),
            Utc::now(),
            Metadata::new(),
            b"usage line items".to_vec(),
        )
        .into_entry();
        index.put(&entry).await.unwrap();
        entry
    }

    #[tokio::test]
    async fn test_archive_one_moves_payload() {
        let (index, bulk, archiver) = setup();
        let entry = seed(&index, "inv-1").await;

        let outcome = archiver.archive_one(&entry).await.unwrap();
        assert!(matches!(
            outcome,
            ArchiveOutcome::Archived { uploaded: true, .. }
        ));

        let stored = index.get(&entry.id).await.unwrap().unwrap();
        let blob = stored.blob().unwrap();
        assert_eq!(blob.key.as_str(), "inv-1.bin");
        assert_eq!(bulk.get(&blob.key).await.unwrap(), b"usage line items".to_vec());
    }

    #[tokio::test]
    async fn test_archive_one_twice_is_once() {
        let (index, bulk, archiver) = setup();
        let entry = seed(&index, "inv-1").await;

        archiver.archive_one(&entry).await.unwrap();
        let second = archiver.archive_one(&entry).await.unwrap();

        assert_eq!(second, ArchiveOutcome::Skipped);
        assert_eq!(bulk.put_count(), 1);
    }

    #[tokio::test]
    async fn test_archive_one_skips_archived_entry() {
        let (index, _bulk, archiver) = setup();
        let entry = seed(&index, "inv-1").await;
        archiver.archive_one(&entry).await.unwrap();

        let current = index.get(&entry.id).await.unwrap().unwrap();
        assert_eq!(
            archiver.archive_one(&current).await.unwrap(),
            ArchiveOutcome::Skipped
        );
    }

    #[tokio::test]
    async fn test_archive_one_rewrites_mismatched_leftover() {
        let (index, bulk, archiver) = setup();
        let entry = seed(&index, "inv-1").await;
        let key = crate::types::BlobKey::derive(&entry.id);
        bulk.put(&key, b"half written", StorageClass::Infrequent)
            .await
            .unwrap();

        let outcome = archiver.archive_one(&entry).await.unwrap();
        assert!(matches!(
            outcome,
            ArchiveOutcome::Archived { uploaded: true, .. }
        ));
        assert_eq!(bulk.get(&key).await.unwrap(), b"usage line items".to_vec());
    }
}
