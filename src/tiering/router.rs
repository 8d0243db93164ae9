//! Retrieval Router
//!
//! Resolves a record id through the index and serves the payload from
//! whichever tier holds it. Callers see a complete record or an error, never
//! a partial record. The router never changes a record's location.

use moka::future::Cache;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

use super::error::{StoreError, TierError};
use super::metrics::TieringMetrics;
use super::traits::{BulkStore, IndexStore};
use crate::types::{
    BlobKey, BlobPointer, Checksum, IndexEntry, Location, RecordId, RecordView, TierKind,
};
use crate::utils::{call_with_retry, call_with_retry_if, RetryPolicy};

pub struct RetrievalRouter {
    index: Arc<dyn IndexStore>,
    bulk: Arc<dyn BulkStore>,
    index_retry: RetryPolicy,
    bulk_retry: RetryPolicy,
    /// Archived payloads by bulk key; inline reads bypass it
    cache: Option<Cache<BlobKey, Arc<Vec<u8>>>>,
    metrics: Option<TieringMetrics>,
}

impl RetrievalRouter {
    pub fn new(index: Arc<dyn IndexStore>, bulk: Arc<dyn BulkStore>) -> Self {
        Self {
            index,
            bulk,
            index_retry: RetryPolicy::index_default(),
            bulk_retry: RetryPolicy::bulk_default(),
            cache: None,
            metrics: None,
        }
    }

    pub fn with_retry(mut self, index_retry: RetryPolicy, bulk_retry: RetryPolicy) -> Self {
        self.index_retry = index_retry;
        self.bulk_retry = bulk_retry;
        self
    }

    /// Cache up to `capacity` archived payloads for `ttl`
    pub fn with_cache(mut self, capacity: u64, ttl: Duration) -> Self {
        self.cache = if capacity == 0 {
            None
        } else {
            Some(
                Cache::builder()
                    .max_capacity(capacity)
                    .time_to_live(ttl)
                    .build(),
            )
        };
        self
    }

    pub fn with_metrics(mut self, metrics: TieringMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Fetch a record by id, whatever tier holds its payload.
    ///
    /// Returns `NotFound` when the index has no entry, `IndexUnavailable`
    /// when the index cannot be read, and `TierUnavailable` when an archived
    /// payload cannot be fetched intact within the bulk retry budget.
    #[instrument(skip(self, id), fields(record_id = %id))]
    pub async fn get_record(&self, id: &RecordId) -> Result<RecordView, TierError> {
        let started = Instant::now();
        let result = self.resolve(id).await;

        if let Some(metrics) = &self.metrics {
            match &result {
                Ok(view) => metrics.record_retrieval(view.tier, started.elapsed()),
                Err(e) => metrics.record_retrieval_error(e),
            }
        }

        result
    }

    async fn resolve(&self, id: &RecordId) -> Result<RecordView, TierError> {
        let index = &self.index;
        let entry = call_with_retry(&self.index_retry, "index.get", move || index.get(id))
            .await
            .map_err(|source| TierError::IndexUnavailable {
                id: id.clone(),
                source,
            })?
            .ok_or_else(|| TierError::NotFound(id.clone()))?;

        let IndexEntry {
            id,
            timestamp,
            metadata,
            location,
        } = entry;

        let (payload, tier) = match location {
            Location::Inline { payload } => (payload, TierKind::Inline),
            Location::Archived { blob } => (self.fetch_archived(&id, &blob).await?, TierKind::Archived),
        };

        Ok(RecordView {
            id,
            timestamp,
            metadata,
            payload,
            tier,
        })
    }

    async fn fetch_archived(&self, id: &RecordId, blob: &BlobPointer) -> Result<Vec<u8>, TierError> {
        if let Some(cache) = &self.cache {
            let cached = cache.get(&blob.key).await;
            if let Some(metrics) = &self.metrics {
                metrics.record_cache(cached.is_some());
            }
            if let Some(bytes) = cached {
                debug!("Serving {} from cache", blob.key);
                return Ok(bytes.as_ref().clone());
            }
        }

        let bulk = &self.bulk;
        let key = &blob.key;

        // A missing or mismatched object is retried too: an index entry only
        // points at an object that was verified when it was archived.
        let bytes = call_with_retry_if(
            &self.bulk_retry,
            "bulk.get",
            move || async move {
                let bytes = bulk.get(key).await?;
                if blob.matches_bytes(&bytes) {
                    Ok(bytes)
                } else {
                    Err(StoreError::Corrupt(format!(
                        "{} is {} bytes / sha256 {}, index expects {} bytes / sha256 {}",
                        key,
                        bytes.len(),
                        Checksum::of(&bytes),
                        blob.size,
                        blob.sha256
                    )))
                }
            },
            |e| {
                e.is_transient() || matches!(e, StoreError::NotFound(_) | StoreError::Corrupt(_))
            },
        )
        .await
        .map_err(|source| {
            warn!("Archived payload {} unavailable: {}", key, source);
            TierError::TierUnavailable {
                id: id.clone(),
                source,
            }
        })?;

        if let Some(cache) = &self.cache {
            cache.insert(key.clone(), Arc::new(bytes.clone())).await;
        }

        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tiering::{Archiver, MemoryBulkStore, MemoryIndexStore};
    use crate::types::{Metadata, NewRecord};
    use chrono::Utc;

    fn fast_bulk_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 2,
            call_timeout_ms: 500,
            jitter: false,
        }
    }

    async fn archived_record(
        index: &Arc<MemoryIndexStore>,
        bulk: &Arc<MemoryBulkStore>,
        id: &str,
        payload: &[u8],
    ) -> RecordId {
        let mut metadata = Metadata::new();
        metadata.insert("customer".to_string(), serde_json::json!("c-1"));
        let entry = NewRecord::new(RecordId::parse(id).unwrap(), Utc::now(), metadata, payload.to_vec())
            .into_entry();
        index.put(&entry).await.unwrap();
        Archiver::new(index.clone(), bulk.clone())
            .archive_one(&entry)
            .await
            .unwrap();
        entry.id
    }

    #[tokio::test]
    async fn test_inline_and_archived_reads_look_the_same() {
        let index = Arc::new(MemoryIndexStore::new());
        let bulk = Arc::new(MemoryBulkStore::new());
        let router = RetrievalRouter::new(index.clone(), bulk.clone());

        let inline = NewRecord::new(
            RecordId::parse("inline-1").unwrap(),
            Utc::now(),
            Metadata::new(),
            b"recent".to_vec(),
        )
        .into_entry();
        index.put(&inline).await.unwrap();
        let archived_id = archived_record(&index, &bulk, "old-1", b"aged payload").await;

        let a = router.get_record(&inline.id).await.unwrap();
        assert_eq!(a.payload, b"recent".to_vec());
        assert_eq!(a.tier, TierKind::Inline);

        let b = router.get_record(&archived_id).await.unwrap();
        assert_eq!(b.payload, b"aged payload".to_vec());
        assert_eq!(b.tier, TierKind::Archived);
        assert_eq!(b.metadata["customer"], serde_json::json!("c-1"));
    }

    #[tokio::test]
    async fn test_missing_record_is_not_found() {
        let router = RetrievalRouter::new(
            Arc::new(MemoryIndexStore::new()),
            Arc::new(MemoryBulkStore::new()),
        );
        let result = router.get_record(&RecordId::parse("nope").unwrap()).await;
        assert!(matches!(result, Err(TierError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_corrupt_blob_is_tier_unavailable() {
        let index = Arc::new(MemoryIndexStore::new());
        let bulk = Arc::new(MemoryBulkStore::new());
        let id = archived_record(&index, &bulk, "old-1", b"aged payload").await;
        bulk.corrupt(&BlobKey::derive(&id), b"bit rot".to_vec()).await;

        let router = RetrievalRouter::new(index, bulk)
            .with_retry(RetryPolicy::no_retry(), fast_bulk_retry());
        let result = router.get_record(&id).await;
        assert!(matches!(
            result,
            Err(TierError::TierUnavailable {
                source: StoreError::Corrupt(_),
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_cache_serves_archived_payload() {
        let index = Arc::new(MemoryIndexStore::new());
        let bulk = Arc::new(MemoryBulkStore::new());
        let id = archived_record(&index, &bulk, "old-1", b"aged payload").await;

        let metrics = TieringMetrics::new(prometheus::Registry::new()).unwrap();
        let router = RetrievalRouter::new(index, bulk.clone())
            .with_retry(RetryPolicy::no_retry(), fast_bulk_retry())
            .with_cache(16, Duration::from_secs(60))
            .with_metrics(metrics.clone());

        router.get_record(&id).await.unwrap();
        // Second read must not need the bulk store at all
        bulk.delete(&BlobKey::derive(&id)).await.unwrap();
        let view = router.get_record(&id).await.unwrap();

        assert_eq!(view.payload, b"aged payload".to_vec());
        assert_eq!(metrics.cache_hits_total.get(), 1);
        assert_eq!(metrics.cache_misses_total.get(), 1);
    }
}
