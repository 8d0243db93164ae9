//! In-memory bulk store

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::debug;

use super::error::StoreError;
use super::traits::{BlobInfo, BulkStore, StorageClass};
use crate::types::{BlobKey, Checksum};

#[derive(Debug, Clone)]
struct StoredObject {
    bytes: Vec<u8>,
    class: StorageClass,
    sha256: Checksum,
}

impl StoredObject {
    fn info(&self, key: &BlobKey) -> BlobInfo {
        BlobInfo {
            key: key.clone(),
            size: self.bytes.len() as u64,
            sha256: self.sha256.clone(),
            storage_class: Some(self.class),
        }
    }
}

/// Bulk store backed by process memory.
///
/// Counts successful puts so callers can check that archival never uploads
/// the same payload twice.
#[derive(Debug, Default)]
pub struct MemoryBulkStore {
    objects: RwLock<HashMap<BlobKey, StoredObject>>,
    puts: AtomicU64,
}

impl MemoryBulkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `put` calls so far
    pub fn put_count(&self) -> u64 {
        self.puts.load(Ordering::Relaxed)
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }

    pub async fn storage_class_of(&self, key: &BlobKey) -> Option<StorageClass> {
        self.objects.read().await.get(key).map(|o| o.class)
    }

    /// Replace an object's bytes without touching its recorded checksum.
    /// Simulates bit rot for integrity tests.
    pub async fn corrupt(&self, key: &BlobKey, bytes: Vec<u8>) -> bool {
        match self.objects.write().await.get_mut(key) {
            Some(object) => {
                object.bytes = bytes;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl BulkStore for MemoryBulkStore {
    async fn put(
        &self,
        key: &BlobKey,
        bytes: &[u8],
        class: StorageClass,
    ) -> Result<BlobInfo, StoreError> {
        let object = StoredObject {
            bytes: bytes.to_vec(),
            class,
            sha256: Checksum::of(bytes),
        };
        let info = object.info(key);

        self.objects.write().await.insert(key.clone(), object);
        self.puts.fetch_add(1, Ordering::Relaxed);

        debug!("Stored object {} ({} bytes, {})", key, bytes.len(), class.as_str());
        Ok(info)
    }

    async fn head(&self, key: &BlobKey) -> Result<Option<BlobInfo>, StoreError> {
        Ok(self.objects.read().await.get(key).map(|o| o.info(key)))
    }

    async fn get(&self, key: &BlobKey) -> Result<Vec<u8>, StoreError> {
        self.objects
            .read()
            .await
            .get(key)
            .map(|o| o.bytes.clone())
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn delete(&self, key: &BlobKey) -> Result<bool, StoreError> {
        Ok(self.objects.write().await.remove(key).is_some())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RecordId;

    fn key(id: &str) -> BlobKey {
        BlobKey::derive(&RecordId::parse(id).unwrap())
    }

    #[tokio::test]
    async fn test_put_head_get_delete() {
        let store = MemoryBulkStore::new();
        let k = key("inv-1");

        let info = store.put(&k, b"hello", StorageClass::Infrequent).await.unwrap();
        assert_eq!(info.size, 5);
        assert_eq!(info.sha256, Checksum::of(b"hello"));
        assert_eq!(store.head(&k).await.unwrap(), Some(info));
        assert_eq!(store.get(&k).await.unwrap(), b"hello".to_vec());
        assert_eq!(store.put_count(), 1);

        assert!(store.delete(&k).await.unwrap());
        assert!(!store.delete(&k).await.unwrap());
        assert!(matches!(store.get(&k).await, Err(StoreError::NotFound(_))));
        assert_eq!(store.head(&k).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_corrupt_keeps_recorded_checksum() {
        let store = MemoryBulkStore::new();
        let k = key("inv-2");
        store.put(&k, b"original", StorageClass::Frequent).await.unwrap();

        assert!(store.corrupt(&k, b"tampered".to_vec()).await);
        assert_eq!(store.get(&k).await.unwrap(), b"tampered".to_vec());
        assert_eq!(
            store.head(&k).await.unwrap().unwrap().sha256,
            Checksum::of(b"original")
        );
        assert_eq!(store.storage_class_of(&k).await, Some(StorageClass::Frequent));
    }
}
