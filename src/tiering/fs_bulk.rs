//! Filesystem Bulk Store
//!
//! One file per archived payload under a base directory. Writes go to a
//! temporary sibling first and are renamed into place, so a reader never
//! observes a partially written object.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::error::StoreError;
use super::traits::{BlobInfo, BulkStore, StorageClass};
use crate::types::{BlobKey, Checksum};

/// Bulk store writing objects as files under `base_path`
pub struct FsBulkStore {
    base_path: PathBuf,
}

impl FsBulkStore {
    /// Create a filesystem bulk store
    ///
    /// # Arguments
    /// * `base_path` - Directory holding archived objects; created if missing
    pub async fn new(base_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let base_path = base_path.as_ref().to_path_buf();
        info!("Initializing FsBulkStore at: {}", base_path.display());

        tokio::fs::create_dir_all(&base_path).await?;

        Ok(Self { base_path })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Resolve a key to a path, refusing anything that could escape the base directory
    fn object_path(&self, key: &BlobKey) -> Result<PathBuf, StoreError> {
        let raw = key.as_str();
        if raw.is_empty() || raw.starts_with('.') || raw.contains('/') || raw.contains('\\') {
            return Err(StoreError::InvalidInput(format!(
                "bulk key {:?} is not a plain file name",
                raw
            )));
        }
        Ok(self.base_path.join(raw))
    }

    fn temp_path(&self, key: &BlobKey) -> PathBuf {
        self.base_path
            .join(format!(".{}.tmp-{:016x}", key.as_str(), rand::random::<u64>()))
    }
}

#[async_trait]
impl BulkStore for FsBulkStore {
    async fn put(
        &self,
        key: &BlobKey,
        bytes: &[u8],
        class: StorageClass,
    ) -> Result<BlobInfo, StoreError> {
        let path = self.object_path(key)?;
        let temp = self.temp_path(key);

        if let Err(e) = tokio::fs::write(&temp, bytes).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e.into());
        }
        if let Err(e) = tokio::fs::rename(&temp, &path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e.into());
        }

        debug!(
            "Wrote object {} ({} bytes, requested class {})",
            path.display(),
            bytes.len(),
            class.as_str()
        );

        Ok(BlobInfo {
            key: key.clone(),
            size: bytes.len() as u64,
            sha256: Checksum::of(bytes),
            // The filesystem has no notion of storage classes
            storage_class: None,
        })
    }

    async fn head(&self, key: &BlobKey) -> Result<Option<BlobInfo>, StoreError> {
        let path = self.object_path(key)?;

        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(BlobInfo {
                key: key.clone(),
                size: bytes.len() as u64,
                sha256: Checksum::of(&bytes),
                storage_class: None,
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, key: &BlobKey) -> Result<Vec<u8>, StoreError> {
        let path = self.object_path(key)?;
        tokio::fs::read(&path).await.map_err(StoreError::from)
    }

    async fn delete(&self, key: &BlobKey) -> Result<bool, StoreError> {
        let path = self.object_path(key)?;

        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn backend_name(&self) -> &'static str {
        "filesystem"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RecordId;

    async fn test_store() -> FsBulkStore {
        let dir = std::env::temp_dir().join(format!("bulk_test_{}", rand::random::<u64>()));
        FsBulkStore::new(&dir).await.unwrap()
    }

    #[tokio::test]
    async fn test_fs_put_head_get() {
        let store = test_store().await;
        let key = BlobKey::derive(&RecordId::parse("inv-1").unwrap());

        let info = store
            .put(&key, b"archived payload", StorageClass::Infrequent)
            .await
            .unwrap();
        assert_eq!(info.size, 16);

        let head = store.head(&key).await.unwrap().unwrap();
        assert_eq!(head.sha256, Checksum::of(b"archived payload"));
        assert_eq!(store.get(&key).await.unwrap(), b"archived payload".to_vec());
    }

    #[tokio::test]
    async fn test_fs_overwrite_and_delete() {
        let store = test_store().await;
        let key = BlobKey::derive(&RecordId::parse("inv-2").unwrap());

        store.put(&key, b"first", StorageClass::Infrequent).await.unwrap();
        store.put(&key, b"second", StorageClass::Infrequent).await.unwrap();
        assert_eq!(store.get(&key).await.unwrap(), b"second".to_vec());

        assert!(store.delete(&key).await.unwrap());
        assert!(!store.delete(&key).await.unwrap());
        assert_eq!(store.head(&key).await.unwrap(), None);
        assert!(matches!(store.get(&key).await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_fs_rejects_path_like_keys() {
        let store = test_store().await;
        for raw in ["../escape.bin", ".hidden", "a/b.bin", ""] {
            let key = BlobKey::from_stored(raw);
            assert!(matches!(
                store.put(&key, b"x", StorageClass::Infrequent).await,
                Err(StoreError::InvalidInput(_))
            ));
        }
    }
}
