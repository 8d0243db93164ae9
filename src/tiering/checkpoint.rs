//! Sweep checkpoints
//!
//! The migration engine saves its page token after every page so a sweep cut
//! short by its time budget (or a crash) resumes where it stopped.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::debug;

use super::error::StoreError;
use super::traits::PageToken;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepCheckpoint {
    pub token: PageToken,
    pub saved_at: DateTime<Utc>,
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self) -> Result<Option<SweepCheckpoint>, StoreError>;
    async fn save(&self, checkpoint: &SweepCheckpoint) -> Result<(), StoreError>;
    /// Forget the checkpoint once a sweep completes
    async fn clear(&self) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    current: RwLock<Option<SweepCheckpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self) -> Result<Option<SweepCheckpoint>, StoreError> {
        Ok(self.current.read().await.clone())
    }

    async fn save(&self, checkpoint: &SweepCheckpoint) -> Result<(), StoreError> {
        *self.current.write().await = Some(checkpoint.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        *self.current.write().await = None;
        Ok(())
    }
}

/// Checkpoint persisted as a JSON file
pub struct FileCheckpointStore {
    path: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self) -> Result<Option<SweepCheckpoint>, StoreError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => serde_json::from_str(&content)
                .map(Some)
                .map_err(|e| StoreError::Corrupt(format!("{}: {}", self.path.display(), e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, checkpoint: &SweepCheckpoint) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(checkpoint)
            .map_err(|e| StoreError::InvalidInput(e.to_string()))?;

        let mut temp = self.path.clone().into_os_string();
        temp.push(".tmp");
        tokio::fs::write(&temp, content).await?;
        tokio::fs::rename(&temp, &self.path).await?;

        debug!(
            "Saved sweep checkpoint after {} @ {}",
            checkpoint.token.after_id, checkpoint.token.after_timestamp_ms
        );
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
