//! Orchestrator configuration and coordination for the billing-tiering service
//!
//! This module provides configuration management, backend construction and
//! graceful shutdown coordination for the daemon and the CLI.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use crate::tiering::{
    BulkStore, ChannelDeadLetterSink, CheckpointStore, DeadLetter, DeadLetterSink,
    FileCheckpointStore, FsBulkStore, IndexStore, MemoryBulkStore, MemoryCheckpointStore,
    MemoryIndexStore, SqliteIndexStore, StorageClass, TieringConfig, TieringMetrics,
    TieringService,
};
use crate::utils::RetryPolicy;

/// Main configuration for the billing-tiering service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub log_level: String,
    /// Where an interrupted sweep keeps its page token (in memory if unset)
    pub checkpoint_path: Option<String>,
    pub dead_letter_buffer: usize,
    pub index: IndexBackendConfig,
    pub bulk: BulkBackendConfig,
    pub tiering: TieringConfig,
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexBackend {
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexBackendConfig {
    pub backend: IndexBackend,
    pub db_path: String,
    pub pool_size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkBackend {
    Memory,
    Filesystem,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkBackendConfig {
    pub backend: BulkBackend,
    pub base_path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "RetryPolicy::index_default")]
    pub index: RetryPolicy,
    #[serde(default = "RetryPolicy::bulk_default")]
    pub bulk: RetryPolicy,
}

impl Default for IndexBackendConfig {
    fn default() -> Self {
        Self {
            backend: IndexBackend::Sqlite,
            db_path: "billing_index.db".to_string(),
            pool_size: 10,
        }
    }
}

impl Default for BulkBackendConfig {
    fn default() -> Self {
        Self {
            backend: BulkBackend::Filesystem,
            base_path: "./bulk_store".to_string(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            index: RetryPolicy::index_default(),
            bulk: RetryPolicy::bulk_default(),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            checkpoint_path: Some("sweep_checkpoint.json".to_string()),
            dead_letter_buffer: 1024,
            index: IndexBackendConfig::default(),
            bulk: BulkBackendConfig::default(),
            tiering: TieringConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Load `path` if it exists, otherwise defaults plus environment overrides.
    ///
    /// A file that exists but does not parse or validate is an error.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            return Self::from_toml_file(path);
        }

        let mut config = OrchestratorConfig::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config: OrchestratorConfig =
            toml::from_str(&contents).context("Failed to parse config file")?;

        config.apply_env_overrides()?;
        config.validate()?;

        Ok(config)
    }

    /// Override selected settings from environment variables
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(days) = std::env::var("ARCHIVE_AFTER_DAYS") {
            self.tiering.archive_after_days = days
                .parse()
                .with_context(|| format!("ARCHIVE_AFTER_DAYS is not an integer: {}", days))?;
        }
        if let Ok(db_path) = std::env::var("INDEX_DB_PATH") {
            self.index.db_path = db_path;
        }
        if let Ok(base_path) = std::env::var("BULK_BASE_PATH") {
            self.bulk.base_path = base_path;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.tiering
            .validate()
            .map_err(anyhow::Error::msg)
            .context("Invalid [tiering] section")?;
        self.retry
            .index
            .validate()
            .map_err(anyhow::Error::msg)
            .context("Invalid [retry.index] section")?;
        self.retry
            .bulk
            .validate()
            .map_err(anyhow::Error::msg)
            .context("Invalid [retry.bulk] section")?;
        if self.index.backend == IndexBackend::Sqlite && self.index.db_path.is_empty() {
            anyhow::bail!("index.db_path must be set for the sqlite backend");
        }
        if self.bulk.backend == BulkBackend::Filesystem && self.bulk.base_path.is_empty() {
            anyhow::bail!("bulk.base_path must be set for the filesystem backend");
        }
        Ok(())
    }

    pub fn to_toml_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Plain fmt logging, for when full observability is not initialized
    pub fn init_logging(&self) {
        let level = match self.log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        };
        let _ = tracing_subscriber::fmt().with_max_level(level).try_init();
    }

    pub fn archive_storage_class(&self) -> StorageClass {
        self.tiering.archive_storage_class
    }
}

/// Coordinates graceful shutdown of background tasks
pub struct ShutdownCoordinator {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            handles: Vec::new(),
        }
    }

    /// Token that background tasks watch for shutdown
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn add_handle(&mut self, handle: JoinHandle<()>) {
        self.handles.push(handle);
    }

    /// Signal every task and wait for it to finish
    pub async fn shutdown(self) {
        tracing::info!(
            "Initiating graceful shutdown of {} components",
            self.handles.len()
        );
        self.token.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::warn!("Background task ended abnormally: {}", e);
            }
        }
        tracing::info!("All components shut down successfully");
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// A constructed service plus the receiving end of its dead-letter channel
pub struct ServiceHandles {
    pub service: Arc<TieringService>,
    pub dead_letters: mpsc::Receiver<DeadLetter>,
}

/// System initializer helper
pub struct SystemInitializer;

impl SystemInitializer {
    pub async fn init_index(config: &IndexBackendConfig) -> Result<Arc<dyn IndexStore>> {
        let index: Arc<dyn IndexStore> = match config.backend {
            IndexBackend::Memory => Arc::new(MemoryIndexStore::new()),
            IndexBackend::Sqlite => Arc::new(
                SqliteIndexStore::new(&config.db_path, config.pool_size)
                    .await
                    .with_context(|| format!("Failed to open index at {}", config.db_path))?,
            ),
        };
        Ok(index)
    }

    pub async fn init_bulk(config: &BulkBackendConfig) -> Result<Arc<dyn BulkStore>> {
        let bulk: Arc<dyn BulkStore> = match config.backend {
            BulkBackend::Memory => Arc::new(MemoryBulkStore::new()),
            BulkBackend::Filesystem => Arc::new(
                FsBulkStore::new(&config.base_path)
                    .await
                    .with_context(|| format!("Failed to open bulk store at {}", config.base_path))?,
            ),
        };
        Ok(bulk)
    }

    pub fn init_checkpoints(config: &OrchestratorConfig) -> Arc<dyn CheckpointStore> {
        match &config.checkpoint_path {
            Some(path) => Arc::new(FileCheckpointStore::new(path)),
            None => Arc::new(MemoryCheckpointStore::new()),
        }
    }

    /// Build the tiering service from configuration, with dead letters on a channel
    pub async fn build_service(
        config: &OrchestratorConfig,
        metrics: Option<TieringMetrics>,
    ) -> Result<ServiceHandles> {
        let (sink, dead_letters) = ChannelDeadLetterSink::new(config.dead_letter_buffer);
        let service = Self::build_service_with_sink(config, metrics, Arc::new(sink)).await?;

        Ok(ServiceHandles {
            service,
            dead_letters,
        })
    }

    /// Build the tiering service publishing dead letters to `sink`
    pub async fn build_service_with_sink(
        config: &OrchestratorConfig,
        metrics: Option<TieringMetrics>,
        sink: Arc<dyn DeadLetterSink>,
    ) -> Result<Arc<TieringService>> {
        let index = Self::init_index(&config.index).await?;
        let bulk = Self::init_bulk(&config.bulk).await?;

        let mut builder = TieringService::builder(index, bulk)
            .config(config.tiering.clone())
            .retry(config.retry.index.clone(), config.retry.bulk.clone())
            .dead_letters(sink)
            .checkpoints(Self::init_checkpoints(config));
        if let Some(metrics) = metrics {
            builder = builder.metrics(metrics);
        }

        Ok(Arc::new(builder.build()?))
    }
}
