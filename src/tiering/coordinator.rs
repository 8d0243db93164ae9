//! Tiering Service
//!
//! Wires the index, the bulk store, the migration engine and the retrieval
//! router into one handle: ingestion, reads, listings, sweeps and the
//! background maintenance loop.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::checkpoint::CheckpointStore;
use super::dead_letter::DeadLetterSink;
use super::error::{StoreError, TierError};
use super::metrics::{SweepAlert, SweepMonitor, SweepThresholds, TieringMetrics};
use super::migration::{MigrationEngine, SweepReport};
use super::router::RetrievalRouter;
use super::traits::{BulkStore, IndexStore, StorageClass, TierCounts};
use crate::types::{NewRecord, RecordId, RecordSummary, RecordView};
use crate::utils::{call_with_retry, Clock, RetryPolicy, SystemClock};

/// Upper bound for `archive_after_days` (about a century)
pub const MAX_ARCHIVE_AFTER_DAYS: i64 = 36_500;

/// Configuration for tiering behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TieringConfig {
    /// Records older than this are archived
    pub archive_after_days: i64,

    /// Candidates fetched per index page
    pub batch_size: usize,

    /// Archive-one calls in flight per page
    pub sweep_concurrency: usize,

    /// Wall-clock budget per sweep (seconds, 0 = unbounded)
    pub sweep_budget_secs: u64,

    /// Interval between scheduled sweeps (seconds)
    pub sweep_interval_secs: u64,

    pub archive_storage_class: StorageClass,

    /// Archived payloads kept in the retrieval cache (0 disables it)
    pub cache_capacity: u64,

    pub cache_ttl_secs: u64,

    /// Failure ratio above which a sweep raises an alert (0.0 to 1.0)
    pub max_failure_ratio: f64,
}

impl Default for TieringConfig {
    fn default() -> Self {
        Self {
            archive_after_days: 90,
            batch_size: 100,
            sweep_concurrency: 8,
            sweep_budget_secs: 300,    // 5 minutes
            sweep_interval_secs: 3600, // 1 hour
            archive_storage_class: StorageClass::Infrequent,
            cache_capacity: 1000,
            cache_ttl_secs: 300,
            max_failure_ratio: 0.1,
        }
    }
}

impl TieringConfig {
    pub fn archive_after(&self) -> chrono::Duration {
        chrono::Duration::try_days(self.archive_after_days).unwrap_or(chrono::Duration::MAX)
    }

    pub fn sweep_budget(&self) -> Option<Duration> {
        (self.sweep_budget_secs > 0).then(|| Duration::from_secs(self.sweep_budget_secs))
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.archive_after_days <= 0 {
            return Err("archive_after_days must be positive".to_string());
        }
        if self.archive_after_days > MAX_ARCHIVE_AFTER_DAYS {
            return Err(format!(
                "archive_after_days must be at most {}",
                MAX_ARCHIVE_AFTER_DAYS
            ));
        }
        if self.batch_size == 0 {
            return Err("batch_size must be at least 1".to_string());
        }
        if self.sweep_concurrency == 0 {
            return Err("sweep_concurrency must be at least 1".to_string());
        }
        if self.sweep_interval_secs == 0 {
            return Err("sweep_interval_secs must be positive".to_string());
        }
        if !(0.0..=1.0).contains(&self.max_failure_ratio) {
            return Err(format!(
                "max_failure_ratio {} is outside 0.0..=1.0",
                self.max_failure_ratio
            ));
        }
        Ok(())
    }
}

/// Builder for [`TieringService`]
pub struct TieringServiceBuilder {
    index: Arc<dyn IndexStore>,
    bulk: Arc<dyn BulkStore>,
    clock: Arc<dyn Clock>,
    config: TieringConfig,
    index_retry: RetryPolicy,
    bulk_retry: RetryPolicy,
    dead_letters: Option<Arc<dyn DeadLetterSink>>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    metrics: Option<TieringMetrics>,
}

impl TieringServiceBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(mut self, config: TieringConfig) -> Self {
        self.config = config;
        self
    }

    pub fn retry(mut self, index_retry: RetryPolicy, bulk_retry: RetryPolicy) -> Self {
        self.index_retry = index_retry;
        self.bulk_retry = bulk_retry;
        self
    }

    pub fn dead_letters(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = Some(sink);
        self
    }

    pub fn checkpoints(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    pub fn metrics(mut self, metrics: TieringMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> Result<TieringService> {
        self.config
            .validate()
            .map_err(anyhow::Error::msg)
            .context("Invalid tiering configuration")?;
        self.index_retry
            .validate()
            .map_err(anyhow::Error::msg)
            .context("Invalid index retry policy")?;
        self.bulk_retry
            .validate()
            .map_err(anyhow::Error::msg)
            .context("Invalid bulk retry policy")?;

        let mut engine = MigrationEngine::new(self.index.clone(), self.bulk.clone(), self.clock)
            .with_retry(self.index_retry.clone(), self.bulk_retry.clone())
            .with_storage_class(self.config.archive_storage_class)
            .with_concurrency(self.config.sweep_concurrency)
            .with_budget(self.config.sweep_budget());
        if let Some(sink) = self.dead_letters {
            engine = engine.with_dead_letters(sink);
        }
        if let Some(store) = self.checkpoints {
            engine = engine.with_checkpoints(store);
        }

        let mut router = RetrievalRouter::new(self.index.clone(), self.bulk)
            .with_retry(self.index_retry.clone(), self.bulk_retry)
            .with_cache(
                self.config.cache_capacity,
                Duration::from_secs(self.config.cache_ttl_secs),
            );

        if let Some(metrics) = &self.metrics {
            engine = engine.with_metrics(metrics.clone());
            router = router.with_metrics(metrics.clone());
        }

        let monitor = SweepMonitor::new(SweepThresholds {
            max_failure_ratio: self.config.max_failure_ratio,
            ..SweepThresholds::default()
        });

        info!(
            "Tiering service ready: index={}, archive after {} days, batch {}, concurrency {}",
            self.index.backend_name(),
            self.config.archive_after_days,
            self.config.batch_size,
            self.config.sweep_concurrency
        );

        Ok(TieringService {
            index: self.index,
            engine,
            router,
            monitor,
            metrics: self.metrics,
            index_retry: self.index_retry,
            config: self.config,
        })
    }
}

/// Entry point for the tiering engine
pub struct TieringService {
    index: Arc<dyn IndexStore>,
    engine: MigrationEngine,
    router: RetrievalRouter,
    monitor: SweepMonitor,
    metrics: Option<TieringMetrics>,
    index_retry: RetryPolicy,
    config: TieringConfig,
}

impl TieringService {
    pub fn builder(index: Arc<dyn IndexStore>, bulk: Arc<dyn BulkStore>) -> TieringServiceBuilder {
        TieringServiceBuilder {
            index,
            bulk,
            clock: Arc::new(SystemClock),
            config: TieringConfig::default(),
            index_retry: RetryPolicy::index_default(),
            bulk_retry: RetryPolicy::bulk_default(),
            dead_letters: None,
            checkpoints: None,
            metrics: None,
        }
    }

    pub fn config(&self) -> &TieringConfig {
        &self.config
    }

    pub fn metrics(&self) -> Option<&TieringMetrics> {
        self.metrics.as_ref()
    }

    /// Store a new record inline.
    ///
    /// Writing the exact same record again is accepted, so a producer may
    /// retry a write whose acknowledgement it lost. A different record under
    /// an existing id is rejected with `DuplicateId`.
    pub async fn write_record(&self, record: NewRecord) -> Result<RecordSummary, TierError> {
        record.validate()?;
        let entry = record.into_entry();

        let index = &self.index;
        let new_entry = &entry;
        match call_with_retry(&self.index_retry, "index.put", move || index.put(new_entry)).await {
            Ok(()) => {
                debug!("Stored record {} inline", entry.id);
                Ok(entry.summary())
            }
            Err(StoreError::AlreadyExists(_)) => {
                let id = &entry.id;
                let existing = call_with_retry(&self.index_retry, "index.get", move || index.get(id))
                    .await
                    .map_err(|source| TierError::IndexUnavailable {
                        id: entry.id.clone(),
                        source,
                    })?;
                match existing {
                    Some(current) if current == entry => Ok(entry.summary()),
                    _ => Err(TierError::DuplicateId(entry.id.clone())),
                }
            }
            Err(source) => Err(TierError::IndexUnavailable {
                id: entry.id.clone(),
                source,
            }),
        }
    }

    pub async fn get_record(&self, id: &RecordId) -> Result<RecordView, TierError> {
        self.router.get_record(id).await
    }

    /// Run one sweep with the configured batch size and age threshold
    pub async fn run_sweep(&self) -> Result<SweepReport, TierError> {
        self.run_sweep_with(self.config.batch_size, self.config.archive_after())
            .await
    }

    pub async fn run_sweep_with(
        &self,
        batch_size: usize,
        archive_after: chrono::Duration,
    ) -> Result<SweepReport, TierError> {
        match self.engine.run_sweep(batch_size, archive_after).await {
            Ok(report) => {
                self.monitor.check_report(&report).await;
                if report.scanned > 0 {
                    self.refresh_tier_gauges().await;
                }
                Ok(report)
            }
            Err(e) => {
                self.monitor.record_failure(&e).await;
                Err(e)
            }
        }
    }

    /// Metadata for records with `from <= timestamp < to`, without touching bulk storage
    pub async fn list_records(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RecordSummary>, TierError> {
        let index = &self.index;
        call_with_retry(&self.index_retry, "index.list_range", move || {
            index.list_range(from, to, limit)
        })
        .await
        .map_err(TierError::ScanFailed)
    }

    pub async fn stats(&self) -> Result<TierCounts, TierError> {
        let index = &self.index;
        let counts = call_with_retry(&self.index_retry, "index.tier_counts", move || {
            index.tier_counts()
        })
        .await
        .map_err(TierError::ScanFailed)?;

        if let Some(metrics) = &self.metrics {
            metrics.set_tier_counts(&counts);
        }
        Ok(counts)
    }

    pub async fn alerts(&self) -> Vec<SweepAlert> {
        self.monitor.get_alerts().await
    }

    async fn refresh_tier_gauges(&self) {
        if self.metrics.is_none() {
            return;
        }
        if let Err(e) = self.stats().await {
            debug!("Could not refresh tier gauges: {}", e);
        }
    }

    /// Run sweeps on the configured interval until `shutdown` fires
    pub fn start_maintenance_loop(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let interval = Duration::from_secs(self.config.sweep_interval_secs);

        info!(
            "Starting tiering maintenance loop (interval: {}s)",
            self.config.sweep_interval_secs
        );

        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("Tiering maintenance loop stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        match self.run_sweep().await {
                            Ok(report) => self.monitor.log_report_summary(&report),
                            Err(e) => warn!("Scheduled sweep failed: {}", e),
                        }
                    }
                }
            }
        })
    }
}
