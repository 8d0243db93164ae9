//! Metrics and monitoring for the tiering engine
//!
//! [`TieringMetrics`] holds the Prometheus series updated by sweeps and
//! retrievals. [`SweepMonitor`] checks each sweep report against thresholds
//! and keeps a short history of alerts.

use chrono::{DateTime, Utc};
use prometheus::{
    register_histogram_vec_with_registry, register_histogram_with_registry,
    register_int_counter_vec_with_registry, register_int_counter_with_registry,
    register_int_gauge_vec_with_registry, Encoder, Histogram, HistogramOpts, HistogramVec,
    IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::error::TierError;
use super::migration::SweepReport;
use super::traits::TierCounts;
use crate::types::TierKind;

const MAX_ALERTS: usize = 100;

/// Prometheus series for sweeps and retrievals
#[derive(Clone)]
pub struct TieringMetrics {
    pub sweeps_total: IntCounter,
    /// Records handled by sweeps, by outcome (scanned, archived, failed, skipped)
    pub sweep_records_total: IntCounterVec,
    pub sweep_duration_seconds: Histogram,
    pub dead_letters_total: IntCounter,
    /// Successful retrievals, by tier
    pub retrievals_total: IntCounterVec,
    /// Failed retrievals, by error kind
    pub retrieval_errors_total: IntCounterVec,
    pub retrieval_latency_seconds: HistogramVec,
    pub cache_hits_total: IntCounter,
    pub cache_misses_total: IntCounter,
    /// Record count per tier, refreshed from the index
    pub tier_records: IntGaugeVec,
    registry: Registry,
}

impl TieringMetrics {
    /// Create the metrics and register them with `registry`.
    ///
    /// A metric that fails to register (for example a name clash) is kept
    /// unregistered with a warning, so recording never fails.
    pub fn new(registry: Registry) -> prometheus::Result<Self> {
        let sweeps_total = counter(&registry, "tiering_sweeps_total", "Total migration sweeps run")?;

        let sweep_records_total = register_int_counter_vec_with_registry!(
            Opts::new(
                "tiering_sweep_records_total",
                "Records handled by migration sweeps, by outcome"
            ),
            &["outcome"],
            &registry
        )
        .or_else(|e| {
            warn!(error = %e, metric = "tiering_sweep_records_total", "Failed to register metric, using unregistered fallback");
            IntCounterVec::new(
                Opts::new("tiering_sweep_records_total_fallback", "fallback sweep record counter"),
                &["outcome"],
            )
        })?;

        let sweep_duration_seconds = register_histogram_with_registry!(
            HistogramOpts::new("tiering_sweep_duration_seconds", "Wall-clock duration of sweeps")
                .buckets(vec![0.1, 0.5, 1.0, 5.0, 30.0, 60.0, 300.0, 900.0]),
            &registry
        )
        .or_else(|e| {
            warn!(error = %e, metric = "tiering_sweep_duration_seconds", "Failed to register metric, using unregistered fallback");
            Histogram::with_opts(HistogramOpts::new(
                "tiering_sweep_duration_seconds_fallback",
                "fallback sweep duration histogram",
            ))
        })?;

        let dead_letters_total = counter(
            &registry,
            "tiering_dead_letters_total",
            "Records published to the dead-letter sink",
        )?;

        let retrievals_total = register_int_counter_vec_with_registry!(
            Opts::new("tiering_retrievals_total", "Successful record retrievals, by tier"),
            &["tier"],
            &registry
        )
        .or_else(|e| {
            warn!(error = %e, metric = "tiering_retrievals_total", "Failed to register metric, using unregistered fallback");
            IntCounterVec::new(
                Opts::new("tiering_retrievals_total_fallback", "fallback retrieval counter"),
                &["tier"],
            )
        })?;

        let retrieval_errors_total = register_int_counter_vec_with_registry!(
            Opts::new("tiering_retrieval_errors_total", "Failed record retrievals, by error kind"),
            &["kind"],
            &registry
        )
        .or_else(|e| {
            warn!(error = %e, metric = "tiering_retrieval_errors_total", "Failed to register metric, using unregistered fallback");
            IntCounterVec::new(
                Opts::new("tiering_retrieval_errors_total_fallback", "fallback retrieval error counter"),
                &["kind"],
            )
        })?;

        let retrieval_latency_seconds = register_histogram_vec_with_registry!(
            HistogramOpts::new("tiering_retrieval_latency_seconds", "Record retrieval latency, by tier")
                .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["tier"],
            &registry
        )
        .or_else(|e| {
            warn!(error = %e, metric = "tiering_retrieval_latency_seconds", "Failed to register metric, using unregistered fallback");
            HistogramVec::new(
                HistogramOpts::new(
                    "tiering_retrieval_latency_seconds_fallback",
                    "fallback retrieval latency histogram",
                ),
                &["tier"],
            )
        })?;

        let cache_hits_total = counter(
            &registry,
            "tiering_cache_hits_total",
            "Archived payloads served from the retrieval cache",
        )?;
        let cache_misses_total = counter(
            &registry,
            "tiering_cache_misses_total",
            "Archived payloads fetched from the bulk store",
        )?;

        let tier_records = register_int_gauge_vec_with_registry!(
            Opts::new("tiering_tier_records", "Records per tier"),
            &["tier"],
            &registry
        )
        .or_else(|e| {
            warn!(error = %e, metric = "tiering_tier_records", "Failed to register metric, using unregistered fallback");
            IntGaugeVec::new(
                Opts::new("tiering_tier_records_fallback", "fallback tier record gauge"),
                &["tier"],
            )
        })?;

        Ok(Self {
            sweeps_total,
            sweep_records_total,
            sweep_duration_seconds,
            dead_letters_total,
            retrievals_total,
            retrieval_errors_total,
            retrieval_latency_seconds,
            cache_hits_total,
            cache_misses_total,
            tier_records,
            registry,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_sweep(&self, report: &SweepReport) {
        self.sweeps_total.inc();
        for (outcome, count) in [
            ("scanned", report.scanned),
            ("archived", report.archived),
            ("failed", report.failed),
            ("skipped", report.skipped),
        ] {
            self.sweep_records_total
                .with_label_values(&[outcome])
                .inc_by(count);
        }
        self.sweep_duration_seconds
            .observe(report.duration_ms as f64 / 1000.0);
    }

    pub fn record_dead_letter(&self) {
        self.dead_letters_total.inc();
    }

    pub fn record_retrieval(&self, tier: TierKind, elapsed: Duration) {
        self.retrievals_total
            .with_label_values(&[tier.as_str()])
            .inc();
        self.retrieval_latency_seconds
            .with_label_values(&[tier.as_str()])
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_retrieval_error(&self, error: &TierError) {
        self.retrieval_errors_total
            .with_label_values(&[error.kind()])
            .inc();
    }

    pub fn record_cache(&self, hit: bool) {
        if hit {
            self.cache_hits_total.inc();
        } else {
            self.cache_misses_total.inc();
        }
    }

    pub fn set_tier_counts(&self, counts: &TierCounts) {
        self.tier_records
            .with_label_values(&[TierKind::Inline.as_str()])
            .set(counts.inline as i64);
        self.tier_records
            .with_label_values(&[TierKind::Archived.as_str()])
            .set(counts.archived as i64);
    }

    /// Render the registry in the Prometheus text format
    pub fn encode_text(&self) -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

fn counter(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntCounter> {
    register_int_counter_with_registry!(Opts::new(name, help), registry).or_else(|e| {
        warn!(error = %e, metric = name, "Failed to register metric, using unregistered fallback");
        IntCounter::new(format!("{}_fallback", name), help)
    })
}

/// Thresholds checked after every sweep
#[derive(Debug, Clone)]
pub struct SweepThresholds {
    /// Maximum acceptable `failed / scanned` (0.0 to 1.0)
    pub max_failure_ratio: f64,
    /// Raise an alert when a sweep stops on its time budget
    pub alert_on_budget_exhausted: bool,
}

impl Default for SweepThresholds {
    fn default() -> Self {
        Self {
            max_failure_ratio: 0.1,
            alert_on_budget_exhausted: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone)]
pub struct SweepAlert {
    pub severity: AlertSeverity,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Monitor for sweep outcomes
pub struct SweepMonitor {
    thresholds: SweepThresholds,
    alerts: Arc<RwLock<Vec<SweepAlert>>>,
}

impl SweepMonitor {
    pub fn new(thresholds: SweepThresholds) -> Self {
        Self {
            thresholds,
            alerts: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Check a finished sweep against the thresholds
    pub async fn check_report(&self, report: &SweepReport) {
        if report.scanned > 0 {
            let ratio = report.failed as f64 / report.scanned as f64;
            if report.failed == report.scanned {
                self.raise(
                    AlertSeverity::Critical,
                    format!("All {} candidates failed to archive", report.scanned),
                )
                .await;
            } else if ratio > self.thresholds.max_failure_ratio {
                self.raise(
                    AlertSeverity::Warning,
                    format!(
                        "Failure ratio {:.2}% exceeds threshold {:.2}% ({} of {})",
                        ratio * 100.0,
                        self.thresholds.max_failure_ratio * 100.0,
                        report.failed,
                        report.scanned
                    ),
                )
                .await;
            }
        }

        if !report.completed && self.thresholds.alert_on_budget_exhausted {
            self.raise(
                AlertSeverity::Info,
                format!(
                    "Sweep stopped on its time budget after {} pages; next sweep resumes from checkpoint",
                    report.pages
                ),
            )
            .await;
        }
    }

    /// Record a sweep that could not run to a report
    pub async fn record_failure(&self, error: &TierError) {
        self.raise(AlertSeverity::Critical, format!("Sweep aborted: {}", error))
            .await;
    }

    async fn raise(&self, severity: AlertSeverity, message: String) {
        warn!("Sweep alert ({:?}): {}", severity, message);

        let mut alerts = self.alerts.write().await;
        alerts.push(SweepAlert {
            severity,
            message,
            timestamp: Utc::now(),
        });

        // Keep only recent alerts
        if alerts.len() > MAX_ALERTS {
            let excess = alerts.len() - MAX_ALERTS;
            alerts.drain(0..excess);
        }
    }

    pub async fn get_alerts(&self) -> Vec<SweepAlert> {
        self.alerts.read().await.clone()
    }

    pub async fn clear_alerts(&self) {
        self.alerts.write().await.clear();
    }

    pub fn log_report_summary(&self, report: &SweepReport) {
        info!(
            "Sweep summary: {} scanned, {} archived, {} failed, {} skipped in {}ms",
            report.scanned, report.archived, report.failed, report.skipped, report.duration_ms
        );
    }
}

impl Default for SweepMonitor {
    fn default() -> Self {
        Self::new(SweepThresholds::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(scanned: u64, failed: u64, completed: bool) -> SweepReport {
        SweepReport {
            scanned,
            archived: scanned - failed,
            failed,
            completed,
            ..SweepReport::empty(Utc::now())
        }
    }

    #[test]
    fn test_metrics_register_and_encode() {
        let metrics = TieringMetrics::new(Registry::new()).unwrap();
        metrics.record_sweep(&report(10, 2, true));
        metrics.record_retrieval(TierKind::Archived, Duration::from_millis(12));
        metrics.record_cache(true);
        metrics.set_tier_counts(&TierCounts {
            inline: 5,
            archived: 7,
        });

        assert_eq!(metrics.sweeps_total.get(), 1);
        assert_eq!(
            metrics
                .sweep_records_total
                .with_label_values(&["archived"])
                .get(),
            8
        );

        let text = metrics.encode_text().unwrap();
        assert!(text.contains("tiering_sweeps_total 1"));
        assert!(text.contains("tiering_tier_records{tier=\"archived\"} 7"));
    }

    #[test]
    fn test_duplicate_registration_falls_back() {
        let registry = Registry::new();
        let _first = TieringMetrics::new(registry.clone()).unwrap();
        let second = TieringMetrics::new(registry).unwrap();

        second.sweeps_total.inc();
        assert_eq!(second.sweeps_total.get(), 1);
    }

    #[tokio::test]
    async fn test_monitor_alerts() {
        let monitor = SweepMonitor::default();

        monitor.check_report(&report(100, 1, true)).await;
        assert!(monitor.get_alerts().await.is_empty());

        monitor.check_report(&report(100, 30, true)).await;
        monitor.check_report(&report(4, 4, false)).await;

        let alerts = monitor.get_alerts().await;
        assert_eq!(alerts.len(), 3);
        assert_eq!(alerts[0].severity, AlertSeverity::Warning);
        assert_eq!(alerts[1].severity, AlertSeverity::Critical);
        assert_eq!(alerts[2].severity, AlertSeverity::Info);

        monitor.clear_alerts().await;
        assert!(monitor.get_alerts().await.is_empty());
    }

    #[tokio::test]
    async fn test_monitor_keeps_recent_alerts() {
        let monitor = SweepMonitor::default();
        for _ in 0..120 {
            monitor.check_report(&report(1, 1, true)).await;
        }
        assert_eq!(monitor.get_alerts().await.len(), MAX_ALERTS);
    }
}
