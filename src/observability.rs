//! Observability module - OpenTelemetry integration for tracing and metrics
//!
//! Sets up:
//! - a `tracing-subscriber` registry with an `EnvFilter` and fmt layer
//! - optionally, OTLP trace export (Jaeger or any OTLP collector)
//! - optionally, an OpenTelemetry meter provider exporting into a Prometheus
//!   registry, which the tiering metrics register into as well
//!
//! # Usage
//! ```no_run
//! use billing_tiering::observability::init_observability;
//!
//! #[tokio::main]
//! async fn main() {
//!     let guard = init_observability(None).expect("Failed to initialize observability");
//!
//!     // Register application metrics into guard.registry() ...
//!
//!     // Guard flushes traces on drop
//! }
//! ```

use anyhow::{Context, Result};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::{Protocol, WithExportConfig};
use opentelemetry_sdk::{
    metrics::SdkMeterProvider,
    runtime,
    trace::{Config, RandomIdGenerator, Sampler, TracerProvider},
    Resource,
};
use prometheus::{Encoder, Registry, TextEncoder};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Configuration for the observability system
#[derive(Debug, Clone)]
pub struct ObservabilityConfig {
    /// Service name for traces and metrics
    pub service_name: String,
    /// Service version
    pub service_version: String,
    /// Environment (dev, staging, prod)
    pub environment: String,
    /// OTLP endpoint for traces (e.g., "http://localhost:4317" for Jaeger)
    pub otlp_endpoint: String,
    /// Whether to enable trace export
    pub enable_tracing: bool,
    /// Whether to enable metrics export
    pub enable_metrics: bool,
    /// Sampling ratio (0.0 to 1.0)
    pub sampling_ratio: f64,
    /// Filter used when `RUST_LOG` is not set
    pub default_filter: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            service_name: "billing-tiering".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            environment: std::env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string()),
            otlp_endpoint: std::env::var("OTLP_ENDPOINT")
                .unwrap_or_else(|_| "http://localhost:4317".to_string()),
            enable_tracing: std::env::var("ENABLE_TRACING")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(true),
            enable_metrics: std::env::var("ENABLE_METRICS")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(true),
            sampling_ratio: std::env::var("TRACE_SAMPLING_RATIO")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1.0),
            default_filter: "info".to_string(),
        }
    }
}

/// Guard that owns the telemetry providers and flushes them on drop
pub struct ObservabilityGuard {
    registry: Registry,
    meter_provider: Option<SdkMeterProvider>,
    tracing_enabled: bool,
}

impl ObservabilityGuard {
    /// Guard for a process running without telemetry export
    pub fn disabled() -> Self {
        Self {
            registry: Registry::new(),
            meter_provider: None,
            tracing_enabled: false,
        }
    }

    /// Prometheus registry that application metrics should register into
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn metrics_text(&self) -> String {
        get_metrics(&self.registry)
    }
}

impl Drop for ObservabilityGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.meter_provider.take() {
            if let Err(e) = provider.shutdown() {
                tracing::warn!("Meter provider shutdown failed: {}", e);
            }
        }
        if self.tracing_enabled {
            // Flush remaining spans
            global::shutdown_tracer_provider();
            tracing::info!("OpenTelemetry tracer provider shutdown complete");
        }
    }
}

/// Initialize the observability system with tracing and metrics
///
/// # Arguments
/// * `config` - Optional configuration. If None, uses default configuration
///
/// # Returns
/// A guard holding the metrics registry; traces are flushed when it drops
pub fn init_observability(config: Option<ObservabilityConfig>) -> Result<ObservabilityGuard> {
    let config = config.unwrap_or_default();

    let resource = Resource::new(vec![
        KeyValue::new("service.name", config.service_name.clone()),
        KeyValue::new("service.version", config.service_version.clone()),
        KeyValue::new("deployment.environment", config.environment.clone()),
    ]);

    let registry = Registry::new();

    let meter_provider = if config.enable_metrics {
        Some(init_metrics(&registry, resource.clone())?)
    } else {
        None
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_filter));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    if config.enable_tracing {
        let provider = init_tracing(&config, resource)?;
        let tracer = provider.tracer(config.service_name.clone());
        global::set_tracer_provider(provider);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(tracing_opentelemetry::layer().with_tracer(tracer))
            .try_init()
            .context("Failed to initialize tracing subscriber")?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()
            .context("Failed to initialize tracing subscriber")?;
    }

    tracing::info!(
        "Observability initialized: service={}, version={}, environment={}, tracing={}, metrics={}",
        config.service_name,
        config.service_version,
        config.environment,
        config.enable_tracing,
        config.enable_metrics
    );

    Ok(ObservabilityGuard {
        registry,
        meter_provider,
        tracing_enabled: config.enable_tracing,
    })
}

/// Build the OTLP trace pipeline
fn init_tracing(config: &ObservabilityConfig, resource: Resource) -> Result<TracerProvider> {
    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(&config.otlp_endpoint)
        .with_protocol(Protocol::Grpc)
        .with_timeout(Duration::from_secs(3));

    let tracer_provider = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(exporter)
        .with_trace_config(
            Config::default()
                .with_sampler(Sampler::TraceIdRatioBased(config.sampling_ratio))
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(resource),
        )
        .install_batch(runtime::Tokio)
        .context("Failed to install OTLP tracer")?;

    Ok(tracer_provider)
}

/// Route OpenTelemetry metrics into `registry` through the Prometheus exporter
fn init_metrics(registry: &Registry, resource: Resource) -> Result<SdkMeterProvider> {
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .build()
        .context("Failed to create Prometheus exporter")?;

    let provider = SdkMeterProvider::builder()
        .with_reader(exporter)
        .with_resource(resource)
        .build();
    global::set_meter_provider(provider.clone());

    Ok(provider)
}

/// Render `registry` in the Prometheus text format
pub fn get_metrics(registry: &Registry) -> String {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::new();
    }

    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_custom_config() {
        let config = ObservabilityConfig {
            service_name: "test-service".to_string(),
            service_version: "1.0.0".to_string(),
            environment: "test".to_string(),
            otlp_endpoint: "http://test:4317".to_string(),
            enable_tracing: false,
            enable_metrics: true,
            sampling_ratio: 0.5,
            default_filter: "debug".to_string(),
        };

        assert_eq!(config.service_name, "test-service");
        assert!(!config.enable_tracing);
        assert_eq!(config.sampling_ratio, 0.5);
    }

    #[test]
    fn test_disabled_guard_renders_empty_registry() {
        let guard = ObservabilityGuard::disabled();
        assert!(guard.metrics_text().is_empty());
    }
}
