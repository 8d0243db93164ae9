//! Main entry point for the billing-tiering daemon
//! Loads configuration, starts the scheduled migration sweeps and drains
//! dead letters until Ctrl-C.

use anyhow::{Context, Result};
use billing_tiering::observability::{init_observability, ObservabilityConfig, ObservabilityGuard};
use billing_tiering::tiering::TieringMetrics;
use billing_tiering::{OrchestratorConfig, ShutdownCoordinator, SystemInitializer};

#[tokio::main]
async fn main() -> Result<()> {
    let config_path =
        std::env::var("TIERING_CONFIG").unwrap_or_else(|_| "config.toml".to_string());

    // A config file that exists but is invalid stops startup
    let from_file = std::path::Path::new(&config_path).exists();
    let config = OrchestratorConfig::load(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path))?;

    // Initialize observability first (before regular logging)
    let observability = init_observability(Some(ObservabilityConfig {
        enable_tracing: std::env::var("ENABLE_TRACING")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false), // Disabled by default to avoid dependency on a collector
        default_filter: config.log_level.clone(),
        ..Default::default()
    }))
    .unwrap_or_else(|e| {
        eprintln!("Warning: Failed to initialize observability: {}", e);
        eprintln!("Continuing without OpenTelemetry export...");
        config.init_logging();
        ObservabilityGuard::disabled()
    });

    if from_file {
        tracing::info!("Loaded config from {}", config_path);
    } else {
        tracing::warn!("No config file at {}, using defaults", config_path);
    }

    tracing::info!("Starting billing-tiering service");

    let metrics = TieringMetrics::new(observability.registry().clone())?;
    let handles = SystemInitializer::build_service(&config, Some(metrics)).await?;
    let service = handles.service;
    let mut dead_letters = handles.dead_letters;

    let mut shutdown = ShutdownCoordinator::new();

    shutdown.add_handle(service.clone().start_maintenance_loop(shutdown.token()));

    let token = shutdown.token();
    shutdown.add_handle(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                letter = dead_letters.recv() => match letter {
                    Some(letter) => tracing::error!(
                        record_id = %letter.id,
                        error_kind = %letter.error_kind,
                        "Dead letter: {}",
                        letter.error
                    ),
                    None => break,
                },
            }
        }
    }));

    match service.stats().await {
        Ok(counts) => tracing::info!(
            "Index holds {} records ({} inline, {} archived)",
            counts.total(),
            counts.inline,
            counts.archived
        ),
        Err(e) => tracing::warn!("Could not read tier counts: {}", e),
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    shutdown.shutdown().await;
    tracing::debug!("Final metrics:\n{}", observability.metrics_text());

    Ok(())
}
