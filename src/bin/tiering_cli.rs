//! CLI for the billing-tiering engine
//!
//! Writes, reads and lists billing records and runs one-off migration
//! sweeps against the backends named in the service configuration.

use anyhow::{Context, Result};
use billing_tiering::tiering::{
    DeadLetterSink, MemoryDeadLetterSink, TieringService, TracingDeadLetterSink,
};
use billing_tiering::types::Metadata;
use billing_tiering::{NewRecord, OrchestratorConfig, RecordId, SystemInitializer};
use chrono::{DateTime, Utc};
use std::io::Read;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        print_usage(&args[0]);
        return Ok(());
    }

    let command = &args[1];

    match command.as_str() {
        "put" => {
            if args.len() < 5 {
                eprintln!(
                    "Usage: {} put <id> <timestamp> <payload_file|-> [metadata_json]",
                    args[0]
                );
                eprintln!(
                    "Example: {} put inv-2024-0001 2024-03-01T12:00:00Z invoice.pdf '{{\"customer\":\"acme\"}}'",
                    args[0]
                );
                return Ok(());
            }

            let id = RecordId::parse(args[2].as_str()).context("Invalid record id")?;
            let timestamp = parse_timestamp(&args[3])?;
            let payload = read_payload(&args[4])?;
            let metadata: Metadata = match args.get(5) {
                Some(raw) => serde_json::from_str(raw).context("Invalid metadata JSON")?,
                None => Metadata::new(),
            };

            let service = open_service().await?;
            let summary = service
                .write_record(NewRecord::new(id, timestamp, metadata, payload))
                .await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        "get" => {
            if args.len() < 3 {
                eprintln!("Usage: {} get <id> [--raw]", args[0]);
                return Ok(());
            }

            let id = RecordId::parse(args[2].as_str()).context("Invalid record id")?;
            let raw = args.iter().skip(3).any(|a| a == "--raw");

            let service = open_service().await?;
            let view = service.get_record(&id).await?;

            if raw {
                use std::io::Write;
                std::io::stdout().write_all(&view.payload)?;
            } else {
                let out = serde_json::json!({
                    "id": view.id,
                    "timestamp": view.timestamp,
                    "metadata": view.metadata,
                    "tier": view.tier,
                    "payload_bytes": view.payload.len(),
                    "payload": String::from_utf8_lossy(&view.payload),
                });
                println!("{}", serde_json::to_string_pretty(&out)?);
            }
        }
        "sweep" => {
            let dead_letters = Arc::new(MemoryDeadLetterSink::new());
            let service = open_service_with(dead_letters.clone()).await?;
            let report = service.run_sweep().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);

            for letter in dead_letters.letters().await {
                eprintln!(
                    "[dead letter] {} ({}): {}",
                    letter.id, letter.error_kind, letter.error
                );
            }
            for alert in service.alerts().await {
                eprintln!("[{:?}] {}", alert.severity, alert.message);
            }
        }
        "list" => {
            if args.len() < 4 {
                eprintln!("Usage: {} list <from> <to> [limit]", args[0]);
                eprintln!(
                    "Example: {} list 2024-01-01T00:00:00Z 2024-02-01T00:00:00Z 50",
                    args[0]
                );
                return Ok(());
            }

            let from = parse_timestamp(&args[2])?;
            let to = parse_timestamp(&args[3])?;
            let limit = match args.get(4) {
                Some(raw) => raw.parse::<usize>().context("Invalid limit")?,
                None => 100,
            };

            let service = open_service().await?;
            let rows = service.list_records(from, to, limit).await?;
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        "stats" => {
            let service = open_service().await?;
            let counts = service.stats().await?;
            println!("{}", serde_json::to_string_pretty(&counts)?);
        }
        _ => {
            eprintln!("Unknown command: {}", command);
            print_usage(&args[0]);
        }
    }

    Ok(())
}

fn print_usage(program: &str) {
    println!("Billing Tiering CLI");
    println!();
    println!("Usage: {} <command> [options]", program);
    println!();
    println!("Commands:");
    println!("  put <id> <timestamp> <payload_file|-> [metadata_json]");
    println!("                        Write a record into the inline tier");
    println!("  get <id> [--raw]      Fetch a record from whichever tier holds it");
    println!("  sweep                 Run one migration sweep and print the report");
    println!("  list <from> <to> [limit]");
    println!("                        List record metadata in a time range");
    println!("  stats                 Show record counts per tier");
    println!();
    println!("Timestamps are RFC 3339, e.g. 2024-03-01T12:00:00Z");
    println!("The configuration file is read from $TIERING_CONFIG or ./config.toml");
}

/// Load the configuration the daemon would use
fn load_config() -> Result<OrchestratorConfig> {
    let path = std::env::var("TIERING_CONFIG").unwrap_or_else(|_| "config.toml".to_string());
    OrchestratorConfig::load(&path)
}

async fn open_service() -> Result<Arc<TieringService>> {
    open_service_with(Arc::new(TracingDeadLetterSink)).await
}

async fn open_service_with(
    dead_letters: Arc<dyn DeadLetterSink>,
) -> Result<Arc<TieringService>> {
    let config = load_config()?;
    SystemInitializer::build_service_with_sink(&config, None, dead_letters).await
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("Invalid RFC 3339 timestamp: {}", raw))?;
    Ok(parsed.with_timezone(&Utc))
}

fn read_payload(source: &str) -> Result<Vec<u8>> {
    let mut payload = Vec::new();
    if source == "-" {
        std::io::stdin()
            .read_to_end(&mut payload)
            .context("Failed to read payload from stdin")?;
    } else {
        payload = std::fs::read(source)
            .with_context(|| format!("Failed to read payload file {}", source))?;
    }
    Ok(payload)
}
