//! Bulk Loader Main Entry Point
//!
//! Reads JSON-lines records from stdin and loads them into OpenSearch as one
//! transaction. The job file named by `LOADER_CONFIG` holds the loader
//! options and the record schema.

use std::env;

use bulk_loader::config::{connect_transport, units_from_env, JobConfig};
use bulk_loader::consumer::{read_units, JsonLinesDecoder};
use bulk_loader::{BulkLoader, LoadingError};
use dotenv::dotenv;
use tokio::io::BufReader;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Records per batch handed to a unit writer.
const INPUT_BATCH_RECORDS: usize = 1000;

/// Initialize tracing/logging.
fn init_tracing() -> Result<(), LoadingError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("bulk_loader=info,bulk_loader_repository=info"));

    let json = env::var("LOG_FORMAT")
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(true),
            )
            .try_init()
            .map_err(|e| LoadingError::config(e.to_string()))?;

        info!(
            service_name = "bulk-loader",
            service_version = env!("CARGO_PKG_VERSION"),
            "Tracing initialized with JSON format"
        );
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(true).pretty())
            .try_init()
            .map_err(|e| LoadingError::config(e.to_string()))?;

        info!(
            service_name = "bulk-loader",
            service_version = env!("CARGO_PKG_VERSION"),
            "Tracing initialized with console output"
        );
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), LoadingError> {
    // Load environment variables from .env file
    dotenv().ok();

    init_tracing()?;

    info!("Starting bulk loader");

    let job = JobConfig::from_env()?;
    let units = units_from_env()?;
    let transport = connect_transport(&job.loader)?;

    let decoder = JsonLinesDecoder::new(job.columns.clone());
    let input = read_units(
        BufReader::new(tokio::io::stdin()),
        &decoder,
        units,
        INPUT_BATCH_RECORDS,
    )
    .await?;

    let mut loader = BulkLoader::transaction(job.loader, job.columns, transport).await?;

    match loader.load_units(input).await {
        Ok(report) => {
            if report.failed_actions > 0 {
                warn!(
                    failed_actions = report.failed_actions,
                    "Some actions were rejected"
                );
            }
            info!(
                generation = %report.generation,
                alias = ?report.alias,
                records = report.records,
                actions = report.actions,
                batches = report.batches,
                failed_actions = report.failed_actions,
                retries = report.retries,
                peak_in_flight = report.peak_in_flight,
                deleted = ?report.deleted,
                "Bulk load completed successfully"
            );
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Bulk load failed");
            Err(e.into())
        }
    }
}
