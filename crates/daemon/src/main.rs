//! Courier - Main Entry Point
//! Runs a competing-consumer pipeline on the in-process simulator

mod pipeline;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use courier_core::config::ConnectionConfig;
use courier_sim::{DomainRegistry, SimOptions};

use pipeline::{Pipeline, PipelineSettings};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Initialize logging
    let log_format = std::env::var("COURIER_LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("courier=info"))?;

    match log_format.as_str() {
        "json" => {
            // Production: JSON structured logging
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json())
                .init();
        }
        _ => {
            // Development: Pretty formatting with colors
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().pretty())
                .init();
        }
    }

    info!("Courier v{} starting...", VERSION);

    // 2. Load configuration
    let config = ConnectionConfig::from_env()?;
    let settings = PipelineSettings::from_env()?;
    info!(
        parallelism = config.parallelism,
        messages = settings.messages,
        workers = settings.workers,
        "Configuration loaded"
    );

    // 3. Wire the simulated bus
    let registry = DomainRegistry::new();
    let pipeline = Pipeline::start(&registry, SimOptions::from_config(&config), &settings).await?;
    pipeline.publish_all(settings.messages).await?;

    info!("Pipeline running. Press Ctrl+C to stop early");

    // 4. Wait for the work to drain or a shutdown signal
    tokio::select! {
        _ = pipeline.drained(settings.messages) => info!("All messages acknowledged"),
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Shutdown signal received. Exiting gracefully...");
        }
    }

    // 5. Graceful shutdown
    let report = pipeline.close().await?;
    info!(
        acked = report.acked,
        heard = report.heard,
        per_worker = ?report.per_worker,
        "Shutdown complete."
    );

    Ok(())
}
