//! Market Data Pipeline
//!
//! Streams ticker data from the upstream exchange feed through the message
//! bus out to downstream WebSocket subscribers.

use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use market_data_pipeline::config::Config;
use market_data_pipeline::pipeline::Pipeline;

#[tokio::main]
async fn main() -> ExitCode {
    // Configuration feeds the log filter, so it loads before tracing is up.
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            return ExitCode::FAILURE;
        }
    };

    tracing_subscriber::registry()
        .with(fmt::layer().json())
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .init();

    info!(
        feed = %config.feed_url,
        topics = ?config.bus_topics,
        port = config.server_port,
        "Starting market data pipeline"
    );

    match Pipeline::new(config).run().await {
        Ok(()) => {
            info!("Clean shutdown");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Pipeline terminated");
            ExitCode::FAILURE
        }
    }
}
