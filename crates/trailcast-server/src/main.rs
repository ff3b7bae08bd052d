//! # Trailcast Server
//!
//! Relays live runner positions from a message broker to WebSocket viewers.
//!
//! ## Usage
//!
//! ```bash
//! # Broker host and credentials are required
//! TRAILCAST_BROKER__HOST=rabbitmq \
//! TRAILCAST_BROKER__USERNAME=relay \
//! TRAILCAST_BROKER__PASSWORD=secret \
//! TRAILCAST_BROKER__TRAILS=pr9,pr21 \
//! trailcast
//!
//! # Run with a config file
//! TRAILCAST_CONFIG=/path/to/trailcast.toml trailcast
//! ```
//!
//! Viewers connect to `ws://<host>:<port>/?trail=pr9&athlete=runner42`.

mod config;
mod handlers;
mod metrics;

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_LOG_FILTER: &str =
    "trailcast_server=debug,trailcast_core=debug,trailcast_broker=debug,tower_http=debug";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration; nothing is bound until this succeeds
    let config = config::Config::load().context("Refusing to start")?;

    tracing::info!(
        "Starting Trailcast on {}:{} (broker {}:{}, trails {:?})",
        config.host,
        config.port,
        config.broker.host,
        config.broker.port,
        config.broker.trails
    );

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
