//! # Relay Server
//!
//! Real-time event gateway.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! relay
//!
//! # Run with a custom config
//! RELAY_CONFIG=/path/to/relay.toml relay
//!
//! # Run with environment variables
//! RELAY_PORT=8080 RELAY_HOST=0.0.0.0 RELAY_TRUSTED_SESSION=... relay
//! ```

mod config;
mod handlers;
mod metrics;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay=debug,tenvis_relay=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!(
        backend = ?config.transport.backend,
        "Starting Relay server on {}:{}",
        config.host,
        config.port
    );

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
