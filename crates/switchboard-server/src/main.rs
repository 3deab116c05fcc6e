//! # Switchboard Server
//!
//! WebSocket relay that lets peers register under an identity and exchange
//! chat messages and WebRTC signaling with each other.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! switchboard
//!
//! # Run with a custom config file
//! SWITCHBOARD_CONFIG=/path/to/switchboard.toml switchboard
//!
//! # Run with environment variables
//! SWITCHBOARD_PORT=8080 SWITCHBOARD_HOST=0.0.0.0 switchboard
//! ```

mod config;
mod handlers;
mod metrics;
mod network;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "switchboard=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!(
        "Starting Switchboard server on {}:{}",
        config.host,
        config.port
    );

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
