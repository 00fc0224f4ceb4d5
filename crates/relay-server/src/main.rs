//! # Relay Server
//!
//! Realtime broadcast server backed by a shared bus.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings (in-process bus)
//! relay
//!
//! # Run against Redis, shared with other instances
//! RELAY__BUS__BACKEND=redis RELAY__BUS__REDIS_URL=redis://127.0.0.1:6379 relay
//!
//! # Run with environment overrides
//! RELAY__PORT=8080 RELAY__HOST=0.0.0.0 relay
//! ```

use anyhow::Result;
use relay_server::{config::Config, handlers, metrics};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::load()?;

    tracing::info!("Starting relay server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
