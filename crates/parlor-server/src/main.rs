//! # Parlor Server
//!
//! Realtime chat server.
//!
//! ## Usage
//!
//! ```bash
//! # Run with settings from the search path
//! parlor
//!
//! # Run with an explicit config file
//! parlor /path/to/parlor.toml
//!
//! # Override settings with environment variables
//! PARLOR_PORT=8080 PARLOR_AUTH__JWT_SECRET=secret parlor
//! ```

use anyhow::Result;
use parlor_server::{config, handlers, metrics};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parlor=debug,parlor_core=debug,parlor_server=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match std::env::args_os().nth(1).map(PathBuf::from) {
        Some(path) => config::Config::load_from(Some(&path))?,
        None => config::Config::load()?,
    };

    tracing::info!("Starting Parlor server on {}:{}", config.host, config.port);

    metrics::init_metrics();

    handlers::run_server(config).await?;

    Ok(())
}
