//! # Relay Node
//!
//! Server entry point.
//!
//! ## Startup Sequence
//!
//! 1. Load configuration (defaults → `RELAY_CONFIG` file → `RELAY_*` env)
//! 2. Initialize logging
//! 3. Open the Postgres pool and the notification feed
//! 4. Register domain subscriptions
//! 5. Serve until Ctrl-C, then terminate every connection

mod config;

use std::sync::Arc;

use anyhow::{Context, Result};
use relay_bus::{ChannelRegistry, PgNotificationFeed};
use relay_gateway::{handlers, GatewayService, HmacTokenVerifier};
use relay_store::{Database, PgStore};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{LogConfig, NodeConfig};

fn init_logging(log: &LogConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&log.filter))
        .context("invalid log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    let result = if log.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| anyhow::anyhow!(e))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal");
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = NodeConfig::from_env().context("failed to load configuration")?;
    init_logging(&config.log)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = ?config.gateway.environment,
        "Starting relay node"
    );

    let store = PgStore::connect(&config.database)
        .await
        .context("failed to connect to the database")?;
    let feed = PgNotificationFeed::new(store.pool().clone(), &config.bus);
    let registry = ChannelRegistry::from_config(Arc::new(feed), &config.bus);
    let database = Database::new(Arc::new(store));

    let router = handlers::routes(&registry).context("failed to register subscriptions")?;
    let verifier = Arc::new(HmacTokenVerifier::new(&config.gateway.auth.token_secret));

    GatewayService::new(config.gateway, database, router, verifier)?
        .start(shutdown_signal())
        .await?;

    info!("Shutdown complete");
    Ok(())
}
