//! dcart auth projector
//!
//! Consumes user events from the broker and maintains the users read model.

use std::sync::Arc;

use anyhow::Result;
use dcart_auth::{
    config,
    db::Database,
    messaging::{AmqpTransport, EventConsumer},
    projections::UsersProjection,
};
use dcart_events::{register_events, EventRegistry};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Prefer RUST_LOG, fall back to DCART_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting dcart auth projector");
    info!(
        exchange = %config.broker.exchange,
        queue = %config.broker.queue,
        "Configuration loaded"
    );

    let db = match Database::connect(&config.database).await {
        Ok(db) => {
            info!("Database connection established");
            db
        }
        Err(e) => {
            error!(error = %e, "Failed to connect to database");
            return Err(e.into());
        }
    };

    if let Err(e) = db.health_check().await {
        error!(error = %e, "Database health check failed");
        return Err(e.into());
    }

    if config.dev_mode {
        info!("Running database migrations (dev mode)");
        if let Err(e) = db.run_migrations().await {
            error!(error = %e, "Failed to run migrations");
            return Err(e.into());
        }
    }

    let mut registry = EventRegistry::new();
    register_events(&mut registry);

    let projection = UsersProjection::new(Arc::new(db.user_views()));
    let consumer = EventConsumer::new(
        AmqpTransport,
        config.broker.clone(),
        Arc::new(registry),
        Arc::new(projection),
    );
    let consumer = consumer.start();

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Received shutdown signal");

    consumer.stop();
    if tokio::time::timeout(config.shutdown_timeout, consumer.wait_stopped())
        .await
        .is_err()
    {
        warn!(state = ?consumer.state(), "Consumer did not shut down in time");
    }

    info!("Auth projector shutdown complete");
    Ok(())
}
