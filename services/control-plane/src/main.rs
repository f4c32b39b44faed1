//! mandrel control plane
//!
//! Serves the node identity and lifecycle API and runs the background
//! workers that drain the signal outbox and refresh power state.

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mandrel_control_plane::api;
use mandrel_control_plane::config::Config;
use mandrel_control_plane::db::{Database, DbConfig};
use mandrel_control_plane::policy::PgPolicyCatalogue;
use mandrel_control_plane::power::IpmitoolChannel;
use mandrel_control_plane::state::AppState;
use mandrel_control_plane::tags::FactTagMatcher;
use mandrel_control_plane::workers::{PowerMonitor, SignalWorker, SignalWorkerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting mandrel control plane");

    let config = Config::from_env()?;
    info!(listen_addr = %config.listen_addr, "Configuration loaded");

    let db_config = DbConfig::from_env();
    let db = match Database::connect(&db_config).await {
        Ok(db) => {
            info!("Database connection established");
            db
        }
        Err(e) => {
            error!(error = %e, "Failed to connect to database");
            return Err(e.into());
        }
    };

    if config.dev_mode {
        info!("Running database migrations (dev mode)");
        if let Err(e) = db.run_migrations(&db_config.migrations_dir).await {
            error!(error = %e, "Failed to run migrations");
            return Err(e.into());
        }
    }

    let matcher = Arc::new(FactTagMatcher::new(db.pool().clone()));
    let catalogue = Arc::new(PgPolicyCatalogue::new(db.pool().clone()));
    let channel = Arc::new(IpmitoolChannel::from_env());

    let state = AppState::new(db.clone(), &config, matcher, catalogue, channel);

    // Background workers
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let signal_worker = SignalWorker::new(
        db.clone(),
        state.outbox().clone(),
        state.store().clone(),
        state.log().clone(),
        state.checkin().clone(),
        state.power().clone(),
        SignalWorkerConfig {
            interval: config.signal_interval,
            ..Default::default()
        },
    );
    let signal_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        signal_worker.run(signal_shutdown).await;
    });

    let power_monitor = PowerMonitor::new(
        state.store().clone(),
        state.power().clone(),
        config.power_interval,
    );
    let power_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        power_monitor.run(power_shutdown).await;
    });

    // Build and run the server
    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    Ok(())
}
