//! Spot manager daemon.
//!
//! Watches the cluster's autoscaling groups and moves each managed group
//! between spot and on-demand capacity as its policy tag and the spot market
//! dictate.
//!
//! ## Architecture
//!
//! - **Controller**: tag and price refresh timers, plan execution
//! - **Status API**: optional read-only HTTP view of the controller
//! - **Cloud**: in-memory until a provider backend is wired in

use std::sync::Arc;

use anyhow::{Context, Result};
use spotter_cloud::{CloudApi, InMemoryCloud, Seed};
use spotter_manager::{status, Config, Controller, LogFormat, MutatorConfig};
use spotter_reconcile::SystemClock;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }

    info!(
        cluster = %config.cluster_name,
        region = %config.region,
        bid_ceiling = %config.bid_ceiling,
        events_only = config.events_only,
        "Starting spot manager"
    );

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Create the cloud (in-memory for now)
    let cloud: Arc<dyn CloudApi> = match &config.dev_seed {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read seed file {}", path.display()))?;
            let seed: Seed = serde_json::from_str(&raw)
                .with_context(|| format!("invalid seed file {}", path.display()))?;
            info!(path = %path.display(), groups = seed.auto_scaling_groups.len(), "Loaded development seed");
            Arc::new(InMemoryCloud::from_seed(seed))
        }
        None => Arc::new(InMemoryCloud::new()),
    };
    warn!(region = %config.region, "No provider backend compiled in, using in-memory cloud");

    let mut controller = Controller::new(
        &config,
        cloud,
        Arc::new(SystemClock),
        MutatorConfig::default(),
        shutdown_rx.clone(),
    );
    controller
        .initialize()
        .await
        .context("controller initialization failed")?;

    // Start the status API
    let status_handle = match config.status_addr {
        Some(addr) => {
            let app = status::create_router(controller.status());
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind status API on {addr}"))?;
            info!(addr = %addr, "Status API listening");

            let mut shutdown_rx = shutdown_rx.clone();
            Some(tokio::spawn(async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(async move {
                        while !*shutdown_rx.borrow() {
                            if shutdown_rx.changed().await.is_err() {
                                break;
                            }
                        }
                    })
                    .await
            }))
        }
        None => None,
    };

    // Start the controller loop
    let mut controller_handle = tokio::spawn(async move {
        controller.run().await;
    });

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut controller_handle => {
            if let Err(e) = result {
                error!(error = %e, "Controller task panicked");
            }
        }
    }

    // Signal shutdown and let in-flight transitions reach a checkpoint
    let _ = shutdown_tx.send(true);
    if !controller_handle.is_finished() {
        info!("Waiting for in-flight transitions...");
        if let Err(e) = controller_handle.await {
            error!(error = %e, "Controller task panicked during shutdown");
        }
    }

    if let Some(handle) = status_handle {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "Status API error"),
            Err(e) => error!(error = %e, "Status API task panicked"),
        }
    }

    info!("Spot manager shutdown complete");
    Ok(())
}
