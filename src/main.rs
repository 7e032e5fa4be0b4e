//! HTLC Relayer - completes hash time-locked atomic swaps between two chains
//!
//! This relayer watches HTLC contracts on both chains, relays a preimage
//! revealed on one chain to the counterpart HTLC on the other, and refunds
//! swaps whose deadline passes unrevealed.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

mod api;
mod chain;
mod config;
mod coordination;
mod error;
mod events;
mod hashlock;
mod ingestion;
mod metrics;
mod state;
mod tx;

use chain::ChainManager;
use config::{DatabaseConfig, Settings, StoreBackend};
use coordination::RelayCoordinator;
use ingestion::EventPipeline;
use metrics::MetricsServer;
use state::{CheckpointStore, MemoryStore, PgStore, SwapRegistry};

/// Time given to in-flight actions on shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting HTLC Relayer v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration for {} chains",
        settings.enabled_chains().len()
    );

    // Open the swap registry
    let (registry, checkpoints) = open_store(&settings.database).await?;
    info!("Swap registry ready ({:?} backend)", settings.database.backend);

    // Initialize chain manager (one gateway per chain)
    let chains = Arc::new(ChainManager::connect(&settings).await?);
    info!("Chain connections initialized");

    // Initialize relay coordinator
    let coordinator = Arc::new(RelayCoordinator::new(
        chains.clone(),
        registry.clone(),
        settings.relayer.clone(),
    ));
    info!("Relay coordinator initialized");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Start one ingestion pipeline per chain
    let mut pipeline_handles = Vec::new();
    for chain_id in chains.chain_ids() {
        let pipeline = EventPipeline::new(
            chains.params(chain_id)?,
            chains.counterpart(chain_id)?,
            chains.gateway(chain_id)?,
            registry.clone(),
            checkpoints.clone(),
            coordinator.clone(),
            settings.relayer.hash_function,
        )
        .with_shard(settings.relayer.shard_index);
        let shutdown = shutdown_rx.clone();
        pipeline_handles.push(tokio::spawn(async move {
            if let Err(e) = pipeline.run(shutdown).await {
                error!("Event pipeline for chain {} failed: {}", chain_id, e);
            }
        }));
    }

    // Start relay coordinator
    let coordinator_handle = tokio::spawn({
        let coordinator = coordinator.clone();
        async move {
            if let Err(e) = coordinator.run().await {
                error!("Relay coordinator error: {}", e);
            }
        }
    });

    // Start API server
    let api_handle = tokio::spawn({
        let state = api::AppState {
            registry: registry.clone(),
            chains: chains.clone(),
            coordinator: coordinator.clone(),
        };
        let config = settings.api.clone();
        async move {
            if let Err(e) = api::run_server(config, state).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Health check loop
    let health_handle = tokio::spawn({
        let chains = chains.clone();
        let registry = registry.clone();
        let interval = settings.relayer.health_check_interval_secs;
        async move {
            loop {
                tokio::time::sleep(Duration::from_secs(interval)).await;

                let mut healthy = true;
                for (chain_id, head) in chains.health_check().await {
                    if head.is_none() {
                        warn!("Chain {} health check failed", chain_id);
                        healthy = false;
                    }
                }

                if let Err(e) = registry.health_check().await {
                    warn!("Registry health check failed: {}", e);
                    healthy = false;
                }

                if healthy {
                    metrics::record_health_check();
                } else {
                    metrics::record_health_check_failure();
                }
            }
        }
    });

    info!("HTLC Relayer is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Stop ingestion first so no new actions are scheduled
    let _ = shutdown_tx.send(true);
    for handle in pipeline_handles {
        if let Err(e) = handle.await {
            warn!("Event pipeline task ended abnormally: {}", e);
        }
    }
    coordinator.stop(SHUTDOWN_GRACE).await;

    // Abort background tasks
    coordinator_handle.abort();
    api_handle.abort();
    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("HTLC Relayer stopped");
    Ok(())
}

async fn open_store(
    config: &DatabaseConfig,
) -> Result<(Arc<dyn SwapRegistry>, Arc<dyn CheckpointStore>)> {
    match config.backend {
        StoreBackend::Postgres => {
            let store = Arc::new(PgStore::new(config).await?);
            store.run_migrations().await?;
            Ok((store.clone(), store))
        }
        StoreBackend::Memory => {
            warn!("Using the in-memory store; swap state is lost on restart");
            let store = Arc::new(MemoryStore::new());
            Ok((store.clone(), store))
        }
    }
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,htlc_relayer=debug,sqlx=warn,hyper=warn"));

    let json = std::env::var("LOG_FORMAT")
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
