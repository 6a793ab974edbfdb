use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use silica_consensus::{
    Address, ChainClient, ConsensusAggregator, ConsensusConfig, CoordinatorSettings, DatabasePool,
    EventMonitor, InMemoryChain, InMemorySettlementStore, JsonRpcChain, MonitorSettings,
    OpenRouterClient, SettlementApiState, SettlementCoordinator, SettlementStore,
    config::{ChainMode, sanitize_for_logging},
    create_settlement_router,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first - this validates addresses and secrets
    let config = Arc::new(ConsensusConfig::from_env().map_err(|e| {
        eprintln!("Configuration error: {}", e);
        eprintln!("Please check SILICA_* environment variables.");
        e
    })?);

    init_logging(&config)?;

    info!("Starting Silica consensus oracle");
    if config.logging.sanitize_logs {
        info!(
            scoring_key = %sanitize_for_logging(&config.scoring.api_key),
            "Scoring service: {} ({})",
            config.scoring.api_url,
            config.scoring.model
        );
    }

    let store = create_store(&config).await?;
    let chain = create_chain(&config)?;

    let scorer = Arc::new(
        OpenRouterClient::new(&config.scoring).context("Failed to create scoring client")?,
    );
    let aggregator = Arc::new(
        ConsensusAggregator::new(scorer, Duration::from_secs(config.scoring.timeout_secs))
            .with_fallback_score(config.scoring.fallback_score),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let coordinator = Arc::new(
        SettlementCoordinator::new(
            chain.clone(),
            store.clone(),
            aggregator.clone(),
            CoordinatorSettings::from_config(&config),
        )
        .with_shutdown(shutdown_rx.clone()),
    );

    let monitor = EventMonitor::new(
        chain.clone(),
        store.clone(),
        coordinator,
        MonitorSettings::from_config(&config.chain),
    );
    let monitor_shutdown = shutdown_rx.clone();
    let monitor_task = tokio::spawn(async move { monitor.run(monitor_shutdown).await });

    let app = create_settlement_router(SettlementApiState {
        store: store.clone(),
        aggregator,
    })
    .layer(TraceLayer::new_for_http());

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", bind_addr, e))?;

    info!("Operator API listening on {}", bind_addr);

    let mut server_shutdown = shutdown_rx.clone();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = server_shutdown.changed().await;
    });
    let server_task = tokio::spawn(async move { server.await });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested; finishing in-flight transitions");
    let _ = shutdown_tx.send(true);

    match monitor_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Event monitor exited with error"),
        Err(e) => error!(error = %e, "Event monitor task panicked"),
    }
    match server_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "API server exited with error"),
        Err(e) => error!(error = %e, "API server task panicked"),
    }

    info!("Silica consensus oracle stopped");
    Ok(())
}

/// Initialize logging from configuration; RUST_LOG overrides the level
fn init_logging(config: &ConsensusConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.to_lowercase()));

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| anyhow::anyhow!("Failed to set logging subscriber: {}", e))?;

    Ok(())
}

/// PostgreSQL when enabled, otherwise the in-memory store
async fn create_store(config: &ConsensusConfig) -> Result<Arc<dyn SettlementStore>> {
    if !config.database.postgres_enabled {
        warn!("PostgreSQL disabled - settlement state will not survive a restart");
        return Ok(Arc::new(InMemorySettlementStore::new()));
    }

    let url = if config.logging.sanitize_logs {
        sanitize_for_logging(&config.database.postgres_url)
    } else {
        config.database.postgres_url.clone()
    };
    info!("Connecting to PostgreSQL at {}", url);

    let db = DatabasePool::new(&config.database)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;
    db.init_schema().await.map_err(|e| anyhow::anyhow!(e))?;

    Ok(Arc::new(db.settlements().clone()))
}

fn create_chain(config: &ConsensusConfig) -> Result<Arc<dyn ChainClient>> {
    match config.chain.mode {
        ChainMode::Rpc => {
            let chain = JsonRpcChain::new(&config.chain).context("Failed to create RPC client")?;
            info!(
                rpc = %config.chain.rpc_url,
                chain_id = config.chain.chain_id,
                "Using JSON-RPC chain"
            );
            Ok(Arc::new(chain))
        }
        ChainMode::Simulated => {
            warn!("Using simulated chain - no real events will be observed");
            let aggregator = Address::parse(&config.chain.aggregator_address)
                .context("Invalid aggregator address")?;
            Ok(Arc::new(InMemoryChain::new(aggregator)))
        }
    }
}
