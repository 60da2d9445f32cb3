use anyhow::Result;
use nft_chain_sync::config::Config;
use nft_chain_sync::provider_manager::ProviderManager;
use nft_chain_sync::repository::Database;
use nft_chain_sync::resilience::{CircuitBreaker, ResilienceExecutor};
use nft_chain_sync::rpc::{Endpoints, RpcClient, RpcProbe};
use nft_chain_sync::scanner::ChainSyncEngine;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting NFT chain sync");

    let config = Config::from_env()?;
    info!("Configuration loaded");
    info!("Contract address: {:?}", config.contract_address);

    let rpc_urls = config.rpc_urls();
    info!("RPC URLs: {} endpoint(s) configured", rpc_urls.len());

    let db = Database::new(&config.database_url)?;
    info!("Database initialized");

    let endpoints = Endpoints::connect(&rpc_urls)?;
    let manager = Arc::new(ProviderManager::new(
        rpc_urls,
        config.chain_id,
        config.health.clone(),
        Arc::new(RpcProbe::new(endpoints.clone())),
    )?);
    manager.check_all_providers().await;
    manager.start_health_monitoring();

    let client =
        RpcClient::new(endpoints, manager.clone()).with_request_timeout(config.rpc_timeout);
    let breaker = Arc::new(CircuitBreaker::new("rpc", config.breaker.clone()));
    let executor = ResilienceExecutor::new(breaker, config.rpc_timeout);

    let engine = Arc::new(
        ChainSyncEngine::new(
            Arc::new(client),
            executor,
            db,
            config.contract_address,
            config.chain_id,
            config.sync.clone(),
        )
        .with_owner_lookup_concurrency(config.owner_lookup_concurrency)
        .with_accuracy_threshold(config.verify_accuracy_threshold),
    );

    if let Err(e) = engine.initialize().await {
        error!("Initialization failed: {:#}", e);
        manager.stop_health_monitoring();
        return Err(e);
    }

    let stopper = engine.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received, finishing current batch");
            stopper.stop_sync();
        }
    });

    let result = engine.run().await;
    manager.stop_health_monitoring();

    if let Err(e) = &result {
        error!("Sync aborted: {:#}", e);
    }
    result
}
