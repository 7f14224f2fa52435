//! Flag sync agent
//!
//! Keeps a local flag snapshot in sync with the flags service and ships
//! usage telemetry, reporting health and metrics over HTTP.

use anyhow::{Context, Result};
use flagsync_agent::{
    api,
    config::AgentConfig,
    http::{DiscardCollector, HttpClient},
};
use sdk_core::{
    health::components,
    storage::StorageParams,
    sync::{Collector, DataFetcher, LocalhostFetcher},
    HealthRegistry, InMemoryStorage, ReadinessManager, StructuredLogger, SyncManager, SyncMetrics,
};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

fn collaborators(config: &AgentConfig) -> Result<(Arc<dyn DataFetcher>, Arc<dyn Collector>)> {
    let settings = &config.settings;
    if settings.sync.localhost_mode {
        let path = config
            .localhost_file
            .as_deref()
            .context("Localhost mode requires localhost_file")?;
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {path}"))?;
        let fetcher = LocalhostFetcher::from_json(&raw).context("Invalid localhost flag file")?;
        let fetcher: Arc<dyn DataFetcher> = Arc::new(fetcher);
        let collector: Arc<dyn Collector> = Arc::new(DiscardCollector);
        return Ok((fetcher, collector));
    }

    let client = Arc::new(HttpClient::new(settings)?);
    let fetcher: Arc<dyn DataFetcher> = client.clone();
    let collector: Arc<dyn Collector> = client;
    Ok((fetcher, collector))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting flagsync-agent");

    let config = AgentConfig::load()?;
    let settings = config.settings.clone();
    info!(
        key = ?settings.core.key,
        localhost = settings.sync.localhost_mode,
        "Agent configured"
    );

    let health_registry = HealthRegistry::new();
    health_registry.register(components::SYNC).await;
    health_registry.register(components::SUBMITTERS).await;
    health_registry.register(components::STORAGE).await;

    let metrics = SyncMetrics::new();
    let logger = StructuredLogger::new(settings.core.key.as_deref().unwrap_or("server"));

    let storage = InMemoryStorage::new(&StorageParams::from(&settings));
    let readiness = Arc::new(ReadinessManager::new(settings.ready_timeout()));
    let (fetcher, collector) = collaborators(&config)?;

    // No streaming transport is wired in, so the manager polls
    let sync = SyncManager::new(
        settings,
        &storage,
        readiness.clone(),
        fetcher,
        collector,
        None,
    );

    tokio::spawn(
        health_registry
            .clone()
            .track_readiness(readiness.subscribe(), logger.clone()),
    );
    tokio::spawn(health_registry.clone().track_sync(sync.subscribe()));

    sync.start();

    let app_state = Arc::new(api::AppState::new(health_registry.clone(), metrics));
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("SIGINT received");

    sync.flush().await;
    sync.stop().await;
    readiness.destroy();
    storage.destroy();
    api_handle.abort();

    info!(version = AGENT_VERSION, "Shutting down");
    Ok(())
}
