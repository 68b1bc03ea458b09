use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use modelhooks_infra::{InMemoryRepository, PipelineConfig};
use modelhooks_users::User;
use modelhooks_worker::app;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("failed to load .env: {e}");
        }
    }
    modelhooks_observability::init();

    let config = PipelineConfig::from_env().context("invalid pipeline configuration")?;
    info!(
        project = %config.project_name,
        queue = %config.queue_key(),
        fallback = %config.fallback_key(),
        "starting model event worker"
    );

    let users = Arc::new(InMemoryRepository::<User>::new());
    let (registry, catalog) = app::registries(users.clone());
    let registry = modelhooks_events::install(registry)?;
    info!(handlers = registry.len(), "handler registry installed");

    let pipeline = app::start(&config, registry, catalog, users).await?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested");

    pipeline.shutdown().await;
    Ok(())
}
