use anyhow::Context;

use coffeeshop_app::Services;
use coffeeshop_infra::config::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    coffeeshop_observability::init();

    let config = AppConfig::from_env().context("invalid configuration")?;
    let services = Services::init(config).await?;

    tracing::info!("worker running; press ctrl-c to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;

    tracing::info!("shutdown requested");
    let stats = services.shutdown().await;
    tracing::info!(
        processed = stats.processed,
        succeeded = stats.succeeded,
        retried = stats.retried,
        archived = stats.archived,
        "worker stopped"
    );
    Ok(())
}
