use anyhow::Context;
use fleetwatch::config::AppConfig;
use fleetwatch::logging;
use fleetwatch::services::ServiceContainer;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables before reading configuration
    dotenvy::dotenv().ok();

    let config = AppConfig::load().context("loading configuration")?;
    let _log_guard = logging::init_logging(&config.log_dir).context("initializing logging")?;

    info!(
        api = %config.api_base_url,
        data_dir = %config.data_dir.display(),
        "fleetwatch starting"
    );

    let container = ServiceContainer::new(config)
        .await
        .context("initializing services")?;
    container.authenticate().await;
    container.start().context("starting scheduler")?;

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
    }

    container.shutdown().await;
    info!("fleetwatch stopped");
    Ok(())
}
