use std::time::Duration;

use anyhow::Context;
use tracing::info;

use stockflow_infra::SettlementConfig;

const STATS_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    stockflow_observability::init();

    let config = SettlementConfig::from_env().context("invalid configuration")?;
    let handle = stockflow_worker::app::start(&config).await?;

    let mut ticker = tokio::time::interval(STATS_INTERVAL);
    ticker.tick().await;
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for shutdown signal")?;
                break;
            }
            _ = ticker.tick() => {
                let stats = serde_json::to_string(&handle.stats())?;
                info!(stats = %stats, "settlement loop stats");
            }
        }
    }

    info!("shutdown requested; waiting for the current batch");
    let stats = tokio::task::spawn_blocking(move || handle.shutdown())
        .await
        .context("settlement loop shutdown task failed")?;
    info!(stats = %serde_json::to_string(&stats)?, "settlement worker stopped");
    Ok(())
}
