use anyhow::Result;
use clap::Parser;
use tandem_server::{relay, telemetry::Telemetry, Cli, RelayConfig};
use tokio::signal;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init()?;

    let cli = Cli::parse();
    let config = RelayConfig::try_from(cli)?;
    if !config.auth_enabled() {
        warn!("no bearer tokens configured; accepting every connection");
    }

    let grace = config.shutdown_grace;
    let handle = relay::spawn(config, Some(telemetry.metrics_handle())).await?;
    info!(listen_addr = %handle.local_addr(), "tandem relay listening");

    let _ = signal::ctrl_c().await;
    info!(
        grace_seconds = grace.as_secs(),
        "shutdown signal received; closing rooms"
    );
    handle.shutdown(grace).await;
    info!("graceful shutdown complete");

    Ok(())
}
