use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use modfleet::client::{HttpClientConfig, HttpPlatformClient};
use modfleet::config::{DirectoryConfigSource, FleetConfig};
use modfleet::fleet::{Fleet, FleetDeps, NoopRetentionStore};
use modfleet::logging::init_logging;
use modfleet::manager::{CausedBy, LoggingProcessor};
use modfleet::notification::TracingNotifier;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let (config, origin) = FleetConfig::load(None).context("failed to load configuration")?;

    // Keep the guard alive so buffered file logs are flushed on exit
    let (logging, _guard) = init_logging(&config.logging)?;
    tracing::info!(
        source = %origin,
        config_dir = %config.config_dir.display(),
        "Operator configuration loaded"
    );
    let shutdown = CancellationToken::new();
    logging.start_retention_cleanup(shutdown.clone());

    let client = HttpPlatformClient::new(HttpClientConfig {
        base_url: config.client.base_url.clone(),
        user_agent: config.client.user_agent.clone(),
        access_token: config.client.access_token.clone(),
        timeout: Duration::from_secs(config.client.timeout_secs),
    })?;

    let deps = FleetDeps {
        client: Arc::new(client),
        config_source: Arc::new(DirectoryConfigSource::new(config.config_dir.clone())),
        processor: Arc::new(LoggingProcessor),
        notifier: Arc::new(TracingNotifier),
        retention: Arc::new(NoopRetentionStore),
    };

    let fleet = Fleet::new(config, deps);
    fleet.run().await.context("fleet failed to start")?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("Shutdown signal received");

    shutdown.cancel();
    fleet.destroy(CausedBy::System).await;
    Ok(())
}
