use std::sync::Arc;

use anyhow::Context;
use host_router::{AccessLog, HostRouter, RedisBackend, RouterConfig};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config = RouterConfig::from_env()?;

    let routes = RedisBackend::connect(&config.read_redis, &config.write_redis)
        .await
        .context("failed to connect to the routes backend")?;
    let access_log = AccessLog::open(&config.log_path)
        .await
        .with_context(|| format!("failed to open access log at {}", config.log_path))?;

    let router = HostRouter::new(config, Arc::new(routes), access_log.clone())?;
    let handle = router.start().await?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutting down");
    handle.shutdown().await;
    if let Some(log) = access_log {
        log.stop().await;
    }
    Ok(())
}
