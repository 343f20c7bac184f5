// Query service main entry point.
use anyhow::{Context, Result};
use queryd::config::ServerConfig;
use queryd::server::Server;
use spire_chain::MemoryChain;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Configure logging from environment for easy local tweaking.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = ServerConfig::from_env_or_yaml().context("load server config")?;

    // The in-memory backend stands in for a full node in dev runs; a real
    // deployment links an actual chain implementation here.
    let chain = Arc::new(MemoryChain::new());
    let server = Server::start(config, chain)
        .await
        .context("start query server")?;
    tracing::info!("query server started");

    // Block until SIGINT so the process stays alive.
    let _ = tokio::signal::ctrl_c().await;
    server.stop().await;
    Ok(())
}
