use anyhow::Context;
use std::sync::Arc;

use qgate::config::GatewayConfig;
use qgate::logger;
use qgate::proxy::server::{AppState, GatewayServer};
use qgate::store::{db, AccountStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logger::init_logger();

    let config = Arc::new(GatewayConfig::from_env());
    tracing::info!(
        "Starting qgate on port {} (api key: {}, admin key: {})",
        config.port,
        if config.api_key.is_some() { "set" } else { "open" },
        if config.admin_key.is_some() { "set" } else { "open" },
    );

    let db_path = db::get_db_path().map_err(anyhow::Error::msg)?;
    let store = AccountStore::open(&db_path)
        .with_context(|| format!("opening account store at {:?}", db_path))?;

    let state = AppState::new(config.clone(), store);

    let (server, handle) = GatewayServer::start("0.0.0.0", config.port, state)
        .await
        .map_err(anyhow::Error::msg)?;

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("Shutdown signal received");
    server.stop();
    let _ = handle.await;

    Ok(())
}
