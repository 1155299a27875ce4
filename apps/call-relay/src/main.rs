use std::sync::Arc;

use anyhow::{Context, Result};
use call_relay::{
    build_router,
    config::{Cli, RelayConfig},
    registry::ParticipantRegistry,
    telemetry::Telemetry,
    AppState,
};
use clap::Parser;
use tokio::signal;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init()?;

    let cli = Cli::parse();
    let config = RelayConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        link_buffer = config.registry.per_link_buffer,
        idle_timeout_secs = config.registry.idle_timeout.as_secs(),
        "starting call-relay"
    );

    let registry = ParticipantRegistry::new(config.registry.clone());
    let state = Arc::new(AppState::new(
        registry.clone(),
        Some(telemetry.metrics_handle()),
    ));
    let recycler = registry.spawn_recycler();

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("call-relay listening on {}", config.listen_addr);

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown with error")?;

    recycler.abort();
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
