//! Parley daemon entry point.

use anyhow::Result;
use parley_common::config::{GatewayConfig, DEFAULT_CONFIG_PATH};
use parleyd::server::{self, AppState};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let config = GatewayConfig::load(&config_path);

    info!("Parley gateway v{} starting", env!("CARGO_PKG_VERSION"));
    info!(
        "Model command: {} (full deadline {}s, preflight {}s)",
        config.model.command, config.model.full_deadline_secs, config.model.preflight_deadline_secs
    );

    let state = AppState::new(config)?;
    server::run(state).await
}
