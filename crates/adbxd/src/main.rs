//! adbxd: database credential broker daemon.

use std::sync::Arc;

use anyhow::{Context, Result};

use adbx_core::config::AdbxConfig;
use adbx_core::identity::ProcIdentity;
use adbxd::Broker;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = AdbxConfig::load().context("failed to load configuration")?;
    tracing::info!(
        config = %AdbxConfig::file_path().display(),
        connections = config.connections.len(),
        "adbxd starting"
    );

    let broker = Broker::bind(&config, Arc::new(ProcIdentity::default()))
        .await
        .context("broker startup failed")?;

    let shutdown = broker.shutdown_handle();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("interrupt received, shutting down"),
            Err(e) => tracing::warn!(error = %e, "cannot listen for interrupt; shutting down"),
        }
        let _ = shutdown.send(());
    });

    broker.run().await
}
