//! lsnpd — LSNP peer daemon.

use anyhow::{Context, Result};

use lsnp_core::config::LsnpConfig;
use lsnpd::Engine;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let (config, config_path) = LsnpConfig::bootstrap().context("config bootstrap failed")?;
    tracing::info!(path = %config_path.display(), "config file");

    let mut engine = Engine::start(config).await.context("engine start failed")?;

    // No terminal UI in the daemon build: drain events into the log so the
    // channel never backs up. A UI would take this receiver instead.
    let mut events = engine.take_events().expect("events already taken");
    let event_logger = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            tracing::info!(?event, "ui event");
        }
    });

    tokio::signal::ctrl_c().await.context("ctrl-c wait failed")?;
    tracing::info!("shutting down");
    engine.shutdown().await;
    event_logger.abort();

    Ok(())
}
