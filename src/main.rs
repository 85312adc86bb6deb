//! The rop broker.

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::prelude::*;

use rop_broker::{App, Config};

#[tokio::main]
async fn main() -> Result<()> {
    // Setup tracing/logging system.
    tracing_subscriber::registry()
        // Filter spans based on the RUST_LOG env var.
        .with(tracing_subscriber::EnvFilter::from_default_env())
        // Send a copy of all spans to stdout in compact form.
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_ansi(true),
        )
        // Install this registry as the global tracing registry.
        .try_init()
        .context("error initializing logging/tracing system")?;

    let cfg = Arc::new(Config::new()?);
    let metrics = PrometheusBuilder::new()
        .add_global_label("broker", format!("{}:{}", cfg.broker_host, cfg.listen_port))
        .install_recorder()
        .context("error setting prometheus metrics recorder")?;

    tracing::info!(
        listen_port = %cfg.listen_port,
        metrics_port = %cfg.metrics_port,
        broker_host = %cfg.broker_host,
        storage_data_path = %cfg.storage_data_path,
        delay_levels = %cfg.message_delay_level,
        "starting rop broker",
    );
    if let Err(err) = App::new(cfg, metrics).await?.spawn().await {
        tracing::error!(error = ?err);
    }

    // Ensure any pending output is flushed.
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();

    Ok(())
}
