use anyhow::{Context, Result};
use clap::Parser;
use kube::Client;
use pvpool::config::Config;
use pvpool::controller;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();

    let default_filter = if config.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    info!("Starting pvpool-controller");
    info!("Name: {}", config.name);
    if let Some(namespace) = &config.namespace {
        info!("Namespace: {}", namespace);
    }
    info!(
        "Max reconcile backoff: {:?}",
        config.controller_max_reconcile_backoff_duration
    );

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    controller::ensure_crds(&client)
        .await
        .context("Failed to install custom resource definitions")?;

    let ctx = Arc::new(controller::Context::new(client, &config));

    tokio::try_join!(
        controller::pool::run(ctx.clone()),
        controller::checkout::run(ctx.clone()),
    )?;

    Ok(())
}
