// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! Mirrors the most recent published checkpoints into a local directory.

use std::path::PathBuf;

use anyhow::{Context, Result};
use checkpoint_mirror::{
    CheckpointSyncer,
    CredentialResolver,
    MirrorConfig,
    ObjectStoreCheckpoints,
};
use clap::Parser;
use mirror_utils::{
    config::LoadConfig,
    metrics::start_prometheus_server,
    telemetry::init_tracing_subscriber,
};
use prometheus::Registry;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = env!("CARGO_BIN_NAME"), version, rename_all = "kebab-case")]
struct Args {
    /// Path to the YAML configuration file. Defaults are used when omitted.
    #[arg(long, short, env = "CKPT_MIRROR_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing_subscriber("info");
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => MirrorConfig::load(path)?,
        None => MirrorConfig::default(),
    };
    config
        .apply_env_overrides()
        .context("invalid configuration override in the environment")?;
    config.validate()?;
    tracing::info!(?config, "loaded configuration");

    let registry = Registry::new();
    if let Some(metrics_address) = config.metrics_address {
        start_prometheus_server(metrics_address, registry.clone()).await?;
    }

    let credentials = CredentialResolver::from_config(&config).resolve().await;
    let store = ObjectStoreCheckpoints::from_config(&config, &credentials)
        .context("failed to set up checkpoint storage")?;
    tracing::info!(
        bucket = %credentials.bucket_name,
        cache_root = %store.cache_root().display(),
        "mirroring checkpoints"
    );

    let cancellation_token = CancellationToken::new();
    tokio::spawn({
        let cancellation_token = cancellation_token.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    tracing::info!("received shutdown signal");
                    cancellation_token.cancel();
                }
                Err(error) => tracing::error!(?error, "unable to listen for the shutdown signal"),
            }
        }
    });

    CheckpointSyncer::from_config(store, &config, &registry)
        .run(cancellation_token)
        .await;
    Ok(())
}
