// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use bridge_config::Config;
use clap::Parser;
use servicechain_bridge::config::BridgeConfig;
use servicechain_bridge::metrics::start_prometheus_server;
use servicechain_bridge::node::run_bridge_node;
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[clap(rename_all = "kebab-case")]
#[clap(name = env!("CARGO_BIN_NAME"))]
#[clap(version = env!("CARGO_PKG_VERSION"))]
struct Args {
    #[clap(long)]
    pub config_path: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = BridgeConfig::load(&args.config_path)?;

    let prometheus_registry = prometheus::Registry::new();
    let metrics_address =
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), config.metrics_port);
    let metrics_cancel = tokio_util::sync::CancellationToken::new();
    let metrics_server = start_prometheus_server(
        metrics_address,
        prometheus_registry.clone(),
        metrics_cancel.clone(),
    )
    .await?;
    info!("Metrics server started at port {}", config.metrics_port);

    let (node, cancel) = run_bridge_node(config, &prometheus_registry).await?;

    tokio::signal::ctrl_c().await?;
    info!("Received ctrl-c, stopping bridge node");
    cancel.cancel();
    node.await
        .map_err(|e| anyhow::anyhow!("Task join error: {}", e))?;
    metrics_cancel.cancel();
    metrics_server
        .await
        .map_err(|e| anyhow::anyhow!("Task join error: {}", e))
}
