// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::account::{BridgeAccount, BridgeAccounts};
use crate::config::BridgeConfig;
use crate::contract::{ChainBackend, PeerSet};
use crate::eth::EthPeerSet;
use crate::event_handler::ValueTransferHandler;
use crate::handle_store::{HandleTxStore, InMemoryHandleTxStore, RocksDbHandleTxStore};
use crate::manager::BridgeManager;
use crate::metrics::BridgeMetrics;
use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Connects both chains, restores the journaled bridges and runs the
/// background loops. Cancelling the returned token stops the manager; the
/// join handle completes once it has stopped.
pub async fn run_bridge_node(
    config: BridgeConfig,
    prometheus_registry: &prometheus::Registry,
) -> anyhow::Result<(JoinHandle<()>, CancellationToken)> {
    config.validate()?;
    let metrics = Arc::new(BridgeMetrics::new(prometheus_registry));
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("unable to create data dir {:?}", config.data_dir))?;

    let request_timeout = config.request_timeout();
    let child = config
        .child
        .connect("child", request_timeout, metrics.clone())
        .await?;
    let parent = config
        .parent
        .connect("parent", request_timeout, metrics.clone())
        .await?;

    child.account.sync_nonce(child.backend.as_ref()).await?;
    parent.account.sync_nonce(parent.backend.as_ref()).await?;
    let accounts = Arc::new(BridgeAccounts::new(parent.account, child.account));

    let handle_store: Arc<dyn HandleTxStore> = if config.persist_handle_txs {
        Arc::new(RocksDbHandleTxStore::open(config.handle_store_path())?)
    } else {
        Arc::new(InMemoryHandleTxStore::new())
    };

    let cancel = CancellationToken::new();
    let peers = Arc::new(EthPeerSet::new());
    let mut handles = vec![peers.spawn_probe(
        parent.signer.clone(),
        Duration::from_secs(config.reset_bridge_interval_secs),
        request_timeout,
        cancel.clone(),
    )];

    let manager = Arc::new(BridgeManager::new(
        config.journal_path(),
        child.backend.clone(),
        parent.backend.clone(),
        accounts.clone(),
        peers.clone(),
        handle_store,
        config.recovery_config(),
        metrics,
    ));

    let handler = Arc::new(ValueTransferHandler::new(manager.clone()));
    handles.push(handler.start(cancel.clone()));
    handles.push(tokio::spawn(restore_bridge_loop(
        manager.clone(),
        Duration::from_secs(config.restore_bridge_interval_secs),
        cancel.clone(),
    )));
    handles.push(tokio::spawn(reset_bridge_loop(
        manager.clone(),
        peers,
        accounts.parent.clone(),
        parent.backend.clone(),
        Duration::from_secs(config.reset_bridge_interval_secs),
        cancel.clone(),
    )));
    handles.push(tokio::spawn(log_status_loop(
        manager.clone(),
        Duration::from_secs(config.log_status_interval_secs),
        cancel.clone(),
    )));

    let shutdown = cancel.clone();
    let node = tokio::spawn(async move {
        shutdown.cancelled().await;
        info!("Shutting down bridge node");
        manager.stop().await;
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Bridge node task ended abnormally: {:?}", e);
            }
        }
    });
    Ok((node, cancel))
}

/// Retries [`BridgeManager::restore_bridges`] every `interval` until it
/// succeeds once.
pub async fn restore_bridge_loop(
    manager: Arc<BridgeManager>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        match manager.restore_bridges().await {
            Ok(()) => return,
            Err(e) => error!("Failed to restore bridges: {:?}", e),
        }
    }
}

/// Re-creates every subscription once the parent chain comes back after a
/// disconnection, then re-reads the parent operator nonce.
pub async fn reset_bridge_loop(
    manager: Arc<BridgeManager>,
    peers: Arc<dyn PeerSet>,
    parent_account: Arc<BridgeAccount>,
    parent_backend: Arc<dyn ChainBackend>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    let mut was_connected = !peers.is_empty();
    let mut need_reset = false;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let connected = !peers.is_empty();
        if was_connected && !connected {
            warn!("Parent chain disconnected, subscriptions will be reset");
            need_reset = true;
        }
        was_connected = connected;
        if !(need_reset && connected) {
            continue;
        }
        if let Err(e) = manager.reset_all_subscribed_events().await {
            error!("Failed to reset subscribed events: {:?}", e);
            continue;
        }
        need_reset = false;
        if let Err(e) = parent_account.sync_nonce(parent_backend.as_ref()).await {
            warn!("Failed to sync parent operator nonce: {:?}", e);
        }
    }
}

pub async fn log_status_loop(
    manager: Arc<BridgeManager>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                manager.log_bridge_status();
            }
        }
    }
}
