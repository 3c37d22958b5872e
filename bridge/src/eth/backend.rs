// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use super::contract::{EthBridgeContract, EthContractConfig};
use super::middleware_error;
use crate::contract::{BridgeContract, ChainBackend, PeerSet};
use crate::error::{BridgeError, BridgeResult};
use async_trait::async_trait;
use ethers::abi::Abi;
use ethers::providers::Middleware;
use ethers::types::{Address, BlockNumber};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct EthChainBackend<M> {
    client: Arc<M>,
    abi: Abi,
    config: EthContractConfig,
}

impl<M: Middleware + 'static> EthChainBackend<M> {
    pub fn new(client: Arc<M>, abi: Abi, config: EthContractConfig) -> Self {
        Self {
            client,
            abi,
            config,
        }
    }

    pub fn client(&self) -> &Arc<M> {
        &self.client
    }

    async fn with_deadline<T>(
        &self,
        method: &str,
        fut: impl std::future::Future<Output = BridgeResult<T>>,
    ) -> BridgeResult<T> {
        tokio::time::timeout(self.config.request_timeout, fut)
            .await
            .map_err(|_| BridgeError::Timeout(method.to_string()))?
    }
}

#[async_trait]
impl<M: Middleware + 'static> ChainBackend for EthChainBackend<M> {
    async fn current_block_number(&self) -> BridgeResult<u64> {
        self.with_deadline("eth_blockNumber", async {
            self.client
                .get_block_number()
                .await
                .map(|n| n.as_u64())
                .map_err(middleware_error)
        })
        .await
    }

    async fn pending_nonce_at(&self, account: Address) -> BridgeResult<u64> {
        self.with_deadline("eth_getTransactionCount", async {
            self.client
                .get_transaction_count(account, Some(BlockNumber::Pending.into()))
                .await
                .map(|n| n.as_u64())
                .map_err(middleware_error)
        })
        .await
    }

    fn bridge_contract(&self, address: Address) -> BridgeResult<Arc<dyn BridgeContract>> {
        Ok(Arc::new(EthBridgeContract::new(
            address,
            self.abi.clone(),
            self.client.clone(),
            self.config,
        )))
    }
}

/// Connectivity towards the parent chain: one peer while its RPC endpoint
/// answers `eth_chainId`.
#[derive(Debug, Default)]
pub struct EthPeerSet {
    peers: AtomicUsize,
}

impl EthPeerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Probes `client` every `interval` until `cancel` fires.
    pub fn spawn_probe<M: Middleware + 'static>(
        self: &Arc<Self>,
        client: Arc<M>,
        interval: Duration,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let peers = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                let connected = matches!(
                    tokio::time::timeout(timeout, client.get_chainid()).await,
                    Ok(Ok(_))
                );
                let previous = peers.peers.swap(connected as usize, Ordering::SeqCst);
                match (previous, connected) {
                    (0, true) => info!("[EthPeerSet] Parent chain connected"),
                    (1, false) => warn!("[EthPeerSet] Parent chain disconnected"),
                    _ => {}
                }
            }
        })
    }
}

impl PeerSet for EthPeerSet {
    fn len(&self) -> usize {
        self.peers.load(Ordering::SeqCst)
    }
}
