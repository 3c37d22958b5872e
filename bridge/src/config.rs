// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::account::{BridgeAccount, DEFAULT_BRIDGE_TX_GAS_LIMIT};
use crate::eth::{
    abi::bridge_abi, new_metered_eth_provider, EthChainBackend, EthContractConfig, EthSigner,
};
use crate::handle_store::HANDLE_TX_STORE_DIR_NAME;
use crate::journal::JOURNAL_FILE_NAME;
use crate::metrics::BridgeMetrics;
use crate::recovery::RecoveryConfig;
use anyhow::{anyhow, Context};
use bridge_config::Config;
use ethers::middleware::SignerMiddleware;
use ethers::providers::Middleware;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::U256;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

fn default_true() -> bool {
    true
}

fn default_vt_recovery_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_gas_limit() -> u64 {
    DEFAULT_BRIDGE_TX_GAS_LIMIT
}

fn default_log_poll_interval_ms() -> u64 {
    1000
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_metrics_port() -> u16 {
    9184
}

fn default_bridge_interval_secs() -> u64 {
    2
}

fn default_log_status_interval_secs() -> u64 {
    60
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ChainConfig {
    // JSON-RPC endpoint, used for queries, log polling and submissions.
    pub rpc_url: String,
    // Expected chain id of the endpoint, also used to sign.
    pub chain_id: u64,
    // File holding the hex encoded private key of the operator account.
    pub operator_key_path: PathBuf,
    // Gas price in wei. The node's suggestion is used when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gas_price: Option<u64>,
    #[serde(default = "default_gas_limit")]
    pub gas_limit: u64,
    #[serde(default = "default_log_poll_interval_ms")]
    pub log_poll_interval_ms: u64,
}

#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct BridgeConfig {
    // Directory of the bridge address journal and the handle tx store.
    pub data_dir: PathBuf,
    #[serde(default = "default_true")]
    pub vt_recovery: bool,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_vt_recovery_interval")]
    pub vt_recovery_interval: Duration,
    // Keep the request to handle tx mapping in RocksDB instead of in memory.
    #[serde(default)]
    pub persist_handle_txs: bool,
    pub child: ChainConfig,
    pub parent: ChainConfig,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    #[serde(default = "default_bridge_interval_secs")]
    pub restore_bridge_interval_secs: u64,
    #[serde(default = "default_bridge_interval_secs")]
    pub reset_bridge_interval_secs: u64,
    #[serde(default = "default_log_status_interval_secs")]
    pub log_status_interval_secs: u64,
}

impl Config for BridgeConfig {}

impl BridgeConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(anyhow!("data-dir must not be empty"));
        }
        if self.vt_recovery && self.vt_recovery_interval.is_zero() {
            return Err(anyhow!(
                "vt-recovery-interval must be positive when vt-recovery is enabled"
            ));
        }
        if self.child.chain_id == self.parent.chain_id {
            return Err(anyhow!(
                "child and parent chains must differ, both have chain id {}",
                self.child.chain_id
            ));
        }
        for (name, chain) in [("child", &self.child), ("parent", &self.parent)] {
            if chain.rpc_url.is_empty() {
                return Err(anyhow!("{}.rpc-url must not be empty", name));
            }
            if chain.log_poll_interval_ms == 0 {
                return Err(anyhow!("{}.log-poll-interval-ms must be positive", name));
            }
        }
        if self.request_timeout_secs == 0 {
            return Err(anyhow!("request-timeout-secs must be positive"));
        }
        Ok(())
    }

    pub fn journal_path(&self) -> PathBuf {
        self.data_dir.join(JOURNAL_FILE_NAME)
    }

    pub fn handle_store_path(&self) -> PathBuf {
        self.data_dir.join(HANDLE_TX_STORE_DIR_NAME)
    }

    pub fn recovery_config(&self) -> RecoveryConfig {
        RecoveryConfig {
            enabled: self.vt_recovery,
            interval: self.vt_recovery_interval,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Clients of one connected chain.
pub struct ChainClient {
    pub signer: Arc<EthSigner>,
    pub backend: Arc<EthChainBackend<EthSigner>>,
    pub account: BridgeAccount,
}

impl ChainConfig {
    pub fn read_operator_key(&self) -> anyhow::Result<LocalWallet> {
        read_operator_key(&self.operator_key_path, self.chain_id)
    }

    /// Connects to the endpoint and checks it serves the configured chain.
    pub async fn connect(
        &self,
        label: &'static str,
        request_timeout: Duration,
        metrics: Arc<BridgeMetrics>,
    ) -> anyhow::Result<ChainClient> {
        let poll_interval = Duration::from_millis(self.log_poll_interval_ms);
        let provider = new_metered_eth_provider(&self.rpc_url, label, metrics, poll_interval)
            .with_context(|| format!("invalid {} rpc url {}", label, self.rpc_url))?;
        let chain_id = tokio::time::timeout(request_timeout, provider.get_chainid())
            .await
            .map_err(|_| anyhow!("timed out reading {} chain id", label))??
            .as_u64();
        if chain_id != self.chain_id {
            return Err(anyhow!(
                "{} chain id mismatch: expected {}, but connected to {}",
                label,
                self.chain_id,
                chain_id
            ));
        }

        let wallet = self.read_operator_key()?;
        let account = BridgeAccount::new(
            wallet.address(),
            self.chain_id,
            self.gas_price.map(U256::from),
            self.gas_limit,
        );
        let signer = Arc::new(SignerMiddleware::new(provider, wallet));
        let backend = Arc::new(EthChainBackend::new(
            signer.clone(),
            bridge_abi()?,
            EthContractConfig {
                request_timeout,
                log_poll_interval: poll_interval,
            },
        ));
        info!(
            "Connected to {} chain {} operator={:?}",
            label,
            chain_id,
            account.address()
        );
        Ok(ChainClient {
            signer,
            backend,
            account,
        })
    }
}

fn read_operator_key(path: &Path, chain_id: u64) -> anyhow::Result<LocalWallet> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("unable to read operator key {:?}", path))?;
    let wallet = LocalWallet::from_str(content.trim())
        .map_err(|e| anyhow!("invalid operator key in {:?}: {}", path, e))?;
    Ok(wallet.with_chain_id(chain_id))
}
