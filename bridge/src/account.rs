// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Operator accounts that sign bridge transactions.
//!
//! The account lock must be held from [`AccountGuard::generate_transact_opts`]
//! until the submission result is known, and released after a single
//! submission.

use crate::contract::ChainBackend;
use crate::error::BridgeResult;
use ethers::types::{Address, U256};
use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard};
use tracing::info;

pub const DEFAULT_BRIDGE_TX_GAS_LIMIT: u64 = 10_000_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactOpts {
    pub from: Address,
    // None lets the backend pick the pending state nonce
    pub nonce: Option<u64>,
    pub gas_limit: u64,
    pub gas_price: Option<U256>,
    pub chain_id: u64,
}

#[derive(Debug)]
struct AccountState {
    nonce: u64,
    is_nonce_synced: bool,
}

#[derive(Debug)]
pub struct BridgeAccount {
    address: Address,
    chain_id: u64,
    gas_price: Option<U256>,
    gas_limit: u64,
    state: Mutex<AccountState>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountSummary {
    pub address: Address,
    pub nonce: u64,
    pub is_nonce_synced: bool,
    pub chain_id: u64,
    pub gas_price: Option<U256>,
}

impl BridgeAccount {
    pub fn new(address: Address, chain_id: u64, gas_price: Option<U256>, gas_limit: u64) -> Self {
        Self {
            address,
            chain_id,
            gas_price,
            gas_limit,
            state: Mutex::new(AccountState {
                nonce: 0,
                is_nonce_synced: false,
            }),
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub async fn lock(&self) -> AccountGuard<'_> {
        AccountGuard {
            account: self,
            state: self.state.lock().await,
        }
    }

    /// Reads the pending nonce from the chain and starts tracking it locally.
    pub async fn sync_nonce(&self, backend: &dyn ChainBackend) -> BridgeResult<u64> {
        let mut guard = self.lock().await;
        let nonce = backend.pending_nonce_at(self.address).await?;
        guard.set_nonce(nonce);
        info!(
            "[BridgeAccount] Synced nonce of {:?} on chain {}: {}",
            self.address, self.chain_id, nonce
        );
        Ok(nonce)
    }

    pub async fn summary(&self) -> AccountSummary {
        let state = self.state.lock().await;
        AccountSummary {
            address: self.address,
            nonce: state.nonce,
            is_nonce_synced: state.is_nonce_synced,
            chain_id: self.chain_id,
            gas_price: self.gas_price,
        }
    }
}

pub struct AccountGuard<'a> {
    account: &'a BridgeAccount,
    state: MutexGuard<'a, AccountState>,
}

impl AccountGuard<'_> {
    pub fn generate_transact_opts(&self) -> TransactOpts {
        TransactOpts {
            from: self.account.address,
            nonce: self.state.is_nonce_synced.then_some(self.state.nonce),
            gas_limit: self.account.gas_limit,
            gas_price: self.account.gas_price,
            chain_id: self.account.chain_id,
        }
    }

    pub fn inc_nonce(&mut self) {
        self.state.nonce += 1;
    }

    pub fn set_nonce(&mut self, nonce: u64) {
        self.state.nonce = nonce;
        self.state.is_nonce_synced = true;
    }

    pub fn nonce(&self) -> u64 {
        self.state.nonce
    }
}

#[derive(Debug)]
pub struct BridgeAccounts {
    pub parent: std::sync::Arc<BridgeAccount>,
    pub child: std::sync::Arc<BridgeAccount>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeOperators {
    pub parent_operator: AccountSummary,
    pub child_operator: AccountSummary,
}

impl BridgeAccounts {
    pub fn new(parent: BridgeAccount, child: BridgeAccount) -> Self {
        Self {
            parent: std::sync::Arc::new(parent),
            child: std::sync::Arc::new(child),
        }
    }

    pub async fn get_bridge_operators(&self) -> BridgeOperators {
        BridgeOperators {
            parent_operator: self.parent.summary().await,
            child_operator: self.child.summary().await,
        }
    }
}
