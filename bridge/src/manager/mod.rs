// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Registry of bridge infos, the bridge address journal and the recoveries
//! of subscribed pairs.
//!
//! Infos refer to each other only by address; the registry is the single
//! owner. Pair lifecycle operations keep the journal in step with the
//! registry: registration appends a journal entry, every subscribed flag
//! change and every removal is persisted by rotating the journal.

mod operator;
mod subscription;

pub use subscription::FeedSubscription;

use crate::account::{BridgeAccount, BridgeAccounts};
use crate::bridge_info::BridgeInfo;
use crate::contract::{BridgeContract, ChainBackend, PeerSet};
use crate::error::{BridgeError, BridgeResult};
use crate::handle_store::HandleTxStore;
use crate::journal::{BridgeAddrJournal, BridgeJournalEntry};
use crate::metrics::BridgeMetrics;
use crate::recovery::{RecoveryConfig, ValueTransferRecovery};
use crate::types::TOKEN_EVENT_CHAN_SIZE;
use ethers::types::Address;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use subscription::{BridgeSubscriptions, EventFeeders};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Snapshot of one bridge as reported by [`BridgeManager::get_bridge_information`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeInformation {
    pub is_running: bool,
    pub request_nonce: u64,
    pub handle_nonce: u64,
    pub lower_handle_nonce: u64,
    pub counter_part: Address,
    pub on_child_chain: bool,
    pub is_subscribed: bool,
    pub pending_event_size: usize,
}

/// Nonce totals of one transfer direction, over subscribed bridges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirectionStatus {
    pub request: u64,
    pub handle: u64,
    pub lower_handle: u64,
}

impl DirectionStatus {
    fn add(&mut self, info: &BridgeInfo) {
        self.request += info.request_nonce_from_counterpart();
        self.handle += info.handle_nonce();
        self.lower_handle += info.lower_handle_nonce();
    }

    pub fn pending(&self) -> u64 {
        self.request.saturating_sub(self.lower_handle)
    }
}

pub struct BridgeManager {
    // child chain is local, parent chain is remote
    child_backend: Arc<dyn ChainBackend>,
    parent_backend: Arc<dyn ChainBackend>,
    accounts: Arc<BridgeAccounts>,
    peers: Arc<dyn PeerSet>,
    handle_store: Arc<dyn HandleTxStore>,
    metrics: Arc<BridgeMetrics>,
    recovery_config: RecoveryConfig,

    bridges: RwLock<HashMap<Address, Arc<BridgeInfo>>>,
    journal: Mutex<BridgeAddrJournal>,
    subscriptions: Mutex<HashMap<Address, BridgeSubscriptions>>,
    recoveries: tokio::sync::Mutex<HashMap<Address, Arc<ValueTransferRecovery>>>,

    feeders: EventFeeders,
    scope: CancellationToken,
}

impl BridgeManager {
    /// Loads the journal at `journal_path` into the cache and rotates it.
    /// A corrupt journal is logged and whatever decoded before the corrupt
    /// record is kept.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        journal_path: impl Into<PathBuf>,
        child_backend: Arc<dyn ChainBackend>,
        parent_backend: Arc<dyn ChainBackend>,
        accounts: Arc<BridgeAccounts>,
        peers: Arc<dyn PeerSet>,
        handle_store: Arc<dyn HandleTxStore>,
        recovery_config: RecoveryConfig,
        metrics: Arc<BridgeMetrics>,
    ) -> Self {
        let mut journal = BridgeAddrJournal::new(journal_path);
        info!(
            "[BridgeManager] Load bridge addresses from journal {:?}",
            journal.path()
        );
        match journal.load(|journal, entry| {
            info!(
                "[BridgeManager] Load bridge address child={:?} parent={:?} subscribed={}",
                entry.child_address, entry.parent_address, entry.subscribed
            );
            journal.insert_cached(entry)
        }) {
            Ok(stats) => {
                metrics.journal_entries_loaded.inc_by(stats.total as u64);
                metrics.journal_entries_dropped.inc_by(stats.dropped as u64);
            }
            Err(e) => error!("[BridgeManager] Failed to load bridge addresses: {:?}", e),
        }
        let entries = journal.entries();
        if let Err(e) = journal.rotate(&entries) {
            error!("[BridgeManager] Failed to rotate bridge journal: {:?}", e);
        }

        Self {
            child_backend,
            parent_backend,
            accounts,
            peers,
            handle_store,
            metrics,
            recovery_config,
            bridges: RwLock::new(HashMap::new()),
            journal: Mutex::new(journal),
            subscriptions: Mutex::new(HashMap::new()),
            recoveries: tokio::sync::Mutex::new(HashMap::new()),
            feeders: EventFeeders::new(TOKEN_EVENT_CHAN_SIZE),
            scope: CancellationToken::new(),
        }
    }

    fn journal(&self) -> MutexGuard<'_, BridgeAddrJournal> {
        self.journal.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn subscriptions(&self) -> MutexGuard<'_, HashMap<Address, BridgeSubscriptions>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn accounts(&self) -> &Arc<BridgeAccounts> {
        &self.accounts
    }

    pub fn handle_store(&self) -> &Arc<dyn HandleTxStore> {
        &self.handle_store
    }

    pub fn is_valid_bridge_pair(&self, bridge1: Address, bridge2: Address) -> bool {
        match (self.get_bridge_info(bridge1), self.get_bridge_info(bridge2)) {
            (Some(b1), Some(b2)) => {
                b2.counterpart_address() == bridge1 && b1.counterpart_address() == bridge2
            }
            _ => false,
        }
    }

    /// Zero when `addr` is not registered.
    pub fn get_counter_part_bridge_addr(&self, addr: Address) -> Address {
        self.get_bridge_info(addr)
            .map(|info| info.counterpart_address())
            .unwrap_or_default()
    }

    pub fn get_counter_part_bridge(&self, addr: Address) -> Option<Arc<dyn BridgeContract>> {
        self.get_bridge_info(addr)
            .map(|info| info.counterpart_bridge().clone())
    }

    pub fn get_bridge_info(&self, addr: Address) -> Option<Arc<BridgeInfo>> {
        self.bridges
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&addr)
            .cloned()
    }

    /// Creates the info of `addr` and starts its worker. `is_local` tells
    /// whether the bridge lives on the child chain.
    #[allow(clippy::too_many_arguments)]
    pub async fn set_bridge_info(
        &self,
        addr: Address,
        bridge: Arc<dyn BridgeContract>,
        cp_addr: Address,
        cp_bridge: Arc<dyn BridgeContract>,
        account: Arc<BridgeAccount>,
        is_local: bool,
        subscribed: bool,
    ) -> BridgeResult<Arc<BridgeInfo>> {
        if self.get_bridge_info(addr).is_some() {
            return Err(BridgeError::DuplicatedBridgeInfo);
        }
        let counterpart_backend = if is_local {
            self.parent_backend.clone()
        } else {
            self.child_backend.clone()
        };
        let info = BridgeInfo::new(
            addr,
            bridge,
            cp_addr,
            cp_bridge,
            account,
            is_local,
            subscribed,
            counterpart_backend,
            self.handle_store.clone(),
            self.metrics.clone(),
        )
        .await?;

        let mut bridges = self.bridges.write().unwrap_or_else(PoisonError::into_inner);
        if bridges.contains_key(&addr) {
            // lost a race with a concurrent registration
            info.close();
            return Err(BridgeError::DuplicatedBridgeInfo);
        }
        bridges.insert(addr, info.clone());
        Ok(info)
    }

    /// Closes the info of `addr` and drops it from the registry.
    pub fn delete_bridge_info(&self, addr: Address) -> BridgeResult<()> {
        let info = self
            .bridges
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&addr)
            .ok_or(BridgeError::NoBridgeInfo)?;
        info.close();
        Ok(())
    }

    pub fn set_journal(&self, local: Address, remote: Address) -> BridgeResult<()> {
        self.journal().insert(local, remote)
    }

    /// Snapshot of the journal cache.
    pub fn get_all_bridge(&self) -> Vec<BridgeJournalEntry> {
        self.journal().entries()
    }

    pub fn journal_len(&self) -> usize {
        self.journal().len()
    }

    fn rotate_journal(&self) -> BridgeResult<()> {
        let mut journal = self.journal();
        let entries = journal.entries();
        journal.rotate(&entries)
    }

    /// Re-creates infos, subscriptions and recoveries of every journaled
    /// pair. Fails unless every pair was restored; a pair restored before
    /// the failure stays in place.
    pub async fn restore_bridges(&self) -> BridgeResult<()> {
        if self.peers.is_empty() {
            error!("[BridgeManager] Check peer connections to restore bridges");
            return Err(BridgeError::BridgeRestore);
        }
        self.stop_all_recoveries().await;

        let entries = self.get_all_bridge();
        let mut restored = 0;
        for entry in &entries {
            if let Err(e) = self.restore_bridge_pair(entry).await {
                error!(
                    "[BridgeManager] Failed to restore bridge pair child={:?} parent={:?}: {:?}",
                    entry.child_address, entry.parent_address, e
                );
                break;
            }
            restored += 1;
        }

        if restored == entries.len() {
            info!("[BridgeManager] Succeeded to restore bridges: pairs={}", restored);
            Ok(())
        } else {
            Err(BridgeError::BridgeRestore)
        }
    }

    async fn restore_bridge_pair(&self, entry: &BridgeJournalEntry) -> BridgeResult<()> {
        let child_addr = entry.child_address;
        let parent_addr = entry.parent_address;
        let child_bridge = self.child_backend.bridge_contract(child_addr)?;
        let parent_bridge = self.parent_backend.bridge_contract(parent_addr)?;

        let child = match self.get_bridge_info(child_addr) {
            Some(info) => info,
            None => self
                .set_bridge_info(
                    child_addr,
                    child_bridge.clone(),
                    parent_addr,
                    parent_bridge.clone(),
                    self.accounts.child.clone(),
                    true,
                    false,
                )
                .await
                .map_err(|e| {
                    error!("[BridgeManager] Setting local bridge info failed: {:?}", e);
                    e
                })?,
        };
        let parent = match self.get_bridge_info(parent_addr) {
            Some(info) => info,
            None => self
                .set_bridge_info(
                    parent_addr,
                    parent_bridge,
                    child_addr,
                    child.bridge().clone(),
                    self.accounts.parent.clone(),
                    false,
                    false,
                )
                .await
                .map_err(|e| {
                    error!("[BridgeManager] Setting remote bridge info failed: {:?}", e);
                    e
                })?,
        };

        if entry.subscribed {
            self.unsubscribe_event(child_addr);
            self.unsubscribe_event(parent_addr);

            info!(
                "[BridgeManager] Automatic local bridge subscription {:?}",
                child_addr
            );
            self.subscribe_bridge_event(&child).await?;
            info!(
                "[BridgeManager] Automatic remote bridge subscription {:?}",
                parent_addr
            );
            if let Err(e) = self.subscribe_bridge_event(&parent).await {
                self.unsubscribe_event(child_addr);
                return Err(e);
            }

            let has_recovery = self.recoveries.lock().await.contains_key(&child_addr);
            if !has_recovery {
                if let Err(e) = self.add_recovery(child_addr, parent_addr).await {
                    warn!(
                        "[BridgeManager] Failed to add recovery for {:?}: {:?}",
                        child_addr, e
                    );
                }
            }
        }
        Ok(())
    }

    /// Starts the value transfer recovery of a pair. No-op when recovery
    /// is disabled.
    pub async fn add_recovery(&self, local: Address, remote: Address) -> BridgeResult<()> {
        if !self.recovery_config.enabled {
            info!("[BridgeManager] Value transfer recovery is disabled");
            return Ok(());
        }
        let local_info = self.get_bridge_info(local).ok_or(BridgeError::NoBridgeInfo)?;
        let remote_info = self.get_bridge_info(remote).ok_or(BridgeError::NoBridgeInfo)?;

        let recovery = Arc::new(ValueTransferRecovery::new(
            self.recovery_config,
            local_info,
            remote_info,
            self.metrics.clone(),
        ));
        recovery.start()?;
        let previous = self.recoveries.lock().await.insert(local, recovery);
        if let Some(previous) = previous {
            previous.stop().await?;
        }
        Ok(())
    }

    pub async fn delete_recovery(&self, local: Address, _remote: Address) -> BridgeResult<()> {
        let recovery = self
            .recoveries
            .lock()
            .await
            .remove(&local)
            .ok_or(BridgeError::NoRecovery)?;
        recovery.stop().await
    }

    pub async fn has_recovery(&self, local: Address) -> bool {
        self.recoveries.lock().await.contains_key(&local)
    }

    async fn stop_all_recoveries(&self) {
        let recoveries: Vec<_> = self.recoveries.lock().await.drain().collect();
        for (addr, recovery) in recoveries {
            if let Err(e) = recovery.stop().await {
                warn!("[BridgeManager] Failed to stop recovery of {:?}: {:?}", addr, e);
            }
        }
    }

    /// Logs nonce totals of subscribed bridges per direction and returns
    /// them as (parent to child, child to parent).
    pub fn log_bridge_status(&self) -> (DirectionStatus, DirectionStatus) {
        let bridges = self.bridges.read().unwrap_or_else(PoisonError::into_inner);
        let mut parent_to_child = DirectionStatus::default();
        let mut child_to_parent = DirectionStatus::default();
        if bridges.is_empty() {
            return (parent_to_child, child_to_parent);
        }

        for (addr, info) in bridges.iter().filter(|(_, info)| info.is_subscribed()) {
            let head = if info.on_child_chain() {
                parent_to_child.add(info);
                "Bridge(Parent -> Child Chain)"
            } else {
                child_to_parent.add(info);
                "Bridge(Child -> Parent Chain)"
            };
            debug!(
                "[BridgeManager] {} bridge={:?} request_nonce={} lower_handle_nonce={} handle_nonce={} pending={}",
                head,
                addr,
                info.request_nonce_from_counterpart(),
                info.lower_handle_nonce(),
                info.handle_nonce(),
                info.request_nonce_from_counterpart()
                    .saturating_sub(info.handle_nonce())
            );
        }
        drop(bridges);

        for (direction, status) in [
            ("parent_to_child", &parent_to_child),
            ("child_to_parent", &child_to_parent),
        ] {
            info!(
                "[BridgeManager] VT {}: request={} handle={} lower_handle={} pending={}",
                direction,
                status.request,
                status.handle,
                status.lower_handle,
                status.pending()
            );
            for (kind, value) in [
                ("request", status.request),
                ("handle", status.handle),
                ("lower_handle", status.lower_handle),
            ] {
                self.metrics
                    .bridge_status_nonces
                    .with_label_values(&[direction, kind])
                    .set(value as i64);
            }
        }
        (parent_to_child, child_to_parent)
    }

    /// Registers a child/parent pair and journals it.
    pub async fn register_bridge_pair(&self, child: Address, parent: Address) -> BridgeResult<()> {
        let child_bridge = self.child_backend.bridge_contract(child)?;
        let parent_bridge = self.parent_backend.bridge_contract(parent)?;

        self.set_bridge_info(
            child,
            child_bridge.clone(),
            parent,
            parent_bridge.clone(),
            self.accounts.child.clone(),
            true,
            false,
        )
        .await?;
        if let Err(e) = self
            .set_bridge_info(
                parent,
                parent_bridge,
                child,
                child_bridge,
                self.accounts.parent.clone(),
                false,
                false,
            )
            .await
        {
            let _ = self.delete_bridge_info(child);
            return Err(e);
        }

        self.set_journal(child, parent)?;
        info!(
            "[BridgeManager] Registered bridge pair child={:?} parent={:?}",
            child, parent
        );
        Ok(())
    }

    pub async fn deregister_bridge_pair(&self, child: Address, parent: Address) -> BridgeResult<()> {
        if !self.is_valid_bridge_pair(child, parent) {
            return Err(BridgeError::InvalidBridgePair);
        }

        let subscribed = self
            .journal()
            .get(&child)
            .map(|entry| entry.subscribed)
            .unwrap_or(false);
        if subscribed {
            self.unsubscribe_event(child);
            self.unsubscribe_event(parent);
            if let Err(e) = self.delete_recovery(child, parent).await {
                debug!("[BridgeManager] No recovery to delete for {:?}: {:?}", child, e);
            }
        }

        self.journal().remove(&child);
        if let Err(e) = self.rotate_journal() {
            warn!(
                "[BridgeManager] Failed to rotate bridge journal child={:?} parent={:?}: {:?}",
                child, parent, e
            );
        }
        if let Err(e) = self.delete_bridge_info(child) {
            warn!("[BridgeManager] Failed to delete child chain bridge info {:?}: {:?}", child, e);
        }
        if let Err(e) = self.delete_bridge_info(parent) {
            warn!("[BridgeManager] Failed to delete parent chain bridge info {:?}: {:?}", parent, e);
        }
        info!(
            "[BridgeManager] Deregistered bridge pair child={:?} parent={:?}",
            child, parent
        );
        Ok(())
    }

    pub async fn subscribe_bridge_pair(&self, child: Address, parent: Address) -> BridgeResult<()> {
        if !self.is_valid_bridge_pair(child, parent) {
            return Err(BridgeError::InvalidBridgePair);
        }

        self.subscribe_event(child).await.map_err(|e| {
            error!("[BridgeManager] Failed to subscribe child bridge {:?}: {:?}", child, e);
            e
        })?;
        if let Err(e) = self.subscribe_event(parent).await {
            error!("[BridgeManager] Failed to subscribe parent bridge {:?}: {:?}", parent, e);
            self.unsubscribe_event(child);
            return Err(e);
        }

        self.journal().set_subscribed(&child, true)?;
        self.rotate_journal()?;

        if let Err(e) = self.add_recovery(child, parent).await {
            self.unsubscribe_event(child);
            self.unsubscribe_event(parent);
            return Err(e);
        }
        Ok(())
    }

    pub async fn unsubscribe_bridge_pair(&self, child: Address, parent: Address) -> BridgeResult<()> {
        if !self.is_valid_bridge_pair(child, parent) {
            return Err(BridgeError::InvalidBridgePair);
        }
        self.unsubscribe_event(child);
        self.unsubscribe_event(parent);

        self.journal().set_subscribed(&child, false)?;
        self.rotate_journal()
    }

    /// Refreshes the info of `addr` from its contract and snapshots it.
    pub async fn get_bridge_information(&self, addr: Address) -> BridgeResult<BridgeInformation> {
        if self.get_counter_part_bridge_addr(addr).is_zero() {
            return Err(BridgeError::InvalidBridgePair);
        }
        let info = self.get_bridge_info(addr).ok_or(BridgeError::NoBridgeInfo)?;
        if let Err(e) = info.update_info().await {
            warn!("[BridgeManager] Failed to update bridge info {:?}: {:?}", addr, e);
        }
        Ok(BridgeInformation {
            is_running: info.is_running(),
            request_nonce: info.request_nonce_from_counterpart(),
            handle_nonce: info.handle_nonce(),
            lower_handle_nonce: info.lower_handle_nonce(),
            counter_part: info.counterpart_address(),
            on_child_chain: info.on_child_chain(),
            is_subscribed: info.is_subscribed(),
            pending_event_size: info.pending_len(),
        })
    }

    /// Closes every info, the subscription scope and the feeders, stops the
    /// recoveries and closes the journal.
    pub async fn stop(&self) {
        {
            let bridges = self.bridges.read().unwrap_or_else(PoisonError::into_inner);
            for info in bridges.values() {
                info.close();
            }
        }
        self.scope.cancel();
        self.stop_all_recoveries().await;
        if let Err(e) = self.journal().close() {
            warn!("[BridgeManager] Failed to close bridge journal: {:?}", e);
        }
        info!("[BridgeManager] Stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.scope.is_cancelled()
    }
}

#[cfg(test)]
mod tests;
