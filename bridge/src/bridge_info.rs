// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Runtime state of one bridge contract and the worker that submits its
//! handle transactions.
//!
//! A `BridgeInfo` handles the requests emitted by its counterpart bridge.
//! Requests are queued by nonce in `pending_request_event`; the worker pops
//! them in ascending order and submits one handle transaction per request,
//! skipping nonces known to be handled already. A failed submission puts the
//! rest of the batch back into the queue and delays the next drain with an
//! exponential backoff.

use crate::account::BridgeAccount;
use crate::contract::{BridgeContract, ChainBackend, HandleTransferCall};
use crate::error::{BridgeError, BridgeResult};
use crate::handle_store::HandleTxStore;
use crate::metrics::BridgeMetrics;
use crate::sorted_map::ItemSortedMap;
use crate::types::{
    HandledNonce, RequestValueTransferEvent, TokenType, MAX_HANDLED_EVENT_SIZE,
    MAX_PENDING_NONCE_DIFF,
};
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use ethers::types::{Address, H256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

const BRIDGE_LOOP_TICK: Duration = Duration::from_secs(1);

pub struct BridgeInfo {
    address: Address,
    counterpart_address: Address,
    bridge: Arc<dyn BridgeContract>,
    counterpart_bridge: Arc<dyn BridgeContract>,
    // chain hosting the counterpart bridge, where the requests we handle are emitted
    counterpart_backend: Arc<dyn ChainBackend>,
    account: Arc<BridgeAccount>,
    handle_store: Arc<dyn HandleTxStore>,
    metrics: Arc<BridgeMetrics>,
    metrics_label: String,
    on_child_chain: bool,

    subscribed: AtomicBool,
    is_running: AtomicBool,

    counterpart_token: RwLock<HashMap<Address, Address>>,
    pending_request_event: ItemSortedMap<RequestValueTransferEvent>,
    handled_event: ItemSortedMap<HandledNonce>,

    request_nonce: AtomicU64,
    request_nonce_from_counterpart: AtomicU64,
    handle_nonce: AtomicU64,
    lower_handle_nonce: AtomicU64,

    new_event: Notify,
    closed: CancellationToken,
}

impl std::fmt::Debug for BridgeInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeInfo")
            .field("address", &self.address)
            .field("counterpart_address", &self.counterpart_address)
            .field("on_child_chain", &self.on_child_chain)
            .field("request_nonce", &self.request_nonce())
            .field("handle_nonce", &self.handle_nonce())
            .field("lower_handle_nonce", &self.lower_handle_nonce())
            .finish()
    }
}

impl BridgeInfo {
    /// Builds the state, seeds it from the contract and spawns the worker.
    #[allow(clippy::too_many_arguments)]
    pub async fn new(
        address: Address,
        bridge: Arc<dyn BridgeContract>,
        counterpart_address: Address,
        counterpart_bridge: Arc<dyn BridgeContract>,
        account: Arc<BridgeAccount>,
        on_child_chain: bool,
        subscribed: bool,
        counterpart_backend: Arc<dyn ChainBackend>,
        handle_store: Arc<dyn HandleTxStore>,
        metrics: Arc<BridgeMetrics>,
    ) -> BridgeResult<Arc<Self>> {
        let info = Arc::new(Self::create(
            address,
            bridge,
            counterpart_address,
            counterpart_bridge,
            account,
            on_child_chain,
            subscribed,
            counterpart_backend,
            handle_store,
            metrics,
        ));
        info.update_info().await?;
        info.start();
        Ok(info)
    }

    /// Builds the state without touching the chain and without a worker.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        address: Address,
        bridge: Arc<dyn BridgeContract>,
        counterpart_address: Address,
        counterpart_bridge: Arc<dyn BridgeContract>,
        account: Arc<BridgeAccount>,
        on_child_chain: bool,
        subscribed: bool,
        counterpart_backend: Arc<dyn ChainBackend>,
        handle_store: Arc<dyn HandleTxStore>,
        metrics: Arc<BridgeMetrics>,
    ) -> Self {
        Self {
            address,
            counterpart_address,
            bridge,
            counterpart_bridge,
            counterpart_backend,
            account,
            handle_store,
            metrics,
            metrics_label: format!("{:?}", address),
            on_child_chain,
            subscribed: AtomicBool::new(subscribed),
            is_running: AtomicBool::new(true),
            counterpart_token: RwLock::new(HashMap::new()),
            pending_request_event: ItemSortedMap::new(),
            handled_event: ItemSortedMap::with_size_limit(MAX_HANDLED_EVENT_SIZE),
            request_nonce: AtomicU64::new(0),
            request_nonce_from_counterpart: AtomicU64::new(0),
            handle_nonce: AtomicU64::new(0),
            lower_handle_nonce: AtomicU64::new(0),
            new_event: Notify::new(),
            closed: CancellationToken::new(),
        }
    }

    /// Spawns the worker loop. It runs until [`close`](Self::close).
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let info = self.clone();
        tokio::spawn(async move { info.run_loop().await })
    }

    async fn run_loop(self: Arc<Self>) {
        info!(
            "[BridgeInfo] Start bridge loop addr={:?} on_child_chain={}",
            self.address, self.on_child_chain
        );
        let mut ticker = tokio::time::interval(BRIDGE_LOOP_TICK);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut retry = SubmitRetry::new();
        loop {
            tokio::select! {
                _ = self.closed.cancelled() => {
                    info!(
                        "[BridgeInfo] Stop bridge loop addr={:?} on_child_chain={}",
                        self.address, self.on_child_chain
                    );
                    return;
                }
                _ = self.new_event.notified() => {}
                _ = ticker.tick() => {}
            }
            if retry.is_deferred() {
                continue;
            }
            match self.processing_pending_request_events().await {
                Ok(()) => retry.reset(),
                Err(e) => {
                    let delay = retry.defer();
                    debug!(
                        "[BridgeInfo] Handle submission failed on {:?}, next attempt in {:?}: {:?}",
                        self.address, delay, e
                    );
                }
            }
        }
    }

    /// Drains one batch of pending requests into handle transactions.
    pub async fn processing_pending_request_events(&self) -> BridgeResult<()> {
        let ready = self.pending_request_event.pop(MAX_PENDING_NONCE_DIFF / 2);
        self.update_pending_gauge();
        if ready.is_empty() {
            return Ok(());
        }
        trace!(
            "[BridgeInfo] Got ready request events addr={:?} ready={} pending={}",
            self.address,
            ready.len(),
            self.pending_request_event.len()
        );

        for (idx, ev) in ready.iter().enumerate() {
            let nonce = ev.request_nonce();
            if nonce < self.lower_handle_nonce() || self.handled_event.exist(nonce) {
                trace!(
                    "[BridgeInfo] Skip handled request nonce={} lower_handle_nonce={}",
                    nonce,
                    self.lower_handle_nonce()
                );
                continue;
            }
            if let Err(e) = self.handle_request_value_transfer_event(ev).await {
                self.metrics
                    .handle_tx_failed
                    .with_label_values(&[&self.metrics_label, e.error_type()])
                    .inc();
                let requeue = ready[idx..].to_vec();
                debug!(
                    "[BridgeInfo] Failed to handle request nonce={} on {:?}, re-queue {} events: {:?}",
                    nonce,
                    self.address,
                    requeue.len(),
                    e
                );
                self.add_request_value_transfer_events(requeue);
                return Err(e);
            }
        }
        Ok(())
    }

    async fn handle_request_value_transfer_event(
        &self,
        ev: &RequestValueTransferEvent,
    ) -> BridgeResult<()> {
        let token_type = match TokenType::try_from(ev.token_type()) {
            Ok(token_type) => token_type,
            Err(unknown) => {
                error!(
                    "[BridgeInfo] Got unknown token type {} bridge={:?} nonce={} from={:?}",
                    unknown,
                    ev.raw().contract_address,
                    ev.request_nonce(),
                    ev.from()
                );
                return Ok(());
            }
        };

        let token_address = match token_type {
            TokenType::Native => Address::zero(),
            _ => self.resolve_counterpart_token(ev.token_address()).await?,
        };
        let call = HandleTransferCall::from_request(ev, token_address);

        let mut account = self.account.lock().await;
        let opts = account.generate_transact_opts();
        let handle_tx = match token_type {
            TokenType::Native => self.bridge.handle_klay_transfer(&opts, &call).await?,
            TokenType::Fungible => self.bridge.handle_erc20_transfer(&opts, &call).await?,
            TokenType::NonFungible => self.bridge.handle_erc721_transfer(&opts, &call).await?,
        };
        account.inc_nonce();
        drop(account);

        trace!(
            "[BridgeInfo] Submitted handle {:?} transfer nonce={} tx={:?}",
            token_type,
            call.request_nonce,
            handle_tx
        );
        self.metrics
            .handle_tx_submitted
            .with_label_values(&[&self.metrics_label])
            .inc();
        self.record_handle_tx(call.request_tx_hash, handle_tx).await;
        self.mark_handled_nonce(call.request_nonce);
        Ok(())
    }

    async fn resolve_counterpart_token(&self, token: Address) -> BridgeResult<Address> {
        let known = self.get_counterpart_token(token);
        if !known.is_zero() {
            return Ok(known);
        }
        warn!(
            "[BridgeInfo] Unregistered counterpart token for {:?} on {:?}",
            token, self.address
        );
        let counterpart_token = self.counterpart_bridge.registered_tokens(token).await?;
        if counterpart_token.is_zero() {
            return Err(BridgeError::UnregisteredCounterpartToken);
        }
        // a concurrent registration of the same pair is fine
        match self.register_token(token, counterpart_token) {
            Ok(()) | Err(BridgeError::DuplicatedToken) => {}
            Err(e) => return Err(e),
        }
        info!(
            "[BridgeInfo] Registered counterpart token {:?} -> {:?}",
            token, counterpart_token
        );
        Ok(counterpart_token)
    }

    async fn record_handle_tx(&self, request_tx_hash: H256, handle_tx_hash: H256) {
        // the transaction is already out, a store failure must not cause a resubmission
        if let Err(e) = self
            .handle_store
            .write_handle_tx_hash_from_request_tx_hash(request_tx_hash, handle_tx_hash)
            .await
        {
            warn!(
                "[BridgeInfo] Failed to store handle tx {:?} of request {:?}: {:?}",
                handle_tx_hash, request_tx_hash, e
            );
        }
    }

    /// Reads the nonces and the pause flag from the contract.
    pub async fn update_info(&self) -> BridgeResult<()> {
        let request_nonce = self.bridge.request_nonce().await?;
        let lower_handle_nonce = self.bridge.lower_handle_nonce().await?;
        let is_running = self.bridge.is_running().await?;

        self.update_request_nonce(request_nonce);
        self.update_lower_handle_nonce(lower_handle_nonce);
        self.is_running.store(is_running, Ordering::SeqCst);
        Ok(())
    }

    pub fn register_token(&self, token: Address, counterpart_token: Address) -> BridgeResult<()> {
        let mut tokens = self
            .counterpart_token
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if tokens.contains_key(&token) {
            return Err(BridgeError::DuplicatedToken);
        }
        tokens.insert(token, counterpart_token);
        Ok(())
    }

    pub fn deregister_token(&self, token: Address, _counterpart_token: Address) -> BridgeResult<()> {
        self.counterpart_token
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&token)
            .map(|_| ())
            .ok_or(BridgeError::InvalidTokenPair)
    }

    /// Zero when `token` is not mapped.
    pub fn get_counterpart_token(&self, token: Address) -> Address {
        self.counterpart_token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&token)
            .copied()
            .unwrap_or_default()
    }

    /// Queues requests emitted by the counterpart bridge. When the queue is
    /// over its soft limit only nonces below the current maximum get in,
    /// each one evicting the maximum.
    pub fn add_request_value_transfer_events(&self, events: Vec<RequestValueTransferEvent>) {
        for ev in events {
            let nonce = ev.request_nonce();
            if !self
                .pending_request_event
                .put_with_limit(ev, MAX_PENDING_NONCE_DIFF)
            {
                trace!(
                    "[BridgeInfo] Pending queue full, dropped request nonce={} on {:?}",
                    nonce,
                    self.address
                );
                self.metrics
                    .dropped_request_events
                    .with_label_values(&[&self.metrics_label])
                    .inc();
                continue;
            }
            self.update_request_nonce_from_counterpart(nonce.saturating_add(1));
        }
        self.update_pending_gauge();
        trace!(
            "[BridgeInfo] Added pending request events on {:?}: pending={}",
            self.address,
            self.pending_request_event.len()
        );
        // a stored permit is enough, repeated signals coalesce
        self.new_event.notify_one();
    }

    pub fn mark_handled_nonce(&self, nonce: u64) {
        if nonce >= self.lower_handle_nonce() {
            self.handled_event.put(HandledNonce(nonce));
        }
        self.update_handled_nonce(nonce.saturating_add(1));
    }

    pub fn update_request_nonce(&self, nonce: u64) {
        let new = self.request_nonce.fetch_max(nonce, Ordering::SeqCst).max(nonce);
        self.metrics
            .request_nonce
            .with_label_values(&[&self.metrics_label])
            .set(new as i64);
    }

    pub fn update_request_nonce_from_counterpart(&self, nonce: u64) {
        self.request_nonce_from_counterpart
            .fetch_max(nonce, Ordering::SeqCst);
    }

    pub fn update_handled_nonce(&self, nonce: u64) {
        let new = self.handle_nonce.fetch_max(nonce, Ordering::SeqCst).max(nonce);
        self.update_request_nonce_from_counterpart(new);
        self.metrics
            .handle_nonce
            .with_label_values(&[&self.metrics_label])
            .set(new as i64);
    }

    /// Advances the contract watermark and forgets handled nonces below it.
    pub fn update_lower_handle_nonce(&self, nonce: u64) {
        let new = self
            .lower_handle_nonce
            .fetch_max(nonce, Ordering::SeqCst)
            .max(nonce);
        self.handled_event.forward(new);
        self.update_handled_nonce(new);
        self.metrics
            .lower_handle_nonce
            .with_label_values(&[&self.metrics_label])
            .set(new as i64);
    }

    /// Head of the chain hosting the counterpart bridge.
    pub async fn get_current_block_number(&self) -> BridgeResult<u64> {
        self.counterpart_backend.current_block_number().await
    }

    fn update_pending_gauge(&self) {
        self.metrics
            .pending_request_events
            .with_label_values(&[&self.metrics_label])
            .set(self.pending_request_event.len() as i64);
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Cancelled once the info is closed.
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn counterpart_address(&self) -> Address {
        self.counterpart_address
    }

    pub fn bridge(&self) -> &Arc<dyn BridgeContract> {
        &self.bridge
    }

    pub fn counterpart_bridge(&self) -> &Arc<dyn BridgeContract> {
        &self.counterpart_bridge
    }

    pub fn account(&self) -> &Arc<BridgeAccount> {
        &self.account
    }

    pub fn on_child_chain(&self) -> bool {
        self.on_child_chain
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::SeqCst)
    }

    pub fn set_subscribed(&self, subscribed: bool) {
        self.subscribed.store(subscribed, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub fn request_nonce(&self) -> u64 {
        self.request_nonce.load(Ordering::SeqCst)
    }

    pub fn request_nonce_from_counterpart(&self) -> u64 {
        self.request_nonce_from_counterpart.load(Ordering::SeqCst)
    }

    pub fn handle_nonce(&self) -> u64 {
        self.handle_nonce.load(Ordering::SeqCst)
    }

    pub fn lower_handle_nonce(&self) -> u64 {
        self.lower_handle_nonce.load(Ordering::SeqCst)
    }

    pub fn pending_len(&self) -> usize {
        self.pending_request_event.len()
    }

    pub fn pending_nonces(&self) -> Vec<u64> {
        self.pending_request_event
            .flatten()
            .iter()
            .map(|ev| ev.request_nonce())
            .collect()
    }

    pub fn is_handled(&self, nonce: u64) -> bool {
        self.handled_event.exist(nonce)
    }
}

/// Delay between drains after a failed submission. Inactive until the first
/// failure; a successful drain clears it.
struct SubmitRetry {
    backoff: ExponentialBackoff,
    deferred_until: Option<Instant>,
}

impl SubmitRetry {
    fn new() -> Self {
        Self {
            backoff: ExponentialBackoff {
                initial_interval: Duration::from_secs(1),
                randomization_factor: 0.1,
                multiplier: 2.0,
                max_interval: Duration::from_secs(60),
                max_elapsed_time: None,
                ..Default::default()
            },
            deferred_until: None,
        }
    }

    fn is_deferred(&self) -> bool {
        self.deferred_until
            .map(|until| Instant::now() < until)
            .unwrap_or(false)
    }

    fn defer(&mut self) -> Duration {
        let delay = self
            .backoff
            .next_backoff()
            .unwrap_or(self.backoff.max_interval);
        self.deferred_until = Some(Instant::now() + delay);
        delay
    }

    fn reset(&mut self) {
        if self.deferred_until.take().is_some() {
            self.backoff.reset();
        }
    }
}
