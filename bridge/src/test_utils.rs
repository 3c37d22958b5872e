// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Mock chain and contract clients plus event builders shared by unit tests.

use crate::account::{BridgeAccount, TransactOpts};
use crate::bridge_info::BridgeInfo;
use crate::contract::{
    event_subscription, BridgeContract, ChainBackend, EventSink, EventSubscription,
    HandleTransferCall, PeerSet,
};
use crate::error::{BridgeError, BridgeResult};
use crate::handle_store::InMemoryHandleTxStore;
use crate::metrics::BridgeMetrics;
use crate::types::{
    HandleValueTransferEvent, RawLog, RequestValueTransfer, RequestValueTransferEncoded,
    RequestValueTransferEvent, TokenType, VoteType,
};
use async_trait::async_trait;
use ethers::types::{Address, Bytes, H256, U256};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Routes `tracing` output through the test harness. Safe to call from
/// every test.
pub fn init_for_testing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("debug"))
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Default)]
struct ContractState {
    request_nonce: u64,
    lower_handle_nonce: u64,
    recovery_block_number: u64,
    is_running: bool,
    configuration_nonce: u64,
    registered_tokens: HashMap<Address, Address>,
    handled_block_nums: HashMap<u64, u64>,
    operator_thresholds: HashMap<u8, u8>,
    erc20_fees: HashMap<Address, U256>,
    klay_fee: U256,
    fee_receiver: Address,
    operators: Vec<Address>,
}

#[derive(Default)]
struct Watchers {
    request: Vec<EventSink<RequestValueTransferEvent>>,
    request_encoded: Vec<EventSink<RequestValueTransferEvent>>,
    handle: Vec<EventSink<HandleValueTransferEvent>>,
}

// Mock bridge contract. Clones share state, so a test keeps one handle while
// the code under test owns another.
#[allow(clippy::type_complexity)]
#[derive(Clone)]
pub struct MockBridgeContract {
    address: Address,
    state: Arc<Mutex<ContractState>>,
    failing_handle_nonces: Arc<Mutex<HashSet<u64>>>,
    failed_attempts: Arc<AtomicUsize>,
    handled_calls: Arc<Mutex<Vec<(TokenType, HandleTransferCall)>>>,
    config_calls: Arc<Mutex<Vec<String>>>,
    logged_events: Arc<Mutex<Vec<RequestValueTransferEvent>>>,
    filter_queries: Arc<Mutex<Vec<(u64, Option<u64>)>>>,
    watchers: Arc<Mutex<Watchers>>,
    watch_error: Arc<Mutex<Option<BridgeError>>>,
    failing_views: Arc<Mutex<Option<BridgeError>>>,
    failing_token_txs: Arc<Mutex<Option<BridgeError>>>,
    next_tx: Arc<AtomicU64>,
}

impl MockBridgeContract {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            state: Arc::new(Mutex::new(ContractState {
                is_running: true,
                ..Default::default()
            })),
            failing_handle_nonces: Default::default(),
            failed_attempts: Default::default(),
            handled_calls: Default::default(),
            config_calls: Default::default(),
            logged_events: Default::default(),
            filter_queries: Default::default(),
            watchers: Default::default(),
            watch_error: Default::default(),
            failing_views: Default::default(),
            failing_token_txs: Default::default(),
            next_tx: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn set_request_nonce(&self, nonce: u64) {
        self.state.lock().unwrap().request_nonce = nonce;
    }

    pub fn set_lower_handle_nonce(&self, nonce: u64) {
        self.state.lock().unwrap().lower_handle_nonce = nonce;
    }

    pub fn set_recovery_block_number(&self, block: u64) {
        self.state.lock().unwrap().recovery_block_number = block;
    }

    pub fn set_is_running(&self, running: bool) {
        self.state.lock().unwrap().is_running = running;
    }

    pub fn set_configuration_nonce(&self, nonce: u64) {
        self.state.lock().unwrap().configuration_nonce = nonce;
    }

    pub fn set_registered_token(&self, token: Address, counterpart: Address) {
        self.state
            .lock()
            .unwrap()
            .registered_tokens
            .insert(token, counterpart);
    }

    pub fn set_handled_block_num(&self, nonce: u64, block: u64) {
        self.state
            .lock()
            .unwrap()
            .handled_block_nums
            .insert(nonce, block);
    }

    pub fn set_operators(&self, operators: Vec<Address>) {
        self.state.lock().unwrap().operators = operators;
    }

    /// Every view call fails with `err` until cleared with `None`.
    pub fn set_failing_views(&self, err: Option<BridgeError>) {
        *self.failing_views.lock().unwrap() = err;
    }

    /// Token (de)registration transactions fail with `err` until cleared.
    pub fn set_failing_token_txs(&self, err: Option<BridgeError>) {
        *self.failing_token_txs.lock().unwrap() = err;
    }

    pub fn registered_token(&self, token: Address) -> Option<Address> {
        self.state
            .lock()
            .unwrap()
            .registered_tokens
            .get(&token)
            .copied()
    }

    pub fn fail_handle_nonce(&self, nonce: u64) {
        self.failing_handle_nonces.lock().unwrap().insert(nonce);
    }

    pub fn clear_handle_failures(&self) {
        self.failing_handle_nonces.lock().unwrap().clear();
    }

    pub fn failed_attempts(&self) -> usize {
        self.failed_attempts.load(Ordering::SeqCst)
    }

    pub fn handled_calls(&self) -> Vec<(TokenType, HandleTransferCall)> {
        self.handled_calls.lock().unwrap().clone()
    }

    pub fn handled_nonces(&self) -> Vec<u64> {
        self.handled_calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, call)| call.request_nonce)
            .collect()
    }

    pub fn config_calls(&self) -> Vec<String> {
        self.config_calls.lock().unwrap().clone()
    }

    /// Adds a request event to the historical logs served by the filters.
    pub fn add_logged_event(&self, ev: RequestValueTransferEvent) {
        self.logged_events.lock().unwrap().push(ev);
    }

    pub fn filter_queries(&self) -> Vec<(u64, Option<u64>)> {
        self.filter_queries.lock().unwrap().clone()
    }

    /// Next `watch_*` call fails with `err`.
    pub fn fail_next_watch(&self, err: BridgeError) {
        *self.watch_error.lock().unwrap() = Some(err);
    }

    pub fn active_watchers(&self) -> usize {
        let watchers = self.watchers.lock().unwrap();
        watchers
            .request
            .iter()
            .filter(|s| !s.cancel.is_cancelled())
            .count()
            + watchers
                .request_encoded
                .iter()
                .filter(|s| !s.cancel.is_cancelled())
                .count()
            + watchers
                .handle
                .iter()
                .filter(|s| !s.cancel.is_cancelled())
                .count()
    }

    pub fn emit_request(&self, ev: RequestValueTransferEvent) {
        let watchers = self.watchers.lock().unwrap();
        let sinks = match ev {
            RequestValueTransferEvent::Plain(_) => &watchers.request,
            RequestValueTransferEvent::Encoded(_) => &watchers.request_encoded,
        };
        for sink in sinks.iter().filter(|s| !s.cancel.is_cancelled()) {
            let _ = sink.events.try_send(ev.clone());
        }
    }

    pub fn emit_handle(&self, ev: HandleValueTransferEvent) {
        let watchers = self.watchers.lock().unwrap();
        for sink in watchers.handle.iter().filter(|s| !s.cancel.is_cancelled()) {
            let _ = sink.events.try_send(ev.clone());
        }
    }

    /// Delivers `err` on the error channel of every live handle-event watcher.
    pub fn fail_handle_watchers(&self, err: BridgeError) {
        let mut watchers = self.watchers.lock().unwrap();
        for sink in std::mem::take(&mut watchers.handle) {
            let _ = sink.err.send(err.clone());
        }
    }

    fn check_views(&self) -> BridgeResult<()> {
        match self.failing_views.lock().unwrap().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn next_tx_hash(&self) -> H256 {
        H256::from_low_u64_be(self.next_tx.fetch_add(1, Ordering::SeqCst))
    }

    fn record_handle(&self, token_type: TokenType, call: &HandleTransferCall) -> BridgeResult<H256> {
        if self
            .failing_handle_nonces
            .lock()
            .unwrap()
            .contains(&call.request_nonce)
        {
            self.failed_attempts.fetch_add(1, Ordering::SeqCst);
            return Err(BridgeError::ContractError(format!(
                "execution reverted: nonce {}",
                call.request_nonce
            )));
        }
        self.handled_calls
            .lock()
            .unwrap()
            .push((token_type, call.clone()));
        Ok(self.next_tx_hash())
    }

    fn record_config(&self, call: String) -> H256 {
        self.config_calls.lock().unwrap().push(call);
        self.next_tx_hash()
    }

    fn take_watch_error(&self) -> BridgeResult<()> {
        match self.watch_error.lock().unwrap().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn filter_logged(&self, encoded: bool, start: u64, end: Option<u64>) -> Vec<RequestValueTransferEvent> {
        self.filter_queries.lock().unwrap().push((start, end));
        self.logged_events
            .lock()
            .unwrap()
            .iter()
            .filter(|ev| matches!(ev, RequestValueTransferEvent::Encoded(_)) == encoded)
            .filter(|ev| {
                let block = ev.raw().block_number;
                block >= start && end.map(|end| block <= end).unwrap_or(true)
            })
            .cloned()
            .collect()
    }
}

#[async_trait]
impl BridgeContract for MockBridgeContract {
    fn address(&self) -> Address {
        self.address
    }

    async fn request_nonce(&self) -> BridgeResult<u64> {
        self.check_views()?;
        Ok(self.state.lock().unwrap().request_nonce)
    }

    async fn lower_handle_nonce(&self) -> BridgeResult<u64> {
        self.check_views()?;
        Ok(self.state.lock().unwrap().lower_handle_nonce)
    }

    async fn recovery_block_number(&self) -> BridgeResult<u64> {
        self.check_views()?;
        Ok(self.state.lock().unwrap().recovery_block_number)
    }

    async fn is_running(&self) -> BridgeResult<bool> {
        self.check_views()?;
        Ok(self.state.lock().unwrap().is_running)
    }

    async fn configuration_nonce(&self) -> BridgeResult<u64> {
        self.check_views()?;
        Ok(self.state.lock().unwrap().configuration_nonce)
    }

    async fn registered_tokens(&self, token: Address) -> BridgeResult<Address> {
        self.check_views()?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .registered_tokens
            .get(&token)
            .copied()
            .unwrap_or_default())
    }

    async fn handle_nonces_to_block_nums(&self, nonce: u64) -> BridgeResult<u64> {
        self.check_views()?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .handled_block_nums
            .get(&nonce)
            .copied()
            .unwrap_or_default())
    }

    async fn operator_thresholds(&self, vote_type: VoteType) -> BridgeResult<u8> {
        self.check_views()?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .operator_thresholds
            .get(&(vote_type as u8))
            .copied()
            .unwrap_or_default())
    }

    async fn fee_of_erc20(&self, token: Address) -> BridgeResult<U256> {
        self.check_views()?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .erc20_fees
            .get(&token)
            .copied()
            .unwrap_or_default())
    }

    async fn fee_of_klay(&self) -> BridgeResult<U256> {
        self.check_views()?;
        Ok(self.state.lock().unwrap().klay_fee)
    }

    async fn fee_receiver(&self) -> BridgeResult<Address> {
        self.check_views()?;
        Ok(self.state.lock().unwrap().fee_receiver)
    }

    async fn get_operator_list(&self) -> BridgeResult<Vec<Address>> {
        self.check_views()?;
        Ok(self.state.lock().unwrap().operators.clone())
    }

    async fn handle_klay_transfer(
        &self,
        _opts: &TransactOpts,
        call: &HandleTransferCall,
    ) -> BridgeResult<H256> {
        self.record_handle(TokenType::Native, call)
    }

    async fn handle_erc20_transfer(
        &self,
        _opts: &TransactOpts,
        call: &HandleTransferCall,
    ) -> BridgeResult<H256> {
        self.record_handle(TokenType::Fungible, call)
    }

    async fn handle_erc721_transfer(
        &self,
        _opts: &TransactOpts,
        call: &HandleTransferCall,
    ) -> BridgeResult<H256> {
        self.record_handle(TokenType::NonFungible, call)
    }

    async fn set_erc20_fee(
        &self,
        _opts: &TransactOpts,
        token: Address,
        fee: U256,
        configuration_nonce: u64,
    ) -> BridgeResult<H256> {
        let mut state = self.state.lock().unwrap();
        state.erc20_fees.insert(token, fee);
        state.configuration_nonce = configuration_nonce + 1;
        drop(state);
        Ok(self.record_config(format!(
            "set_erc20_fee({:?},{},{})",
            token, fee, configuration_nonce
        )))
    }

    async fn set_klay_fee(
        &self,
        _opts: &TransactOpts,
        fee: U256,
        configuration_nonce: u64,
    ) -> BridgeResult<H256> {
        let mut state = self.state.lock().unwrap();
        state.klay_fee = fee;
        state.configuration_nonce = configuration_nonce + 1;
        drop(state);
        Ok(self.record_config(format!("set_klay_fee({},{})", fee, configuration_nonce)))
    }

    async fn set_fee_receiver(&self, _opts: &TransactOpts, receiver: Address) -> BridgeResult<H256> {
        self.state.lock().unwrap().fee_receiver = receiver;
        Ok(self.record_config(format!("set_fee_receiver({:?})", receiver)))
    }

    async fn register_operator(
        &self,
        _opts: &TransactOpts,
        operator: Address,
    ) -> BridgeResult<H256> {
        self.state.lock().unwrap().operators.push(operator);
        Ok(self.record_config(format!("register_operator({:?})", operator)))
    }

    async fn set_operator_threshold(
        &self,
        _opts: &TransactOpts,
        vote_type: VoteType,
        threshold: u8,
    ) -> BridgeResult<H256> {
        self.state
            .lock()
            .unwrap()
            .operator_thresholds
            .insert(vote_type as u8, threshold);
        Ok(self.record_config(format!(
            "set_operator_threshold({},{})",
            vote_type as u8, threshold
        )))
    }

    async fn register_token(
        &self,
        _opts: &TransactOpts,
        token: Address,
        counterpart_token: Address,
    ) -> BridgeResult<H256> {
        if let Some(err) = self.failing_token_txs.lock().unwrap().clone() {
            return Err(err);
        }
        self.set_registered_token(token, counterpart_token);
        Ok(self.record_config(format!(
            "register_token({:?},{:?})",
            token, counterpart_token
        )))
    }

    async fn deregister_token(&self, _opts: &TransactOpts, token: Address) -> BridgeResult<H256> {
        if let Some(err) = self.failing_token_txs.lock().unwrap().clone() {
            return Err(err);
        }
        self.state.lock().unwrap().registered_tokens.remove(&token);
        Ok(self.record_config(format!("deregister_token({:?})", token)))
    }

    async fn filter_request_value_transfer(
        &self,
        start: u64,
        end: Option<u64>,
    ) -> BridgeResult<Vec<RequestValueTransferEvent>> {
        self.check_views()?;
        Ok(self.filter_logged(false, start, end))
    }

    async fn filter_request_value_transfer_encoded(
        &self,
        start: u64,
        end: Option<u64>,
    ) -> BridgeResult<Vec<RequestValueTransferEvent>> {
        self.check_views()?;
        Ok(self.filter_logged(true, start, end))
    }

    async fn watch_request_value_transfer(
        &self,
    ) -> BridgeResult<EventSubscription<RequestValueTransferEvent>> {
        self.take_watch_error()?;
        let (sink, sub) = event_subscription();
        self.watchers.lock().unwrap().request.push(sink);
        Ok(sub)
    }

    async fn watch_request_value_transfer_encoded(
        &self,
    ) -> BridgeResult<EventSubscription<RequestValueTransferEvent>> {
        self.take_watch_error()?;
        let (sink, sub) = event_subscription();
        self.watchers.lock().unwrap().request_encoded.push(sink);
        Ok(sub)
    }

    async fn watch_handle_value_transfer(
        &self,
    ) -> BridgeResult<EventSubscription<HandleValueTransferEvent>> {
        self.take_watch_error()?;
        let (sink, sub) = event_subscription();
        self.watchers.lock().unwrap().handle.push(sink);
        Ok(sub)
    }
}

// Mock chain backend. Contract handles are created on first use and shared
// with the test through `contract`.
#[derive(Clone, Default)]
pub struct MockChainBackend {
    block_number: Arc<AtomicU64>,
    pending_nonces: Arc<Mutex<HashMap<Address, u64>>>,
    contracts: Arc<Mutex<HashMap<Address, MockBridgeContract>>>,
}

impl MockChainBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_block_number(&self, block: u64) {
        self.block_number.store(block, Ordering::SeqCst);
    }

    pub fn set_pending_nonce(&self, account: Address, nonce: u64) {
        self.pending_nonces.lock().unwrap().insert(account, nonce);
    }

    pub fn add_contract(&self, contract: MockBridgeContract) {
        self.contracts
            .lock()
            .unwrap()
            .insert(contract.address, contract);
    }

    pub fn contract(&self, address: Address) -> MockBridgeContract {
        self.contracts
            .lock()
            .unwrap()
            .entry(address)
            .or_insert_with(|| MockBridgeContract::new(address))
            .clone()
    }
}

#[async_trait]
impl ChainBackend for MockChainBackend {
    async fn current_block_number(&self) -> BridgeResult<u64> {
        Ok(self.block_number.load(Ordering::SeqCst))
    }

    async fn pending_nonce_at(&self, account: Address) -> BridgeResult<u64> {
        Ok(self
            .pending_nonces
            .lock()
            .unwrap()
            .get(&account)
            .copied()
            .unwrap_or_default())
    }

    fn bridge_contract(&self, address: Address) -> BridgeResult<Arc<dyn BridgeContract>> {
        Ok(Arc::new(self.contract(address)))
    }
}

#[derive(Debug, Default)]
pub struct MockPeerSet(AtomicUsize);

impl MockPeerSet {
    pub fn new(peers: usize) -> Self {
        Self(AtomicUsize::new(peers))
    }

    pub fn set_len(&self, peers: usize) {
        self.0.store(peers, Ordering::SeqCst);
    }
}

impl PeerSet for MockPeerSet {
    fn len(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// Plain request emitted by `bridge`, in block `nonce + 1`.
pub fn request_event(bridge: Address, nonce: u64, token_type: TokenType) -> RequestValueTransferEvent {
    RequestValueTransferEvent::Plain(RequestValueTransfer {
        token_type: token_type as u8,
        from: Address::repeat_byte(0xf1),
        to: Address::repeat_byte(0xf2),
        token_address: Address::zero(),
        value_or_token_id: U256::from(1_000 + nonce),
        request_nonce: nonce,
        fee: U256::zero(),
        extra_data: Bytes::default(),
        raw: RawLog {
            block_number: nonce + 1,
            tx_hash: H256::from_low_u64_be(0x1000 + nonce),
            contract_address: bridge,
        },
    })
}

/// Encoded non-fungible request carrying `uri`, in block `nonce + 1`.
pub fn encoded_request_event(bridge: Address, nonce: u64, uri: &str) -> RequestValueTransferEvent {
    RequestValueTransferEvent::Encoded(RequestValueTransferEncoded {
        token_type: TokenType::NonFungible as u8,
        from: Address::repeat_byte(0xf1),
        to: Address::repeat_byte(0xf2),
        token_address: Address::repeat_byte(0x77),
        value_or_token_id: U256::from(nonce),
        request_nonce: nonce,
        fee: U256::zero(),
        encoding_ver: 1,
        uri: uri.to_string(),
        extra_data: Bytes::default(),
        raw: RawLog {
            block_number: nonce + 1,
            tx_hash: H256::from_low_u64_be(0x2000 + nonce),
            contract_address: bridge,
        },
    })
}

pub fn handle_event(
    bridge: Address,
    handle_nonce: u64,
    lower_handle_nonce: u64,
) -> HandleValueTransferEvent {
    HandleValueTransferEvent {
        request_tx_hash: H256::from_low_u64_be(0x1000 + handle_nonce),
        token_type: TokenType::Native as u8,
        from: Address::repeat_byte(0xf1),
        to: Address::repeat_byte(0xf2),
        token_address: Address::zero(),
        value_or_token_id: U256::from(1_000 + handle_nonce),
        handle_nonce,
        lower_handle_nonce,
        extra_data: Bytes::default(),
        raw: RawLog {
            block_number: handle_nonce + 1,
            tx_hash: H256::from_low_u64_be(0x3000 + handle_nonce),
            contract_address: bridge,
        },
    }
}

/// A bridge info on the child chain wired to mocks, without a worker.
pub struct BridgeInfoTestEnv {
    pub address: Address,
    pub counterpart_address: Address,
    pub bridge: MockBridgeContract,
    pub counterpart_bridge: MockBridgeContract,
    pub counterpart_backend: MockChainBackend,
    pub account: Arc<BridgeAccount>,
    pub store: Arc<InMemoryHandleTxStore>,
    pub metrics: Arc<BridgeMetrics>,
    info: Arc<BridgeInfo>,
}

impl BridgeInfoTestEnv {
    pub fn new() -> Self {
        let address = Address::repeat_byte(0xc1);
        let counterpart_address = Address::repeat_byte(0xa1);
        let bridge = MockBridgeContract::new(address);
        let counterpart_bridge = MockBridgeContract::new(counterpart_address);
        let counterpart_backend = MockChainBackend::new();
        counterpart_backend.add_contract(counterpart_bridge.clone());
        let account = Arc::new(BridgeAccount::new(Address::repeat_byte(0xee), 1000, None, 1_000_000));
        let store = Arc::new(InMemoryHandleTxStore::new());
        let metrics = Arc::new(BridgeMetrics::new_for_testing());
        let info = Arc::new(BridgeInfo::create(
            address,
            Arc::new(bridge.clone()),
            counterpart_address,
            Arc::new(counterpart_bridge.clone()),
            account.clone(),
            true,
            false,
            Arc::new(counterpart_backend.clone()),
            store.clone(),
            metrics.clone(),
        ));
        Self {
            address,
            counterpart_address,
            bridge,
            counterpart_bridge,
            counterpart_backend,
            account,
            store,
            metrics,
            info,
        }
    }

    pub fn info(&self) -> &Arc<BridgeInfo> {
        &self.info
    }
}

/// A started bridge info around `bridge`, with every collaborator mocked.
pub async fn new_test_bridge_info(bridge: MockBridgeContract) -> Arc<BridgeInfo> {
    let counterpart_address = Address::repeat_byte(0xa2);
    let backend = MockChainBackend::new();
    BridgeInfo::new(
        bridge.address(),
        Arc::new(bridge.clone()),
        counterpart_address,
        Arc::new(backend.contract(counterpart_address)),
        Arc::new(BridgeAccount::new(Address::repeat_byte(0xee), 1000, None, 1_000_000)),
        true,
        false,
        Arc::new(backend),
        Arc::new(InMemoryHandleTxStore::new()),
        Arc::new(BridgeMetrics::new_for_testing()),
    )
    .await
    .unwrap()
}
