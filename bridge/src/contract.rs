// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Capabilities the coordinator needs from a chain and its bridge contract.
//! The ethers implementation lives in [`crate::eth`]; tests use the mocks in
//! `test_utils`.

use crate::account::TransactOpts;
use crate::error::{BridgeError, BridgeResult};
use crate::types::{
    HandleValueTransferEvent, RequestValueTransferEvent, VoteType, TOKEN_EVENT_CHAN_SIZE,
};
use async_trait::async_trait;
use ethers::types::{Address, Bytes, H256, U256};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Arguments shared by the three `handle*Transfer` contract methods.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleTransferCall {
    pub request_tx_hash: H256,
    pub from: Address,
    pub to: Address,
    // counterpart token on the handling chain, zero for native transfers
    pub token_address: Address,
    pub value_or_token_id: U256,
    pub request_nonce: u64,
    pub request_block_number: u64,
    pub uri: String,
    pub extra_data: Bytes,
}

impl HandleTransferCall {
    pub fn from_request(ev: &RequestValueTransferEvent, token_address: Address) -> Self {
        Self {
            request_tx_hash: ev.raw().tx_hash,
            from: ev.from(),
            to: ev.to(),
            token_address,
            value_or_token_id: ev.value_or_token_id(),
            request_nonce: ev.request_nonce(),
            request_block_number: ev.raw().block_number,
            uri: ev.uri().to_string(),
            extra_data: ev.extra_data().clone(),
        }
    }
}

/// Cancels the producer side of an [`EventSubscription`].
#[derive(Debug, Clone, Default)]
pub struct SubscriptionHandle(CancellationToken);

impl SubscriptionHandle {
    pub fn unsubscribe(&self) {
        self.0.cancel()
    }

    pub fn is_unsubscribed(&self) -> bool {
        self.0.is_cancelled()
    }

    pub fn token(&self) -> CancellationToken {
        self.0.clone()
    }
}

/// A live contract event stream. `err` fires at most once, after which no
/// more events are delivered.
#[derive(Debug)]
pub struct EventSubscription<T> {
    pub events: mpsc::Receiver<T>,
    pub err: oneshot::Receiver<BridgeError>,
    pub handle: SubscriptionHandle,
}

/// Producer side of an [`EventSubscription`].
#[derive(Debug)]
pub struct EventSink<T> {
    pub events: mpsc::Sender<T>,
    pub err: oneshot::Sender<BridgeError>,
    pub cancel: CancellationToken,
}

pub fn event_subscription<T>() -> (EventSink<T>, EventSubscription<T>) {
    let (events_tx, events_rx) = mpsc::channel(TOKEN_EVENT_CHAN_SIZE);
    let (err_tx, err_rx) = oneshot::channel();
    let handle = SubscriptionHandle::default();
    (
        EventSink {
            events: events_tx,
            err: err_tx,
            cancel: handle.token(),
        },
        EventSubscription {
            events: events_rx,
            err: err_rx,
            handle,
        },
    )
}

#[async_trait]
pub trait BridgeContract: Send + Sync {
    fn address(&self) -> Address;

    async fn request_nonce(&self) -> BridgeResult<u64>;
    async fn lower_handle_nonce(&self) -> BridgeResult<u64>;
    async fn recovery_block_number(&self) -> BridgeResult<u64>;
    async fn is_running(&self) -> BridgeResult<bool>;
    async fn configuration_nonce(&self) -> BridgeResult<u64>;
    async fn registered_tokens(&self, token: Address) -> BridgeResult<Address>;
    /// Block in which `nonce` was handled, zero if it never was.
    async fn handle_nonces_to_block_nums(&self, nonce: u64) -> BridgeResult<u64>;
    async fn operator_thresholds(&self, vote_type: VoteType) -> BridgeResult<u8>;
    async fn fee_of_erc20(&self, token: Address) -> BridgeResult<U256>;
    async fn fee_of_klay(&self) -> BridgeResult<U256>;
    async fn fee_receiver(&self) -> BridgeResult<Address>;
    async fn get_operator_list(&self) -> BridgeResult<Vec<Address>>;

    async fn handle_klay_transfer(
        &self,
        opts: &TransactOpts,
        call: &HandleTransferCall,
    ) -> BridgeResult<H256>;
    async fn handle_erc20_transfer(
        &self,
        opts: &TransactOpts,
        call: &HandleTransferCall,
    ) -> BridgeResult<H256>;
    async fn handle_erc721_transfer(
        &self,
        opts: &TransactOpts,
        call: &HandleTransferCall,
    ) -> BridgeResult<H256>;
    async fn set_erc20_fee(
        &self,
        opts: &TransactOpts,
        token: Address,
        fee: U256,
        configuration_nonce: u64,
    ) -> BridgeResult<H256>;
    async fn set_klay_fee(
        &self,
        opts: &TransactOpts,
        fee: U256,
        configuration_nonce: u64,
    ) -> BridgeResult<H256>;
    async fn set_fee_receiver(&self, opts: &TransactOpts, receiver: Address) -> BridgeResult<H256>;
    async fn register_operator(&self, opts: &TransactOpts, operator: Address)
        -> BridgeResult<H256>;
    async fn set_operator_threshold(
        &self,
        opts: &TransactOpts,
        vote_type: VoteType,
        threshold: u8,
    ) -> BridgeResult<H256>;
    async fn register_token(
        &self,
        opts: &TransactOpts,
        token: Address,
        counterpart_token: Address,
    ) -> BridgeResult<H256>;
    async fn deregister_token(&self, opts: &TransactOpts, token: Address) -> BridgeResult<H256>;

    /// Request events emitted in `[start, end]`, up to the head if `end` is None.
    async fn filter_request_value_transfer(
        &self,
        start: u64,
        end: Option<u64>,
    ) -> BridgeResult<Vec<RequestValueTransferEvent>>;
    async fn filter_request_value_transfer_encoded(
        &self,
        start: u64,
        end: Option<u64>,
    ) -> BridgeResult<Vec<RequestValueTransferEvent>>;

    async fn watch_request_value_transfer(
        &self,
    ) -> BridgeResult<EventSubscription<RequestValueTransferEvent>>;
    async fn watch_request_value_transfer_encoded(
        &self,
    ) -> BridgeResult<EventSubscription<RequestValueTransferEvent>>;
    async fn watch_handle_value_transfer(
        &self,
    ) -> BridgeResult<EventSubscription<HandleValueTransferEvent>>;
}

#[async_trait]
pub trait ChainBackend: Send + Sync {
    async fn current_block_number(&self) -> BridgeResult<u64>;
    async fn pending_nonce_at(&self, account: Address) -> BridgeResult<u64>;
    /// Binds a bridge contract handle on this chain.
    fn bridge_contract(&self, address: Address) -> BridgeResult<Arc<dyn BridgeContract>>;
}

/// Connectivity towards the counterpart chain.
pub trait PeerSet: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
