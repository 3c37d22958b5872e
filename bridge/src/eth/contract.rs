// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Bridge contract client over an ethers middleware. Every call is bounded by
//! the per-RPC deadline; event streams poll `eth_getLogs`.

use super::abi::{
    bridge_event, decode_handle_value_transfer, decode_request_value_transfer,
    decode_request_value_transfer_encoded, HANDLE_VALUE_TRANSFER, REQUEST_VALUE_TRANSFER,
    REQUEST_VALUE_TRANSFER_ENCODED,
};
use super::middleware_error;
use crate::account::TransactOpts;
use crate::contract::{
    event_subscription, BridgeContract, EventSink, EventSubscription, HandleTransferCall,
};
use crate::error::{BridgeError, BridgeResult};
use crate::types::{HandleValueTransferEvent, RequestValueTransferEvent, VoteType};
use async_trait::async_trait;
use ethers::abi::{Abi, Detokenize, Event, Tokenize};
use ethers::contract::{Contract, ContractCall};
use ethers::providers::Middleware;
use ethers::types::{Address, BlockNumber, Filter, Log, H256, U256};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
pub struct EthContractConfig {
    pub request_timeout: Duration,
    pub log_poll_interval: Duration,
}

pub struct EthBridgeContract<M> {
    address: Address,
    contract: Contract<M>,
    client: Arc<M>,
    config: EthContractConfig,
}

impl<M: Middleware + 'static> EthBridgeContract<M> {
    pub fn new(address: Address, abi: Abi, client: Arc<M>, config: EthContractConfig) -> Self {
        Self {
            address,
            contract: Contract::new(address, abi, client.clone()),
            client,
            config,
        }
    }

    async fn with_deadline<T>(
        &self,
        method: &str,
        fut: impl Future<Output = BridgeResult<T>>,
    ) -> BridgeResult<T> {
        tokio::time::timeout(self.config.request_timeout, fut)
            .await
            .map_err(|_| {
                BridgeError::Timeout(format!("{} on bridge {:?}", method, self.address))
            })?
    }

    fn method<T: Tokenize, D: Detokenize>(
        &self,
        name: &str,
        args: T,
    ) -> BridgeResult<ContractCall<M, D>> {
        self.contract
            .method::<T, D>(name, args)
            .map_err(|e| BridgeError::InternalError(format!("{}: {}", name, e)))
    }

    async fn view<T: Tokenize, D: Detokenize + Send + Sync>(
        &self,
        name: &str,
        args: T,
    ) -> BridgeResult<D> {
        let call = self.method::<T, D>(name, args)?;
        self.with_deadline(name, async move { Ok(call.call().await?) })
            .await
    }

    async fn transact<T: Tokenize>(
        &self,
        name: &str,
        opts: &TransactOpts,
        args: T,
    ) -> BridgeResult<H256> {
        let mut call = self
            .method::<T, ()>(name, args)?
            .legacy()
            .from(opts.from)
            .gas(opts.gas_limit);
        if let Some(nonce) = opts.nonce {
            call = call.nonce(nonce);
        }
        if let Some(gas_price) = opts.gas_price {
            call = call.gas_price(gas_price);
        }
        self.with_deadline(name, async move {
            let pending = call.send().await?;
            let tx_hash = *pending;
            debug!("[EthBridgeContract] Sent {} tx={:?}", name, tx_hash);
            Ok(tx_hash)
        })
        .await
    }

    async fn filter<T>(
        &self,
        event_name: &str,
        start: u64,
        end: Option<u64>,
        decode: fn(&Event, &Log) -> BridgeResult<T>,
    ) -> BridgeResult<Vec<T>> {
        let event = bridge_event(event_name)?;
        let filter = Filter::new()
            .address(self.address)
            .topic0(event.signature())
            .from_block(start)
            .to_block(end.map(BlockNumber::from).unwrap_or(BlockNumber::Latest));
        let logs = self
            .with_deadline(event_name, async {
                self.client.get_logs(&filter).await.map_err(middleware_error)
            })
            .await?;
        Ok(decode_logs(&event, &logs, decode))
    }

    async fn watch<T: Send + 'static>(
        &self,
        event_name: &str,
        decode: fn(&Event, &Log) -> BridgeResult<T>,
    ) -> BridgeResult<EventSubscription<T>> {
        let event = bridge_event(event_name)?;
        let head = self
            .with_deadline("eth_blockNumber", async {
                self.client
                    .get_block_number()
                    .await
                    .map_err(middleware_error)
            })
            .await?
            .as_u64();
        let (sink, subscription) = event_subscription();
        tokio::spawn(poll_logs(
            self.client.clone(),
            self.address,
            event,
            head + 1,
            self.config,
            decode,
            sink,
        ));
        Ok(subscription)
    }
}

// Delivers decoded logs from `from_block` onward until the subscription is
// cancelled or a poll fails.
async fn poll_logs<M: Middleware + 'static, T: Send + 'static>(
    client: Arc<M>,
    address: Address,
    event: Event,
    mut from_block: u64,
    config: EthContractConfig,
    decode: fn(&Event, &Log) -> BridgeResult<T>,
    sink: EventSink<T>,
) {
    let mut ticker = tokio::time::interval(config.log_poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = sink.cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let logs = tokio::time::timeout(config.request_timeout, async {
            let head = client
                .get_block_number()
                .await
                .map_err(middleware_error)?
                .as_u64();
            if head < from_block {
                return Ok((head, vec![]));
            }
            let filter = Filter::new()
                .address(address)
                .topic0(event.signature())
                .from_block(from_block)
                .to_block(head);
            let logs = client.get_logs(&filter).await.map_err(middleware_error)?;
            Ok::<_, BridgeError>((head, logs))
        })
        .await
        .unwrap_or_else(|_| {
            Err(BridgeError::Timeout(format!(
                "polling {} logs of {:?}",
                event.name, address
            )))
        });

        let (head, logs) = match logs {
            Ok(polled) => polled,
            Err(e) => {
                warn!(
                    "[EthBridgeContract] Stop watching {} of {:?}: {:?}",
                    event.name, address, e
                );
                let _ = sink.err.send(e);
                return;
            }
        };
        for log in &logs {
            match decode(&event, log) {
                Ok(ev) => {
                    tokio::select! {
                        _ = sink.cancel.cancelled() => return,
                        sent = sink.events.send(ev) => {
                            if sent.is_err() {
                                return;
                            }
                        }
                    }
                }
                Err(e) => warn!(
                    "[EthBridgeContract] Skip undecodable {} log tx={:?}: {:?}",
                    event.name, log.transaction_hash, e
                ),
            }
        }
        from_block = from_block.max(head + 1);
    }
}

/// Decodes `logs`, skipping the ones that do not match `event`.
fn decode_logs<T>(
    event: &Event,
    logs: &[Log],
    decode: fn(&Event, &Log) -> BridgeResult<T>,
) -> Vec<T> {
    logs.iter()
        .filter_map(|log| match decode(event, log) {
            Ok(ev) => Some(ev),
            Err(e) => {
                warn!(
                    "[EthBridgeContract] Skip undecodable {} log tx={:?}: {:?}",
                    event.name, log.transaction_hash, e
                );
                None
            }
        })
        .collect()
}

#[async_trait]
impl<M: Middleware + 'static> BridgeContract for EthBridgeContract<M> {
    fn address(&self) -> Address {
        self.address
    }

    async fn request_nonce(&self) -> BridgeResult<u64> {
        self.view("requestNonce", ()).await
    }

    async fn lower_handle_nonce(&self) -> BridgeResult<u64> {
        self.view("lowerHandleNonce", ()).await
    }

    async fn recovery_block_number(&self) -> BridgeResult<u64> {
        self.view("recoveryBlockNumber", ()).await
    }

    async fn is_running(&self) -> BridgeResult<bool> {
        self.view("isRunning", ()).await
    }

    async fn configuration_nonce(&self) -> BridgeResult<u64> {
        self.view("configurationNonce", ()).await
    }

    async fn registered_tokens(&self, token: Address) -> BridgeResult<Address> {
        self.view("registeredTokens", token).await
    }

    async fn handle_nonces_to_block_nums(&self, nonce: u64) -> BridgeResult<u64> {
        self.view("handleNoncesToBlockNums", nonce).await
    }

    async fn operator_thresholds(&self, vote_type: VoteType) -> BridgeResult<u8> {
        self.view("operatorThresholds", vote_type as u8).await
    }

    async fn fee_of_erc20(&self, token: Address) -> BridgeResult<U256> {
        self.view("feeOfERC20", token).await
    }

    async fn fee_of_klay(&self) -> BridgeResult<U256> {
        self.view("feeOfKLAY", ()).await
    }

    async fn fee_receiver(&self) -> BridgeResult<Address> {
        self.view("feeReceiver", ()).await
    }

    async fn get_operator_list(&self) -> BridgeResult<Vec<Address>> {
        self.view("getOperatorList", ()).await
    }

    async fn handle_klay_transfer(
        &self,
        opts: &TransactOpts,
        call: &HandleTransferCall,
    ) -> BridgeResult<H256> {
        self.transact(
            "handleKLAYTransfer",
            opts,
            (
                call.request_tx_hash,
                call.from,
                call.to,
                call.value_or_token_id,
                call.request_nonce,
                call.request_block_number,
                call.extra_data.clone(),
            ),
        )
        .await
    }

    async fn handle_erc20_transfer(
        &self,
        opts: &TransactOpts,
        call: &HandleTransferCall,
    ) -> BridgeResult<H256> {
        self.transact(
            "handleERC20Transfer",
            opts,
            (
                call.request_tx_hash,
                call.from,
                call.to,
                call.token_address,
                call.value_or_token_id,
                call.request_nonce,
                call.request_block_number,
                call.extra_data.clone(),
            ),
        )
        .await
    }

    async fn handle_erc721_transfer(
        &self,
        opts: &TransactOpts,
        call: &HandleTransferCall,
    ) -> BridgeResult<H256> {
        self.transact(
            "handleERC721Transfer",
            opts,
            (
                call.request_tx_hash,
                call.from,
                call.to,
                call.token_address,
                call.value_or_token_id,
                call.request_nonce,
                call.request_block_number,
                call.uri.clone(),
                call.extra_data.clone(),
            ),
        )
        .await
    }

    async fn set_erc20_fee(
        &self,
        opts: &TransactOpts,
        token: Address,
        fee: U256,
        configuration_nonce: u64,
    ) -> BridgeResult<H256> {
        self.transact("setERC20Fee", opts, (token, fee, configuration_nonce))
            .await
    }

    async fn set_klay_fee(
        &self,
        opts: &TransactOpts,
        fee: U256,
        configuration_nonce: u64,
    ) -> BridgeResult<H256> {
        self.transact("setKLAYFee", opts, (fee, configuration_nonce))
            .await
    }

    async fn set_fee_receiver(&self, opts: &TransactOpts, receiver: Address) -> BridgeResult<H256> {
        self.transact("setFeeReceiver", opts, receiver).await
    }

    async fn register_operator(
        &self,
        opts: &TransactOpts,
        operator: Address,
    ) -> BridgeResult<H256> {
        self.transact("registerOperator", opts, operator).await
    }

    async fn set_operator_threshold(
        &self,
        opts: &TransactOpts,
        vote_type: VoteType,
        threshold: u8,
    ) -> BridgeResult<H256> {
        self.transact("setOperatorThreshold", opts, (vote_type as u8, threshold))
            .await
    }

    async fn register_token(
        &self,
        opts: &TransactOpts,
        token: Address,
        counterpart_token: Address,
    ) -> BridgeResult<H256> {
        self.transact("registerToken", opts, (token, counterpart_token))
            .await
    }

    async fn deregister_token(&self, opts: &TransactOpts, token: Address) -> BridgeResult<H256> {
        self.transact("deregisterToken", opts, token).await
    }

    async fn filter_request_value_transfer(
        &self,
        start: u64,
        end: Option<u64>,
    ) -> BridgeResult<Vec<RequestValueTransferEvent>> {
        self.filter(REQUEST_VALUE_TRANSFER, start, end, decode_request_value_transfer)
            .await
    }

    async fn filter_request_value_transfer_encoded(
        &self,
        start: u64,
        end: Option<u64>,
    ) -> BridgeResult<Vec<RequestValueTransferEvent>> {
        self.filter(
            REQUEST_VALUE_TRANSFER_ENCODED,
            start,
            end,
            decode_request_value_transfer_encoded,
        )
        .await
    }

    async fn watch_request_value_transfer(
        &self,
    ) -> BridgeResult<EventSubscription<RequestValueTransferEvent>> {
        self.watch(REQUEST_VALUE_TRANSFER, decode_request_value_transfer)
            .await
    }

    async fn watch_request_value_transfer_encoded(
        &self,
    ) -> BridgeResult<EventSubscription<RequestValueTransferEvent>> {
        self.watch(
            REQUEST_VALUE_TRANSFER_ENCODED,
            decode_request_value_transfer_encoded,
        )
        .await
    }

    async fn watch_handle_value_transfer(
        &self,
    ) -> BridgeResult<EventSubscription<HandleValueTransferEvent>> {
        self.watch(HANDLE_VALUE_TRANSFER, decode_handle_value_transfer)
            .await
    }
}
