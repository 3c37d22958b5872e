// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Routes value transfer events from the manager feeders to bridge infos.
//!
//! A request event emitted by a bridge is handled by its counterpart, so it
//! is queued on the counterpart's info. A handle event is bookkeeping for
//! the bridge that emitted it.

use crate::error::{BridgeError, BridgeResult};
use crate::manager::{BridgeManager, FeedSubscription};
use crate::types::{HandleValueTransferEvent, RequestValueTransferEvent};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct ValueTransferHandler {
    manager: Arc<BridgeManager>,
}

impl ValueTransferHandler {
    pub fn new(manager: Arc<BridgeManager>) -> Self {
        Self { manager }
    }

    pub fn process_request_event(&self, ev: &RequestValueTransferEvent) -> BridgeResult<()> {
        let emitter = ev.raw().contract_address;
        let nonce = ev.request_nonce();
        let counterpart = self.manager.get_counter_part_bridge_addr(emitter);
        let handler = self.manager.get_bridge_info(counterpart).ok_or_else(|| {
            warn!(
                "[EventHandler] No bridge info for counterpart of {:?}, request nonce {}",
                emitter, nonce
            );
            BridgeError::NoBridgeInfo
        })?;

        debug!(
            "[EventHandler] Request value transfer bridge={:?} nonce={} token_type={} tx={:?}",
            emitter,
            nonce,
            ev.token_type(),
            ev.raw().tx_hash
        );
        if let Some(info) = self.manager.get_bridge_info(emitter) {
            info.update_request_nonce(nonce.saturating_add(1));
        }
        handler.add_request_value_transfer_events(vec![ev.clone()]);
        Ok(())
    }

    pub async fn process_handle_event(&self, ev: &HandleValueTransferEvent) -> BridgeResult<()> {
        let emitter = ev.raw.contract_address;
        let info = self
            .manager
            .get_bridge_info(emitter)
            .ok_or(BridgeError::NoBridgeInfo)?;

        debug!(
            "[EventHandler] Handle value transfer bridge={:?} handle_nonce={} lower_handle_nonce={} tx={:?}",
            emitter, ev.handle_nonce, ev.lower_handle_nonce, ev.raw.tx_hash
        );
        if let Err(e) = self
            .manager
            .handle_store()
            .write_handle_tx_hash_from_request_tx_hash(ev.request_tx_hash, ev.raw.tx_hash)
            .await
        {
            warn!(
                "[EventHandler] Failed to store handle tx of request {:?}: {:?}",
                ev.request_tx_hash, e
            );
        }
        info.mark_handled_nonce(ev.handle_nonce);
        info.update_lower_handle_nonce(ev.lower_handle_nonce);
        Ok(())
    }

    /// Subscribes to the manager feeders and spawns the dispatch loop. The
    /// subscriptions exist when this returns, so no later event is missed.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let requests = self.manager.subscribe_request_event();
        let encoded_requests = self.manager.subscribe_request_encoded_event();
        let handles = self.manager.subscribe_handle_event();
        let this = self.clone();
        tokio::spawn(async move {
            this.run(cancel, requests, encoded_requests, handles).await;
        })
    }

    async fn run(
        &self,
        cancel: CancellationToken,
        mut requests: FeedSubscription<RequestValueTransferEvent>,
        mut encoded_requests: FeedSubscription<RequestValueTransferEvent>,
        mut handles: FeedSubscription<HandleValueTransferEvent>,
    ) {
        info!("[EventHandler] Started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                ev = requests.recv() => match ev {
                    Ok(ev) => self.on_request_event(&ev),
                    Err(RecvError::Lagged(n)) => lagged("request", n),
                    Err(RecvError::Closed) => break,
                },
                ev = encoded_requests.recv() => match ev {
                    Ok(ev) => self.on_request_event(&ev),
                    Err(RecvError::Lagged(n)) => lagged("encoded request", n),
                    Err(RecvError::Closed) => break,
                },
                ev = handles.recv() => match ev {
                    Ok(ev) => {
                        if let Err(e) = self.process_handle_event(&ev).await {
                            error!(
                                "[EventHandler] Failed to process handle event of {:?}, nonce {}: {:?}",
                                ev.raw.contract_address, ev.handle_nonce, e
                            );
                        }
                    }
                    Err(RecvError::Lagged(n)) => lagged("handle", n),
                    Err(RecvError::Closed) => break,
                },
            }
        }
        info!("[EventHandler] Stopped");
    }

    fn on_request_event(&self, ev: &RequestValueTransferEvent) {
        if let Err(e) = self.process_request_event(ev) {
            error!(
                "[EventHandler] Failed to process request event of {:?}, nonce {}: {:?}",
                ev.raw().contract_address,
                ev.request_nonce(),
                e
            );
        }
    }
}

// Skipped events are picked up again by the recovery.
fn lagged(stream: &str, skipped: u64) {
    warn!(
        "[EventHandler] {} feed lagged, skipped {} events",
        stream, skipped
    );
}
