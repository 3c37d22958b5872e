// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Contract event subscriptions and the feeders that fan them in.

use super::BridgeManager;
use crate::bridge_info::BridgeInfo;
use crate::contract::{EventSubscription, SubscriptionHandle};
use crate::error::{BridgeError, BridgeResult};
use crate::metrics::BridgeMetrics;
use crate::types::{HandleValueTransferEvent, RequestValueTransferEvent};
use ethers::types::Address;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Broadcast senders the fan-in tasks publish into.
#[derive(Clone, Debug)]
pub(crate) struct EventFeeders {
    pub(crate) request: broadcast::Sender<RequestValueTransferEvent>,
    pub(crate) request_encoded: broadcast::Sender<RequestValueTransferEvent>,
    pub(crate) handle: broadcast::Sender<HandleValueTransferEvent>,
}

impl EventFeeders {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            request: broadcast::channel(capacity).0,
            request_encoded: broadcast::channel(capacity).0,
            handle: broadcast::channel(capacity).0,
        }
    }
}

/// Receiver of a manager feeder. Reports `Closed` once the manager's
/// subscription scope is closed.
#[derive(Debug)]
pub struct FeedSubscription<T> {
    receiver: broadcast::Receiver<T>,
    scope: CancellationToken,
}

impl<T: Clone> FeedSubscription<T> {
    pub(crate) fn new(receiver: broadcast::Receiver<T>, scope: CancellationToken) -> Self {
        Self { receiver, scope }
    }

    pub async fn recv(&mut self) -> Result<T, broadcast::error::RecvError> {
        tokio::select! {
            biased;
            _ = self.scope.cancelled() => Err(broadcast::error::RecvError::Closed),
            ev = self.receiver.recv() => ev,
        }
    }
}

/// The three contract watches of one subscribed bridge.
#[derive(Debug, Default)]
pub(crate) struct BridgeSubscriptions {
    handles: Vec<SubscriptionHandle>,
}

impl BridgeSubscriptions {
    fn unsubscribe(&self) {
        for handle in &self.handles {
            handle.unsubscribe();
        }
    }
}

impl BridgeManager {
    pub fn subscribe_request_event(&self) -> FeedSubscription<RequestValueTransferEvent> {
        FeedSubscription::new(self.feeders.request.subscribe(), self.scope.clone())
    }

    pub fn subscribe_request_encoded_event(&self) -> FeedSubscription<RequestValueTransferEvent> {
        FeedSubscription::new(
            self.feeders.request_encoded.subscribe(),
            self.scope.clone(),
        )
    }

    pub fn subscribe_handle_event(&self) -> FeedSubscription<HandleValueTransferEvent> {
        FeedSubscription::new(self.feeders.handle.subscribe(), self.scope.clone())
    }

    /// Starts watching the request and handle events of a registered bridge.
    pub async fn subscribe_event(&self, addr: Address) -> BridgeResult<()> {
        let info = self.get_bridge_info(addr).ok_or(BridgeError::NoBridgeInfo)?;
        if info.is_subscribed() {
            return Err(BridgeError::AlreadySubscribed);
        }
        self.subscribe_bridge_event(&info).await
    }

    pub(crate) async fn subscribe_bridge_event(&self, info: &Arc<BridgeInfo>) -> BridgeResult<()> {
        let addr = info.address();
        let bridge = info.bridge();
        let mut subscriptions = BridgeSubscriptions::default();

        let request = bridge.watch_request_value_transfer().await.map_err(|e| {
            error!("[BridgeManager] Failed to watch request events of {:?}: {:?}", addr, e);
            e
        })?;
        subscriptions.handles.push(request.handle.clone());

        let request_encoded = match bridge.watch_request_value_transfer_encoded().await {
            Ok(sub) => sub,
            Err(e) => {
                error!(
                    "[BridgeManager] Failed to watch encoded request events of {:?}: {:?}",
                    addr, e
                );
                subscriptions.unsubscribe();
                return Err(e);
            }
        };
        subscriptions.handles.push(request_encoded.handle.clone());

        let handle = match bridge.watch_handle_value_transfer().await {
            Ok(sub) => sub,
            Err(e) => {
                error!(
                    "[BridgeManager] Failed to watch handle events of {:?}: {:?}",
                    addr, e
                );
                subscriptions.unsubscribe();
                return Err(e);
            }
        };
        subscriptions.handles.push(handle.handle.clone());

        if let Some(stale) = self.subscriptions().insert(addr, subscriptions) {
            stale.unsubscribe();
        }
        info.set_subscribed(true);

        tokio::spawn(event_loop(
            addr,
            info.closed_token(),
            self.scope.clone(),
            self.feeders.clone(),
            self.metrics.clone(),
            request,
            request_encoded,
            handle,
        ));
        info!("[BridgeManager] Subscribed events of bridge {:?}", addr);
        Ok(())
    }

    /// Cancels the watches of `addr` and clears its subscribed flag.
    pub fn unsubscribe_event(&self, addr: Address) {
        if let Some(subscriptions) = self.subscriptions().remove(&addr) {
            subscriptions.unsubscribe();
            info!("[BridgeManager] Unsubscribed events of bridge {:?}", addr);
        }
        if let Some(info) = self.get_bridge_info(addr) {
            info.set_subscribed(false);
        }
    }

    /// Re-creates the watches of every subscribed pair.
    pub async fn reset_all_subscribed_events(&self) -> BridgeResult<()> {
        info!("[BridgeManager] Reset all subscribed events");
        for entry in self.get_all_bridge() {
            if !entry.subscribed {
                continue;
            }
            self.unsubscribe_event(entry.child_address);
            self.unsubscribe_event(entry.parent_address);

            let child = self.get_bridge_info(entry.child_address).ok_or_else(|| {
                error!(
                    "[BridgeManager] Reset subscription: no child bridge info {:?}",
                    entry.child_address
                );
                BridgeError::NoBridgeInfo
            })?;
            self.subscribe_bridge_event(&child).await?;

            let Some(parent) = self.get_bridge_info(entry.parent_address) else {
                error!(
                    "[BridgeManager] Reset subscription: no parent bridge info {:?}",
                    entry.parent_address
                );
                self.unsubscribe_event(entry.child_address);
                return Err(BridgeError::NoBridgeInfo);
            };
            self.subscribe_bridge_event(&parent).await?;
        }
        Ok(())
    }
}

// Forwards the events of one bridge into the manager feeders until the
// bridge is closed, the scope is closed, the watch is cancelled or a watch
// reports an error.
#[allow(clippy::too_many_arguments)]
async fn event_loop(
    addr: Address,
    closed: CancellationToken,
    scope: CancellationToken,
    feeders: EventFeeders,
    metrics: Arc<BridgeMetrics>,
    mut request: EventSubscription<RequestValueTransferEvent>,
    mut request_encoded: EventSubscription<RequestValueTransferEvent>,
    mut handle: EventSubscription<HandleValueTransferEvent>,
) {
    let label = format!("{:?}", addr);
    let unsubscribed = request.handle.token();
    loop {
        tokio::select! {
            _ = closed.cancelled() => break,
            _ = scope.cancelled() => break,
            _ = unsubscribed.cancelled() => break,
            ev = request.events.recv() => match ev {
                Some(ev) => {
                    metrics.request_events_received.with_label_values(&[&label]).inc();
                    // no receivers is fine
                    let _ = feeders.request.send(ev);
                }
                None => break,
            },
            ev = request_encoded.events.recv() => match ev {
                Some(ev) => {
                    metrics.request_events_received.with_label_values(&[&label]).inc();
                    let _ = feeders.request_encoded.send(ev);
                }
                None => break,
            },
            ev = handle.events.recv() => match ev {
                Some(ev) => {
                    metrics.handle_events_received.with_label_values(&[&label]).inc();
                    let _ = feeders.handle.send(ev);
                }
                None => break,
            },
            err = &mut request.err => {
                info!("[BridgeManager] Request event loop of {:?} stopped: {:?}", addr, err);
                break;
            }
            err = &mut request_encoded.err => {
                info!("[BridgeManager] Encoded request event loop of {:?} stopped: {:?}", addr, err);
                break;
            }
            err = &mut handle.err => {
                info!("[BridgeManager] Handle event loop of {:?} stopped: {:?}", addr, err);
                break;
            }
        }
    }
    request.handle.unsubscribe();
    request_encoded.handle.unsubscribe();
    handle.handle.unsubscribe();
}
