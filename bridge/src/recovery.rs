// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Periodic reconciliation of one child/parent bridge pair.
//!
//! Each pass samples the request nonce of the emitting bridge and the lower
//! handle nonce of the handling bridge in both directions. A direction whose
//! handle nonce stays put across two passes while requests are outstanding
//! is considered stuck: its historical request logs are scanned from the
//! handling bridge's recovery block and every request the handling bridge
//! has no record of is fed back into the regular pending queue.

use crate::bridge_info::BridgeInfo;
use crate::error::{BridgeError, BridgeResult};
use crate::metrics::BridgeMetrics;
use crate::types::{RequestValueTransferEvent, FILTER_LOGS_STRIDE, MAX_PENDING_TXS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

const RUNNING_STATUS_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryConfig {
    pub enabled: bool,
    pub interval: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValueTransferHint {
    /// First block to scan for request logs.
    pub block_number: u64,
    pub request_nonce: u64,
    pub handle_nonce: u64,
    /// Handle nonce observed by the previous pass.
    pub prev_handle_nonce: u64,
    pub candidate: bool,
}

impl ValueTransferHint {
    fn is_stuck(&self) -> bool {
        self.request_nonce != self.handle_nonce && self.prev_handle_nonce == self.handle_nonce
    }

    /// True on every second consecutive stuck observation.
    pub fn check_recovery_condition(&mut self) -> bool {
        match (self.is_stuck(), self.candidate) {
            (true, true) => {
                self.candidate = false;
                true
            }
            (true, false) => {
                self.candidate = true;
                false
            }
            (false, _) => {
                self.candidate = false;
                false
            }
        }
    }
}

#[derive(Debug, Default)]
struct RecoveryState {
    child_to_parent_hint: ValueTransferHint,
    parent_to_child_hint: ValueTransferHint,
    child_events: Vec<RequestValueTransferEvent>,
    parent_events: Vec<RequestValueTransferEvent>,
}

struct RecoveryWorker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct ValueTransferRecovery {
    config: RecoveryConfig,
    child_info: Arc<BridgeInfo>,
    parent_info: Arc<BridgeInfo>,
    metrics: Arc<BridgeMetrics>,
    state: tokio::sync::Mutex<RecoveryState>,
    is_running: AtomicBool,
    worker: Mutex<Option<RecoveryWorker>>,
}

impl ValueTransferRecovery {
    pub fn new(
        config: RecoveryConfig,
        child_info: Arc<BridgeInfo>,
        parent_info: Arc<BridgeInfo>,
        metrics: Arc<BridgeMetrics>,
    ) -> Self {
        Self {
            config,
            child_info,
            parent_info,
            metrics,
            state: tokio::sync::Mutex::new(RecoveryState::default()),
            is_running: AtomicBool::new(false),
            worker: Mutex::new(None),
        }
    }

    /// Runs one pass right away, then one per configured interval.
    pub fn start(self: &Arc<Self>) -> BridgeResult<()> {
        if !self.config.enabled {
            return Err(BridgeError::VtrDisabled);
        }
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if worker.is_some() {
            return Err(BridgeError::VtrAlreadyStarted);
        }

        let cancel = CancellationToken::new();
        let recovery = self.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move { recovery.run_loop(token).await });
        *worker = Some(RecoveryWorker { cancel, handle });
        Ok(())
    }

    async fn run_loop(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            "[ValueTransferRecovery] Start recovery child={:?} parent={:?} interval={:?}",
            self.child_info.address(),
            self.parent_info.address(),
            self.config.interval
        );
        tokio::select! {
            _ = cancel.cancelled() => return,
            result = self.recover() => {
                if let Err(e) = result {
                    warn!("[ValueTransferRecovery] Value transfer recovery failed: {:?}", e);
                }
            }
        }
        self.is_running.store(true, Ordering::SeqCst);

        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.config.interval,
            self.config.interval,
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(
                        "[ValueTransferRecovery] Recovery stopped child={:?}",
                        self.child_info.address()
                    );
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.recover().await {
                        warn!("[ValueTransferRecovery] Value transfer recovery failed: {:?}", e);
                    }
                }
            }
        }
    }

    /// Stops the periodic task and waits for it to exit. Stopping a recovery
    /// that never started is a no-op.
    pub async fn stop(&self) -> BridgeResult<()> {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(worker) = worker else {
            info!("[ValueTransferRecovery] Recovery is already stopped");
            return Ok(());
        };
        worker.cancel.cancel();
        if let Err(e) = worker.handle.await {
            warn!("[ValueTransferRecovery] Recovery task ended abnormally: {:?}", e);
        }
        self.is_running.store(false, Ordering::SeqCst);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub async fn wait_running_status(&self, expected: bool, timeout: Duration) -> BridgeResult<()> {
        tokio::time::timeout(timeout, async {
            while self.is_running() != expected {
                tokio::time::sleep(RUNNING_STATUS_POLL).await;
            }
        })
        .await
        .map_err(|_| {
            BridgeError::Timeout(format!(
                "recovery running status did not become {} within {:?}",
                expected, timeout
            ))
        })
    }

    /// One reconciliation pass.
    pub async fn recover(&self) -> BridgeResult<()> {
        let mut state = self.state.lock().await;
        debug!("[ValueTransferRecovery] Update value transfer hint");
        self.update_recovery_hint(&mut state).await?;
        debug!("[ValueTransferRecovery] Retrieve pending events");
        self.retrieve_pending_events(&mut state).await?;
        debug!("[ValueTransferRecovery] Recover pending events");
        self.recover_pending_events(&mut state);
        Ok(())
    }

    pub async fn hints(&self) -> (ValueTransferHint, ValueTransferHint) {
        let state = self.state.lock().await;
        (state.child_to_parent_hint, state.parent_to_child_hint)
    }

    async fn update_recovery_hint(&self, state: &mut RecoveryState) -> BridgeResult<()> {
        let child_to_parent = update_recovery_hint_from_to(
            &state.child_to_parent_hint,
            &self.child_info,
            &self.parent_info,
        )
        .await?;
        let parent_to_child = update_recovery_hint_from_to(
            &state.parent_to_child_hint,
            &self.parent_info,
            &self.child_info,
        )
        .await?;
        state.child_to_parent_hint = child_to_parent;
        state.parent_to_child_hint = parent_to_child;

        if !self.is_running() {
            for hint in [
                &mut state.child_to_parent_hint,
                &mut state.parent_to_child_hint,
            ] {
                hint.prev_handle_nonce = hint.handle_nonce;
                hint.candidate = true;
            }
        }
        Ok(())
    }

    async fn retrieve_pending_events(&self, state: &mut RecoveryState) -> BridgeResult<()> {
        state.child_events = retrieve_pending_events_from(
            &mut state.child_to_parent_hint,
            &self.child_info,
            &self.parent_info,
        )
        .await?;
        state.parent_events = retrieve_pending_events_from(
            &mut state.parent_to_child_hint,
            &self.parent_info,
            &self.child_info,
        )
        .await?;
        Ok(())
    }

    fn recover_pending_events(&self, state: &mut RecoveryState) {
        let child_events = std::mem::take(&mut state.child_events);
        let parent_events = std::mem::take(&mut state.parent_events);
        self.inject(child_events, &self.parent_info, "child");
        self.inject(parent_events, &self.child_info, "parent");
    }

    fn inject(&self, events: Vec<RequestValueTransferEvent>, to: &BridgeInfo, origin: &str) {
        if events.is_empty() {
            return;
        }
        warn!(
            "[ValueTransferRecovery] Try to recover {} chain's request events to {:?}: {}",
            origin,
            to.address(),
            events.len()
        );
        for ev in &events {
            trace!(
                "[ValueTransferRecovery] Recover event tx={:?} nonce={}",
                ev.raw().tx_hash,
                ev.request_nonce()
            );
        }
        self.metrics
            .recovered_request_events
            .with_label_values(&[&format!("{:?}", to.address())])
            .inc_by(events.len() as u64);
        to.add_request_value_transfer_events(events);
    }
}

async fn update_recovery_hint_from_to(
    prev: &ValueTransferHint,
    from: &BridgeInfo,
    to: &BridgeInfo,
) -> BridgeResult<ValueTransferHint> {
    trace!(
        "[ValueTransferRecovery] Previous hint request_nonce={} handle_nonce={} prev_handle_nonce={} candidate={}",
        prev.request_nonce,
        prev.handle_nonce,
        prev.prev_handle_nonce,
        prev.candidate
    );
    let block_number = to.bridge().recovery_block_number().await?;
    let request_nonce = from.bridge().request_nonce().await?;
    let handle_nonce = to.bridge().lower_handle_nonce().await?;

    from.update_request_nonce(request_nonce);
    to.update_request_nonce_from_counterpart(request_nonce);
    to.update_lower_handle_nonce(handle_nonce);

    Ok(ValueTransferHint {
        block_number,
        request_nonce,
        handle_nonce,
        prev_handle_nonce: prev.handle_nonce,
        candidate: prev.candidate,
    })
}

/// Requests emitted by `from` that `to` has not handled, scanned in block
/// windows from the hint's block up to the head of `from`'s chain.
async fn retrieve_pending_events_from(
    hint: &mut ValueTransferHint,
    from: &BridgeInfo,
    to: &BridgeInfo,
) -> BridgeResult<Vec<RequestValueTransferEvent>> {
    if hint.request_nonce == hint.handle_nonce {
        return Ok(vec![]);
    }
    if !hint.check_recovery_condition() {
        return Ok(vec![]);
    }

    // the head of the chain hosting `to`'s counterpart, i.e. `from`
    let head = to.get_current_block_number().await?;
    let mut pending = vec![];
    let mut start = hint.block_number;
    'scan: while start <= head {
        let end = start.saturating_add(FILTER_LOGS_STRIDE - 1).min(head);
        let mut events = from
            .bridge()
            .filter_request_value_transfer(start, Some(end))
            .await?;
        events.extend(
            from.bridge()
                .filter_request_value_transfer_encoded(start, Some(end))
                .await?,
        );
        for ev in events {
            let nonce = ev.request_nonce();
            trace!("[ValueTransferRecovery] Pending nonce in the event: {}", nonce);
            if nonce < hint.handle_nonce {
                continue;
            }
            if to.bridge().handle_nonces_to_block_nums(nonce).await? != 0 {
                continue;
            }
            pending.push(ev);
            if pending.len() >= MAX_PENDING_TXS {
                break 'scan;
            }
        }
        match end.checked_add(1) {
            Some(next) => start = next,
            None => break,
        }
    }
    debug!(
        "[ValueTransferRecovery] Retrieved pending events from {:?}: {}",
        from.address(),
        pending.len()
    );
    Ok(pending)
}
