// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use super::*;
use crate::handle_store::InMemoryHandleTxStore;
use crate::journal::JOURNAL_FILE_NAME;
use crate::test_utils::{
    handle_event, init_for_testing, request_event, MockChainBackend, MockPeerSet,
};
use crate::types::TokenType;
use ethers::types::U256;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

const CHILD: Address = Address::repeat_byte(0xc1);
const PARENT: Address = Address::repeat_byte(0xa1);

struct ManagerEnv {
    dir: tempfile::TempDir,
    child_backend: MockChainBackend,
    parent_backend: MockChainBackend,
    peers: Arc<MockPeerSet>,
    metrics: Arc<BridgeMetrics>,
}

impl ManagerEnv {
    fn new() -> Self {
        init_for_testing();
        Self {
            dir: tempfile::tempdir().unwrap(),
            child_backend: MockChainBackend::new(),
            parent_backend: MockChainBackend::new(),
            peers: Arc::new(MockPeerSet::new(1)),
            metrics: Arc::new(BridgeMetrics::new_for_testing()),
        }
    }

    fn manager(&self, vt_recovery: bool) -> BridgeManager {
        BridgeManager::new(
            self.dir.path().join(JOURNAL_FILE_NAME),
            Arc::new(self.child_backend.clone()),
            Arc::new(self.parent_backend.clone()),
            Arc::new(BridgeAccounts::new(
                BridgeAccount::new(Address::repeat_byte(0xe1), 1, None, 1_000_000),
                BridgeAccount::new(Address::repeat_byte(0xe2), 2, None, 1_000_000),
            )),
            self.peers.clone(),
            Arc::new(InMemoryHandleTxStore::new()),
            RecoveryConfig {
                enabled: vt_recovery,
                interval: Duration::from_secs(5),
            },
            self.metrics.clone(),
        )
    }
}

#[tokio::test]
async fn test_register_bridge_pair() {
    let env = ManagerEnv::new();
    let manager = env.manager(false);
    manager.register_bridge_pair(CHILD, PARENT).await.unwrap();

    assert!(manager.is_valid_bridge_pair(CHILD, PARENT));
    assert!(manager.is_valid_bridge_pair(PARENT, CHILD));
    assert!(!manager.is_valid_bridge_pair(CHILD, Address::repeat_byte(9)));
    assert_eq!(manager.get_counter_part_bridge_addr(CHILD), PARENT);
    assert_eq!(manager.get_counter_part_bridge_addr(PARENT), CHILD);
    assert!(manager
        .get_counter_part_bridge_addr(Address::repeat_byte(9))
        .is_zero());
    assert_eq!(
        manager.get_counter_part_bridge(CHILD).unwrap().address(),
        PARENT
    );
    assert!(manager.get_bridge_info(CHILD).unwrap().on_child_chain());
    assert!(!manager.get_bridge_info(PARENT).unwrap().on_child_chain());
    assert_eq!(manager.journal_len(), 1);
    assert_eq!(
        manager.get_all_bridge(),
        vec![BridgeJournalEntry::new(CHILD, PARENT)]
    );

    assert_eq!(
        manager.register_bridge_pair(CHILD, PARENT).await,
        Err(BridgeError::DuplicatedBridgeInfo)
    );
    manager.stop().await;
}

#[tokio::test]
async fn test_register_bridge_pair_cleans_up_child_on_parent_failure() {
    let env = ManagerEnv::new();
    env.parent_backend
        .contract(PARENT)
        .set_failing_views(Some(BridgeError::TransientProviderError("down".into())));
    let manager = env.manager(false);

    assert!(matches!(
        manager.register_bridge_pair(CHILD, PARENT).await,
        Err(BridgeError::TransientProviderError(_))
    ));
    assert!(manager.get_bridge_info(CHILD).is_none());
    assert!(manager.get_bridge_info(PARENT).is_none());
    assert_eq!(manager.journal_len(), 0);
}

#[tokio::test]
async fn test_set_and_delete_bridge_info() {
    let env = ManagerEnv::new();
    let manager = env.manager(false);
    let child_bridge = env.child_backend.bridge_contract(CHILD).unwrap();
    let parent_bridge = env.parent_backend.bridge_contract(PARENT).unwrap();
    let info = manager
        .set_bridge_info(
            CHILD,
            child_bridge.clone(),
            PARENT,
            parent_bridge.clone(),
            manager.accounts().child.clone(),
            true,
            false,
        )
        .await
        .unwrap();
    assert_eq!(
        manager
            .set_bridge_info(
                CHILD,
                child_bridge,
                PARENT,
                parent_bridge,
                manager.accounts().child.clone(),
                true,
                false,
            )
            .await
            .unwrap_err(),
        BridgeError::DuplicatedBridgeInfo
    );
    // only one side registered
    assert!(!manager.is_valid_bridge_pair(CHILD, PARENT));

    manager.delete_bridge_info(CHILD).unwrap();
    assert!(info.is_closed());
    assert_eq!(
        manager.delete_bridge_info(CHILD),
        Err(BridgeError::NoBridgeInfo)
    );
}

#[tokio::test]
async fn test_set_journal_requirements() {
    let env = ManagerEnv::new();
    let manager = env.manager(false);
    assert_eq!(
        manager.set_journal(Address::zero(), PARENT),
        Err(BridgeError::EmptyBridgeAddress)
    );
    manager.set_journal(CHILD, PARENT).unwrap();
    assert_eq!(
        manager.set_journal(CHILD, PARENT),
        Err(BridgeError::DuplicatedJournal)
    );
}

#[tokio::test]
async fn test_subscribe_bridge_pair_persists_flag_and_starts_recovery() {
    let env = ManagerEnv::new();
    let manager = env.manager(true);
    manager.register_bridge_pair(CHILD, PARENT).await.unwrap();
    manager.subscribe_bridge_pair(CHILD, PARENT).await.unwrap();

    assert!(manager.get_bridge_info(CHILD).unwrap().is_subscribed());
    assert!(manager.get_bridge_info(PARENT).unwrap().is_subscribed());
    assert!(manager.get_all_bridge()[0].subscribed);
    assert!(manager.has_recovery(CHILD).await);
    assert_eq!(env.child_backend.contract(CHILD).active_watchers(), 3);
    assert_eq!(env.parent_backend.contract(PARENT).active_watchers(), 3);

    assert_eq!(
        manager.subscribe_event(CHILD).await,
        Err(BridgeError::AlreadySubscribed)
    );
    assert_eq!(
        manager.subscribe_event(Address::repeat_byte(9)).await,
        Err(BridgeError::NoBridgeInfo)
    );
    manager.stop().await;

    // the flag survives a restart
    let reloaded = env.manager(true);
    assert_eq!(
        reloaded.get_all_bridge(),
        vec![BridgeJournalEntry {
            child_address: CHILD,
            parent_address: PARENT,
            subscribed: true,
        }]
    );
}

#[tokio::test]
async fn test_subscribe_rolls_back_child_when_parent_fails() {
    let env = ManagerEnv::new();
    let manager = env.manager(false);
    manager.register_bridge_pair(CHILD, PARENT).await.unwrap();
    env.parent_backend
        .contract(PARENT)
        .fail_next_watch(BridgeError::ProviderError("no filters".into()));

    assert!(manager.subscribe_bridge_pair(CHILD, PARENT).await.is_err());
    assert!(!manager.get_bridge_info(CHILD).unwrap().is_subscribed());
    assert!(!manager.get_bridge_info(PARENT).unwrap().is_subscribed());
    assert_eq!(env.child_backend.contract(CHILD).active_watchers(), 0);
    assert!(!manager.get_all_bridge()[0].subscribed);
    manager.stop().await;
}

#[tokio::test]
async fn test_events_are_fanned_into_feeders() {
    let env = ManagerEnv::new();
    let manager = env.manager(false);
    manager.register_bridge_pair(CHILD, PARENT).await.unwrap();
    let mut requests = manager.subscribe_request_event();
    let mut handles = manager.subscribe_handle_event();
    manager.subscribe_bridge_pair(CHILD, PARENT).await.unwrap();

    let ev = request_event(CHILD, 7, TokenType::Native);
    env.child_backend.contract(CHILD).emit_request(ev.clone());
    assert_eq!(requests.recv().await.unwrap(), ev);

    let hev = handle_event(PARENT, 7, 7);
    env.parent_backend.contract(PARENT).emit_handle(hev.clone());
    assert_eq!(handles.recv().await.unwrap(), hev);

    assert_eq!(
        env.metrics
            .request_events_received
            .with_label_values(&[&format!("{:?}", CHILD)])
            .get(),
        1
    );
    manager.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_watch_error_ends_fan_in_for_that_bridge_only() {
    let env = ManagerEnv::new();
    let manager = env.manager(false);
    manager.register_bridge_pair(CHILD, PARENT).await.unwrap();
    let mut requests = manager.subscribe_request_event();
    manager.subscribe_bridge_pair(CHILD, PARENT).await.unwrap();

    env.child_backend
        .contract(CHILD)
        .fail_handle_watchers(BridgeError::SubscriptionClosed);
    tokio::time::sleep(Duration::from_millis(10)).await;

    env.child_backend
        .contract(CHILD)
        .emit_request(request_event(CHILD, 1, TokenType::Native));
    assert!(
        tokio::time::timeout(Duration::from_secs(1), requests.recv())
            .await
            .is_err()
    );

    let ev = request_event(PARENT, 2, TokenType::Native);
    env.parent_backend.contract(PARENT).emit_request(ev.clone());
    assert_eq!(requests.recv().await.unwrap(), ev);
    manager.stop().await;
}

#[tokio::test]
async fn test_unsubscribe_bridge_pair() {
    let env = ManagerEnv::new();
    let manager = env.manager(false);
    manager.register_bridge_pair(CHILD, PARENT).await.unwrap();
    manager.subscribe_bridge_pair(CHILD, PARENT).await.unwrap();
    manager.unsubscribe_bridge_pair(CHILD, PARENT).await.unwrap();

    assert!(!manager.get_bridge_info(CHILD).unwrap().is_subscribed());
    assert!(!manager.get_bridge_info(PARENT).unwrap().is_subscribed());
    assert_eq!(env.child_backend.contract(CHILD).active_watchers(), 0);
    assert_eq!(env.parent_backend.contract(PARENT).active_watchers(), 0);
    assert!(!manager.get_all_bridge()[0].subscribed);

    // subscribing again works after an unsubscribe
    manager.subscribe_bridge_pair(CHILD, PARENT).await.unwrap();
    manager.stop().await;
}

#[tokio::test]
async fn test_deregister_bridge_pair() {
    let env = ManagerEnv::new();
    let manager = env.manager(true);
    manager.register_bridge_pair(CHILD, PARENT).await.unwrap();
    manager.subscribe_bridge_pair(CHILD, PARENT).await.unwrap();
    let child = manager.get_bridge_info(CHILD).unwrap();

    manager.deregister_bridge_pair(CHILD, PARENT).await.unwrap();
    assert!(child.is_closed());
    assert!(manager.get_bridge_info(CHILD).is_none());
    assert!(manager.get_bridge_info(PARENT).is_none());
    assert_eq!(manager.journal_len(), 0);
    assert!(!manager.has_recovery(CHILD).await);
    assert_eq!(
        manager.delete_recovery(CHILD, PARENT).await,
        Err(BridgeError::NoRecovery)
    );
    manager.stop().await;
    assert!(env.manager(true).get_all_bridge().is_empty());
}

#[tokio::test]
async fn test_pair_operations_reject_invalid_pairs() {
    let env = ManagerEnv::new();
    let manager = env.manager(false);
    manager.register_bridge_pair(CHILD, PARENT).await.unwrap();
    let other = Address::repeat_byte(0x99);
    assert_eq!(
        manager.subscribe_bridge_pair(CHILD, other).await,
        Err(BridgeError::InvalidBridgePair)
    );
    assert_eq!(
        manager.unsubscribe_bridge_pair(other, PARENT).await,
        Err(BridgeError::InvalidBridgePair)
    );
    assert_eq!(
        manager.deregister_bridge_pair(PARENT, other).await,
        Err(BridgeError::InvalidBridgePair)
    );
    assert_eq!(
        manager.get_bridge_information(other).await,
        Err(BridgeError::InvalidBridgePair)
    );
    manager.stop().await;
}

#[tokio::test]
async fn test_restore_bridges_requires_peers() {
    let env = ManagerEnv::new();
    env.peers.set_len(0);
    let manager = env.manager(false);
    assert_eq!(
        manager.restore_bridges().await,
        Err(BridgeError::BridgeRestore)
    );
}

#[tokio::test]
async fn test_restore_bridges_from_journal() {
    let env = ManagerEnv::new();
    let other_child = Address::repeat_byte(0xc2);
    let other_parent = Address::repeat_byte(0xa2);
    {
        let manager = env.manager(true);
        manager.register_bridge_pair(CHILD, PARENT).await.unwrap();
        manager
            .register_bridge_pair(other_child, other_parent)
            .await
            .unwrap();
        manager.subscribe_bridge_pair(CHILD, PARENT).await.unwrap();
        manager.stop().await;
    }

    let manager = env.manager(true);
    assert_eq!(manager.journal_len(), 2);
    manager.restore_bridges().await.unwrap();

    assert!(manager.is_valid_bridge_pair(CHILD, PARENT));
    assert!(manager.is_valid_bridge_pair(other_child, other_parent));
    assert!(manager.get_bridge_info(CHILD).unwrap().is_subscribed());
    assert!(manager.get_bridge_info(PARENT).unwrap().is_subscribed());
    assert!(!manager.get_bridge_info(other_child).unwrap().is_subscribed());
    assert!(manager.has_recovery(CHILD).await);
    assert!(!manager.has_recovery(other_child).await);

    // restoring again keeps the existing infos
    let child = manager.get_bridge_info(CHILD).unwrap();
    manager.restore_bridges().await.unwrap();
    assert!(Arc::ptr_eq(&child, &manager.get_bridge_info(CHILD).unwrap()));
    manager.stop().await;
}

#[tokio::test]
async fn test_restore_bridges_fails_on_unreachable_contract() {
    let env = ManagerEnv::new();
    {
        let manager = env.manager(false);
        manager.register_bridge_pair(CHILD, PARENT).await.unwrap();
        manager.stop().await;
    }
    env.parent_backend
        .contract(PARENT)
        .set_failing_views(Some(BridgeError::TransientProviderError("down".into())));

    let manager = env.manager(false);
    assert_eq!(
        manager.restore_bridges().await,
        Err(BridgeError::BridgeRestore)
    );
    // the child side stays registered until the caller cleans up
    assert!(manager.get_bridge_info(CHILD).is_some());
    assert!(manager.get_bridge_info(PARENT).is_none());
    manager.stop().await;
}

#[tokio::test]
async fn test_reset_all_subscribed_events() {
    let env = ManagerEnv::new();
    let manager = env.manager(false);
    manager.register_bridge_pair(CHILD, PARENT).await.unwrap();
    manager.subscribe_bridge_pair(CHILD, PARENT).await.unwrap();
    let mut requests = manager.subscribe_request_event();

    manager.reset_all_subscribed_events().await.unwrap();
    assert_eq!(env.child_backend.contract(CHILD).active_watchers(), 3);
    assert_eq!(env.parent_backend.contract(PARENT).active_watchers(), 3);

    let ev = request_event(CHILD, 3, TokenType::Native);
    env.child_backend.contract(CHILD).emit_request(ev.clone());
    assert_eq!(requests.recv().await.unwrap(), ev);
    manager.stop().await;
}

#[tokio::test]
async fn test_log_bridge_status_sums_subscribed_bridges() {
    let env = ManagerEnv::new();
    env.child_backend.contract(CHILD).set_lower_handle_nonce(3);
    env.parent_backend.contract(PARENT).set_lower_handle_nonce(5);
    let manager = env.manager(false);
    manager.register_bridge_pair(CHILD, PARENT).await.unwrap();

    let (p2c, c2p) = manager.log_bridge_status();
    assert_eq!(p2c, DirectionStatus::default());
    assert_eq!(c2p, DirectionStatus::default());

    manager.subscribe_bridge_pair(CHILD, PARENT).await.unwrap();
    manager
        .get_bridge_info(CHILD)
        .unwrap()
        .update_request_nonce_from_counterpart(10);
    let (p2c, c2p) = manager.log_bridge_status();
    assert_eq!(
        p2c,
        DirectionStatus {
            request: 10,
            handle: 3,
            lower_handle: 3,
        }
    );
    assert_eq!(p2c.pending(), 7);
    assert_eq!(c2p.lower_handle, 5);
    assert_eq!(
        env.metrics
            .bridge_status_nonces
            .with_label_values(&["parent_to_child", "request"])
            .get(),
        10
    );
    manager.stop().await;
}

#[tokio::test]
async fn test_contract_parameter_writes() {
    let env = ManagerEnv::new();
    let manager = env.manager(false);
    manager.register_bridge_pair(CHILD, PARENT).await.unwrap();
    let child_bridge = env.child_backend.contract(CHILD);
    child_bridge.set_configuration_nonce(4);

    let token = Address::repeat_byte(0x70);
    manager
        .set_erc20_fee(CHILD, token, U256::from(11))
        .await
        .unwrap();
    manager.set_klay_fee(CHILD, U256::from(12)).await.unwrap();
    manager
        .set_fee_receiver(CHILD, Address::repeat_byte(0x71))
        .await
        .unwrap();
    manager
        .register_operator(CHILD, Address::repeat_byte(0x72))
        .await
        .unwrap();
    manager
        .set_value_transfer_operator_threshold(CHILD, 2)
        .await
        .unwrap();
    manager
        .set_configuration_operator_threshold(CHILD, 3)
        .await
        .unwrap();

    assert_eq!(
        child_bridge.config_calls(),
        vec![
            format!("set_erc20_fee({:?},11,4)", token),
            "set_klay_fee(12,5)".to_string(),
            format!("set_fee_receiver({:?})", Address::repeat_byte(0x71)),
            format!("register_operator({:?})", Address::repeat_byte(0x72)),
            "set_operator_threshold(0,2)".to_string(),
            "set_operator_threshold(1,3)".to_string(),
        ]
    );
    assert_eq!(manager.accounts().child.lock().await.nonce(), 6);
    assert_eq!(manager.accounts().parent.lock().await.nonce(), 0);

    assert_eq!(
        manager.get_erc20_fee(CHILD, token).await.unwrap(),
        U256::from(11)
    );
    assert_eq!(manager.get_klay_fee(CHILD).await.unwrap(), U256::from(12));
    assert_eq!(
        manager.get_fee_receiver(CHILD).await.unwrap(),
        Address::repeat_byte(0x71)
    );
    assert_eq!(
        manager.get_operators(CHILD).await.unwrap(),
        vec![Address::repeat_byte(0x72)]
    );
    assert_eq!(
        manager
            .get_value_transfer_operator_threshold(CHILD)
            .await
            .unwrap(),
        2
    );
    assert_eq!(
        manager.set_klay_fee(Address::repeat_byte(9), U256::one()).await,
        Err(BridgeError::NoBridgeInfo)
    );
    manager.stop().await;
}

#[tokio::test]
async fn test_register_and_deregister_token() {
    let env = ManagerEnv::new();
    let manager = env.manager(false);
    manager.register_bridge_pair(CHILD, PARENT).await.unwrap();
    let (c_token, p_token) = (Address::repeat_byte(0x10), Address::repeat_byte(0x20));

    manager
        .register_token(CHILD, PARENT, c_token, p_token)
        .await
        .unwrap();
    let child_info = manager.get_bridge_info(CHILD).unwrap();
    let parent_info = manager.get_bridge_info(PARENT).unwrap();
    assert_eq!(child_info.get_counterpart_token(c_token), p_token);
    assert_eq!(parent_info.get_counterpart_token(p_token), c_token);
    let child_bridge = env.child_backend.contract(CHILD);
    let parent_bridge = env.parent_backend.contract(PARENT);
    assert_eq!(child_bridge.registered_token(c_token), Some(p_token));
    assert_eq!(parent_bridge.registered_token(p_token), Some(c_token));
    assert_eq!(manager.accounts().child.lock().await.nonce(), 1);
    assert_eq!(manager.accounts().parent.lock().await.nonce(), 1);

    assert_eq!(
        manager.register_token(CHILD, PARENT, c_token, p_token).await,
        Err(BridgeError::DuplicatedToken)
    );

    manager
        .deregister_token(CHILD, PARENT, c_token, p_token)
        .await
        .unwrap();
    assert!(child_info.get_counterpart_token(c_token).is_zero());
    assert!(parent_info.get_counterpart_token(p_token).is_zero());
    assert_eq!(child_bridge.registered_token(c_token), None);
    assert_eq!(parent_bridge.registered_token(p_token), None);
    assert_eq!(
        child_bridge.config_calls(),
        vec![
            format!("register_token({:?},{:?})", c_token, p_token),
            format!("deregister_token({:?})", c_token),
        ]
    );
    assert_eq!(manager.accounts().child.lock().await.nonce(), 2);
    assert_eq!(manager.accounts().parent.lock().await.nonce(), 2);
    manager.stop().await;
}

#[tokio::test]
async fn test_token_registration_rejects_bad_input() {
    let env = ManagerEnv::new();
    let manager = env.manager(false);
    let (c_token, p_token) = (Address::repeat_byte(0x10), Address::repeat_byte(0x20));
    assert_eq!(
        manager.register_token(CHILD, PARENT, c_token, p_token).await,
        Err(BridgeError::InvalidBridgePair)
    );
    assert_eq!(
        manager
            .deregister_token(CHILD, PARENT, c_token, p_token)
            .await,
        Err(BridgeError::NoBridgeInfo)
    );

    manager.register_bridge_pair(CHILD, PARENT).await.unwrap();
    assert_eq!(
        manager
            .register_token(CHILD, Address::repeat_byte(0x99), c_token, p_token)
            .await,
        Err(BridgeError::InvalidBridgePair)
    );
    assert_eq!(
        manager
            .deregister_token(CHILD, PARENT, c_token, p_token)
            .await,
        Err(BridgeError::InvalidTokenPair)
    );

    // a token already mapped on the parent side leaves the child side untouched
    let parent_info = manager.get_bridge_info(PARENT).unwrap();
    parent_info
        .register_token(p_token, Address::repeat_byte(0x30))
        .unwrap();
    assert_eq!(
        manager.register_token(CHILD, PARENT, c_token, p_token).await,
        Err(BridgeError::DuplicatedToken)
    );
    let child_info = manager.get_bridge_info(CHILD).unwrap();
    assert!(child_info.get_counterpart_token(c_token).is_zero());
    assert_eq!(
        manager
            .deregister_token(CHILD, PARENT, c_token, p_token)
            .await,
        Err(BridgeError::InvalidTokenPair)
    );
    assert!(env.child_backend.contract(CHILD).config_calls().is_empty());
    manager.stop().await;
}

#[tokio::test]
async fn test_register_token_keeps_nonce_when_submission_fails() {
    let env = ManagerEnv::new();
    let manager = env.manager(false);
    manager.register_bridge_pair(CHILD, PARENT).await.unwrap();
    let parent_bridge = env.parent_backend.contract(PARENT);
    parent_bridge.set_failing_token_txs(Some(BridgeError::ContractError(
        "reverted".to_string(),
    )));

    let (c_token, p_token) = (Address::repeat_byte(0x10), Address::repeat_byte(0x20));
    assert!(matches!(
        manager.register_token(CHILD, PARENT, c_token, p_token).await,
        Err(BridgeError::ContractError(_))
    ));
    assert_eq!(manager.accounts().child.lock().await.nonce(), 1);
    assert_eq!(manager.accounts().parent.lock().await.nonce(), 0);
    assert_eq!(parent_bridge.registered_token(p_token), None);
    manager.stop().await;
}

#[tokio::test]
async fn test_get_bridge_information() {
    let env = ManagerEnv::new();
    let manager = env.manager(false);
    manager.register_bridge_pair(CHILD, PARENT).await.unwrap();
    let child_bridge = env.child_backend.contract(CHILD);
    child_bridge.set_lower_handle_nonce(8);
    child_bridge.set_is_running(false);

    let information = manager.get_bridge_information(CHILD).await.unwrap();
    assert_eq!(
        information,
        BridgeInformation {
            is_running: false,
            request_nonce: 8,
            handle_nonce: 8,
            lower_handle_nonce: 8,
            counter_part: PARENT,
            on_child_chain: true,
            is_subscribed: false,
            pending_event_size: 0,
        }
    );
    let json = serde_json::to_value(&information).unwrap();
    assert_eq!(json["lowerHandleNonce"], 8);
    manager.stop().await;
}

#[tokio::test]
async fn test_recovery_registry() {
    let env = ManagerEnv::new();
    let disabled = env.manager(false);
    disabled.register_bridge_pair(CHILD, PARENT).await.unwrap();
    disabled.add_recovery(CHILD, PARENT).await.unwrap();
    assert!(!disabled.has_recovery(CHILD).await);
    disabled.stop().await;

    let env = ManagerEnv::new();
    let manager = env.manager(true);
    assert_eq!(
        manager.add_recovery(CHILD, PARENT).await,
        Err(BridgeError::NoBridgeInfo)
    );
    manager.register_bridge_pair(CHILD, PARENT).await.unwrap();
    manager.add_recovery(CHILD, PARENT).await.unwrap();
    assert!(manager.has_recovery(CHILD).await);
    manager.delete_recovery(CHILD, PARENT).await.unwrap();
    assert!(!manager.has_recovery(CHILD).await);
    manager.stop().await;
}

#[tokio::test]
async fn test_stop_closes_infos_and_feeders() {
    let env = ManagerEnv::new();
    let manager = env.manager(false);
    manager.register_bridge_pair(CHILD, PARENT).await.unwrap();
    let mut requests = manager.subscribe_request_event();
    let child = manager.get_bridge_info(CHILD).unwrap();

    manager.stop().await;
    assert!(manager.is_stopped());
    assert!(child.is_closed());
    assert!(matches!(requests.recv().await, Err(RecvError::Closed)));
    // closing twice is harmless
    manager.stop().await;
}
