// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Reads and writes of bridge contract parameters. Every write holds the
//! operator account lock for exactly one submission.

use super::BridgeManager;
use crate::error::{BridgeError, BridgeResult};
use crate::types::VoteType;
use ethers::types::{Address, H256, U256};
use tracing::{debug, info};

impl BridgeManager {
    pub async fn set_erc20_fee(&self, bridge: Address, token: Address, fee: U256) -> BridgeResult<H256> {
        let info = self.get_bridge_info(bridge).ok_or(BridgeError::NoBridgeInfo)?;
        let mut account = info.account().lock().await;
        let configuration_nonce = info.bridge().configuration_nonce().await?;
        let tx = info
            .bridge()
            .set_erc20_fee(
                &account.generate_transact_opts(),
                token,
                fee,
                configuration_nonce,
            )
            .await?;
        account.inc_nonce();
        info!(
            "[BridgeManager] Set ERC20 fee bridge={:?} token={:?} fee={} tx={:?}",
            bridge, token, fee, tx
        );
        Ok(tx)
    }

    pub async fn set_klay_fee(&self, bridge: Address, fee: U256) -> BridgeResult<H256> {
        let info = self.get_bridge_info(bridge).ok_or(BridgeError::NoBridgeInfo)?;
        let mut account = info.account().lock().await;
        let configuration_nonce = info.bridge().configuration_nonce().await?;
        let tx = info
            .bridge()
            .set_klay_fee(&account.generate_transact_opts(), fee, configuration_nonce)
            .await?;
        account.inc_nonce();
        info!(
            "[BridgeManager] Set KLAY fee bridge={:?} fee={} tx={:?}",
            bridge, fee, tx
        );
        Ok(tx)
    }

    pub async fn set_fee_receiver(&self, bridge: Address, receiver: Address) -> BridgeResult<H256> {
        let info = self.get_bridge_info(bridge).ok_or(BridgeError::NoBridgeInfo)?;
        let mut account = info.account().lock().await;
        let tx = info
            .bridge()
            .set_fee_receiver(&account.generate_transact_opts(), receiver)
            .await?;
        account.inc_nonce();
        Ok(tx)
    }

    pub async fn register_operator(&self, bridge: Address, operator: Address) -> BridgeResult<H256> {
        let info = self.get_bridge_info(bridge).ok_or(BridgeError::NoBridgeInfo)?;
        let mut account = info.account().lock().await;
        let tx = info
            .bridge()
            .register_operator(&account.generate_transact_opts(), operator)
            .await?;
        account.inc_nonce();
        Ok(tx)
    }

    pub async fn set_value_transfer_operator_threshold(
        &self,
        bridge: Address,
        threshold: u8,
    ) -> BridgeResult<H256> {
        self.set_operator_threshold(bridge, VoteType::ValueTransfer, threshold)
            .await
    }

    pub async fn set_configuration_operator_threshold(
        &self,
        bridge: Address,
        threshold: u8,
    ) -> BridgeResult<H256> {
        self.set_operator_threshold(bridge, VoteType::Configuration, threshold)
            .await
    }

    async fn set_operator_threshold(
        &self,
        bridge: Address,
        vote_type: VoteType,
        threshold: u8,
    ) -> BridgeResult<H256> {
        let info = self.get_bridge_info(bridge).ok_or(BridgeError::NoBridgeInfo)?;
        let mut account = info.account().lock().await;
        let tx = info
            .bridge()
            .set_operator_threshold(&account.generate_transact_opts(), vote_type, threshold)
            .await?;
        account.inc_nonce();
        Ok(tx)
    }

    /// Maps `c_token` on the child bridge to `p_token` on the parent bridge,
    /// locally on both sides first and then on both contracts.
    pub async fn register_token(
        &self,
        c_bridge: Address,
        p_bridge: Address,
        c_token: Address,
        p_token: Address,
    ) -> BridgeResult<()> {
        if !self.is_valid_bridge_pair(c_bridge, p_bridge) {
            return Err(BridgeError::InvalidBridgePair);
        }
        let c_info = self.get_bridge_info(c_bridge).ok_or(BridgeError::NoBridgeInfo)?;
        let p_info = self.get_bridge_info(p_bridge).ok_or(BridgeError::NoBridgeInfo)?;

        c_info.register_token(c_token, p_token)?;
        if let Err(e) = p_info.register_token(p_token, c_token) {
            let _ = c_info.deregister_token(c_token, p_token);
            return Err(e);
        }

        for (info, token, counterpart_token) in
            [(&c_info, c_token, p_token), (&p_info, p_token, c_token)]
        {
            let mut account = info.account().lock().await;
            let tx = info
                .bridge()
                .register_token(&account.generate_transact_opts(), token, counterpart_token)
                .await?;
            account.inc_nonce();
            debug!(
                "[BridgeManager] Bridge {:?} registered token {:?} -> {:?} tx={:?}",
                info.address(),
                token,
                counterpart_token,
                tx
            );
        }
        info!(
            "[BridgeManager] Register token c_token={:?} p_token={:?}",
            c_token, p_token
        );
        Ok(())
    }

    pub async fn deregister_token(
        &self,
        c_bridge: Address,
        p_bridge: Address,
        c_token: Address,
        p_token: Address,
    ) -> BridgeResult<()> {
        let c_info = self.get_bridge_info(c_bridge).ok_or(BridgeError::NoBridgeInfo)?;
        let p_info = self.get_bridge_info(p_bridge).ok_or(BridgeError::NoBridgeInfo)?;
        if c_info.get_counterpart_token(c_token) != p_token
            || p_info.get_counterpart_token(p_token) != c_token
        {
            return Err(BridgeError::InvalidTokenPair);
        }
        c_info.deregister_token(c_token, p_token)?;
        p_info.deregister_token(p_token, c_token)?;

        for (info, token) in [(&c_info, c_token), (&p_info, p_token)] {
            let mut account = info.account().lock().await;
            let tx = info
                .bridge()
                .deregister_token(&account.generate_transact_opts(), token)
                .await?;
            account.inc_nonce();
            debug!(
                "[BridgeManager] Bridge {:?} deregistered token {:?} tx={:?}",
                info.address(),
                token,
                tx
            );
        }
        info!(
            "[BridgeManager] Deregister token c_token={:?} p_token={:?}",
            c_token, p_token
        );
        Ok(())
    }

    pub async fn get_erc20_fee(&self, bridge: Address, token: Address) -> BridgeResult<U256> {
        let info = self.get_bridge_info(bridge).ok_or(BridgeError::NoBridgeInfo)?;
        info.bridge().fee_of_erc20(token).await
    }

    pub async fn get_klay_fee(&self, bridge: Address) -> BridgeResult<U256> {
        let info = self.get_bridge_info(bridge).ok_or(BridgeError::NoBridgeInfo)?;
        info.bridge().fee_of_klay().await
    }

    pub async fn get_fee_receiver(&self, bridge: Address) -> BridgeResult<Address> {
        let info = self.get_bridge_info(bridge).ok_or(BridgeError::NoBridgeInfo)?;
        info.bridge().fee_receiver().await
    }

    pub async fn get_operators(&self, bridge: Address) -> BridgeResult<Vec<Address>> {
        let info = self.get_bridge_info(bridge).ok_or(BridgeError::NoBridgeInfo)?;
        info.bridge().get_operator_list().await
    }

    pub async fn get_value_transfer_operator_threshold(&self, bridge: Address) -> BridgeResult<u8> {
        let info = self.get_bridge_info(bridge).ok_or(BridgeError::NoBridgeInfo)?;
        info.bridge()
            .operator_thresholds(VoteType::ValueTransfer)
            .await
    }
}
