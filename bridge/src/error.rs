// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use ethers::providers::{Middleware, ProviderError};
use ethers::utils::rlp::DecoderError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    #[error("bridge information does not exist")]
    NoBridgeInfo,
    #[error("bridge information is duplicated")]
    DuplicatedBridgeInfo,
    #[error("invalid token pair")]
    InvalidTokenPair,
    #[error("token is duplicated")]
    DuplicatedToken,
    #[error("no active bridge address journal")]
    NoActiveAddressJournal,
    #[error("duplicated bridge address journal")]
    DuplicatedJournal,
    #[error("empty bridge address")]
    EmptyBridgeAddress,
    #[error("recovery does not exist")]
    NoRecovery,
    #[error("already subscribed")]
    AlreadySubscribed,
    #[error("restoring bridges is failed")]
    BridgeRestore,
    #[error("value transfer recovery is disabled")]
    VtrDisabled,
    #[error("value transfer recovery is already started")]
    VtrAlreadyStarted,
    // The two addresses are not registered as counterparts of each other
    #[error("invalid bridge pair")]
    InvalidBridgePair,
    // The counterpart bridge has no token registered for the local token
    #[error("counterpart token is not registered")]
    UnregisteredCounterpartToken,
    // Transient chain provider error, worth retrying
    #[error("transient provider error: {0}")]
    TransientProviderError(String),
    #[error("provider error: {0}")]
    ProviderError(String),
    // Contract call or transaction rejected
    #[error("contract error: {0}")]
    ContractError(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("journal decode error: {0}")]
    JournalDecode(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("storage error: {0}")]
    StorageError(String),
    // Event subscription channel was closed by the producer
    #[error("subscription closed")]
    SubscriptionClosed,
    #[error("internal error: {0}")]
    InternalError(String),
}

impl BridgeError {
    /// Returns a short string identifying the error type for metrics labels
    pub fn error_type(&self) -> &'static str {
        match self {
            BridgeError::NoBridgeInfo => "no_bridge_info",
            BridgeError::DuplicatedBridgeInfo => "duplicated_bridge_info",
            BridgeError::InvalidTokenPair => "invalid_token_pair",
            BridgeError::DuplicatedToken => "duplicated_token",
            BridgeError::NoActiveAddressJournal => "no_active_address_journal",
            BridgeError::DuplicatedJournal => "duplicated_journal",
            BridgeError::EmptyBridgeAddress => "empty_bridge_address",
            BridgeError::NoRecovery => "no_recovery",
            BridgeError::AlreadySubscribed => "already_subscribed",
            BridgeError::BridgeRestore => "bridge_restore",
            BridgeError::VtrDisabled => "vtr_disabled",
            BridgeError::VtrAlreadyStarted => "vtr_already_started",
            BridgeError::InvalidBridgePair => "invalid_bridge_pair",
            BridgeError::UnregisteredCounterpartToken => "unregistered_counterpart_token",
            BridgeError::TransientProviderError(_) => "transient_provider_error",
            BridgeError::ProviderError(_) => "provider_error",
            BridgeError::ContractError(_) => "contract_error",
            BridgeError::Timeout(_) => "timeout",
            BridgeError::JournalDecode(_) => "journal_decode",
            BridgeError::Io(_) => "io_error",
            BridgeError::StorageError(_) => "storage_error",
            BridgeError::SubscriptionClosed => "subscription_closed",
            BridgeError::InternalError(_) => "internal_error",
        }
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;

impl From<std::io::Error> for BridgeError {
    fn from(e: std::io::Error) -> Self {
        BridgeError::Io(e.to_string())
    }
}

impl From<DecoderError> for BridgeError {
    fn from(e: DecoderError) -> Self {
        BridgeError::JournalDecode(e.to_string())
    }
}

impl From<ProviderError> for BridgeError {
    fn from(e: ProviderError) -> Self {
        match &e {
            ProviderError::HTTPError(_) => BridgeError::TransientProviderError(e.to_string()),
            _ => BridgeError::ProviderError(e.to_string()),
        }
    }
}

impl<M: Middleware> From<ethers::contract::ContractError<M>> for BridgeError {
    fn from(e: ethers::contract::ContractError<M>) -> Self {
        BridgeError::ContractError(e.to_string())
    }
}
