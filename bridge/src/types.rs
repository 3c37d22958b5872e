// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::sorted_map::Nonced;
use ethers::types::{Address, Bytes, H256, U256};
use serde::{Deserialize, Serialize};

/// Buffer size of every contract event subscription channel.
pub const TOKEN_EVENT_CHAN_SIZE: usize = 10_000;
/// Soft limit of the pending request queue of a bridge.
pub const MAX_PENDING_NONCE_DIFF: usize = 1000;
/// Capacity of the handled nonce set of a bridge.
pub const MAX_HANDLED_EVENT_SIZE: usize = 10_000_000;
/// Block window used when scanning historical request logs.
pub const FILTER_LOGS_STRIDE: u64 = 100;
/// Upper bound of request events collected by one recovery pass.
pub const MAX_PENDING_TXS: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TokenType {
    Native = 0,
    Fungible = 1,
    NonFungible = 2,
}

impl TryFrom<u8> for TokenType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(TokenType::Native),
            1 => Ok(TokenType::Fungible),
            2 => Ok(TokenType::NonFungible),
            other => Err(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum VoteType {
    ValueTransfer = 0,
    Configuration = 1,
}

/// Metadata of the log an event was decoded from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawLog {
    pub block_number: u64,
    pub tx_hash: H256,
    pub contract_address: Address,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestValueTransfer {
    pub token_type: u8,
    pub from: Address,
    pub to: Address,
    pub token_address: Address,
    pub value_or_token_id: U256,
    pub request_nonce: u64,
    pub fee: U256,
    pub extra_data: Bytes,
    pub raw: RawLog,
}

/// Request emitted with a versioned payload. Version 1 carries the
/// metadata uri of a non-fungible token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestValueTransferEncoded {
    pub token_type: u8,
    pub from: Address,
    pub to: Address,
    pub token_address: Address,
    pub value_or_token_id: U256,
    pub request_nonce: u64,
    pub fee: U256,
    pub encoding_ver: u8,
    pub uri: String,
    pub extra_data: Bytes,
    pub raw: RawLog,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestValueTransferEvent {
    Plain(RequestValueTransfer),
    Encoded(RequestValueTransferEncoded),
}

impl RequestValueTransferEvent {
    pub fn request_nonce(&self) -> u64 {
        match self {
            Self::Plain(ev) => ev.request_nonce,
            Self::Encoded(ev) => ev.request_nonce,
        }
    }

    pub fn token_type(&self) -> u8 {
        match self {
            Self::Plain(ev) => ev.token_type,
            Self::Encoded(ev) => ev.token_type,
        }
    }

    pub fn token_address(&self) -> Address {
        match self {
            Self::Plain(ev) => ev.token_address,
            Self::Encoded(ev) => ev.token_address,
        }
    }

    pub fn from(&self) -> Address {
        match self {
            Self::Plain(ev) => ev.from,
            Self::Encoded(ev) => ev.from,
        }
    }

    pub fn to(&self) -> Address {
        match self {
            Self::Plain(ev) => ev.to,
            Self::Encoded(ev) => ev.to,
        }
    }

    pub fn value_or_token_id(&self) -> U256 {
        match self {
            Self::Plain(ev) => ev.value_or_token_id,
            Self::Encoded(ev) => ev.value_or_token_id,
        }
    }

    pub fn extra_data(&self) -> &Bytes {
        match self {
            Self::Plain(ev) => &ev.extra_data,
            Self::Encoded(ev) => &ev.extra_data,
        }
    }

    pub fn raw(&self) -> &RawLog {
        match self {
            Self::Plain(ev) => &ev.raw,
            Self::Encoded(ev) => &ev.raw,
        }
    }

    /// Empty for plain requests.
    pub fn uri(&self) -> &str {
        match self {
            Self::Plain(_) => "",
            Self::Encoded(ev) => &ev.uri,
        }
    }
}

impl Nonced for RequestValueTransferEvent {
    fn nonce(&self) -> u64 {
        self.request_nonce()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleValueTransferEvent {
    pub request_tx_hash: H256,
    pub token_type: u8,
    pub from: Address,
    pub to: Address,
    pub token_address: Address,
    pub value_or_token_id: U256,
    pub handle_nonce: u64,
    pub lower_handle_nonce: u64,
    pub extra_data: Bytes,
    pub raw: RawLog,
}

/// Entry of the handled nonce set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandledNonce(pub u64);

impl Nonced for HandledNonce {
    fn nonce(&self) -> u64 {
        self.0
    }
}
