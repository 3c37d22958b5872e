// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Bridge contract ABI and decoding of its event logs.

use crate::error::{BridgeError, BridgeResult};
use crate::types::{
    HandleValueTransferEvent, RawLog, RequestValueTransfer, RequestValueTransferEncoded,
    RequestValueTransferEvent, TokenType,
};
use ethers::abi::{self, Abi, Event, ParamType, Token};
use ethers::types::{Address, Bytes, Log, H256, U256};
use once_cell::sync::Lazy;

pub const REQUEST_VALUE_TRANSFER: &str = "RequestValueTransfer";
pub const REQUEST_VALUE_TRANSFER_ENCODED: &str = "RequestValueTransferEncoded";
pub const HANDLE_VALUE_TRANSFER: &str = "HandleValueTransfer";

// Encoding version of `encodedData` carrying an ABI encoded token URI.
const ENCODING_VER_URI: u8 = 1;

const BRIDGE_ABI: &[&str] = &[
    "function requestNonce() view returns (uint64)",
    "function lowerHandleNonce() view returns (uint64)",
    "function recoveryBlockNumber() view returns (uint64)",
    "function isRunning() view returns (bool)",
    "function configurationNonce() view returns (uint64)",
    "function registeredTokens(address) view returns (address)",
    "function handleNoncesToBlockNums(uint64) view returns (uint64)",
    "function operatorThresholds(uint8) view returns (uint8)",
    "function feeOfERC20(address) view returns (uint256)",
    "function feeOfKLAY() view returns (uint256)",
    "function feeReceiver() view returns (address)",
    "function getOperatorList() view returns (address[])",
    "function handleKLAYTransfer(bytes32 requestTxHash, address from, address to, uint256 value, uint64 requestedNonce, uint64 requestedBlockNumber, bytes extraData)",
    "function handleERC20Transfer(bytes32 requestTxHash, address from, address to, address tokenAddress, uint256 value, uint64 requestedNonce, uint64 requestedBlockNumber, bytes extraData)",
    "function handleERC721Transfer(bytes32 requestTxHash, address from, address to, address tokenAddress, uint256 tokenId, uint64 requestedNonce, uint64 requestedBlockNumber, string tokenURI, bytes extraData)",
    "function setERC20Fee(address token, uint256 fee, uint64 requestNonce)",
    "function setKLAYFee(uint256 fee, uint64 requestNonce)",
    "function setFeeReceiver(address feeReceiver)",
    "function registerOperator(address operator)",
    "function setOperatorThreshold(uint8 voteType, uint8 threshold)",
    "function registerToken(address _token, address _cToken)",
    "function deregisterToken(address _token)",
    "event RequestValueTransfer(uint8 tokenType, address indexed from, address indexed to, address indexed tokenAddress, uint256 valueOrTokenId, uint64 requestNonce, uint256 fee, bytes extraData)",
    "event RequestValueTransferEncoded(uint8 tokenType, address indexed from, address indexed to, address indexed tokenAddress, uint256 valueOrTokenId, uint64 requestNonce, uint256 fee, bytes extraData, uint8 encodingVer, bytes encodedData)",
    "event HandleValueTransfer(bytes32 requestTxHash, uint8 tokenType, address indexed from, address indexed to, address indexed tokenAddress, uint256 valueOrTokenId, uint64 handleNonce, uint64 lowerHandleNonce, bytes extraData)",
];

static PARSED_BRIDGE_ABI: Lazy<Result<Abi, String>> =
    Lazy::new(|| abi::parse_abi(BRIDGE_ABI).map_err(|e| e.to_string()));

pub fn bridge_abi() -> BridgeResult<Abi> {
    PARSED_BRIDGE_ABI
        .clone()
        .map_err(|e| BridgeError::InternalError(format!("invalid bridge abi: {}", e)))
}

pub fn bridge_event(name: &str) -> BridgeResult<Event> {
    bridge_abi()?
        .event(name)
        .cloned()
        .map_err(|e| BridgeError::InternalError(e.to_string()))
}

fn raw_log(log: &Log) -> RawLog {
    RawLog {
        block_number: log.block_number.map(|n| n.as_u64()).unwrap_or_default(),
        tx_hash: log.transaction_hash.unwrap_or_default(),
        contract_address: log.address,
    }
}

struct DecodedLog {
    params: Vec<(String, Token)>,
}

impl DecodedLog {
    fn parse(event: &Event, log: &Log) -> BridgeResult<Self> {
        let parsed = event
            .parse_log(abi::RawLog {
                topics: log.topics.clone(),
                data: log.data.to_vec(),
            })
            .map_err(|e| BridgeError::ProviderError(format!("undecodable {} log: {}", event.name, e)))?;
        Ok(Self {
            params: parsed.params.into_iter().map(|p| (p.name, p.value)).collect(),
        })
    }

    fn token(&self, name: &str) -> BridgeResult<Token> {
        self.params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, t)| t.clone())
            .ok_or_else(|| BridgeError::ProviderError(format!("missing log field {}", name)))
    }

    fn uint(&self, name: &str) -> BridgeResult<U256> {
        self.token(name)?
            .into_uint()
            .ok_or_else(|| BridgeError::ProviderError(format!("log field {} is not a uint", name)))
    }

    fn u64(&self, name: &str) -> BridgeResult<u64> {
        let value = self.uint(name)?;
        if value > U256::from(u64::MAX) {
            return Err(BridgeError::ProviderError(format!(
                "log field {} overflows u64",
                name
            )));
        }
        Ok(value.as_u64())
    }

    fn u8(&self, name: &str) -> BridgeResult<u8> {
        let value = self.uint(name)?;
        if value > U256::from(u8::MAX) {
            return Err(BridgeError::ProviderError(format!(
                "log field {} overflows u8",
                name
            )));
        }
        Ok(value.as_u32() as u8)
    }

    fn address(&self, name: &str) -> BridgeResult<Address> {
        self.token(name)?
            .into_address()
            .ok_or_else(|| BridgeError::ProviderError(format!("log field {} is not an address", name)))
    }

    fn bytes(&self, name: &str) -> BridgeResult<Vec<u8>> {
        self.token(name)?
            .into_bytes()
            .ok_or_else(|| BridgeError::ProviderError(format!("log field {} is not bytes", name)))
    }

    fn h256(&self, name: &str) -> BridgeResult<H256> {
        self.token(name)?
            .into_fixed_bytes()
            .filter(|b| b.len() == 32)
            .map(|b| H256::from_slice(&b))
            .ok_or_else(|| BridgeError::ProviderError(format!("log field {} is not bytes32", name)))
    }
}

pub fn decode_request_value_transfer(event: &Event, log: &Log) -> BridgeResult<RequestValueTransferEvent> {
    let decoded = DecodedLog::parse(event, log)?;
    Ok(RequestValueTransferEvent::Plain(RequestValueTransfer {
        token_type: decoded.u8("tokenType")?,
        from: decoded.address("from")?,
        to: decoded.address("to")?,
        token_address: decoded.address("tokenAddress")?,
        value_or_token_id: decoded.uint("valueOrTokenId")?,
        request_nonce: decoded.u64("requestNonce")?,
        fee: decoded.uint("fee")?,
        extra_data: Bytes::from(decoded.bytes("extraData")?),
        raw: raw_log(log),
    }))
}

pub fn decode_request_value_transfer_encoded(
    event: &Event,
    log: &Log,
) -> BridgeResult<RequestValueTransferEvent> {
    let decoded = DecodedLog::parse(event, log)?;
    let token_type = decoded.u8("tokenType")?;
    let encoding_ver = decoded.u8("encodingVer")?;
    let encoded_data = decoded.bytes("encodedData")?;
    let uri = if token_type == TokenType::NonFungible as u8 && encoding_ver == ENCODING_VER_URI {
        decode_uri(&encoded_data)?
    } else {
        String::new()
    };
    Ok(RequestValueTransferEvent::Encoded(RequestValueTransferEncoded {
        token_type,
        from: decoded.address("from")?,
        to: decoded.address("to")?,
        token_address: decoded.address("tokenAddress")?,
        value_or_token_id: decoded.uint("valueOrTokenId")?,
        request_nonce: decoded.u64("requestNonce")?,
        fee: decoded.uint("fee")?,
        encoding_ver,
        uri,
        extra_data: Bytes::from(decoded.bytes("extraData")?),
        raw: raw_log(log),
    }))
}

pub fn decode_handle_value_transfer(event: &Event, log: &Log) -> BridgeResult<HandleValueTransferEvent> {
    let decoded = DecodedLog::parse(event, log)?;
    Ok(HandleValueTransferEvent {
        request_tx_hash: decoded.h256("requestTxHash")?,
        token_type: decoded.u8("tokenType")?,
        from: decoded.address("from")?,
        to: decoded.address("to")?,
        token_address: decoded.address("tokenAddress")?,
        value_or_token_id: decoded.uint("valueOrTokenId")?,
        handle_nonce: decoded.u64("handleNonce")?,
        lower_handle_nonce: decoded.u64("lowerHandleNonce")?,
        extra_data: Bytes::from(decoded.bytes("extraData")?),
        raw: raw_log(log),
    })
}

fn decode_uri(encoded: &[u8]) -> BridgeResult<String> {
    abi::decode(&[ParamType::String], encoded)
        .ok()
        .and_then(|tokens| tokens.into_iter().next())
        .and_then(Token::into_string)
        .ok_or_else(|| BridgeError::ProviderError("undecodable token uri".to_string()))
}
