// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! ethers backed implementations of the chain and contract capabilities.

pub mod abi;
pub mod backend;
pub mod contract;
pub mod metered_provider;

pub use backend::{EthChainBackend, EthPeerSet};
pub use contract::{EthBridgeContract, EthContractConfig};
pub use metered_provider::{new_metered_eth_provider, MeteredEthHttpProvider};

use crate::error::BridgeError;
use ethers::middleware::SignerMiddleware;
use ethers::providers::{MiddlewareError, Provider, ProviderError, RpcError};
use ethers::signers::LocalWallet;

/// Signing client used for both chains.
pub type EthSigner = SignerMiddleware<Provider<MeteredEthHttpProvider>, LocalWallet>;

// Transport failures are transient, JSON-RPC error responses are not.
pub(crate) fn middleware_error<E: MiddlewareError>(e: E) -> BridgeError {
    match e.as_provider_error() {
        Some(ProviderError::HTTPError(_)) => BridgeError::TransientProviderError(e.to_string()),
        Some(ProviderError::JsonRpcClientError(rpc)) if rpc.as_error_response().is_none() => {
            BridgeError::TransientProviderError(e.to_string())
        }
        _ => BridgeError::ProviderError(e.to_string()),
    }
}
