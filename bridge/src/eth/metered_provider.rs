// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::metrics::BridgeMetrics;
use ethers::providers::{Http, HttpClientError, JsonRpcClient, Provider};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use url::{ParseError, Url};

/// HTTP JSON-RPC transport that counts and times every request per chain.
#[derive(Debug, Clone)]
pub struct MeteredEthHttpProvider {
    inner: Http,
    chain: &'static str,
    metrics: Arc<BridgeMetrics>,
}

#[cfg_attr(target_arch = "wasm32", async_trait::async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait::async_trait)]
impl JsonRpcClient for MeteredEthHttpProvider {
    type Error = HttpClientError;

    async fn request<T: Serialize + Send + Sync + Debug, R: DeserializeOwned + Send>(
        &self,
        method: &str,
        params: T,
    ) -> Result<R, HttpClientError> {
        self.metrics
            .rpc_queries
            .with_label_values(&[self.chain, method])
            .inc();
        let _guard = self
            .metrics
            .rpc_queries_latency
            .with_label_values(&[self.chain, method])
            .start_timer();
        let result = self.inner.request(method, params).await;
        self.metrics
            .node_connected
            .with_label_values(&[self.chain])
            .set(result.is_ok() as i64);
        result
    }
}

impl MeteredEthHttpProvider {
    pub fn new(url: impl Into<Url>, chain: &'static str, metrics: Arc<BridgeMetrics>) -> Self {
        Self {
            inner: Http::new(url),
            chain,
            metrics,
        }
    }
}

pub fn new_metered_eth_provider(
    url: &str,
    chain: &'static str,
    metrics: Arc<BridgeMetrics>,
    poll_interval: Duration,
) -> Result<Provider<MeteredEthHttpProvider>, ParseError> {
    let http_provider = MeteredEthHttpProvider::new(Url::parse(url)?, chain, metrics);
    Ok(Provider::new(http_provider).interval(poll_interval))
}
