// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use axum::{extract::State, http::StatusCode, routing::get, Router};
use prometheus::{
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, register_int_gauge_vec_with_registry, HistogramVec,
    IntCounter, IntCounterVec, IntGaugeVec, Registry, TextEncoder,
};
use std::net::SocketAddr;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub const METRICS_ROUTE: &str = "/metrics";

const FINE_GRAINED_LATENCY_SEC_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.05, 0.1, 0.15, 0.2, 0.25, 0.3, 0.35, 0.4, 0.45, 0.5, 0.6, 0.7, 0.8, 0.9,
    1.0, 1.2, 1.4, 1.6, 1.8, 2.0, 2.5, 3.0, 3.5, 4.0, 5.0, 6.0, 6.5, 7.0, 7.5, 8.0, 8.5, 9.0, 9.5,
    10., 15., 20., 25., 30., 35., 40., 45., 50., 60., 70., 80., 90., 100., 120., 140., 160., 180.,
    200., 250., 300., 350., 400.,
];

#[derive(Clone, Debug)]
pub struct BridgeMetrics {
    // Event intake
    pub(crate) request_events_received: IntCounterVec,
    pub(crate) handle_events_received: IntCounterVec,
    pub(crate) recovered_request_events: IntCounterVec,
    pub(crate) dropped_request_events: IntCounterVec,
    pub(crate) pending_request_events: IntGaugeVec,

    // Per-bridge nonces
    pub(crate) request_nonce: IntGaugeVec,
    pub(crate) handle_nonce: IntGaugeVec,
    pub(crate) lower_handle_nonce: IntGaugeVec,

    // Handle transaction submission
    pub(crate) handle_tx_submitted: IntCounterVec,
    pub(crate) handle_tx_failed: IntCounterVec,

    // Journal
    pub(crate) journal_entries_loaded: IntCounter,
    pub(crate) journal_entries_dropped: IntCounter,

    // Aggregated nonces per direction, set by the periodic status log
    pub(crate) bridge_status_nonces: IntGaugeVec,

    // Chain RPC
    pub(crate) rpc_queries: IntCounterVec,
    pub(crate) rpc_queries_latency: HistogramVec,
    pub(crate) node_connected: IntGaugeVec,
}

impl BridgeMetrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            request_events_received: register_int_counter_vec_with_registry!(
                "bridge_request_events_received",
                "Total number of request value transfer events received, by emitting bridge",
                &["bridge"],
                registry,
            )
            .unwrap(),
            handle_events_received: register_int_counter_vec_with_registry!(
                "bridge_handle_events_received",
                "Total number of handle value transfer events received, by emitting bridge",
                &["bridge"],
                registry,
            )
            .unwrap(),
            recovered_request_events: register_int_counter_vec_with_registry!(
                "bridge_recovered_request_events",
                "Total number of request events re-injected by value transfer recovery, by handling bridge",
                &["bridge"],
                registry,
            )
            .unwrap(),
            dropped_request_events: register_int_counter_vec_with_registry!(
                "bridge_dropped_request_events",
                "Total number of request events dropped because the pending queue was full",
                &["bridge"],
                registry,
            )
            .unwrap(),
            pending_request_events: register_int_gauge_vec_with_registry!(
                "bridge_pending_request_events",
                "Number of request events waiting to be handled, by handling bridge",
                &["bridge"],
                registry,
            )
            .unwrap(),
            request_nonce: register_int_gauge_vec_with_registry!(
                "bridge_request_nonce",
                "Highest request nonce observed on the bridge",
                &["bridge"],
                registry,
            )
            .unwrap(),
            handle_nonce: register_int_gauge_vec_with_registry!(
                "bridge_handle_nonce",
                "Next nonce to be handled on the bridge",
                &["bridge"],
                registry,
            )
            .unwrap(),
            lower_handle_nonce: register_int_gauge_vec_with_registry!(
                "bridge_lower_handle_nonce",
                "Lowest unhandled nonce reported by the bridge contract",
                &["bridge"],
                registry,
            )
            .unwrap(),
            handle_tx_submitted: register_int_counter_vec_with_registry!(
                "bridge_handle_tx_submitted",
                "Total number of handle value transfer transactions submitted",
                &["bridge"],
                registry,
            )
            .unwrap(),
            handle_tx_failed: register_int_counter_vec_with_registry!(
                "bridge_handle_tx_failed",
                "Total number of failed handle value transfer submissions, by error type",
                &["bridge", "error_type"],
                registry,
            )
            .unwrap(),
            journal_entries_loaded: register_int_counter_with_registry!(
                "bridge_journal_entries_loaded",
                "Total number of bridge journal entries replayed from disk",
                registry,
            )
            .unwrap(),
            journal_entries_dropped: register_int_counter_with_registry!(
                "bridge_journal_entries_dropped",
                "Total number of bridge journal entries rejected while replaying",
                registry,
            )
            .unwrap(),
            bridge_status_nonces: register_int_gauge_vec_with_registry!(
                "bridge_status_nonces",
                "Sum of nonces over subscribed bridges, by transfer direction and nonce kind",
                &["direction", "kind"],
                registry,
            )
            .unwrap(),
            rpc_queries: register_int_counter_vec_with_registry!(
                "bridge_rpc_queries",
                "Total number of queries issued to chain providers, by chain and request type",
                &["chain", "type"],
                registry,
            )
            .unwrap(),
            rpc_queries_latency: register_histogram_vec_with_registry!(
                "bridge_rpc_queries_latency",
                "Latency of queries issued to chain providers, by chain and request type",
                &["chain", "type"],
                FINE_GRAINED_LATENCY_SEC_BUCKETS.to_vec(),
                registry,
            )
            .unwrap(),
            node_connected: register_int_gauge_vec_with_registry!(
                "bridge_node_connected",
                "Whether the last query to the chain provider succeeded (1) or not (0)",
                &["chain"],
                registry,
            )
            .unwrap(),
        }
    }

    pub fn new_for_testing() -> Self {
        let registry = Registry::new();
        Self::new(&registry)
    }
}

/// Serves the text exposition of `registry` on `addr` until `cancel` fires.
pub async fn start_prometheus_server(
    addr: SocketAddr,
    registry: Registry,
    cancel: CancellationToken,
) -> std::io::Result<JoinHandle<()>> {
    let app = Router::new()
        .route(METRICS_ROUTE, get(serve_metrics))
        .with_state(registry);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Prometheus metrics served on {:?}", listener.local_addr()?);
    Ok(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await
        {
            error!("Metrics server error: {:?}", e);
        }
    }))
}

async fn serve_metrics(State(registry): State<Registry>) -> (StatusCode, String) {
    match TextEncoder::new().encode_to_string(&registry.gather()) {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("unable to encode metrics: {}", e),
        ),
    }
}
