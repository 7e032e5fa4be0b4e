//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Chain connection status and ingestion progress
//! - Event counts and orphaned (reorged) events
//! - Relay/refund action outcomes and latency
//! - Operator alerts

use crate::error::{RelayerError, RelayerResult};
use crate::hashlock::{short, ChainId, HashLock};

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::{error, info};

lazy_static! {
    // Chain metrics
    pub static ref CHAIN_CONNECTED: GaugeVec = register_gauge_vec!(
        "htlc_relayer_chain_connected",
        "Chain connection status (1=connected, 0=disconnected)",
        &["chain_id"]
    ).expect("metric registration");

    pub static ref CHAIN_BLOCK_HEIGHT: GaugeVec = register_gauge_vec!(
        "htlc_relayer_chain_block_height",
        "Latest block height seen per chain",
        &["chain_id"]
    ).expect("metric registration");

    pub static ref CHAIN_CHECKPOINT: GaugeVec = register_gauge_vec!(
        "htlc_relayer_chain_checkpoint",
        "Last block whose events are fully processed",
        &["chain_id"]
    ).expect("metric registration");

    // Event metrics
    pub static ref EVENTS_RECEIVED: CounterVec = register_counter_vec!(
        "htlc_relayer_events_received_total",
        "Total final events received by type",
        &["chain_id", "event_type"]
    ).expect("metric registration");

    pub static ref EVENTS_ORPHANED: CounterVec = register_counter_vec!(
        "htlc_relayer_events_orphaned_total",
        "Events dropped because their block left the canonical chain",
        &["chain_id"]
    ).expect("metric registration");

    // Swap metrics
    pub static ref SWAPS_CREATED: CounterVec = register_counter_vec!(
        "htlc_relayer_swaps_created_total",
        "Swaps registered from a first lock",
        &["chain_id"]
    ).expect("metric registration");

    // Action metrics
    pub static ref ACTIONS_SUBMITTED: CounterVec = register_counter_vec!(
        "htlc_relayer_actions_submitted_total",
        "Unlock/refund transactions broadcast",
        &["chain_id", "action"]
    ).expect("metric registration");

    pub static ref ACTIONS_COMPLETED: CounterVec = register_counter_vec!(
        "htlc_relayer_actions_completed_total",
        "Actions that reached their terminal status",
        &["chain_id", "action"]
    ).expect("metric registration");

    pub static ref ACTIONS_FAILED: CounterVec = register_counter_vec!(
        "htlc_relayer_actions_failed_total",
        "Actions abandoned with a flag",
        &["chain_id", "action"]
    ).expect("metric registration");

    pub static ref ACTION_LATENCY: HistogramVec = register_histogram_vec!(
        "htlc_relayer_action_latency_seconds",
        "Time from scheduling to confirmed action",
        &["chain_id", "action"],
        vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]
    ).expect("metric registration");

    pub static ref ALERTS: CounterVec = register_counter_vec!(
        "htlc_relayer_alerts_total",
        "Conditions surfaced to the operator",
        &["kind"]
    ).expect("metric registration");

    // Health metrics
    pub static ref HEALTH_CHECK_SUCCESS: CounterVec = register_counter_vec!(
        "htlc_relayer_health_check_success_total",
        "Total successful health checks",
        &[]
    ).expect("metric registration");

    pub static ref HEALTH_CHECK_FAILURE: CounterVec = register_counter_vec!(
        "htlc_relayer_health_check_failure_total",
        "Total failed health checks",
        &[]
    ).expect("metric registration");
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> RelayerResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| RelayerError::Internal(format!("Failed to bind {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| RelayerError::Internal(format!("Metrics server error: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    String::from_utf8(buffer).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

// Helper functions to record metrics

pub fn record_chain_health(chain_id: ChainId, healthy: bool) {
    CHAIN_CONNECTED
        .with_label_values(&[&chain_id.to_string()])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_chain_head(chain_id: ChainId, block_number: u64) {
    CHAIN_BLOCK_HEIGHT
        .with_label_values(&[&chain_id.to_string()])
        .set(block_number as f64);
}

pub fn record_checkpoint(chain_id: ChainId, block_number: u64) {
    CHAIN_CHECKPOINT
        .with_label_values(&[&chain_id.to_string()])
        .set(block_number as f64);
}

pub fn record_event(chain_id: ChainId, event_type: &str) {
    EVENTS_RECEIVED
        .with_label_values(&[&chain_id.to_string(), event_type])
        .inc();
}

pub fn record_orphaned(chain_id: ChainId) {
    EVENTS_ORPHANED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_swap_created(chain_id: ChainId) {
    SWAPS_CREATED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_action_submitted(chain_id: ChainId, action: &str) {
    ACTIONS_SUBMITTED
        .with_label_values(&[&chain_id.to_string(), action])
        .inc();
}

pub fn record_action_completed(chain_id: ChainId, action: &str, latency_secs: f64) {
    let chain = chain_id.to_string();
    ACTIONS_COMPLETED.with_label_values(&[&chain, action]).inc();
    ACTION_LATENCY
        .with_label_values(&[&chain, action])
        .observe(latency_secs);
}

pub fn record_action_failed(chain_id: ChainId, action: &str) {
    ACTIONS_FAILED
        .with_label_values(&[&chain_id.to_string(), action])
        .inc();
}

pub fn record_alert(kind: &str) {
    ALERTS.with_label_values(&[kind]).inc();
}

/// Surface a swap that needs an operator
pub fn alert(kind: &str, hash_lock: &HashLock, message: &str) {
    error!(
        alert = kind,
        hash_lock = %short(hash_lock),
        "Operator attention required: {}",
        message
    );
    record_alert(kind);
}

pub fn record_health_check() {
    HEALTH_CHECK_SUCCESS.with_label_values(&[]).inc();
}

pub fn record_health_check_failure() {
    HEALTH_CHECK_FAILURE.with_label_values(&[]).inc();
}
