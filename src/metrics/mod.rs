//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Chain head progress and subscription health
//! - Transaction submission, replacement and confirmation
//! - Fan activity and funding

use crate::error::{FanError, FanResult};

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_int_counter, CounterVec, Encoder, Gauge,
    IntCounter, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Chain metrics
    pub static ref BLOCKS_RECEIVED: IntCounter = register_int_counter!(
        "crazed_fans_blocks_received_total",
        "Total blocks delivered by the head subscription"
    ).unwrap();

    pub static ref CHAIN_HEAD: Gauge = register_gauge!(
        "crazed_fans_chain_head",
        "Number of the most recently delivered block"
    ).unwrap();

    pub static ref SUBSCRIPTION_ERRORS: IntCounter = register_int_counter!(
        "crazed_fans_subscription_errors_total",
        "Total head subscription failures"
    ).unwrap();

    // Transaction metrics
    pub static ref TX_SUBMITTED: CounterVec = register_counter_vec!(
        "crazed_fans_transactions_submitted_total",
        "Total transactions broadcast, by gas policy",
        &["policy"]
    ).unwrap();

    pub static ref TX_REPLACED: CounterVec = register_counter_vec!(
        "crazed_fans_transactions_replaced_total",
        "Total fee-bumped replacements, by gas policy",
        &["policy"]
    ).unwrap();

    pub static ref TX_CONFIRMED: CounterVec = register_counter_vec!(
        "crazed_fans_transactions_confirmed_total",
        "Total transactions observed in a block, by gas policy",
        &["policy"]
    ).unwrap();

    pub static ref TX_FAILED: CounterVec = register_counter_vec!(
        "crazed_fans_transactions_failed_total",
        "Total rejected broadcasts, by reason",
        &["reason"]
    ).unwrap();

    // Fan metrics
    pub static ref FANS_SEARCHING: Gauge = register_gauge!(
        "crazed_fans_searching",
        "Fans currently reacting to blocks"
    ).unwrap();

    pub static ref FUNDING_TRANSFERS: CounterVec = register_counter_vec!(
        "crazed_fans_funding_transfers_total",
        "Funding transfers by outcome",
        &["outcome"]
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> FanResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| FanError::Config(format!("cannot bind metrics port {}: {}", self.port, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| FanError::Internal(format!("metrics server failed: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, (StatusCode, String)> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

// Helper functions to record metrics

pub fn record_block(number: u64) {
    BLOCKS_RECEIVED.inc();
    CHAIN_HEAD.set(number as f64);
}

pub fn record_subscription_error() {
    SUBSCRIPTION_ERRORS.inc();
}

pub fn record_tx_submitted(policy: &str) {
    TX_SUBMITTED.with_label_values(&[policy]).inc();
}

pub fn record_tx_replaced(policy: &str) {
    TX_REPLACED.with_label_values(&[policy]).inc();
}

pub fn record_tx_confirmed(policy: &str, count: usize) {
    TX_CONFIRMED.with_label_values(&[policy]).inc_by(count as f64);
}

pub fn record_tx_failed(error: &FanError) {
    let reason = match error {
        FanError::InsufficientFunds(_) => "insufficient_funds",
        FanError::NonceTooLow(_) => "nonce_too_low",
        FanError::Submission { .. } | FanError::Rpc(_) => "rejected",
        FanError::GasEstimation(_) => "gas_estimation",
        FanError::Signing(_) => "signing",
        _ => "other",
    };
    TX_FAILED.with_label_values(&[reason]).inc();
}

pub fn record_fan_started() {
    FANS_SEARCHING.inc();
}

pub fn record_fan_stopped() {
    FANS_SEARCHING.dec();
}

pub fn record_funding(success: bool) {
    let outcome = if success { "confirmed" } else { "failed" };
    FUNDING_TRANSFERS.with_label_values(&[outcome]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_metrics_are_exported() {
        record_block(42);
        record_tx_failed(&FanError::InsufficientFunds("empty".into()));

        let body = metrics_handler().await.expect("encodes");
        assert!(body.contains("crazed_fans_blocks_received_total"));
        assert!(body.contains("reason=\"insufficient_funds\""));
    }
}
