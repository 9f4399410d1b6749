//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define gatekeeper metrics (rejections, delays, breaker transitions)
//! - Expose a Prometheus-compatible scrape endpoint
//!
//! # Metrics
//! - `gatekeeper_requests_total` (counter): admitted requests by status
//! - `gatekeeper_rate_limited_total` (counter): rate limit rejections by scope
//! - `gatekeeper_quota_rejected_total` (counter): quota rejections by period
//! - `gatekeeper_throttle_delay_ms` (histogram): applied throttle delays
//! - `gatekeeper_store_errors_total` (counter): counter store failures by caller
//! - `gatekeeper_breaker_transitions_total` (counter): transitions by resource and state
//! - `gatekeeper_resource_calls_total` (counter): coordinator outcomes by resource
//!
//! # Design Decisions
//! - Label values are small closed sets, except resource names which come from config

use std::net::SocketAddr;
use std::sync::OnceLock;

use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::resilience::CircuitState;

static INSTALLED: OnceLock<()> = OnceLock::new();

/// Install the Prometheus recorder and its HTTP listener. Later calls are ignored.
pub fn init_metrics(addr: SocketAddr) {
    INSTALLED.get_or_init(|| {
        match PrometheusBuilder::new().with_http_listener(addr).install() {
            Ok(()) => {
                describe_all();
                tracing::info!(address = %addr, "Metrics endpoint listening");
            }
            Err(e) => {
                tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter");
            }
        }
    });
}

fn describe_all() {
    describe_counter!("gatekeeper_requests_total", "Requests that passed admission");
    describe_counter!(
        "gatekeeper_rate_limited_total",
        "Requests rejected by the fixed-window rate limiter"
    );
    describe_counter!(
        "gatekeeper_quota_rejected_total",
        "Requests rejected because a daily or monthly quota was exhausted"
    );
    describe_histogram!(
        "gatekeeper_throttle_delay_ms",
        "Delay applied to admitted requests near their quota"
    );
    describe_counter!(
        "gatekeeper_store_errors_total",
        "Counter store failures (requests were admitted)"
    );
    describe_counter!(
        "gatekeeper_breaker_transitions_total",
        "Circuit breaker state transitions"
    );
    describe_counter!(
        "gatekeeper_resource_calls_total",
        "Coordinated resource calls by outcome"
    );
}

pub fn record_request(status: u16) {
    counter!("gatekeeper_requests_total", "status" => status.to_string()).increment(1);
}

/// `scope` is "ip" or "credential".
pub fn record_rate_limited(scope: &'static str) {
    counter!("gatekeeper_rate_limited_total", "scope" => scope).increment(1);
}

/// `period` is "daily" or "monthly".
pub fn record_quota_rejected(period: &'static str) {
    counter!("gatekeeper_quota_rejected_total", "period" => period).increment(1);
}

pub fn record_throttle_delay(delay_ms: u64) {
    histogram!("gatekeeper_throttle_delay_ms").record(delay_ms as f64);
}

pub fn record_store_error(caller: &'static str) {
    counter!("gatekeeper_store_errors_total", "caller" => caller).increment(1);
}

pub fn record_breaker_transition(resource: &str, to: CircuitState) {
    counter!(
        "gatekeeper_breaker_transitions_total",
        "resource" => resource.to_string(),
        "to" => to.as_str()
    )
    .increment(1);
}

/// `outcome` is "success", "failure", "timeout", "circuit_open" or "shutting_down".
pub fn record_resource_call(resource: &str, outcome: &'static str) {
    counter!(
        "gatekeeper_resource_calls_total",
        "resource" => resource.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}
