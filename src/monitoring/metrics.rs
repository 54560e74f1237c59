// src/monitoring/metrics.rs - Prometheus counters for the proxy hot path
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub const REQUESTS_TOTAL: &str = "proxy_requests_total";
pub const RATE_LIMITED_TOTAL: &str = "proxy_rate_limited_total";
pub const REJECTED_TOTAL: &str = "proxy_rejected_total";
pub const ERRORS_TOTAL: &str = "proxy_errors_total";
pub const REQUEST_LATENCY_SECONDS: &str = "proxy_request_latency_seconds";
pub const ACTIVE_CONNECTIONS: &str = "proxy_active_connections";

/// Install the global Prometheus recorder and return the render handle.
/// Call once at startup, before the first connection.
pub fn install() -> anyhow::Result<PrometheusHandle> {
    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();
    metrics::set_global_recorder(recorder)
        .map_err(|e| anyhow::anyhow!("failed to install metrics recorder: {e}"))?;

    describe_counter!(REQUESTS_TOTAL, "Total number of requests received");
    describe_counter!(RATE_LIMITED_TOTAL, "Total number of rate-limited requests");
    describe_counter!(
        REJECTED_TOTAL,
        "Total number of connections rejected by predicates or capacity limits"
    );
    describe_counter!(ERRORS_TOTAL, "Total number of errors encountered");
    describe_histogram!(REQUEST_LATENCY_SECONDS, "Histogram of request latency");
    describe_gauge!(ACTIVE_CONNECTIONS, "Current number of active connections");

    Ok(handle)
}

pub fn increment_request_counter() {
    counter!(REQUESTS_TOTAL).increment(1);
}

pub fn increment_rate_limited_counter() {
    counter!(RATE_LIMITED_TOTAL).increment(1);
}

pub fn increment_rejected_counter() {
    counter!(REJECTED_TOTAL).increment(1);
}

pub fn increment_error_counter() {
    counter!(ERRORS_TOTAL).increment(1);
}

pub fn observe_request_latency(seconds: f64) {
    histogram!(REQUEST_LATENCY_SECONDS).record(seconds);
}

pub fn connection_opened() {
    gauge!(ACTIVE_CONNECTIONS).increment(1.0);
}

pub fn connection_closed() {
    gauge!(ACTIVE_CONNECTIONS).decrement(1.0);
}
