//! Prometheus metrics for connector-service.

use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec,
    IntCounterVec, TextEncoder,
};

/// Sync passes by loop and outcome: changed, not_modified, error.
pub static SYNC_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("connector_sync_total", "Sync passes by loop and outcome"),
        &["loop", "outcome"]
    )
    .expect("Failed to register SYNC_TOTAL")
});

/// Destination credential requests answered, by outcome.
pub static CREDENTIALS_ANSWERED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "connector_credentials_answered_total",
            "Destination credential requests handled"
        ),
        &["outcome"]
    )
    .expect("Failed to register CREDENTIALS_ANSWERED_TOTAL")
});

/// Proxied Kubernetes API requests.
pub static PROXY_REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "connector_proxy_request_duration_seconds",
            "Impersonating proxy request duration"
        ),
        &["method", "status"]
    )
    .expect("Failed to register PROXY_REQUEST_DURATION")
});

pub fn init_metrics() {
    let _ = &*SYNC_TOTAL;
    let _ = &*CREDENTIALS_ANSWERED_TOTAL;
    let _ = &*PROXY_REQUEST_DURATION;
}

pub fn record_sync(loop_name: &str, outcome: &str) {
    SYNC_TOTAL.with_label_values(&[loop_name, outcome]).inc();
}

pub fn record_credential(outcome: &str) {
    CREDENTIALS_ANSWERED_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn observe_proxy_request(method: &str, status: u16, seconds: f64) {
    PROXY_REQUEST_DURATION
        .with_label_values(&[method, &status.to_string()])
        .observe(seconds);
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recorded_sync_shows_up_in_output() {
        init_metrics();
        record_sync("grants", "not_modified");
        assert!(get_metrics().contains("connector_sync_total"));
    }
}
