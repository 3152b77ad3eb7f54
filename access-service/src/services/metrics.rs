//! Prometheus metrics for access-service.

use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec,
    IntCounterVec, TextEncoder,
};

/// Database query duration histogram
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "access_db_query_duration_seconds",
            "Database query duration"
        ),
        &["operation"]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Blocking request outcomes: changed, not_modified, timeout, error.
pub static BLOCKING_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "access_blocking_requests_total",
            "Long-poll requests by endpoint and outcome"
        ),
        &["endpoint", "outcome"]
    )
    .expect("Failed to register BLOCKING_REQUESTS_TOTAL")
});

/// Time from a destination credential request to its answer.
pub static DESTINATION_CREDENTIAL_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "access_destination_credential_duration_seconds",
            "Destination credential round trip",
            vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]
        ),
        &["outcome"]
    )
    .expect("Failed to register DESTINATION_CREDENTIAL_DURATION")
});

/// Rows removed by the maintenance worker.
pub static JOB_DELETIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "access_job_deletions_total",
            "Rows deleted by maintenance jobs"
        ),
        &["job"]
    )
    .expect("Failed to register JOB_DELETIONS_TOTAL")
});

/// Access key validations by result.
pub static ACCESS_KEY_VALIDATIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "access_key_validations_total",
            "Access key validations by result"
        ),
        &["result"]
    )
    .expect("Failed to register ACCESS_KEY_VALIDATIONS_TOTAL")
});

/// Initialize all metrics. Call once at startup.
pub fn init_metrics() {
    let _ = &*DB_QUERY_DURATION;
    let _ = &*BLOCKING_REQUESTS_TOTAL;
    let _ = &*DESTINATION_CREDENTIAL_DURATION;
    let _ = &*JOB_DELETIONS_TOTAL;
    let _ = &*ACCESS_KEY_VALIDATIONS_TOTAL;
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return format!("# Failed to encode metrics: {}\n", e);
    }
    String::from_utf8(buffer).unwrap_or_default()
}

pub fn record_blocking_request(endpoint: &str, outcome: &str) {
    BLOCKING_REQUESTS_TOTAL
        .with_label_values(&[endpoint, outcome])
        .inc();
}

pub fn record_job_deletions(job: &str, count: u64) {
    JOB_DELETIONS_TOTAL.with_label_values(&[job]).inc_by(count);
}

pub fn record_access_key_validation(result: &str) {
    ACCESS_KEY_VALIDATIONS_TOTAL
        .with_label_values(&[result])
        .inc();
}
