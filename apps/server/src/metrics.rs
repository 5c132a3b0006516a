//! Metrics collection for the request service
//!
//! Prometheus metrics registered in the default registry and exposed on `/metrics`.

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge, register_int_gauge_vec,
    HistogramVec, IntCounterVec, IntGauge, IntGaugeVec,
};

lazy_static! {
    // HTTP Request Metrics

    /// Total HTTP requests by method, path, and status
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "hemocalc_http_requests_total",
        "Total number of HTTP requests",
        &["method", "path", "status"]
    )
    .expect("Failed to register HTTP_REQUESTS_TOTAL");

    /// HTTP request duration in seconds
    pub static ref HTTP_REQUEST_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "hemocalc_http_request_duration_seconds",
        "HTTP request duration in seconds",
        &["method", "path"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .expect("Failed to register HTTP_REQUEST_DURATION_SECONDS");

    /// In-flight HTTP requests
    pub static ref HTTP_REQUESTS_IN_FLIGHT: IntGaugeVec = register_int_gauge_vec!(
        "hemocalc_http_requests_in_flight",
        "Number of HTTP requests currently being processed",
        &["method", "path"]
    )
    .expect("Failed to register HTTP_REQUESTS_IN_FLIGHT");

    /// HTTP response size in bytes
    pub static ref HTTP_RESPONSE_SIZE_BYTES: HistogramVec = register_histogram_vec!(
        "hemocalc_http_response_size_bytes",
        "HTTP response size in bytes",
        &["method", "path", "status"],
        vec![100.0, 1_000.0, 10_000.0, 100_000.0, 1_000_000.0]
    )
    .expect("Failed to register HTTP_RESPONSE_SIZE_BYTES");

    // Lifecycle Metrics

    /// Successful request status transitions
    pub static ref LIFECYCLE_TRANSITIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "hemocalc_lifecycle_transitions_total",
        "Total number of request status transitions",
        &["from", "to"]
    )
    .expect("Failed to register LIFECYCLE_TRANSITIONS_TOTAL");

    /// Lifecycle operations by outcome (`ok` or the error kind)
    pub static ref LIFECYCLE_OPERATIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "hemocalc_lifecycle_operations_total",
        "Total number of lifecycle operations",
        &["operation", "outcome"]
    )
    .expect("Failed to register LIFECYCLE_OPERATIONS_TOTAL");

    /// Lifecycle operation duration
    pub static ref LIFECYCLE_OPERATION_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "hemocalc_lifecycle_operation_duration_seconds",
        "Lifecycle operation duration in seconds",
        &["operation"],
        vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0]
    )
    .expect("Failed to register LIFECYCLE_OPERATION_DURATION_SECONDS");

    /// Where completed item totals came from
    pub static ref ESTIMATE_SOURCES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "hemocalc_estimate_sources_total",
        "Completed items by blood-loss source",
        &["source"]
    )
    .expect("Failed to register ESTIMATE_SOURCES_TOTAL");

    // Database Metrics

    /// Retries of transient store failures
    pub static ref STORE_RETRIES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "hemocalc_store_retries_total",
        "Total number of retried store calls",
        &["operation"]
    )
    .expect("Failed to register STORE_RETRIES_TOTAL");

    /// Active database connections
    pub static ref DB_CONNECTIONS_ACTIVE: IntGauge = register_int_gauge!(
        "hemocalc_db_connections_active",
        "Number of active database connections"
    )
    .expect("Failed to register DB_CONNECTIONS_ACTIVE");

    /// Idle database connections
    pub static ref DB_CONNECTIONS_IDLE: IntGauge = register_int_gauge!(
        "hemocalc_db_connections_idle",
        "Number of idle database connections"
    )
    .expect("Failed to register DB_CONNECTIONS_IDLE");
}

pub fn record_transition(from: &str, to: &str) {
    LIFECYCLE_TRANSITIONS_TOTAL
        .with_label_values(&[from, to])
        .inc();
}

pub fn record_operation(operation: &str, outcome: &str, seconds: f64) {
    LIFECYCLE_OPERATIONS_TOTAL
        .with_label_values(&[operation, outcome])
        .inc();
    LIFECYCLE_OPERATION_DURATION_SECONDS
        .with_label_values(&[operation])
        .observe(seconds);
}

pub fn record_estimate_source(source: &str) {
    ESTIMATE_SOURCES_TOTAL.with_label_values(&[source]).inc();
}

pub fn record_store_retry(operation: &str) {
    STORE_RETRIES_TOTAL.with_label_values(&[operation]).inc();
}

/// Refresh the connection pool gauges.
pub fn update_pool_metrics(pool: &sqlx::PgPool) {
    let size = pool.size() as i64;
    let idle = pool.num_idle() as i64;
    DB_CONNECTIONS_ACTIVE.set(size - idle);
    DB_CONNECTIONS_IDLE.set(idle);
}

/// Sanitize path to reduce cardinality.
///
/// Numeric segments become `{id}`:
/// `/api/requests/12/items/3` → `/api/requests/{id}/items/{id}`
pub fn sanitize_path(path: &str) -> String {
    let segments: Vec<&str> = path
        .split('/')
        .filter(|s| !s.is_empty())
        .map(|s| {
            if s.chars().all(|c| c.is_ascii_digit()) {
                "{id}"
            } else {
                s
            }
        })
        .collect();

    if segments.is_empty() {
        return "/".to_string();
    }
    format!("/{}", segments.join("/"))
}
