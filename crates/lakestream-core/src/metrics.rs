//! Prometheus metrics helpers for the lakestream pipeline.
//!
//! This module provides centralized metrics initialization and the metric
//! descriptions shared by the gateway and the stream job.
//!
//! # Usage
//!
//! ```rust,ignore
//! use lakestream_core::metrics::{init_metrics, start_metrics_server};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let handle = init_metrics()?;
//!     start_metrics_server(9091, handle).await?;
//!
//!     metrics::counter!("gateway_events_accepted_total").increment(1);
//!     Ok(())
//! }
//! ```
//!
//! # Metric Naming Conventions
//!
//! - Prefix: component (`gateway_`, `producer_`, `stream_`, `table_`, `checkpoint_`, `dedupe_`)
//! - Suffix: unit or type (`_total`, `_bytes`, `_seconds`)
//! - Labels: used sparingly (`reason`, `partition`)

use axum::{Router, routing::get};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

/// Initialize the Prometheus metrics recorder.
///
/// Must be called once at startup before any metrics are recorded. Fails if
/// a recorder is already installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    register_common_metrics();
    Ok(handle)
}

/// Like [`init_metrics`] but returns `None` if a recorder is already installed.
pub fn try_init_metrics() -> Option<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder().ok()?;
    register_common_metrics();
    Some(handle)
}

/// Start the Prometheus metrics HTTP server on `port`, serving `/metrics`.
///
/// The listener is bound before returning; serving runs on a background task.
pub async fn start_metrics_server(
    port: u16,
    handle: PrometheusHandle,
) -> Result<(), std::io::Error> {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Metrics server stopped: {}", e);
        }
    });

    Ok(())
}

/// Register descriptions for the pipeline's metrics.
fn register_common_metrics() {
    // =========================================================================
    // Ingestion Gateway
    // =========================================================================

    describe_counter!(
        "gateway_events_received_total",
        "Ingest calls received by the gateway"
    );
    describe_counter!(
        "gateway_events_accepted_total",
        "Events validated and handed to the producer"
    );
    describe_counter!(
        "gateway_events_rejected_total",
        "Events rejected at the gateway (label: reason)"
    );
    describe_counter!(
        "gateway_field_issues_total",
        "Soft field-level defects coerced during validation (label: field)"
    );

    // =========================================================================
    // Durable Log Producer
    // =========================================================================

    describe_counter!("producer_records_acked_total", "Records acknowledged by the log");
    describe_counter!(
        "producer_records_failed_total",
        "Records that exhausted their retry budget"
    );
    describe_counter!("producer_retries_total", "Publish attempts retried after a transient error");
    describe_histogram!(
        "producer_delivery_duration_seconds",
        "Time from publish to final delivery result"
    );

    // =========================================================================
    // Stream Transform Job
    // =========================================================================

    describe_counter!("stream_batches_committed_total", "Micro-batches committed");
    describe_counter!("stream_batches_aborted_total", "Micro-batches aborted before write");
    describe_counter!("stream_records_read_total", "Log records read");
    describe_counter!("stream_rows_written_total", "Valid rows written to the table");
    describe_counter!(
        "stream_rows_invalid_total",
        "Rows routed to the invalid-records sink (label: reason)"
    );
    describe_counter!("stream_rows_duplicate_total", "Rows skipped by the dedupe index");
    describe_histogram!("stream_batch_duration_seconds", "Wall time of one micro-batch cycle");
    describe_gauge!("stream_running", "Whether the stream job is running (1=yes, 0=no)");

    // =========================================================================
    // Table Sink
    // =========================================================================

    describe_counter!("table_commits_total", "Snapshots committed to the table");
    describe_counter!("table_commit_conflicts_total", "Optimistic commit conflicts");
    describe_counter!("table_data_files_written_total", "Parquet data files written");
    describe_counter!("table_bytes_written_total", "Parquet bytes written");
    describe_counter!("table_schema_evolutions_total", "Additive schema changes");

    // =========================================================================
    // Checkpoint & Dedupe
    // =========================================================================

    describe_gauge!("checkpoint_batch_id", "Last committed micro-batch id");
    describe_gauge!("dedupe_keys_approximate", "Approximate number of event IDs in the dedupe index");
}

// =============================================================================
// Metric Recording Helpers
// =============================================================================

/// Increment a counter.
#[inline]
pub fn increment(name: &'static str, count: u64) {
    metrics::counter!(name).increment(count);
}

/// Increment a counter carrying a `reason` label.
#[inline]
pub fn increment_with_reason(name: &'static str, reason: &'static str, count: u64) {
    metrics::counter!(name, "reason" => reason).increment(count);
}

/// Set a gauge value.
#[inline]
pub fn set_gauge(name: &'static str, value: f64) {
    metrics::gauge!(name).set(value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Once;

    static INIT: Once = Once::new();

    fn ensure_metrics_init() {
        INIT.call_once(|| {
            let _ = try_init_metrics();
        });
    }

    #[test]
    fn test_try_init_metrics_idempotent() {
        let handle1 = try_init_metrics();
        let handle2 = try_init_metrics();

        // At most one should succeed
        assert!(handle1.is_none() || handle2.is_none());
    }

    #[test]
    fn test_helpers_do_not_panic() {
        ensure_metrics_init();
        increment("test_counter", 0);
        increment("test_counter", 5);
        increment_with_reason("test_reason_counter", "invalid_event", 1);
        set_gauge("test_gauge", 42.5);
        set_gauge("test_gauge", -1.0);
    }

    #[test]
    fn test_register_common_metrics_does_not_panic() {
        ensure_metrics_init();
        register_common_metrics();
        register_common_metrics();
    }
}
