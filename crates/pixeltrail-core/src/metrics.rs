//! Prometheus metrics helpers.
//!
//! Recording goes through the `metrics` facade everywhere; without an
//! installed recorder every call is a no-op, so the exporter is optional.
//!
//! # Usage
//!
//! ```rust,ignore
//! use pixeltrail_core::metrics::{init_metrics, start_metrics_server};
//!
//! let handle = init_metrics().expect("recorder not yet installed");
//! start_metrics_server(9091, handle).await?;
//! ```

use axum::{Router, routing::get};
use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

pub const PIXEL_REQUESTS_TOTAL: &str = "pixel_requests_total";
pub const OPEN_EVENTS_RECORDED_TOTAL: &str = "open_events_recorded_total";
pub const OPEN_ROLLUPS_UPSERTED_TOTAL: &str = "open_rollups_upserted_total";
pub const TOKEN_REJECTED_TOTAL: &str = "tracking_token_rejected_total";
pub const INGEST_FAILURES_TOTAL: &str = "ingest_failures_total";
pub const QUERY_ROWS: &str = "open_events_query_rows";

/// Install the Prometheus recorder and register metric descriptions.
///
/// Returns `None` if a recorder is already installed.
pub fn init_metrics() -> Option<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder().ok()?;
    register_metrics();
    Some(handle)
}

/// Serve `/metrics` on `port` from a background task.
///
/// The listener is bound before returning so address errors surface to the caller.
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
            tracing::error!(error = %e, "metrics server stopped");
        }
    });

    Ok(())
}

fn register_metrics() {
    describe_counter!(PIXEL_REQUESTS_TOTAL, "Pixel image requests served");
    describe_counter!(
        OPEN_EVENTS_RECORDED_TOTAL,
        "Open events appended to the event log"
    );
    describe_counter!(
        OPEN_ROLLUPS_UPSERTED_TOTAL,
        "Per-message rollup rows inserted or incremented"
    );
    describe_counter!(
        TOKEN_REJECTED_TOTAL,
        "Pixel hits dropped because the tracking token was rejected (label: reason)"
    );
    describe_counter!(
        INGEST_FAILURES_TOTAL,
        "Background ingestion tasks that failed on storage"
    );
    describe_histogram!(QUERY_ROWS, "Rows returned per open-events page");
}

/// Count a rejected token under its reason label.
pub fn record_token_rejected(reason: &'static str) {
    metrics::counter!(TOKEN_REJECTED_TOTAL, "reason" => reason).increment(1);
}

/// Increment a counter by one.
#[inline]
pub fn increment(name: &'static str) {
    metrics::counter!(name).increment(1);
}
