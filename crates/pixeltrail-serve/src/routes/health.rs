//! Health check endpoint.

use axum::Json;
use chrono::{SecondsFormat, Utc};
use serde::Serialize;

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
    time: String,
}

/// Public health check endpoint.
///
/// Returns basic service health without authentication.
/// Use this for load balancer health probes.
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "pixeltrail",
        version: env!("CARGO_PKG_VERSION"),
        time: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    })
}
