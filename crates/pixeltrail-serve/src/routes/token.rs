//! Tracking token issuance.

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use chrono::Utc;
use pixeltrail_core::{DEFAULT_TTL_SECS, TrackingPayload, normalize_email};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::ApiError;
use crate::state::AppState;

const REQUIRED_FIELDS: &[&str] = &["message_id", "campaign_id", "recipient_id"];

/// Issued token and the pixel URL that carries it.
#[derive(Debug, Serialize)]
pub struct IssuedToken {
    pub url: String,
    pub token: String,
    pub payload: TrackingPayload,
}

/// `POST /api/pixel-token`
///
/// Body: `{message_id, campaign_id, recipient_id, recipient_email?, ttl_seconds?}`.
pub async fn issue_token(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<IssuedToken>, ApiError> {
    if !state.codec.has_secret() {
        return Err(ApiError::ServerNotConfigured("PIXELTRAIL_SECRET"));
    }

    let body: Map<String, Value> =
        serde_json::from_slice(&body).map_err(|_| ApiError::InvalidJson)?;

    let message_id = text_field(&body, "message_id");
    let campaign_id = text_field(&body, "campaign_id");
    let recipient_id = text_field(&body, "recipient_id");
    if message_id.is_empty() || campaign_id.is_empty() || recipient_id.is_empty() {
        return Err(ApiError::MissingFields(REQUIRED_FIELDS));
    }

    let ttl = body
        .get("ttl_seconds")
        .and_then(Value::as_f64)
        .filter(|t| t.is_finite())
        .map(|t| t.floor() as i64)
        .unwrap_or(DEFAULT_TTL_SECS);

    let token_id = uuid::Uuid::new_v4().to_string();
    let mut payload = TrackingPayload::new(
        message_id,
        campaign_id,
        recipient_id,
        token_id,
        Utc::now().timestamp(),
        ttl,
    );
    if let Some(email) = normalize_email(&text_field(&body, "recipient_email")) {
        payload = payload.with_recipient_email(email);
    }

    let token = state
        .codec
        .issue(&payload)
        .map_err(|e| ApiError::Internal(e.into()))?;
    let url = format!("{}/p/o.gif?t={token}", public_base(&state, &headers));

    tracing::info!(
        message_id = %payload.message_id,
        campaign_id = %payload.campaign_id,
        token_id = %payload.token_id,
        exp = ?payload.expires_at,
        "tracking token issued"
    );

    Ok(Json(IssuedToken {
        url,
        token,
        payload,
    }))
}

/// Trimmed string form of a body field. Numbers are accepted as their text.
fn text_field(body: &Map<String, Value>, name: &str) -> String {
    match body.get(name) {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

/// Configured base URL, else the scheme and host the request arrived on.
fn public_base(state: &AppState, headers: &HeaderMap) -> String {
    if let Some(base) = &state.config.base_url {
        return base.clone();
    }

    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };
    let proto = header("x-forwarded-proto")
        .and_then(|p| p.split(',').next())
        .map(str::trim)
        .unwrap_or("http");
    let host = header("x-forwarded-host")
        .or_else(|| header("host"))
        .unwrap_or("localhost");
    format!("{proto}://{host}")
}
