//! API error types and response formatting.

use axum::Json;
use axum::http::header::WWW_AUTHENTICATE;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// API error type that converts to appropriate HTTP responses.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Missing or wrong bearer token.
    #[error("unauthorized")]
    Unauthorized,

    /// A secret the endpoint depends on is not configured.
    #[error("server not configured: {0}")]
    ServerNotConfigured(&'static str),

    /// Required body fields were absent or blank.
    #[error("missing fields")]
    MissingFields(&'static [&'static str]),

    /// Request body was not a JSON object.
    #[error("invalid json")]
    InvalidJson,

    /// `limit` was not a positive integer.
    #[error("invalid limit")]
    InvalidLimit,

    /// `cursor` was not a non-negative integer.
    #[error("invalid cursor")]
    InvalidCursor,

    /// Internal server error (database, task join, etc.).
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<pixeltrail_ingest::Error> for ApiError {
    fn from(err: pixeltrail_ingest::Error) -> Self {
        match err {
            pixeltrail_ingest::Error::InvalidLimit(_) => Self::InvalidLimit,
            pixeltrail_ingest::Error::InvalidCursor(_) => Self::InvalidCursor,
            other => Self::Internal(other.into()),
        }
    }
}

/// JSON error response body.
#[derive(Debug, Clone, Serialize)]
struct ErrorResponse {
    error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    required: Option<&'static [&'static str]>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match &self {
            Self::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized"),
            Self::ServerNotConfigured(what) => {
                tracing::error!(missing = what, "endpoint called without required configuration");
                (StatusCode::INTERNAL_SERVER_ERROR, "server_not_configured")
            }
            Self::MissingFields(_) => (StatusCode::BAD_REQUEST, "missing_fields"),
            Self::InvalidJson => (StatusCode::BAD_REQUEST, "invalid_json"),
            Self::InvalidLimit => (StatusCode::BAD_REQUEST, "invalid_limit"),
            Self::InvalidCursor => (StatusCode::BAD_REQUEST, "invalid_cursor"),
            Self::Internal(err) => {
                tracing::error!(error = %err, "internal server error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
            }
        };

        let required = match self {
            Self::MissingFields(fields) => Some(fields),
            _ => None,
        };

        let mut response = (status, Json(ErrorResponse { error, required })).into_response();
        if status == StatusCode::UNAUTHORIZED {
            response
                .headers_mut()
                .insert(WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        }
        response
    }
}
