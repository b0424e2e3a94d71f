//! Bearer token authentication middleware.

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;
use subtle::ConstantTimeEq;

use crate::error::ApiError;
use crate::state::AppState;

/// Middleware that requires the configured Bearer token.
///
/// The token must be provided in the `Authorization` header as:
/// ```text
/// Authorization: Bearer <token>
/// ```
///
/// When `PIXELTRAIL_API_TOKEN` is unset every request is refused with
/// `server_not_configured` rather than let through.
pub async fn require_auth(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(expected) = state.config.api_token.as_deref() else {
        return Err(ApiError::ServerNotConfigured("PIXELTRAIL_API_TOKEN"));
    };

    let auth_header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok());

    let token = match auth_header.and_then(|h| h.strip_prefix("Bearer ")) {
        Some(token) => token.trim(),
        None => {
            tracing::debug!("missing or malformed authorization header");
            return Err(ApiError::Unauthorized);
        }
    };

    if !bool::from(token.as_bytes().ct_eq(expected.as_bytes())) {
        tracing::debug!("invalid api token");
        return Err(ApiError::Unauthorized);
    }

    Ok(next.run(request).await)
}
