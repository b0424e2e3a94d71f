//! Open-event query endpoint.

use axum::Json;
use axum::extract::{Query, State};
use pixeltrail_ingest::{EventFilter, EventPage, PageRequest};
use serde::Deserialize;

use crate::error::ApiError;
use crate::state::AppState;

/// Raw query parameters. `limit` and `cursor` are validated by hand so bad
/// values map to `invalid_limit`/`invalid_cursor` instead of a rejection.
#[derive(Debug, Default, Deserialize)]
pub struct EventsParams {
    pub campaign_id: Option<String>,
    pub message_id: Option<String>,
    pub recipient_email: Option<String>,
    pub limit: Option<String>,
    pub cursor: Option<String>,
}

/// `GET /api/open-events`
pub async fn list_events(
    State(state): State<AppState>,
    Query(params): Query<EventsParams>,
) -> Result<Json<EventPage>, ApiError> {
    let page = PageRequest::parse(params.limit.as_deref(), params.cursor.as_deref())?;
    let filter = EventFilter::new(
        params.campaign_id.as_deref(),
        params.message_id.as_deref(),
        params.recipient_email.as_deref(),
    );

    let store = state.store.clone();
    let result = tokio::task::spawn_blocking(move || store.query_events(&filter, page))
        .await
        .map_err(|e| ApiError::Internal(e.into()))??;

    Ok(Json(result))
}
