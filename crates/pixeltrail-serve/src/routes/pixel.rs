//! Tracking pixel endpoint.

use std::net::SocketAddr;

use axum::extract::rejection::QueryRejection;
use axum::extract::{ConnectInfo, Query, Request, State};
use axum::http::header;
use axum::response::IntoResponse;
use pixeltrail_core::metrics::{PIXEL_REQUESTS_TOTAL, increment};
use pixeltrail_core::{ConnectionInfo, PixelParams};

use crate::state::AppState;

/// 1×1 transparent GIF89a.
pub const TRANSPARENT_GIF: [u8; 43] = [
    0x47, 0x49, 0x46, 0x38, 0x39, 0x61, 0x01, 0x00, 0x01, 0x00, 0x80, 0x00, 0x00, 0x00, 0x00,
    0x00, 0xff, 0xff, 0xff, 0x21, 0xf9, 0x04, 0x01, 0x00, 0x00, 0x00, 0x00, 0x2c, 0x00, 0x00,
    0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x02, 0x02, 0x44, 0x01, 0x00, 0x3b,
];

/// `GET /p/o.gif`
///
/// Always answers with the pixel. Ingestion is handed to the blocking pool
/// and not awaited, so its outcome never reaches the client.
pub async fn open_pixel(
    State(state): State<AppState>,
    query: Result<Query<Vec<(String, String)>>, QueryRejection>,
    request: Request,
) -> impl IntoResponse {
    increment(PIXEL_REQUESTS_TOTAL);

    // Repeated keys resolve to their first value. A garbled query string
    // still gets the pixel; it just resolves no identity.
    let params = query
        .map(|Query(pairs)| PixelParams::from_pairs(pairs))
        .unwrap_or_default();

    let conn = ConnectionInfo {
        peer_ip: request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip()),
    };
    let signals = state.classifier.classify(request.headers(), &conn);

    // Detached: dropping the handle does not cancel the task.
    let _ = state.pipeline.spawn_track(params, signals);

    (
        [
            (header::CONTENT_TYPE, "image/gif"),
            (
                header::CACHE_CONTROL,
                "no-store, no-cache, must-revalidate, max-age=0",
            ),
            (header::PRAGMA, "no-cache"),
            (header::EXPIRES, "0"),
        ],
        TRANSPARENT_GIF.as_slice(),
    )
}
