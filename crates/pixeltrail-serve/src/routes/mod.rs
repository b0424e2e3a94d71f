//! API route definitions.

mod events;
mod health;
mod pixel;
mod token;

use axum::Router;
use axum::http::{HeaderValue, header};
use axum::middleware;
use axum::response::Response;
use axum::routing::{get, post};

use crate::auth::require_auth;
use crate::state::AppState;

pub use pixel::TRANSPARENT_GIF;

/// Build the complete API router.
///
/// # Route Structure
///
/// ## Public (no auth)
/// - `GET /p/o.gif` - Tracking pixel
/// - `GET /api/health` - Health check
///
/// ## Protected (auth required)
/// - `POST /api/pixel-token` - Issue a signed tracking token
/// - `GET /api/open-events` - Paginated open events
pub fn router(state: AppState) -> Router {
    // Public routes (no authentication)
    let public = Router::new()
        .route("/p/o.gif", get(pixel::open_pixel))
        .route("/api/health", get(health::health_check));

    // Protected API routes
    let api = Router::new()
        .route("/api/pixel-token", post(token::issue_token))
        .route("/api/open-events", get(events::list_events))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .layer(middleware::map_response(no_store));

    Router::new().merge(public).merge(api).with_state(state)
}

/// Mark API responses uncacheable; they carry tokens and recipient data.
async fn no_store(mut response: Response) -> Response {
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Config;
    use axum::body::{Body, to_bytes};
    use axum::extract::ConnectInfo;
    use axum::http::{Request, StatusCode};
    use pixeltrail_core::{TokenCodec, TrackingPayload};
    use pixeltrail_ingest::EventStore;
    use serde_json::{Value, json};
    use std::net::SocketAddr;
    use tower::ServiceExt;

    const SECRET: &str = "router-secret";
    const API_TOKEN: &str = "api-token";

    fn state_with(config: Config) -> AppState {
        AppState::with_store(config, EventStore::open_in_memory().unwrap())
    }

    fn configured() -> AppState {
        state_with(Config {
            secret: Some(SECRET.to_string()),
            api_token: Some(API_TOKEN.to_string()),
            ..Config::default()
        })
    }

    fn authed(method: &str, uri: &str, body: Body) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("authorization", format!("Bearer {API_TOKEN}"))
            .header("host", "track.example.com")
            .body(body)
            .unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    /// Poll until background ingestion has written `n` events.
    async fn wait_for_events(state: &AppState, n: usize) -> Vec<pixeltrail_ingest::OpenEvent> {
        for _ in 0..200 {
            let page = state
                .store
                .query_events(&Default::default(), Default::default())
                .unwrap();
            if page.events.len() >= n {
                return page.events;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("background ingestion did not record {n} events");
    }

    #[tokio::test]
    async fn test_health_is_public() {
        let response = router(state_with(Config::default()))
            .oneshot(Request::get("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["service"], "pixeltrail");
        assert!(body["time"].is_string());
    }

    #[tokio::test]
    async fn test_pixel_always_returns_gif() {
        let app = router(configured());
        for uri in ["/p/o.gif", "/p/o.gif?t=garbage.token.here", "/p/o.gif?m=a&m=b"] {
            let response = app
                .clone()
                .oneshot(Request::get(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK, "{uri}");
            assert_eq!(response.headers()[header::CONTENT_TYPE], "image/gif");
            assert_eq!(
                response.headers()[header::CACHE_CONTROL],
                "no-store, no-cache, must-revalidate, max-age=0"
            );
            assert_eq!(response.headers()[header::PRAGMA], "no-cache");
            assert_eq!(response.headers()[header::EXPIRES], "0");
            let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
            assert_eq!(&bytes[..], &TRANSPARENT_GIF[..]);
        }
    }

    #[tokio::test]
    async fn test_pixel_records_signed_open() {
        let state = configured();
        let payload = TrackingPayload::new(
            "msg1",
            "camp1",
            "rec1",
            "tid-1",
            chrono::Utc::now().timestamp(),
            3600,
        );
        let token = TokenCodec::new(Some(SECRET)).issue(&payload).unwrap();

        let mut request = Request::get(format!("/p/o.gif?t={token}"))
            .header("user-agent", "Mozilla/5.0 via ggpht.com GoogleImageProxy")
            .header("cf-ipcountry", "DE")
            .header("cf-ray", "8a1b2c3d4e5f-FRA")
            .body(Body::empty())
            .unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([203, 0, 113, 7], 40000))));

        let response = router(state.clone()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let events = wait_for_events(&state, 1).await;
        let e = &events[0];
        assert_eq!(e.message_id.as_deref(), Some("msg1"));
        assert_eq!(e.token_id.as_deref(), Some("tid-1"));
        assert_eq!(e.country.as_deref(), Some("DE"));
        assert_eq!(e.colo.as_deref(), Some("FRA"));
        assert_eq!(e.is_prefetch, 1);
        assert_eq!(
            e.ip_hash.as_deref(),
            Some(state.classifier.hash_ip("203.0.113.7").as_str())
        );
    }

    #[tokio::test]
    async fn test_pixel_repeated_token_uses_first_value() {
        let state = configured();
        let payload = TrackingPayload::new(
            "msg-dup",
            "camp1",
            "rec1",
            "tid-dup",
            chrono::Utc::now().timestamp(),
            3600,
        );
        let token = TokenCodec::new(Some(SECRET)).issue(&payload).unwrap();

        let response = router(state.clone())
            .oneshot(
                Request::get(format!("/p/o.gif?t={token}&t={token}&m=ignored&m=again"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let events = wait_for_events(&state, 1).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message_id.as_deref(), Some("msg-dup"));
        assert_eq!(events[0].token_id.as_deref(), Some("tid-dup"));

        // The rollup is written just after the event row.
        let mut rollup = None;
        for _ in 0..200 {
            rollup = state.store.rollup("msg-dup").unwrap();
            if rollup.is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(rollup.unwrap().open_count, 1);
    }

    #[tokio::test]
    async fn test_protected_routes_require_bearer() {
        let app = router(configured());
        for auth in [None, Some("Bearer wrong"), Some("Basic abc")] {
            let mut builder = Request::get("/api/open-events");
            if let Some(auth) = auth {
                builder = builder.header("authorization", auth);
            }
            let response = app
                .clone()
                .oneshot(builder.body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{auth:?}");
            assert_eq!(response.headers()[header::WWW_AUTHENTICATE], "Bearer");
            assert_eq!(json_body(response).await["error"], "unauthorized");
        }
    }

    #[tokio::test]
    async fn test_missing_api_token_is_not_configured() {
        let response = router(state_with(Config::default()))
            .oneshot(authed("GET", "/api/open-events", Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json_body(response).await["error"], "server_not_configured");
    }

    #[tokio::test]
    async fn test_issue_token_without_secret() {
        let state = state_with(Config {
            api_token: Some(API_TOKEN.to_string()),
            ..Config::default()
        });
        let body = json!({"message_id": "m", "campaign_id": "c", "recipient_id": "r"});
        let response = router(state)
            .oneshot(authed("POST", "/api/pixel-token", Body::from(body.to_string())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json_body(response).await["error"], "server_not_configured");
    }

    #[tokio::test]
    async fn test_issue_token() {
        let state = configured();
        let body = json!({
            "message_id": " msg1 ",
            "campaign_id": "camp1",
            "recipient_id": 42,
            "recipient_email": "Reader@Example.com",
            "ttl_seconds": 10,
        });
        let response = router(state.clone())
            .oneshot(authed("POST", "/api/pixel-token", Body::from(body.to_string())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CACHE_CONTROL], "no-store");

        let body = json_body(response).await;
        let token = body["token"].as_str().unwrap();
        assert_eq!(
            body["url"].as_str().unwrap(),
            format!("http://track.example.com/p/o.gif?t={token}")
        );
        assert_eq!(body["payload"]["m"], "msg1");
        assert_eq!(body["payload"]["r"], "42");
        assert_eq!(body["payload"]["re"], "reader@example.com");
        let iat = body["payload"]["iat"].as_i64().unwrap();
        assert_eq!(body["payload"]["exp"].as_i64().unwrap(), iat + 60);

        let decoded = state.codec.decode(token).unwrap();
        assert_eq!(decoded.message_id, "msg1");
        assert_eq!(decoded.token_id, body["payload"]["tid"].as_str().unwrap());
    }

    #[tokio::test]
    async fn test_issue_token_uses_configured_base_url() {
        let state = state_with(Config {
            secret: Some(SECRET.to_string()),
            api_token: Some(API_TOKEN.to_string()),
            base_url: Some("https://px.example.org".to_string()),
            ..Config::default()
        });
        let body = json!({"message_id": "m", "campaign_id": "c", "recipient_id": "r"});
        let response = router(state)
            .oneshot(authed("POST", "/api/pixel-token", Body::from(body.to_string())))
            .await
            .unwrap();
        let body = json_body(response).await;
        assert!(body["url"].as_str().unwrap().starts_with("https://px.example.org/p/o.gif?t="));
        let exp = body["payload"]["exp"].as_i64().unwrap();
        let iat = body["payload"]["iat"].as_i64().unwrap();
        assert_eq!(exp - iat, pixeltrail_core::DEFAULT_TTL_SECS);
    }

    #[tokio::test]
    async fn test_issue_token_validation() {
        let app = router(configured());

        let response = app
            .clone()
            .oneshot(authed("POST", "/api/pixel-token", Body::from("{not json")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"], "invalid_json");

        let body = json!({"message_id": "m", "campaign_id": "  ", "recipient_id": "r"});
        let response = app
            .oneshot(authed("POST", "/api/pixel-token", Body::from(body.to_string())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["error"], "missing_fields");
        assert_eq!(body["required"], json!(["message_id", "campaign_id", "recipient_id"]));
    }

    #[tokio::test]
    async fn test_open_events_pagination() {
        let state = configured();
        for i in 0..3 {
            let params = pixeltrail_core::PixelParams {
                m: Some(format!("m{i}")),
                c: Some("camp".to_string()),
                ..Default::default()
            };
            state
                .pipeline
                .track(&params, &Default::default(), chrono::Utc::now())
                .unwrap();
        }

        let app = router(state);
        let response = app
            .clone()
            .oneshot(authed("GET", "/api/open-events?campaign_id=camp&limit=2", Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["events"].as_array().unwrap().len(), 2);
        assert_eq!(body["next_cursor"], "2");

        let response = app
            .oneshot(authed(
                "GET",
                "/api/open-events?campaign_id=camp&limit=2&cursor=2",
                Body::empty(),
            ))
            .await
            .unwrap();
        let body = json_body(response).await;
        assert_eq!(body["events"].as_array().unwrap().len(), 1);
        assert!(body["next_cursor"].is_null());
    }

    #[tokio::test]
    async fn test_open_events_rejects_bad_paging() {
        let app = router(configured());
        for (uri, code) in [
            ("/api/open-events?limit=0", "invalid_limit"),
            ("/api/open-events?limit=abc", "invalid_limit"),
            ("/api/open-events?cursor=-5", "invalid_cursor"),
        ] {
            let response = app
                .clone()
                .oneshot(authed("GET", uri, Body::empty()))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{uri}");
            assert_eq!(json_body(response).await["error"], code);
        }
    }
}
