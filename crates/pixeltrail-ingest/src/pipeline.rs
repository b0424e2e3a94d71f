//! Open-event ingestion.
//!
//! ```text
//! PixelParams ──▶ identity::resolve ──▶ insert OpenEvent ──▶ upsert OpenRollup
//!                       │                                   (message_id only)
//!                       └── token rejected: nothing recorded, logged
//! ```
//!
//! Ingestion runs after the pixel has been returned. [`Pipeline::spawn_track`]
//! hands the work to tokio's blocking pool and forgets it: failures are logged
//! and counted, never reported back to the request.

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use pixeltrail_core::metrics::{
    INGEST_FAILURES_TOTAL, OPEN_EVENTS_RECORDED_TOTAL, OPEN_ROLLUPS_UPSERTED_TOTAL, increment,
    record_token_rejected,
};
use pixeltrail_core::{Identity, PixelParams, Signals, TokenCodec, TokenError, truncate_chars};

use crate::Result;
use crate::store::{EventStore, OpenEvent};

/// Longest raw token stored as a fallback correlation id.
pub const MAX_RAW_TOKEN_LEN: usize = 512;

/// What happened to one pixel hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackOutcome {
    /// The token was rejected; nothing was written.
    Rejected(TokenError),
    /// An event row was written.
    Recorded {
        /// Row id of the new event.
        event_id: i64,
        /// Whether the per-message rollup was touched.
        rollup_updated: bool,
    },
}

/// Writes open events and rollups.
///
/// Holds no per-request state; share one behind an `Arc`.
pub struct Pipeline {
    store: Arc<EventStore>,
    codec: TokenCodec,
}

impl Pipeline {
    pub fn new(store: Arc<EventStore>, codec: TokenCodec) -> Self {
        Self { store, codec }
    }

    pub fn store(&self) -> &Arc<EventStore> {
        &self.store
    }

    /// Resolve the hit's identity and record it.
    ///
    /// A rejected token is an outcome, not an error: only storage failures
    /// return `Err`.
    pub fn track(
        &self,
        params: &PixelParams,
        signals: &Signals,
        now: DateTime<Utc>,
    ) -> Result<TrackOutcome> {
        let identity = match pixeltrail_core::resolve_at(params, &self.codec, now.timestamp()) {
            Ok(identity) => identity,
            Err(err) => {
                tracing::warn!(reason = err.reason(), error = %err, "tracking token rejected");
                record_token_rejected(err.reason());
                return Ok(TrackOutcome::Rejected(err));
            }
        };

        let raw_token = params
            .token()
            .map(|t| truncate_chars(t, MAX_RAW_TOKEN_LEN));
        self.ingest(&identity, signals, raw_token, now)
    }

    /// Record an already-resolved identity.
    ///
    /// The event row is always written, even without a message id, so partial
    /// links leave evidence. The rollup is only touched when a message id is
    /// present.
    pub fn ingest(
        &self,
        identity: &Identity,
        signals: &Signals,
        raw_token: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<TrackOutcome> {
        let event = OpenEvent {
            message_id: identity.message_id.clone(),
            campaign_id: identity.campaign_id.clone(),
            recipient_id: identity.recipient_id.clone(),
            recipient_email: identity.recipient_email.clone(),
            token_id: identity.token_id.clone().or(raw_token),
            opened_at: now.to_rfc3339_opts(SecondsFormat::Millis, true),
            user_agent: signals.user_agent.clone(),
            ip_hash: signals.ip_hash.clone(),
            country: signals.country.clone(),
            colo: signals.colo.clone(),
            ray_id: signals.ray_id.clone(),
            is_prefetch: u8::from(signals.is_prefetch),
        };

        let event_id = self.store.insert_event(&event)?;
        increment(OPEN_EVENTS_RECORDED_TOTAL);

        let rollup_updated = self.store.upsert_rollup(&event)?;
        if rollup_updated {
            increment(OPEN_ROLLUPS_UPSERTED_TOTAL);
        }

        tracing::debug!(
            event_id,
            message_id = event.message_id.as_deref().unwrap_or(""),
            token_id = event.token_id.as_deref().unwrap_or(""),
            is_prefetch = signals.is_prefetch,
            "open recorded"
        );

        Ok(TrackOutcome::Recorded {
            event_id,
            rollup_updated,
        })
    }

    /// Track a hit on the blocking pool without waiting for it.
    ///
    /// The returned handle may be dropped; the task still runs to completion.
    /// Errors are logged and counted, never propagated.
    pub fn spawn_track(
        self: &Arc<Self>,
        params: PixelParams,
        signals: Signals,
    ) -> tokio::task::JoinHandle<()> {
        let pipeline = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            if let Err(err) = pipeline.track(&params, &signals, Utc::now()) {
                tracing::error!(error = %err, "open ingestion failed");
                increment(INGEST_FAILURES_TOTAL);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{EventFilter, PageRequest};
    use crate::store::tests::legacy_store;
    use chrono::TimeZone;
    use pixeltrail_core::TrackingPayload;
    use std::thread;

    const SECRET: &str = "pipeline-secret";

    fn pipeline() -> Pipeline {
        Pipeline::new(
            Arc::new(EventStore::open_in_memory().unwrap()),
            TokenCodec::new(Some(SECRET)),
        )
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn token_params(payload: &TrackingPayload) -> PixelParams {
        PixelParams {
            t: Some(TokenCodec::new(Some(SECRET)).issue(payload).unwrap()),
            ..Default::default()
        }
    }

    fn signals() -> Signals {
        Signals {
            user_agent: "Mozilla/5.0".to_string(),
            ip_hash: Some("hash".to_string()),
            ..Default::default()
        }
    }

    fn all_events(p: &Pipeline) -> Vec<OpenEvent> {
        p.store()
            .query_events(&EventFilter::default(), PageRequest { limit: 500, offset: 0 })
            .unwrap()
            .events
    }

    #[test]
    fn test_signed_token_records_event_and_rollup() {
        let p = pipeline();
        let payload = TrackingPayload::new("msg1", "camp1", "rec1", "tid-1", 1_700_000_000, 3600)
            .with_recipient_email("reader@example.com");

        let outcome = p.track(&token_params(&payload), &signals(), at(1_700_000_100)).unwrap();
        assert!(matches!(
            outcome,
            TrackOutcome::Recorded {
                rollup_updated: true,
                ..
            }
        ));

        let events = all_events(&p);
        assert_eq!(events.len(), 1);
        let e = &events[0];
        assert_eq!(e.message_id.as_deref(), Some("msg1"));
        assert_eq!(e.campaign_id.as_deref(), Some("camp1"));
        assert_eq!(e.recipient_email.as_deref(), Some("reader@example.com"));
        assert_eq!(e.token_id.as_deref(), Some("tid-1"));
        assert_eq!(e.opened_at, "2023-11-14T22:15:00.000Z");
        assert_eq!(e.is_prefetch, 0);

        let rollup = p.store().rollup("msg1").unwrap().unwrap();
        assert_eq!(rollup.open_count, 1);
        assert_eq!(rollup.last_ip_hash.as_deref(), Some("hash"));
    }

    #[test]
    fn test_rejected_tokens_record_nothing() {
        let p = pipeline();
        let payload = TrackingPayload::new("msg1", "c", "r", "tid", 1000, 60);
        let expired = token_params(&payload);

        for params in [
            expired,
            PixelParams {
                t: Some("a.b.c".to_string()),
                ..Default::default()
            },
            PixelParams {
                t: Some("bm90IGpzb24".to_string()),
                ..Default::default()
            },
        ] {
            let outcome = p.track(&params, &signals(), at(1_000_000)).unwrap();
            assert!(matches!(outcome, TrackOutcome::Rejected(_)), "{params:?}");
        }

        assert!(all_events(&p).is_empty());
        assert!(p.store().rollup("msg1").unwrap().is_none());
    }

    #[test]
    fn test_forged_signature_is_rejected() {
        let p = pipeline();
        let payload = TrackingPayload::new("msg1", "c", "r", "tid", 1000, 3600);
        let forged = PixelParams {
            t: Some(TokenCodec::new(Some("other")).issue(&payload).unwrap()),
            ..Default::default()
        };
        assert_eq!(
            p.track(&forged, &signals(), at(1000)).unwrap(),
            TrackOutcome::Rejected(TokenError::InvalidSignature)
        );
    }

    #[test]
    fn test_event_without_message_id_skips_rollup() {
        let p = pipeline();
        let params = PixelParams {
            c: Some("camp".to_string()),
            ..Default::default()
        };
        let outcome = p.track(&params, &signals(), at(1000)).unwrap();
        assert!(matches!(
            outcome,
            TrackOutcome::Recorded {
                rollup_updated: false,
                ..
            }
        ));

        let events = all_events(&p);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message_id, None);
        assert_eq!(events[0].campaign_id.as_deref(), Some("camp"));
    }

    #[test]
    fn test_legacy_token_without_tid_stores_raw_token() {
        let p = pipeline();
        // base64url of {"m":"foo"}
        let params = PixelParams {
            t: Some("eyJtIjoiZm9vIn0".to_string()),
            ..Default::default()
        };
        p.track(&params, &signals(), at(1000)).unwrap();

        let events = all_events(&p);
        assert_eq!(events[0].message_id.as_deref(), Some("foo"));
        assert_eq!(events[0].token_id.as_deref(), Some("eyJtIjoiZm9vIn0"));
    }

    #[test]
    fn test_prefetch_hits_still_count() {
        let p = pipeline();
        let params = PixelParams {
            m: Some("m1".to_string()),
            ..Default::default()
        };
        let prefetch = Signals {
            is_prefetch: true,
            ..signals()
        };
        p.track(&params, &signals(), at(1000)).unwrap();
        p.track(&params, &prefetch, at(1001)).unwrap();

        let rollup = p.store().rollup("m1").unwrap().unwrap();
        assert_eq!(rollup.open_count, 2);
        assert!(rollup.last_is_prefetch);
    }

    #[test]
    fn test_concurrent_tracks_for_same_message() {
        let p = Arc::new(pipeline());
        let n = 40i64;
        let payload = TrackingPayload::new("hot", "camp", "rec", "tid", 1000, 3600);
        let params = token_params(&payload);

        let handles: Vec<_> = (0..n)
            .map(|i| {
                let p = Arc::clone(&p);
                let params = params.clone();
                thread::spawn(move || {
                    p.track(&params, &signals(), at(1000 + (i * 7) % n)).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let rollup = p.store().rollup("hot").unwrap().unwrap();
        assert_eq!(rollup.open_count, n);
        assert_eq!(
            rollup.last_open_at,
            at(1000 + n - 1).to_rfc3339_opts(SecondsFormat::Millis, true)
        );
        assert_eq!(all_events(&p).len(), n as usize);
    }

    #[test]
    fn test_legacy_schema_degrades_gracefully() {
        let p = Pipeline::new(Arc::new(legacy_store()), TokenCodec::new(Some(SECRET)));
        let params = PixelParams {
            m: Some("m1".to_string()),
            re: Some("reader@example.com".to_string()),
            ..Default::default()
        };
        p.track(&params, &signals(), at(1000)).unwrap();

        let rollup = p.store().rollup("m1").unwrap().unwrap();
        assert_eq!(rollup.open_count, 1);
        assert_eq!(rollup.recipient_email, None);
    }

    #[tokio::test]
    async fn test_spawn_track_runs_in_background() {
        let p = Arc::new(pipeline());
        let params = PixelParams {
            m: Some("bg".to_string()),
            ..Default::default()
        };
        p.spawn_track(params, signals()).await.unwrap();
        assert_eq!(p.store().rollup("bg").unwrap().unwrap().open_count, 1);
    }

    #[tokio::test]
    async fn test_spawn_track_swallows_rejections() {
        let p = Arc::new(pipeline());
        let params = PixelParams {
            t: Some("x.y.z".to_string()),
            ..Default::default()
        };
        p.spawn_track(params, signals()).await.unwrap();
        assert!(all_events(&p).is_empty());
    }
}
