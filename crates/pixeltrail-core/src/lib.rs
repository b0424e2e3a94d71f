//! Core types for pixeltrail email open tracking.
//!
//! This crate provides:
//! - The signed tracking-token codec (HMAC-SHA256 over a base64url JSON payload)
//! - Identity resolution from signed tokens or legacy query parameters
//! - Request classification (prefetch heuristic, hashed client IP, edge metadata)
//! - Prometheus metrics helpers
//!
//! Nothing here touches storage; everything except the metrics exporter is
//! pure and safe to call from any thread.

pub mod classify;
mod error;
pub mod identity;
pub mod metrics;
pub mod token;

pub use classify::{Classifier, ConnectionInfo, Signals};
pub use error::{Result, TokenError};
pub use identity::{Identity, PixelParams, normalize_email, resolve, resolve_at};
pub use token::{DEFAULT_TTL_SECS, MIN_TTL_SECS, TokenCodec, TrackingPayload};

/// Truncate to at most `max` characters, never splitting a UTF-8 sequence.
pub fn truncate_chars(value: &str, max: usize) -> String {
    match value.char_indices().nth(max) {
        Some((idx, _)) => value[..idx].to_string(),
        None => value.to_string(),
    }
}
