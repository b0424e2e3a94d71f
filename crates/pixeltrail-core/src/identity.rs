//! Tracking identity resolution for pixel requests.
//!
//! A pixel URL identifies the opened message either through a signed token
//! (`?t=<token>`) or, for older links, through plain query parameters
//! (`?m=&c=&r=&re=`). The plain form is unauthenticated and accepted only for
//! compatibility.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::Result;
use crate::token::{TokenCodec, TrackingPayload};
use crate::truncate_chars;

/// Maximum stored length of message, campaign, recipient and token ids.
pub const MAX_ID_LEN: usize = 128;

/// Maximum stored length of a recipient email.
pub const MAX_EMAIL_LEN: usize = 320;

static EMAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("valid email regex"));

/// Query parameters accepted by the pixel endpoint.
#[derive(Debug, Clone, Default)]
pub struct PixelParams {
    /// Signed or legacy token.
    pub t: Option<String>,
    /// Message id (unsigned form).
    pub m: Option<String>,
    /// Campaign id (unsigned form).
    pub c: Option<String>,
    /// Recipient id (unsigned form).
    pub r: Option<String>,
    /// Recipient email (unsigned form).
    pub re: Option<String>,
    /// Long alias of `re`.
    pub recipient_email: Option<String>,
}

impl PixelParams {
    /// Build params from decoded query pairs.
    ///
    /// The first occurrence of each known key wins; repeats and unknown keys
    /// are ignored.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut params = Self::default();
        for (key, value) in pairs {
            let slot = match key.as_ref() {
                "t" => &mut params.t,
                "m" => &mut params.m,
                "c" => &mut params.c,
                "r" => &mut params.r,
                "re" => &mut params.re,
                "recipient_email" => &mut params.recipient_email,
                _ => continue,
            };
            if slot.is_none() {
                *slot = Some(value.into());
            }
        }
        params
    }

    /// The `t` parameter, if present and non-empty.
    pub fn token(&self) -> Option<&str> {
        self.t.as_deref().filter(|t| !t.is_empty())
    }
}

/// Who opened what, as far as the request can tell.
///
/// Every field is optional: empty values are normalized to `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub message_id: Option<String>,
    pub campaign_id: Option<String>,
    pub recipient_id: Option<String>,
    pub recipient_email: Option<String>,
    pub token_id: Option<String>,
}

/// Resolve the identity carried by a pixel request.
///
/// Token errors are returned unchanged; the unsigned path never fails.
pub fn resolve(params: &PixelParams, codec: &TokenCodec) -> Result<Identity> {
    resolve_at(params, codec, chrono::Utc::now().timestamp())
}

/// Like [`resolve`], checking token expiry against `now` (Unix seconds).
pub fn resolve_at(params: &PixelParams, codec: &TokenCodec, now: i64) -> Result<Identity> {
    if let Some(token) = params.token() {
        let payload = codec.decode_at(token, now)?;
        return Ok(Identity::from_payload(&payload));
    }

    let email = params
        .re
        .as_deref()
        .filter(|s| !s.is_empty())
        .or(params.recipient_email.as_deref());

    Ok(Identity {
        message_id: normalize_id(params.m.as_deref()),
        campaign_id: normalize_id(params.c.as_deref()),
        recipient_id: normalize_id(params.r.as_deref()),
        recipient_email: email.and_then(normalize_email),
        token_id: None,
    })
}

impl Identity {
    /// Map decoded token claims onto an identity.
    pub fn from_payload(payload: &TrackingPayload) -> Self {
        Self {
            message_id: normalize_id(Some(&payload.message_id)),
            campaign_id: normalize_id(Some(&payload.campaign_id)),
            recipient_id: normalize_id(Some(&payload.recipient_id)),
            recipient_email: payload.recipient_email.as_deref().and_then(normalize_email),
            token_id: normalize_id(Some(&payload.token_id)),
        }
    }
}

fn normalize_id(value: Option<&str>) -> Option<String> {
    value
        .map(|v| truncate_chars(v, MAX_ID_LEN))
        .filter(|v| !v.is_empty())
}

/// Lower-case and validate an email address.
///
/// Returns `None` for anything that doesn't look like `local@domain.tld`.
pub fn normalize_email(value: &str) -> Option<String> {
    let normalized = value.trim().to_lowercase();
    if normalized.is_empty() || !EMAIL_RE.is_match(&normalized) {
        return None;
    }
    Some(truncate_chars(&normalized, MAX_EMAIL_LEN))
}
