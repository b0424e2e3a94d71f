//! Signed tracking-token codec.
//!
//! A signed token is two base64url segments joined by a dot:
//!
//! ```text
//! base64url(JSON(payload)) "." base64url(HMAC-SHA256(secret, base64url(JSON(payload))))
//! ```
//!
//! The MAC covers the *encoded* payload segment exactly as it travels in the
//! URL, so verification never re-serializes JSON. A single segment without a
//! dot is a legacy unsigned token: it decodes, but proves nothing.

use base64::Engine as _;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::{Result, TokenError};

type HmacSha256 = Hmac<Sha256>;

/// Unpadded base64url on encode; padding optional on decode.
const B64URL: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Default token lifetime: 45 days.
pub const DEFAULT_TTL_SECS: i64 = 45 * 24 * 3600;

/// Shortest lifetime a caller may request.
pub const MIN_TTL_SECS: i64 = 60;

/// The signed claim set carried by a tracking token.
///
/// Field names on the wire are deliberately short (`m`, `c`, `r`, ...) to keep
/// pixel URLs compact.
///
/// Decoding is lenient about JSON types: ids may arrive as strings or
/// numbers, `iat`/`exp` as numbers or numeric strings, and the email as `re`
/// or `recipient_email`. See [`TrackingPayload::from_json`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackingPayload {
    #[serde(rename = "m")]
    pub message_id: String,

    #[serde(rename = "c")]
    pub campaign_id: String,

    #[serde(rename = "r")]
    pub recipient_id: String,

    #[serde(rename = "re", skip_serializing_if = "Option::is_none")]
    pub recipient_email: Option<String>,

    /// Opaque id for log correlation. Not a credential.
    #[serde(rename = "tid")]
    pub token_id: String,

    /// Issued-at, Unix seconds.
    #[serde(rename = "iat", skip_serializing_if = "Option::is_none")]
    pub issued_at: Option<i64>,

    /// Expiry, Unix seconds.
    #[serde(rename = "exp", skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
}

impl TrackingPayload {
    /// Build a payload issued at `now` that expires `ttl_secs` later.
    ///
    /// `ttl_secs` is clamped to [`MIN_TTL_SECS`].
    pub fn new(
        message_id: impl Into<String>,
        campaign_id: impl Into<String>,
        recipient_id: impl Into<String>,
        token_id: impl Into<String>,
        now: i64,
        ttl_secs: i64,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            campaign_id: campaign_id.into(),
            recipient_id: recipient_id.into(),
            recipient_email: None,
            token_id: token_id.into(),
            issued_at: Some(now),
            expires_at: Some(now.saturating_add(ttl_secs.max(MIN_TTL_SECS))),
        }
    }

    /// Attach a recipient email claim.
    pub fn with_recipient_email(mut self, email: impl Into<String>) -> Self {
        self.recipient_email = Some(email.into());
        self
    }
}

impl TrackingPayload {
    /// Read a payload from parsed JSON.
    ///
    /// `null`, `false` and other falsy values are rejected. Any other value is
    /// read field by field; missing or unusable fields come back empty.
    pub fn from_json(value: &Value) -> Result<Self> {
        let falsy = match value {
            Value::Null => true,
            Value::Bool(b) => !b,
            Value::Number(n) => n.as_f64() == Some(0.0),
            Value::String(s) => s.is_empty(),
            _ => false,
        };
        if falsy {
            return Err(TokenError::MalformedPayload(format!(
                "payload is {value}, expected an object"
            )));
        }

        let email = text_claim(value, "re");
        let email = if email.is_empty() {
            text_claim(value, "recipient_email")
        } else {
            email
        };

        Ok(Self {
            message_id: text_claim(value, "m"),
            campaign_id: text_claim(value, "c"),
            recipient_id: text_claim(value, "r"),
            recipient_email: Some(email).filter(|e| !e.is_empty()),
            token_id: text_claim(value, "tid"),
            issued_at: time_claim(value, "iat"),
            expires_at: time_claim(value, "exp"),
        })
    }
}

impl<'de> Deserialize<'de> for TrackingPayload {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        Self::from_json(&value).map_err(serde::de::Error::custom)
    }
}

/// String claim; numbers are taken as their decimal text.
fn text_claim(value: &Value, key: &str) -> String {
    match value.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(true)) => "true".to_string(),
        _ => String::new(),
    }
}

/// Unix-seconds claim from a number or a numeric string. Fractions are floored.
fn time_claim(value: &Value, key: &str) -> Option<i64> {
    match value.get(key)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.floor() as i64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>().ok().or_else(|| {
                s.parse::<f64>()
                    .ok()
                    .filter(|f| f.is_finite())
                    .map(|f| f.floor() as i64)
            })
        }
        _ => None,
    }
}

/// Issues and verifies tracking tokens with a shared HMAC secret.
///
/// The codec is immutable and cheap to clone; share one per process.
#[derive(Clone, Default)]
pub struct TokenCodec {
    secret: Option<Vec<u8>>,
}

impl std::fmt::Debug for TokenCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCodec")
            .field("secret_configured", &self.secret.is_some())
            .finish()
    }
}

impl TokenCodec {
    /// Create a codec. An empty secret counts as not configured.
    pub fn new(secret: Option<&str>) -> Self {
        Self {
            secret: secret
                .filter(|s| !s.is_empty())
                .map(|s| s.as_bytes().to_vec()),
        }
    }

    /// Whether a signing secret is available.
    pub fn has_secret(&self) -> bool {
        self.secret.is_some()
    }

    /// Serialize, encode and sign a payload.
    pub fn issue(&self, payload: &TrackingPayload) -> Result<String> {
        let secret = self.secret.as_deref().ok_or(TokenError::SecretNotConfigured)?;
        let json = serde_json::to_vec(payload)
            .map_err(|e| TokenError::MalformedPayload(e.to_string()))?;
        let payload_part = B64URL.encode(json);
        let sig_part = B64URL.encode(sign(secret, &payload_part));
        Ok(format!("{payload_part}.{sig_part}"))
    }

    /// Decode a token, checking signature and expiry against the current time.
    pub fn decode(&self, token: &str) -> Result<TrackingPayload> {
        self.decode_at(token, chrono::Utc::now().timestamp())
    }

    /// Decode a token, checking expiry against `now` (Unix seconds).
    pub fn decode_at(&self, token: &str, now: i64) -> Result<TrackingPayload> {
        let parts: Vec<&str> = token.split('.').collect();
        match parts.as_slice() {
            [payload_part] => decode_payload(payload_part),
            [payload_part, sig_part] => {
                let secret = self.secret.as_deref().ok_or(TokenError::SecretNotConfigured)?;
                let expected = B64URL.encode(sign(secret, payload_part));
                if !bool::from(expected.as_bytes().ct_eq(sig_part.as_bytes())) {
                    return Err(TokenError::InvalidSignature);
                }

                let payload = decode_payload(payload_part)?;
                if let Some(exp) = payload.expires_at {
                    if now > exp {
                        return Err(TokenError::TokenExpired { exp, now });
                    }
                }
                Ok(payload)
            }
            _ => Err(TokenError::MalformedFormat {
                segments: parts.len(),
            }),
        }
    }
}

fn sign(secret: &[u8], input: &str) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(input.as_bytes());
    mac.finalize().into_bytes().to_vec()
}

fn decode_payload(segment: &str) -> Result<TrackingPayload> {
    let bytes = B64URL
        .decode(segment)
        .map_err(|e| TokenError::MalformedPayload(e.to_string()))?;
    let value: Value =
        serde_json::from_slice(&bytes).map_err(|e| TokenError::MalformedPayload(e.to_string()))?;
    TrackingPayload::from_json(&value)
}
