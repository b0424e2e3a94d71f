//! Error types for tracking-token handling.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, TokenError>;

/// Errors that can occur while issuing or decoding a tracking token.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    /// Token does not have one (legacy) or two (signed) `.`-separated segments.
    #[error("malformed token: expected 1 or 2 segments, got {segments}")]
    MalformedFormat {
        /// Number of segments found after splitting on `.`.
        segments: usize,
    },

    /// Payload segment is not base64url-encoded JSON of the expected shape.
    #[error("malformed token payload: {0}")]
    MalformedPayload(String),

    /// Signature segment does not match the recomputed HMAC.
    #[error("invalid token signature")]
    InvalidSignature,

    /// A signature is present (or one must be produced) but no secret is configured.
    #[error("signing secret is not configured")]
    SecretNotConfigured,

    /// The payload's `exp` claim is in the past.
    #[error("token expired at {exp} (now {now})")]
    TokenExpired {
        /// Expiry claim, Unix seconds.
        exp: i64,
        /// Time of the check, Unix seconds.
        now: i64,
    },
}

impl TokenError {
    /// Short, stable label used for log fields and metric labels.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::MalformedFormat { .. } => "malformed_format",
            Self::MalformedPayload(_) => "malformed_payload",
            Self::InvalidSignature => "invalid_signature",
            Self::SecretNotConfigured => "secret_not_configured",
            Self::TokenExpired { .. } => "token_expired",
        }
    }
}
