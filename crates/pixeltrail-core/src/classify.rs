//! Client signals derived from an inbound pixel request.
//!
//! Prefetch detection is a heuristic. Mail clients and link unfurlers that
//! proxy images will sometimes look like humans and vice versa.

use std::net::IpAddr;

use axum::http::HeaderMap;
use sha2::{Digest, Sha256};

use crate::truncate_chars;

/// Salt used when the operator does not configure one. Not a secret.
pub const DEFAULT_IP_HASH_SALT: &str = "pixeltrail";

pub const MAX_USER_AGENT_LEN: usize = 512;
pub const MAX_COUNTRY_LEN: usize = 8;
pub const MAX_COLO_LEN: usize = 16;
pub const MAX_RAY_ID_LEN: usize = 64;

/// Lower-cased user-agent fragments of known image-proxy fetchers.
const PROXY_SIGNATURES: &[&str] = &["googleimageproxy", "yahoomailproxy"];

/// Transport-level facts about the connection, outside the headers.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectionInfo {
    /// Socket peer address, if known.
    pub peer_ip: Option<IpAddr>,
}

/// Signals recorded alongside an open event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Signals {
    pub user_agent: String,
    pub is_prefetch: bool,
    pub ip_hash: Option<String>,
    pub country: Option<String>,
    pub colo: Option<String>,
    pub ray_id: Option<String>,
}

/// Stateless request classifier holding the IP-hash salt.
#[derive(Clone)]
pub struct Classifier {
    salt: String,
}

impl std::fmt::Debug for Classifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Classifier").finish_non_exhaustive()
    }
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new(None)
    }
}

impl Classifier {
    /// Create a classifier. `None` or an empty salt uses [`DEFAULT_IP_HASH_SALT`].
    pub fn new(salt: Option<&str>) -> Self {
        let salt = salt
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_IP_HASH_SALT);
        Self {
            salt: salt.to_string(),
        }
    }

    /// Derive signals from request headers and connection info.
    pub fn classify(&self, headers: &HeaderMap, conn: &ConnectionInfo) -> Signals {
        let user_agent = truncate_chars(
            header(headers, "user-agent").unwrap_or(""),
            MAX_USER_AGENT_LEN,
        );

        let ray = header(headers, "cf-ray").filter(|v| !v.is_empty());
        let colo = ray
            .and_then(|r| r.rsplit_once('-'))
            .map(|(_, colo)| truncate_chars(colo, MAX_COLO_LEN))
            .filter(|c| !c.is_empty());

        let client_ip = header(headers, "cf-connecting-ip")
            .map(str::trim)
            .filter(|ip| !ip.is_empty())
            .map(str::to_string)
            .or_else(|| conn.peer_ip.map(|ip| ip.to_string()));

        Signals {
            is_prefetch: is_prefetch(headers, &user_agent),
            ip_hash: client_ip.map(|ip| self.hash_ip(&ip)),
            country: header(headers, "cf-ipcountry")
                .map(|c| truncate_chars(c.trim(), MAX_COUNTRY_LEN))
                .filter(|c| !c.is_empty()),
            colo,
            ray_id: ray.map(|r| truncate_chars(r, MAX_RAY_ID_LEN)),
            user_agent,
        }
    }

    /// Hex SHA-256 of `salt ":" ip`.
    pub fn hash_ip(&self, ip: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.salt.as_bytes());
        hasher.update(b":");
        hasher.update(ip.as_bytes());
        hex::encode(hasher.finalize())
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn is_prefetch(headers: &HeaderMap, user_agent: &str) -> bool {
    let purpose_hint = ["purpose", "sec-purpose"].iter().any(|name| {
        header(headers, name).is_some_and(|v| v.to_ascii_lowercase().contains("prefetch"))
    });
    if purpose_hint {
        return true;
    }

    let ua = user_agent.to_ascii_lowercase();
    PROXY_SIGNATURES.iter().any(|sig| ua.contains(sig))
}
