//! Application state and configuration.

use std::path::PathBuf;
use std::sync::Arc;

use pixeltrail_core::classify::DEFAULT_IP_HASH_SALT;
use pixeltrail_core::{Classifier, TokenCodec};
use pixeltrail_ingest::{EventStore, Pipeline};

/// Application configuration loaded from environment.
#[derive(Clone)]
pub struct Config {
    /// Server bind address (e.g., "0.0.0.0:8080").
    pub bind_addr: String,

    /// SQLite database file.
    pub db_path: PathBuf,

    /// Token signing secret (`PIXELTRAIL_SECRET`).
    pub secret: Option<String>,

    /// Bearer token for the protected endpoints (`PIXELTRAIL_API_TOKEN`).
    pub api_token: Option<String>,

    /// Salt mixed into client IP hashes.
    pub ip_hash_salt: String,

    /// Public base URL for issued pixel links, without trailing slash.
    pub base_url: Option<String>,

    /// Port for the Prometheus exporter, if enabled.
    pub metrics_port: Option<u16>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("bind_addr", &self.bind_addr)
            .field("db_path", &self.db_path)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .field("api_token", &self.api_token.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .field("metrics_port", &self.metrics_port)
            .finish_non_exhaustive()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            db_path: PathBuf::from("./data/pixeltrail.db"),
            secret: None,
            api_token: None,
            ip_hash_salt: DEFAULT_IP_HASH_SALT.to_string(),
            base_url: None,
            metrics_port: None,
        }
    }
}

/// Read an environment variable, treating empty values as unset.
fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Nothing is required: a missing secret or API token disables the
    /// endpoints that need it (they answer `server_not_configured`).
    ///
    /// - `PIXELTRAIL_BIND_ADDR`: Server bind address (default: "0.0.0.0:8080")
    /// - `PIXELTRAIL_DB_PATH`: SQLite file (default: "./data/pixeltrail.db")
    /// - `PIXELTRAIL_SECRET`: Token signing secret
    /// - `PIXELTRAIL_API_TOKEN`: Bearer token for protected endpoints
    /// - `PIXELTRAIL_IP_HASH_SALT`: IP hash salt (default: "pixeltrail")
    /// - `PIXELTRAIL_BASE_URL`: Public base URL for pixel links
    /// - `PIXELTRAIL_METRICS_PORT`: Prometheus exporter port
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let metrics_port = env_var("PIXELTRAIL_METRICS_PORT")
            .map(|raw| {
                raw.parse::<u16>().map_err(|_| {
                    anyhow::anyhow!("PIXELTRAIL_METRICS_PORT must be a port number, got {raw:?}")
                })
            })
            .transpose()?;

        let config = Self {
            bind_addr: env_var("PIXELTRAIL_BIND_ADDR").unwrap_or(defaults.bind_addr),
            db_path: env_var("PIXELTRAIL_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            secret: env_var("PIXELTRAIL_SECRET"),
            api_token: env_var("PIXELTRAIL_API_TOKEN"),
            ip_hash_salt: env_var("PIXELTRAIL_IP_HASH_SALT").unwrap_or(defaults.ip_hash_salt),
            base_url: env_var("PIXELTRAIL_BASE_URL").map(|u| u.trim_end_matches('/').to_string()),
            metrics_port,
        };

        if config.secret.is_none() {
            tracing::warn!("PIXELTRAIL_SECRET not set; token issuance disabled");
        }
        if config.api_token.is_none() {
            tracing::warn!("PIXELTRAIL_API_TOKEN not set; protected endpoints disabled");
        }
        if config.ip_hash_salt == DEFAULT_IP_HASH_SALT {
            tracing::warn!("PIXELTRAIL_IP_HASH_SALT not set; IP hashes use the public default salt");
        }

        tracing::info!(
            bind_addr = %config.bind_addr,
            db_path = %config.db_path.display(),
            base_url = config.base_url.as_deref().unwrap_or(""),
            metrics_port = ?config.metrics_port,
            "configuration loaded"
        );

        Ok(config)
    }
}

/// Shared application state available to all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<Config>,

    /// Event log, read directly by the query endpoint.
    pub store: Arc<EventStore>,

    /// Background ingestion for pixel hits.
    pub pipeline: Arc<Pipeline>,

    /// Issues and verifies tracking tokens.
    pub codec: TokenCodec,

    /// Derives client signals from pixel requests.
    pub classifier: Classifier,
}

impl AppState {
    /// Open the configured database and build the state.
    pub fn open(config: Config) -> anyhow::Result<Self> {
        let store = EventStore::open(&config.db_path)?;
        Ok(Self::with_store(config, store))
    }

    /// Build the state around an already-open store.
    pub fn with_store(config: Config, store: EventStore) -> Self {
        let store = Arc::new(store);
        let codec = TokenCodec::new(config.secret.as_deref());
        let classifier = Classifier::new(Some(config.ip_hash_salt.as_str()));
        let pipeline = Arc::new(Pipeline::new(Arc::clone(&store), codec.clone()));

        Self {
            config: Arc::new(config),
            store,
            pipeline,
            codec,
            classifier,
        }
    }
}
