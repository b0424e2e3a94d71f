//! Pixeltrail Serve - HTTP API server for email open tracking.
//!
//! This binary opens the SQLite event store and serves the pixel, token
//! issuance and query endpoints.

use std::net::SocketAddr;

use axum::http::Request;
use clap::Parser;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::Level;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use pixeltrail_core::metrics::{init_metrics, start_metrics_server};
use pixeltrail_serve::{AppState, Config, router};

/// Pixeltrail open-tracking API server.
#[derive(Parser, Debug)]
#[command(name = "pixeltrail-serve")]
#[command(about = "HTTP API server for email open tracking", long_about = None)]
struct Args {
    /// Path to .env file (optional).
    #[arg(long, env = "DOTENV_PATH", default_value = ".env")]
    dotenv: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load .env file if it exists
    if std::path::Path::new(&args.dotenv).exists() {
        dotenvy::from_path(&args.dotenv)?;
        eprintln!("Loaded environment from {}", args.dotenv);
    }

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    let bind_addr = config.bind_addr.clone();

    if let Some(port) = config.metrics_port {
        match init_metrics() {
            Some(handle) => start_metrics_server(port, handle).await?,
            None => tracing::warn!("metrics recorder already installed; exporter not started"),
        }
    }

    let state = AppState::open(config)?;

    let app = router(state)
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &Request<_>| {
                // Query strings carry tracking tokens; keep them out of logs.
                tracing::span!(
                    Level::INFO,
                    "http_request",
                    method = %request.method(),
                    path = %request.uri().path(),
                )
            }),
        )
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "starting server");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
