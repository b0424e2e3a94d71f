//! Pixeltrail Serve - HTTP API for email open tracking
//!
//! This crate serves the tracking pixel, issues signed tracking tokens and
//! exposes a paginated read endpoint over recorded opens.
//!
//! # Authentication
//!
//! Token issuance and event queries require a Bearer token configured via
//! `PIXELTRAIL_API_TOKEN`. The pixel and health endpoints are public.
//!
//! # Architecture
//!
//! - **AppState**: Shared application state (event store, pipeline, codec, configuration)
//! - **Auth**: Bearer token middleware for request authentication
//! - **Routes**: Endpoint handlers grouped by domain

mod auth;
mod error;
mod routes;
mod state;

pub use self::auth::require_auth;
pub use self::error::ApiError;
pub use self::routes::{TRANSPARENT_GIF, router};
pub use self::state::{AppState, Config};
