//! Pixeltrail ingestion and event log storage.
//!
//! This crate records email opens into SQLite and serves paginated reads
//! over the recorded events.
//!
//! # Modules
//!
//! - [`store`] - SQLite event log and per-message rollups
//! - [`pipeline`] - Turns a pixel hit into an event row and a rollup update
//! - [`query`] - Filtered, paginated reads over the event log
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │    Pixel hit    │  (query params + classified request signals)
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │    Pipeline     │  resolves identity, drops rejected tokens
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │   EventStore    │  email_open_events (append-only)
//! │                 │  email_open_rollups (one row per message)
//! └─────────────────┘
//! ```
//!
//! The event log is the source of truth; rollups are maintained with a
//! single atomic upsert per event.

pub mod error;
pub mod pipeline;
pub mod query;
pub mod store;

pub use error::{Error, Result};
pub use pipeline::{Pipeline, TrackOutcome};
pub use query::{DEFAULT_LIMIT, EventFilter, EventPage, MAX_LIMIT, PageRequest};
pub use store::{EventStore, OpenEvent, OpenRollup, StoreCapabilities};
