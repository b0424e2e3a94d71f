//! Error types for ingestion and event queries.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while writing or reading open events.
#[derive(Error, Debug)]
pub enum Error {
    /// SQLite error.
    #[error("SQLite error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Page size is not a positive integer.
    #[error("invalid limit: {0:?}")]
    InvalidLimit(String),

    /// Cursor is not a non-negative integer offset.
    #[error("invalid cursor: {0:?}")]
    InvalidCursor(String),
}
