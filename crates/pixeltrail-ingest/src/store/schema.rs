//! SQLite schema for the open-event log and per-message rollups.
//!
//! Tables are created when missing but never altered: databases created by
//! older deployments may lack the optional `recipient_email` columns. Which
//! optional columns exist is checked once at open time and reported as
//! [`StoreCapabilities`].

use rusqlite::functions::FunctionFlags;
use rusqlite::{Connection, Result};

pub const EVENTS_TABLE: &str = "email_open_events";
pub const ROLLUPS_TABLE: &str = "email_open_rollups";

/// SQL function lower-casing text with Unicode rules. SQLite's `LOWER` folds
/// ASCII only.
pub const UNICODE_LOWER_FN: &str = "unicode_lower";

/// Optional columns present in the opened database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreCapabilities {
    /// `email_open_events.recipient_email` exists.
    pub events_recipient_email: bool,
    /// `email_open_rollups.recipient_email` exists.
    pub rollups_recipient_email: bool,
}

impl StoreCapabilities {
    /// Every optional column present.
    pub const FULL: Self = Self {
        events_recipient_email: true,
        rollups_recipient_email: true,
    };
}

/// Create missing tables and indexes, then report column capabilities.
pub fn init_schema(conn: &Connection) -> Result<StoreCapabilities> {
    register_functions(conn)?;
    create_tables(conn)?;
    let caps = detect_capabilities(conn)?;
    create_indexes(conn, caps)?;
    Ok(caps)
}

/// Register the connection-local SQL functions the queries rely on.
fn register_functions(conn: &Connection) -> Result<()> {
    conn.create_scalar_function(
        UNICODE_LOWER_FN,
        1,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| Ok(ctx.get::<Option<String>>(0)?.map(|s| s.to_lowercase())),
    )
}

fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Append-only log, one row per pixel fetch
        CREATE TABLE IF NOT EXISTS email_open_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            message_id TEXT,
            campaign_id TEXT,
            recipient_id TEXT,
            recipient_email TEXT,
            token_id TEXT,
            opened_at TEXT NOT NULL,
            user_agent TEXT,
            ip_hash TEXT,
            country TEXT,
            colo TEXT,
            ray_id TEXT,
            is_prefetch INTEGER NOT NULL DEFAULT 0
        );

        -- One summary row per message
        CREATE TABLE IF NOT EXISTS email_open_rollups (
            message_id TEXT PRIMARY KEY,
            campaign_id TEXT,
            recipient_id TEXT,
            recipient_email TEXT,
            first_open_at TEXT NOT NULL,
            last_open_at TEXT NOT NULL,
            open_count INTEGER NOT NULL DEFAULT 0,
            last_user_agent TEXT,
            last_ip_hash TEXT,
            last_is_prefetch INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_open_events_opened_at ON email_open_events(opened_at DESC);
        CREATE INDEX IF NOT EXISTS idx_open_events_message ON email_open_events(message_id);
        CREATE INDEX IF NOT EXISTS idx_open_events_campaign ON email_open_events(campaign_id);
        CREATE INDEX IF NOT EXISTS idx_open_rollups_campaign ON email_open_rollups(campaign_id);
        "#,
    )
}

fn create_indexes(conn: &Connection, caps: StoreCapabilities) -> Result<()> {
    if caps.events_recipient_email {
        conn.execute_batch(
            "CREATE INDEX IF NOT EXISTS idx_open_events_recipient_email
                ON email_open_events(recipient_email)",
        )?;
    }
    Ok(())
}

/// Probe which optional columns exist.
pub fn detect_capabilities(conn: &Connection) -> Result<StoreCapabilities> {
    Ok(StoreCapabilities {
        events_recipient_email: has_column(conn, EVENTS_TABLE, "recipient_email")?,
        rollups_recipient_email: has_column(conn, ROLLUPS_TABLE, "recipient_email")?,
    })
}

fn has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
    for name in names {
        if name? == column {
            return Ok(true);
        }
    }
    Ok(false)
}
