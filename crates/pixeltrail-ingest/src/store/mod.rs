//! SQLite-backed storage for open events and rollups.
//!
//! [`EventStore`] owns a single connection behind a mutex. Every write is one
//! SQL statement, so atomicity comes from SQLite itself: the rollup update is
//! an `INSERT ... ON CONFLICT DO UPDATE`, never a read followed by a write.

mod schema;

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};

pub use schema::{StoreCapabilities, detect_capabilities};

use crate::{Error, Result};

/// One pixel fetch, as stored in `email_open_events`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenEvent {
    pub message_id: Option<String>,
    pub campaign_id: Option<String>,
    pub recipient_id: Option<String>,
    pub recipient_email: Option<String>,
    pub token_id: Option<String>,
    /// ISO-8601 UTC with millisecond precision.
    pub opened_at: String,
    pub user_agent: String,
    pub ip_hash: Option<String>,
    pub country: Option<String>,
    pub colo: Option<String>,
    pub ray_id: Option<String>,
    /// 1 when the hit looked like a prefetch or proxy fetch, else 0.
    pub is_prefetch: u8,
}

impl OpenEvent {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            message_id: row.get("message_id")?,
            campaign_id: row.get("campaign_id")?,
            recipient_id: row.get("recipient_id")?,
            recipient_email: row.get("recipient_email")?,
            token_id: row.get("token_id")?,
            opened_at: row.get("opened_at")?,
            user_agent: row
                .get::<_, Option<String>>("user_agent")?
                .unwrap_or_default(),
            ip_hash: row.get("ip_hash")?,
            country: row.get("country")?,
            colo: row.get("colo")?,
            ray_id: row.get("ray_id")?,
            is_prefetch: u8::from(row.get::<_, Option<i64>>("is_prefetch")?.unwrap_or(0) != 0),
        })
    }
}

/// Summary row for one message in `email_open_rollups`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenRollup {
    pub message_id: String,
    pub campaign_id: Option<String>,
    pub recipient_id: Option<String>,
    pub recipient_email: Option<String>,
    pub first_open_at: String,
    pub last_open_at: String,
    pub open_count: i64,
    pub last_user_agent: Option<String>,
    pub last_ip_hash: Option<String>,
    pub last_is_prefetch: bool,
}

const INSERT_EVENT: &str = "INSERT INTO email_open_events
    (message_id, campaign_id, recipient_id, recipient_email, token_id, opened_at,
     user_agent, ip_hash, country, colo, ray_id, is_prefetch)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)";

const INSERT_EVENT_NO_EMAIL: &str = "INSERT INTO email_open_events
    (message_id, campaign_id, recipient_id, token_id, opened_at,
     user_agent, ip_hash, country, colo, ray_id, is_prefetch)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)";

// Identity columns: incoming non-null wins, null keeps the stored value.
// last_*: overwritten on every open. Timestamps are merged with MIN/MAX so a
// late-committing writer cannot move them backwards.
const UPSERT_ROLLUP: &str = "INSERT INTO email_open_rollups
    (message_id, campaign_id, recipient_id, recipient_email, first_open_at, last_open_at,
     open_count, last_user_agent, last_ip_hash, last_is_prefetch)
    VALUES (?1, ?2, ?3, ?4, ?5, ?5, 1, ?6, ?7, ?8)
    ON CONFLICT(message_id) DO UPDATE SET
        campaign_id = COALESCE(excluded.campaign_id, email_open_rollups.campaign_id),
        recipient_id = COALESCE(excluded.recipient_id, email_open_rollups.recipient_id),
        recipient_email = COALESCE(excluded.recipient_email, email_open_rollups.recipient_email),
        first_open_at = MIN(email_open_rollups.first_open_at, excluded.first_open_at),
        last_open_at = MAX(email_open_rollups.last_open_at, excluded.last_open_at),
        open_count = email_open_rollups.open_count + 1,
        last_user_agent = excluded.last_user_agent,
        last_ip_hash = excluded.last_ip_hash,
        last_is_prefetch = excluded.last_is_prefetch";

const UPSERT_ROLLUP_NO_EMAIL: &str = "INSERT INTO email_open_rollups
    (message_id, campaign_id, recipient_id, first_open_at, last_open_at,
     open_count, last_user_agent, last_ip_hash, last_is_prefetch)
    VALUES (?1, ?2, ?3, ?4, ?4, 1, ?5, ?6, ?7)
    ON CONFLICT(message_id) DO UPDATE SET
        campaign_id = COALESCE(excluded.campaign_id, email_open_rollups.campaign_id),
        recipient_id = COALESCE(excluded.recipient_id, email_open_rollups.recipient_id),
        first_open_at = MIN(email_open_rollups.first_open_at, excluded.first_open_at),
        last_open_at = MAX(email_open_rollups.last_open_at, excluded.last_open_at),
        open_count = email_open_rollups.open_count + 1,
        last_user_agent = excluded.last_user_agent,
        last_ip_hash = excluded.last_ip_hash,
        last_is_prefetch = excluded.last_is_prefetch";

/// Event log and rollup store.
pub struct EventStore {
    /// SQLite connection (protected by mutex for thread safety).
    conn: Mutex<Connection>,
    caps: StoreCapabilities,
}

impl EventStore {
    /// Open or create the database file at `path`.
    pub fn open<P>(path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        // WAL lets the query endpoint read while ingestion writes.
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA busy_timeout=5000;",
        )?;

        let store = Self::from_connection(conn)?;
        tracing::info!(
            path = %path.display(),
            events_recipient_email = store.caps.events_recipient_email,
            rollups_recipient_email = store.caps.rollups_recipient_email,
            "event store opened"
        );
        Ok(store)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    /// Wrap an existing connection, creating missing tables.
    pub fn from_connection(conn: Connection) -> Result<Self> {
        let caps = schema::init_schema(&conn)?;
        if caps != StoreCapabilities::FULL {
            tracing::warn!(
                ?caps,
                "event store schema lacks optional columns; recipient emails will not be stored"
            );
        }
        Ok(Self {
            conn: Mutex::new(conn),
            caps,
        })
    }

    /// Optional columns detected at open time.
    pub fn capabilities(&self) -> StoreCapabilities {
        self.caps
    }

    /// Append one event. Returns its row id.
    pub fn insert_event(&self, event: &OpenEvent) -> Result<i64> {
        let conn = self.conn.lock();
        if self.caps.events_recipient_email {
            conn.execute(
                INSERT_EVENT,
                params![
                    event.message_id,
                    event.campaign_id,
                    event.recipient_id,
                    event.recipient_email,
                    event.token_id,
                    event.opened_at,
                    event.user_agent,
                    event.ip_hash,
                    event.country,
                    event.colo,
                    event.ray_id,
                    event.is_prefetch,
                ],
            )?;
        } else {
            conn.execute(
                INSERT_EVENT_NO_EMAIL,
                params![
                    event.message_id,
                    event.campaign_id,
                    event.recipient_id,
                    event.token_id,
                    event.opened_at,
                    event.user_agent,
                    event.ip_hash,
                    event.country,
                    event.colo,
                    event.ray_id,
                    event.is_prefetch,
                ],
            )?;
        }
        Ok(conn.last_insert_rowid())
    }

    /// Insert the rollup for the event's message or fold the event into it.
    ///
    /// Events without a message id have no rollup; they are skipped and
    /// `false` is returned.
    pub fn upsert_rollup(&self, event: &OpenEvent) -> Result<bool> {
        let Some(message_id) = event.message_id.as_deref().filter(|m| !m.is_empty()) else {
            return Ok(false);
        };

        let conn = self.conn.lock();
        if self.caps.rollups_recipient_email {
            conn.execute(
                UPSERT_ROLLUP,
                params![
                    message_id,
                    event.campaign_id,
                    event.recipient_id,
                    event.recipient_email,
                    event.opened_at,
                    event.user_agent,
                    event.ip_hash,
                    event.is_prefetch,
                ],
            )?;
        } else {
            conn.execute(
                UPSERT_ROLLUP_NO_EMAIL,
                params![
                    message_id,
                    event.campaign_id,
                    event.recipient_id,
                    event.opened_at,
                    event.user_agent,
                    event.ip_hash,
                    event.is_prefetch,
                ],
            )?;
        }
        Ok(true)
    }

    /// Fetch the rollup for one message.
    pub fn rollup(&self, message_id: &str) -> Result<Option<OpenRollup>> {
        let email_col = if self.caps.rollups_recipient_email {
            "recipient_email"
        } else {
            "NULL AS recipient_email"
        };
        let sql = format!(
            "SELECT message_id, campaign_id, recipient_id, {email_col}, first_open_at,
                    last_open_at, open_count, last_user_agent, last_ip_hash, last_is_prefetch
             FROM email_open_rollups
             WHERE message_id = ?1"
        );

        let conn = self.conn.lock();
        conn.query_row(&sql, [message_id], |row| {
            Ok(OpenRollup {
                message_id: row.get("message_id")?,
                campaign_id: row.get("campaign_id")?,
                recipient_id: row.get("recipient_id")?,
                recipient_email: row.get("recipient_email")?,
                first_open_at: row.get("first_open_at")?,
                last_open_at: row.get("last_open_at")?,
                open_count: row.get("open_count")?,
                last_user_agent: row.get("last_user_agent")?,
                last_ip_hash: row.get("last_ip_hash")?,
                last_is_prefetch: row.get::<_, i64>("last_is_prefetch")? != 0,
            })
        })
        .optional()
        .map_err(Error::from)
    }

    /// Run `f` with the locked connection.
    pub(crate) fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        f(&conn)
    }
}
