//! Paginated reads over the open-event log.
//!
//! Results are ordered by `(opened_at DESC, token_id DESC, rowid DESC)`. The
//! rowid tie-breaker makes the order total, so offset cursors neither skip
//! nor repeat rows between pages as long as no rows are inserted ahead of the
//! cursor.

use rusqlite::params_from_iter;
use rusqlite::types::Value;
use serde::Serialize;

use crate::store::{EventStore, OpenEvent};
use crate::{Error, Result};

pub const DEFAULT_LIMIT: u32 = 100;
pub const MAX_LIMIT: u32 = 500;

/// Filters applied to the event log. Empty filters are ignored; the rest are ANDed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    pub campaign_id: Option<String>,
    pub message_id: Option<String>,
    /// Lower-cased; matched case-insensitively.
    pub recipient_email: Option<String>,
}

impl EventFilter {
    /// Build a filter from raw request values, trimming and dropping empties.
    pub fn new(
        campaign_id: Option<&str>,
        message_id: Option<&str>,
        recipient_email: Option<&str>,
    ) -> Self {
        fn clean(value: Option<&str>) -> Option<String> {
            value.map(str::trim).filter(|v| !v.is_empty()).map(str::to_string)
        }

        Self {
            campaign_id: clean(campaign_id),
            message_id: clean(message_id),
            recipient_email: clean(recipient_email).map(|e| e.to_lowercase()),
        }
    }
}

/// Validated page position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub limit: u32,
    pub offset: u64,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIMIT,
            offset: 0,
        }
    }
}

impl PageRequest {
    /// Parse raw `limit` and `cursor` values.
    ///
    /// Missing or empty values take their defaults. `limit` must be a
    /// positive integer and is capped at [`MAX_LIMIT`]; `cursor` must be a
    /// non-negative integer.
    pub fn parse(limit: Option<&str>, cursor: Option<&str>) -> Result<Self> {
        let limit = match limit.map(str::trim).filter(|v| !v.is_empty()) {
            None => DEFAULT_LIMIT,
            Some(raw) => match raw.parse::<i64>() {
                Ok(n) if n >= 1 => n.min(i64::from(MAX_LIMIT)) as u32,
                _ => return Err(Error::InvalidLimit(raw.to_string())),
            },
        };

        let offset = match cursor.map(str::trim).filter(|v| !v.is_empty()) {
            None => 0,
            Some(raw) => match raw.parse::<i64>() {
                Ok(n) if n >= 0 => n as u64,
                _ => return Err(Error::InvalidCursor(raw.to_string())),
            },
        };

        Ok(Self { limit, offset })
    }
}

/// One page of events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventPage {
    pub events: Vec<OpenEvent>,
    /// Offset of the next page, or `None` on the last page.
    pub next_cursor: Option<String>,
}

impl EventStore {
    /// Fetch one page of events matching `filter`.
    pub fn query_events(&self, filter: &EventFilter, page: PageRequest) -> Result<EventPage> {
        let caps = self.capabilities();

        // Without the column no stored event can match an email filter.
        if filter.recipient_email.is_some() && !caps.events_recipient_email {
            return Ok(EventPage {
                events: Vec::new(),
                next_cursor: None,
            });
        }

        let mut clauses = Vec::new();
        let mut values = Vec::new();
        if let Some(campaign_id) = &filter.campaign_id {
            clauses.push("campaign_id = ?");
            values.push(Value::Text(campaign_id.clone()));
        }
        if let Some(message_id) = &filter.message_id {
            clauses.push("message_id = ?");
            values.push(Value::Text(message_id.clone()));
        }
        if let Some(email) = &filter.recipient_email {
            clauses.push("unicode_lower(recipient_email) = ?");
            values.push(Value::Text(email.clone()));
        }

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let email_col = if caps.events_recipient_email {
            "recipient_email"
        } else {
            "NULL AS recipient_email"
        };

        // One extra row tells us whether another page exists.
        values.push(Value::Integer(i64::from(page.limit) + 1));
        values.push(Value::Integer(i64::try_from(page.offset).unwrap_or(i64::MAX)));

        let sql = format!(
            "SELECT message_id, campaign_id, recipient_id, {email_col}, token_id, opened_at,
                    user_agent, ip_hash, country, colo, ray_id, is_prefetch
             FROM email_open_events
             {where_sql}
             ORDER BY opened_at DESC, token_id DESC, rowid DESC
             LIMIT ? OFFSET ?"
        );

        let mut events = self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(values.iter()), OpenEvent::from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })?;

        let limit = page.limit as usize;
        let next_cursor = if events.len() > limit {
            events.truncate(limit);
            Some((page.offset + u64::from(page.limit)).to_string())
        } else {
            None
        };

        metrics::histogram!(pixeltrail_core::metrics::QUERY_ROWS).record(events.len() as f64);
        Ok(EventPage {
            events,
            next_cursor,
        })
    }
}
