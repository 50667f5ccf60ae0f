//! Row mapping between SQLite tables and vs-core records.
//!
//! The domain records live in vs-core; this module teaches each of them how
//! to build itself from a `rusqlite::Row` through [`FromRow`].

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use vs_core::{Job, JobId, MediaEntry, MediaId, SourceId, WatchProgress};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// helpers
// ---------------------------------------------------------------------------

fn conversion_err<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

/// Parse a UUID-based ID from a text column.
fn parse_id<T: From<Uuid>>(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<T> {
    let s: String = row.get(idx)?;
    let uuid = Uuid::parse_str(&s).map_err(|e| conversion_err(idx, e))?;
    Ok(T::from(uuid))
}

/// Parse an RFC 3339 timestamp column.
fn parse_time(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_err(idx, e))
}

/// Format a timestamp the way [`parse_time`] reads it back.
pub fn format_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339()
}

/// Records that can be built from a result row selected with the matching
/// column list.
pub trait FromRow: Sized {
    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self>;
}

// ---------------------------------------------------------------------------
// IdentityRecord
// ---------------------------------------------------------------------------

/// One row of the identity table: the id bound to a (source, path) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityRecord {
    pub id: MediaId,
    pub source_id: SourceId,
    pub rel_path: String,
}

impl FromRow for IdentityRecord {
    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: MediaId::from(row.get::<_, String>(0)?),
            source_id: SourceId::from(row.get::<_, String>(1)?),
            rel_path: row.get(2)?,
        })
    }
}

// ---------------------------------------------------------------------------
// MediaEntry
// ---------------------------------------------------------------------------

impl FromRow for MediaEntry {
    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        let size: i64 = row.get(4)?;
        Ok(Self {
            id: MediaId::from(row.get::<_, String>(0)?),
            source_id: SourceId::from(row.get::<_, String>(1)?),
            rel_path: row.get(2)?,
            title: row.get(3)?,
            size_bytes: size.max(0) as u64,
            modified_at: parse_time(row, 5)?,
        })
    }
}

// ---------------------------------------------------------------------------
// WatchProgress
// ---------------------------------------------------------------------------

impl FromRow for WatchProgress {
    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            media_id: MediaId::from(row.get::<_, String>(0)?),
            position_secs: row.get(1)?,
            updated_at: parse_time(row, 2)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

impl FromRow for Job {
    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        let status: String = row.get(5)?;
        let params: String = row.get(10)?;
        let attempt: i64 = row.get(11)?;
        Ok(Self {
            id: parse_id::<JobId>(row, 0)?,
            kind: row.get(1)?,
            source_id: SourceId::from(row.get::<_, String>(2)?),
            target_rel_path: row.get(3)?,
            display_name: row.get(4)?,
            status: status.parse().map_err(|e| conversion_err(5, e))?,
            progress_percent: row.get(6)?,
            phase: row.get(7)?,
            error_message: row.get(8)?,
            result_media_id: row.get::<_, Option<String>>(9)?.map(MediaId::from),
            params: serde_json::from_str(&params).unwrap_or(serde_json::Value::Null),
            attempt: attempt.max(0) as u32,
            created_at: parse_time(row, 12)?,
            updated_at: parse_time(row, 13)?,
        })
    }
}
