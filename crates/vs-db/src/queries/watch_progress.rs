//! Playback position operations.

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use vs_core::{Error, MediaId, Result, WatchProgress};

use crate::models::FromRow;

/// Get the stored position for an entry, if one was ever reported.
pub fn get_progress(conn: &Connection, media_id: &MediaId) -> Result<Option<WatchProgress>> {
    conn.query_row(
        "SELECT media_id, position_secs, updated_at FROM watch_progress WHERE media_id = ?1",
        [media_id.as_str()],
        WatchProgress::from_row,
    )
    .optional()
    .map_err(|e| Error::database(e.to_string()))
}

/// Every stored position, for joining onto catalog listings.
pub fn list_progress(conn: &Connection) -> Result<Vec<WatchProgress>> {
    let mut stmt = conn
        .prepare("SELECT media_id, position_secs, updated_at FROM watch_progress")
        .map_err(|e| Error::database(e.to_string()))?;
    let rows = stmt
        .query_map([], WatchProgress::from_row)
        .map_err(|e| Error::database(e.to_string()))?;
    rows.collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::database(e.to_string()))
}

/// Create or overwrite the position for an entry.
pub fn set_progress(
    conn: &Connection,
    media_id: &MediaId,
    position_secs: f64,
) -> Result<WatchProgress> {
    let now = Utc::now();
    conn.execute(
        "INSERT INTO watch_progress (media_id, position_secs, updated_at)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(media_id) DO UPDATE SET
            position_secs = excluded.position_secs,
            updated_at = excluded.updated_at",
        rusqlite::params![media_id.as_str(), position_secs, now.to_rfc3339()],
    )
    .map_err(|e| Error::database(e.to_string()))?;

    Ok(WatchProgress {
        media_id: media_id.clone(),
        position_secs,
        updated_at: now,
    })
}
