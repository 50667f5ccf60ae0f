//! Catalog entry persistence.

use rusqlite::{Connection, OptionalExtension};
use vs_core::{Error, MediaEntry, MediaId, Result, SourceId};

use crate::models::{format_time, FromRow};

const COLS: &str = "id, source_id, rel_path, title, size_bytes, modified_at";

/// Insert or overwrite an entry by id.
pub fn upsert_entry(conn: &Connection, entry: &MediaEntry) -> Result<()> {
    conn.execute(
        "INSERT INTO media_entries (id, source_id, rel_path, title, size_bytes, modified_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(id) DO UPDATE SET
            source_id = excluded.source_id,
            rel_path = excluded.rel_path,
            title = excluded.title,
            size_bytes = excluded.size_bytes,
            modified_at = excluded.modified_at",
        rusqlite::params![
            entry.id.as_str(),
            entry.source_id.as_str(),
            entry.rel_path,
            entry.title,
            entry.size_bytes as i64,
            format_time(&entry.modified_at),
        ],
    )
    .map_err(|e| Error::database(e.to_string()))?;
    Ok(())
}

/// Get an entry by id.
pub fn get_entry(conn: &Connection, id: &MediaId) -> Result<Option<MediaEntry>> {
    let q = format!("SELECT {COLS} FROM media_entries WHERE id = ?1");
    conn.query_row(&q, [id.as_str()], MediaEntry::from_row)
        .optional()
        .map_err(|e| Error::database(e.to_string()))
}

/// Delete entries by id in one transaction. Their watch progress goes with
/// them through the foreign key cascade.
pub fn delete_entries(conn: &Connection, ids: &[MediaId]) -> Result<usize> {
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| Error::database(e.to_string()))?;
    let mut n = 0;
    for id in ids {
        n += tx
            .execute("DELETE FROM media_entries WHERE id = ?1", [id.as_str()])
            .map_err(|e| Error::database(e.to_string()))?;
    }
    tx.commit().map_err(|e| Error::database(e.to_string()))?;
    Ok(n)
}

/// Write a batch of relocated entries in one transaction.
///
/// Rows are first parked on a unique placeholder path so that swaps inside
/// the batch cannot trip the `(source_id, rel_path)` constraint.
pub fn relocate_entries(conn: &Connection, entries: &[MediaEntry]) -> Result<()> {
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| Error::database(e.to_string()))?;
    for entry in entries {
        tx.execute(
            "UPDATE media_entries SET rel_path = '//relocating/' || id WHERE id = ?1",
            [entry.id.as_str()],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    }
    for entry in entries {
        tx.execute(
            "UPDATE media_entries SET source_id = ?2, rel_path = ?3, title = ?4
             WHERE id = ?1",
            rusqlite::params![
                entry.id.as_str(),
                entry.source_id.as_str(),
                entry.rel_path,
                entry.title,
            ],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    }
    tx.commit().map_err(|e| Error::database(e.to_string()))?;
    Ok(())
}

/// List entries, optionally for one source, ordered by path.
pub fn list_entries(conn: &Connection, source_id: Option<&SourceId>) -> Result<Vec<MediaEntry>> {
    let (q, params): (String, Vec<&str>) = match source_id {
        Some(s) => (
            format!("SELECT {COLS} FROM media_entries WHERE source_id = ?1 ORDER BY rel_path"),
            vec![s.as_str()],
        ),
        None => (
            format!("SELECT {COLS} FROM media_entries ORDER BY source_id, rel_path"),
            vec![],
        ),
    };
    let mut stmt = conn.prepare(&q).map_err(|e| Error::database(e.to_string()))?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(params), MediaEntry::from_row)
        .map_err(|e| Error::database(e.to_string()))?;
    rows.collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::database(e.to_string()))
}
