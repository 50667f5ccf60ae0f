//! Identity mapping operations.

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use vs_core::{Error, MediaId, Result, SourceId};

use crate::models::{FromRow, IdentityRecord};

const COLS: &str = "id, source_id, rel_path";

/// Bind `id` to `(source_id, rel_path)`.
pub fn insert_identity(
    conn: &Connection,
    id: &MediaId,
    source_id: &SourceId,
    rel_path: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO identities (id, source_id, rel_path, created_at) VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![id.as_str(), source_id.as_str(), rel_path, Utc::now().to_rfc3339()],
    )
    .map_err(|e| Error::database(e.to_string()))?;
    Ok(())
}

/// Look up the identity bound to a location.
pub fn get_by_path(
    conn: &Connection,
    source_id: &SourceId,
    rel_path: &str,
) -> Result<Option<IdentityRecord>> {
    let q = format!("SELECT {COLS} FROM identities WHERE source_id = ?1 AND rel_path = ?2");
    conn.query_row(&q, [source_id.as_str(), rel_path], IdentityRecord::from_row)
        .optional()
        .map_err(|e| Error::database(e.to_string()))
}

/// Move the identity at the old location to the new one.
///
/// Any stale mapping already sitting at the new location is dropped first.
/// Returns `false` when nothing was bound to the old location.
pub fn reassign(
    conn: &Connection,
    old_source: &SourceId,
    old_rel: &str,
    new_source: &SourceId,
    new_rel: &str,
) -> Result<bool> {
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| Error::database(e.to_string()))?;

    tx.execute(
        "DELETE FROM identities WHERE source_id = ?1 AND rel_path = ?2",
        [new_source.as_str(), new_rel],
    )
    .map_err(|e| Error::database(e.to_string()))?;

    let n = tx
        .execute(
            "UPDATE identities SET source_id = ?3, rel_path = ?4
             WHERE source_id = ?1 AND rel_path = ?2",
            [old_source.as_str(), old_rel, new_source.as_str(), new_rel],
        )
        .map_err(|e| Error::database(e.to_string()))?;

    if n == 0 {
        // Leave the target mapping untouched when the move had no source.
        return Ok(false);
    }

    tx.commit().map_err(|e| Error::database(e.to_string()))?;
    Ok(true)
}

/// Apply many reassignments in one transaction. Pairs with no mapping are
/// skipped. Returns how many were moved.
///
/// Moving rows are parked on a placeholder path first so that a batch may
/// swap locations between its own members.
pub fn reassign_many(
    conn: &Connection,
    moves: &[(SourceId, String, SourceId, String)],
) -> Result<usize> {
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| Error::database(e.to_string()))?;

    let mut parked = Vec::new();
    for (old_source, old_rel, new_source, new_rel) in moves {
        let id: Option<String> = tx
            .query_row(
                "UPDATE identities SET rel_path = '//moving/' || id
                 WHERE source_id = ?1 AND rel_path = ?2
                 RETURNING id",
                [old_source.as_str(), old_rel.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| Error::database(e.to_string()))?;
        if let Some(id) = id {
            parked.push((id, new_source, new_rel));
        }
    }

    for (id, new_source, new_rel) in &parked {
        tx.execute(
            "DELETE FROM identities WHERE source_id = ?1 AND rel_path = ?2",
            [new_source.as_str(), new_rel.as_str()],
        )
        .map_err(|e| Error::database(e.to_string()))?;
        tx.execute(
            "UPDATE identities SET source_id = ?2, rel_path = ?3 WHERE id = ?1",
            [id.as_str(), new_source.as_str(), new_rel.as_str()],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    }

    tx.commit().map_err(|e| Error::database(e.to_string()))?;
    Ok(parked.len())
}

/// Forget the identity bound to a location. Returns whether one existed.
pub fn delete_by_path(conn: &Connection, source_id: &SourceId, rel_path: &str) -> Result<bool> {
    let n = conn
        .execute(
            "DELETE FROM identities WHERE source_id = ?1 AND rel_path = ?2",
            [source_id.as_str(), rel_path],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}

/// Every mapping, used to hydrate the in-memory image at startup.
pub fn list_all(conn: &Connection) -> Result<Vec<IdentityRecord>> {
    let q = format!("SELECT {COLS} FROM identities ORDER BY source_id, rel_path");
    let mut stmt = conn.prepare(&q).map_err(|e| Error::database(e.to_string()))?;
    let rows = stmt
        .query_map([], IdentityRecord::from_row)
        .map_err(|e| Error::database(e.to_string()))?;
    rows.collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::database(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{get_conn, init_memory_pool};

    #[test]
    fn insert_and_lookup() {
        let pool = init_memory_pool().unwrap();
        let conn = get_conn(&pool).unwrap();
        let src = SourceId::from("movies");
        let id = MediaId::derive(&src, "a.mp4");

        insert_identity(&conn, &id, &src, "a.mp4").unwrap();
        let rec = get_by_path(&conn, &src, "a.mp4").unwrap().unwrap();
        assert_eq!(rec.id, id);
        assert!(get_by_path(&conn, &src, "b.mp4").unwrap().is_none());
    }

    #[test]
    fn duplicate_location_rejected() {
        let pool = init_memory_pool().unwrap();
        let conn = get_conn(&pool).unwrap();
        let src = SourceId::from("movies");

        insert_identity(&conn, &MediaId::from("aaaa"), &src, "a.mp4").unwrap();
        assert!(insert_identity(&conn, &MediaId::from("bbbb"), &src, "a.mp4").is_err());
    }

    #[test]
    fn reassign_moves_mapping() {
        let pool = init_memory_pool().unwrap();
        let conn = get_conn(&pool).unwrap();
        let s1 = SourceId::from("movies");
        let s2 = SourceId::from("shows");
        let id = MediaId::from("0123456789abcdef");
        insert_identity(&conn, &id, &s1, "old.mp4").unwrap();

        assert!(reassign(&conn, &s1, "old.mp4", &s2, "a/b.mp4").unwrap());
        assert!(get_by_path(&conn, &s1, "old.mp4").unwrap().is_none());
        assert_eq!(get_by_path(&conn, &s2, "a/b.mp4").unwrap().unwrap().id, id);
    }

    #[test]
    fn reassign_missing_returns_false() {
        let pool = init_memory_pool().unwrap();
        let conn = get_conn(&pool).unwrap();
        let src = SourceId::from("movies");
        let stale = MediaId::from("stale");
        insert_identity(&conn, &stale, &src, "b.mp4").unwrap();

        assert!(!reassign(&conn, &src, "nope.mp4", &src, "b.mp4").unwrap());
        // Rolled back: the mapping at the target survives.
        assert_eq!(get_by_path(&conn, &src, "b.mp4").unwrap().unwrap().id, stale);
    }

    #[test]
    fn reassign_many_and_delete() {
        let pool = init_memory_pool().unwrap();
        let conn = get_conn(&pool).unwrap();
        let src = SourceId::from("movies");
        insert_identity(&conn, &MediaId::from("1"), &src, "d/x.mp4").unwrap();
        insert_identity(&conn, &MediaId::from("2"), &src, "d/y.mp4").unwrap();

        let moved = reassign_many(
            &conn,
            &[
                (src.clone(), "d/x.mp4".into(), src.clone(), "e/x.mp4".into()),
                (src.clone(), "d/y.mp4".into(), src.clone(), "e/y.mp4".into()),
                (src.clone(), "d/z.mp4".into(), src.clone(), "e/z.mp4".into()),
            ],
        )
        .unwrap();
        assert_eq!(moved, 2);

        assert!(delete_by_path(&conn, &src, "e/x.mp4").unwrap());
        assert!(!delete_by_path(&conn, &src, "e/x.mp4").unwrap());
        assert_eq!(list_all(&conn).unwrap().len(), 1);
    }

    #[test]
    fn reassign_many_can_swap() {
        let pool = init_memory_pool().unwrap();
        let conn = get_conn(&pool).unwrap();
        let src = SourceId::from("movies");
        insert_identity(&conn, &MediaId::from("1"), &src, "a.mp4").unwrap();
        insert_identity(&conn, &MediaId::from("2"), &src, "b.mp4").unwrap();

        reassign_many(
            &conn,
            &[
                (src.clone(), "a.mp4".into(), src.clone(), "b.mp4".into()),
                (src.clone(), "b.mp4".into(), src.clone(), "a.mp4".into()),
            ],
        )
        .unwrap();
        assert_eq!(get_by_path(&conn, &src, "a.mp4").unwrap().unwrap().id, MediaId::from("2"));
        assert_eq!(get_by_path(&conn, &src, "b.mp4").unwrap().unwrap().id, MediaId::from("1"));
    }
}
