//! Embedded SQL migrations and runner.
//!
//! Migrations are stored as `&str` constants and executed in order.  A
//! `schema_migrations` table tracks which versions have been applied.

use rusqlite::Connection;
use vs_core::{Error, Result};

/// V1: initial schema.
const V1_INITIAL: &str = r#"
-- Stable ids per (source, relative path)
CREATE TABLE identities (
    id         TEXT PRIMARY KEY,
    source_id  TEXT NOT NULL,
    rel_path   TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE (source_id, rel_path)
);

-- Catalog
CREATE TABLE media_entries (
    id          TEXT PRIMARY KEY,
    source_id   TEXT NOT NULL,
    rel_path    TEXT NOT NULL,
    title       TEXT NOT NULL,
    size_bytes  INTEGER NOT NULL DEFAULT 0,
    modified_at TEXT NOT NULL,
    UNIQUE (source_id, rel_path)
);

-- Playback position, at most one per entry
CREATE TABLE watch_progress (
    media_id      TEXT PRIMARY KEY REFERENCES media_entries(id) ON DELETE CASCADE,
    position_secs REAL NOT NULL DEFAULT 0.0,
    updated_at    TEXT NOT NULL
);

-- Acquisition jobs
CREATE TABLE jobs (
    id               TEXT PRIMARY KEY,
    kind             TEXT NOT NULL,
    source_id        TEXT NOT NULL,
    target_rel_path  TEXT NOT NULL,
    display_name     TEXT,
    status           TEXT NOT NULL DEFAULT 'queued',
    progress_percent REAL NOT NULL DEFAULT 0.0,
    phase            TEXT,
    error_message    TEXT,
    result_media_id  TEXT,
    params           TEXT NOT NULL DEFAULT 'null',
    attempt          INTEGER NOT NULL DEFAULT 0,
    created_at       TEXT NOT NULL,
    updated_at       TEXT NOT NULL
);

CREATE INDEX idx_media_entries_source ON media_entries(source_id);
CREATE INDEX idx_jobs_status          ON jobs(status);
CREATE INDEX idx_jobs_updated         ON jobs(updated_at);
"#;

/// Ordered list of (version, sql) pairs.
const MIGRATIONS: &[(i64, &str)] = &[(1, V1_INITIAL)];

/// Run all pending migrations on `conn`.
///
/// Creates the `schema_migrations` tracking table if it does not exist,
/// then applies each outstanding migration inside a transaction.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version    INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
    )
    .map_err(|e| Error::database(format!("Failed to create schema_migrations: {e}")))?;

    for &(version, sql) in MIGRATIONS {
        let already: bool = conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM schema_migrations WHERE version = ?1",
                [version],
                |row| row.get(0),
            )
            .map_err(|e| Error::database(e.to_string()))?;

        if already {
            continue;
        }

        let tx = conn
            .unchecked_transaction()
            .map_err(|e| Error::database(e.to_string()))?;

        tx.execute_batch(sql)
            .map_err(|e| Error::database(format!("Migration V{version} failed: {e}")))?;

        tx.execute(
            "INSERT INTO schema_migrations (version) VALUES (?1)",
            [version],
        )
        .map_err(|e| Error::database(e.to_string()))?;

        tx.commit().map_err(|e| Error::database(e.to_string()))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        let applied: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(applied, MIGRATIONS.len() as i64);
    }

    #[test]
    fn test_tables_created() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        for table in ["identities", "media_entries", "watch_progress", "jobs"] {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    [table],
                    |row| row.get(0),
                )
                .unwrap();
            assert_eq!(count, 1, "missing table {table}");
        }
    }
}
