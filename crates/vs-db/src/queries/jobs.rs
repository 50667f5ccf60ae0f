//! Job record operations.
//!
//! Every state change is a conditional `UPDATE` on the expected current
//! status, so a transition that lost a race simply affects zero rows and the
//! caller decides what that means. Worker-originated writes additionally
//! match on `attempt` so a disowned worker from an earlier run can never
//! overwrite a restarted job.

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use vs_core::{Error, Job, JobId, JobStatus, MediaId, NewJob, Result};

use crate::models::FromRow;

const COLS: &str = "id, kind, source_id, target_rel_path, display_name, status,
    progress_percent, phase, error_message, result_media_id, params, attempt,
    created_at, updated_at";

fn db_err(e: rusqlite::Error) -> Error {
    Error::database(e.to_string())
}

/// Create a new queued job.
pub fn create_job(conn: &Connection, new: &NewJob) -> Result<Job> {
    let id = JobId::new();
    let now = Utc::now();
    let params = serde_json::to_string(&new.params).map_err(|e| Error::Internal(e.to_string()))?;

    conn.execute(
        "INSERT INTO jobs (id, kind, source_id, target_rel_path, display_name, status,
                           params, attempt, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 'queued', ?6, 0, ?7, ?7)",
        rusqlite::params![
            id.to_string(),
            new.kind,
            new.source_id.as_str(),
            new.target_rel_path,
            new.display_name,
            params,
            now.to_rfc3339(),
        ],
    )
    .map_err(db_err)?;

    Ok(Job {
        id,
        kind: new.kind.clone(),
        source_id: new.source_id.clone(),
        target_rel_path: new.target_rel_path.clone(),
        display_name: new.display_name.clone(),
        status: JobStatus::Queued,
        progress_percent: 0.0,
        phase: None,
        error_message: None,
        result_media_id: None,
        params: new.params.clone(),
        attempt: 0,
        created_at: now,
        updated_at: now,
    })
}

/// Get a job by ID.
pub fn get_job(conn: &Connection, id: JobId) -> Result<Option<Job>> {
    let q = format!("SELECT {COLS} FROM jobs WHERE id = ?1");
    conn.query_row(&q, [id.to_string()], Job::from_row)
        .optional()
        .map_err(db_err)
}

/// List jobs, newest activity first, optionally filtered by kind or status.
pub fn list_jobs(
    conn: &Connection,
    kind: Option<&str>,
    status: Option<JobStatus>,
    limit: u32,
) -> Result<Vec<Job>> {
    let mut q = format!("SELECT {COLS} FROM jobs WHERE 1=1");
    let mut params: Vec<String> = Vec::new();

    if let Some(k) = kind {
        params.push(k.to_string());
        q.push_str(&format!(" AND kind = ?{}", params.len()));
    }
    if let Some(s) = status {
        params.push(s.as_str().to_string());
        q.push_str(&format!(" AND status = ?{}", params.len()));
    }
    q.push_str(&format!(" ORDER BY updated_at DESC, created_at DESC LIMIT {limit}"));

    let mut stmt = conn.prepare(&q).map_err(db_err)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(params.iter()), Job::from_row)
        .map_err(db_err)?;
    rows.collect::<std::result::Result<Vec<_>, _>>()
        .map_err(db_err)
}

/// `queued -> running`. Returns the attempt number that now owns the job.
pub fn mark_running(conn: &Connection, id: JobId) -> Result<Option<u32>> {
    let now = Utc::now().to_rfc3339();
    conn.query_row(
        "UPDATE jobs SET status = 'running', updated_at = ?2
         WHERE id = ?1 AND status = 'queued'
         RETURNING attempt",
        rusqlite::params![id.to_string(), now],
        |row| row.get::<_, i64>(0),
    )
    .optional()
    .map(|a| a.map(|a| a.max(0) as u32))
    .map_err(db_err)
}

/// Persist progress for a running attempt.
pub fn update_progress(
    conn: &Connection,
    id: JobId,
    attempt: u32,
    progress: f64,
    phase: Option<&str>,
) -> Result<bool> {
    let now = Utc::now().to_rfc3339();
    let n = conn
        .execute(
            "UPDATE jobs SET progress_percent = ?3, phase = COALESCE(?4, phase), updated_at = ?5
             WHERE id = ?1 AND attempt = ?2 AND status = 'running'",
            rusqlite::params![id.to_string(), attempt, progress, phase, now],
        )
        .map_err(db_err)?;
    Ok(n > 0)
}

/// Record the name a fetcher discovered for the content.
pub fn set_display_name(conn: &Connection, id: JobId, name: &str) -> Result<()> {
    conn.execute(
        "UPDATE jobs SET display_name = ?2 WHERE id = ?1",
        rusqlite::params![id.to_string(), name],
    )
    .map_err(db_err)?;
    Ok(())
}

/// `running -> done` for the given attempt.
pub fn complete_job(
    conn: &Connection,
    id: JobId,
    attempt: u32,
    result_media_id: Option<&MediaId>,
) -> Result<bool> {
    let now = Utc::now().to_rfc3339();
    let n = conn
        .execute(
            "UPDATE jobs SET status = 'done', progress_percent = 100.0, phase = NULL,
                 error_message = NULL, result_media_id = ?3, updated_at = ?4
             WHERE id = ?1 AND attempt = ?2 AND status = 'running'",
            rusqlite::params![
                id.to_string(),
                attempt,
                result_media_id.map(|m| m.as_str()),
                now
            ],
        )
        .map_err(db_err)?;
    Ok(n > 0)
}

/// `running -> failed` for the given attempt.
pub fn fail_job(conn: &Connection, id: JobId, attempt: u32, error: &str) -> Result<bool> {
    let now = Utc::now().to_rfc3339();
    let n = conn
        .execute(
            "UPDATE jobs SET status = 'failed', error_message = ?3, updated_at = ?4
             WHERE id = ?1 AND attempt = ?2 AND status = 'running'",
            rusqlite::params![id.to_string(), attempt, error, now],
        )
        .map_err(db_err)?;
    Ok(n > 0)
}

/// `queued|running -> stopped`.
pub fn stop_job(conn: &Connection, id: JobId) -> Result<bool> {
    let now = Utc::now().to_rfc3339();
    let n = conn
        .execute(
            "UPDATE jobs SET status = 'stopped', updated_at = ?2
             WHERE id = ?1 AND status IN ('queued', 'running')",
            rusqlite::params![id.to_string(), now],
        )
        .map_err(db_err)?;
    Ok(n > 0)
}

/// `failed|stopped -> queued`, starting a new attempt with a clean slate.
pub fn requeue_job(conn: &Connection, id: JobId) -> Result<Option<Job>> {
    let now = Utc::now().to_rfc3339();
    let q = format!(
        "UPDATE jobs SET status = 'queued', attempt = attempt + 1, progress_percent = 0.0,
             phase = NULL, error_message = NULL, result_media_id = NULL, updated_at = ?2
         WHERE id = ?1 AND status IN ('failed', 'stopped')
         RETURNING {COLS}"
    );
    conn.query_row(&q, rusqlite::params![id.to_string(), now], Job::from_row)
        .optional()
        .map_err(db_err)
}

/// Delete a job. Returns whether it existed.
pub fn delete_job(conn: &Connection, id: JobId) -> Result<bool> {
    let n = conn
        .execute("DELETE FROM jobs WHERE id = ?1", [id.to_string()])
        .map_err(db_err)?;
    Ok(n > 0)
}

/// Fail every job still marked `running`. Used once at startup, when no
/// worker of this process can own them.
pub fn fail_interrupted(conn: &Connection, reason: &str) -> Result<Vec<JobId>> {
    let now = Utc::now().to_rfc3339();
    let mut stmt = conn
        .prepare(
            "UPDATE jobs SET status = 'failed', error_message = ?1, updated_at = ?2
             WHERE status = 'running'
             RETURNING id",
        )
        .map_err(db_err)?;
    let ids = stmt
        .query_map(rusqlite::params![reason, now], |row| row.get::<_, String>(0))
        .map_err(db_err)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(db_err)?;
    ids.iter()
        .map(|s| s.parse::<JobId>().map_err(|e| Error::Internal(e.to_string())))
        .collect()
}

/// Ids of queued jobs, oldest first.
pub fn queued_job_ids(conn: &Connection) -> Result<Vec<JobId>> {
    let mut stmt = conn
        .prepare("SELECT id FROM jobs WHERE status = 'queued' ORDER BY created_at ASC")
        .map_err(db_err)?;
    let ids = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(db_err)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(db_err)?;
    ids.iter()
        .map(|s| s.parse::<JobId>().map_err(|e| Error::Internal(e.to_string())))
        .collect()
}
