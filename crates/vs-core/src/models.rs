//! Domain records shared between the catalog, the job orchestrator and the
//! persistence layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::ids::{JobId, MediaId, SourceId};
use crate::Error;

// ---------------------------------------------------------------------------
// StorageSource
// ---------------------------------------------------------------------------

/// A configured root directory acting as one browsable media collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageSource {
    pub id: SourceId,
    /// Display name; falls back to the id when left empty.
    #[serde(default)]
    pub label: String,
    pub root_path: PathBuf,
}

impl StorageSource {
    pub fn display_label(&self) -> &str {
        if self.label.trim().is_empty() {
            self.id.as_str()
        } else {
            &self.label
        }
    }
}

// ---------------------------------------------------------------------------
// MediaEntry
// ---------------------------------------------------------------------------

/// A catalog record for one discovered media file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaEntry {
    pub id: MediaId,
    pub source_id: SourceId,
    /// Normalized POSIX-style path relative to the source root.
    pub rel_path: String,
    pub title: String,
    pub size_bytes: u64,
    pub modified_at: DateTime<Utc>,
}

impl MediaEntry {
    /// Whether `other` describes the same file content at the same location.
    pub fn same_content(&self, other: &MediaEntry) -> bool {
        self.source_id == other.source_id
            && self.rel_path == other.rel_path
            && self.title == other.title
            && self.size_bytes == other.size_bytes
            && self.modified_at == other.modified_at
    }
}

/// Title shown for a file: its stem, or the whole name if it has none.
pub fn title_from_rel_path(rel_path: &str) -> String {
    let name = rel_path.rsplit('/').next().unwrap_or(rel_path);
    match name.rfind('.') {
        Some(idx) if idx > 0 => name[..idx].to_string(),
        _ => name.to_string(),
    }
}

// ---------------------------------------------------------------------------
// WatchProgress
// ---------------------------------------------------------------------------

/// Last reported playback position for a media entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchProgress {
    pub media_id: MediaId,
    pub position_secs: f64,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// Lifecycle state of an acquisition job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Failed,
    Stopped,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
            JobStatus::Stopped => "stopped",
        }
    }

    /// `done`, `failed` and `stopped` end an attempt.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed | JobStatus::Stopped)
    }

    /// Whether an explicit restart may move the job back to `queued`.
    pub fn is_restartable(&self) -> bool {
        matches!(self, JobStatus::Failed | JobStatus::Stopped)
    }

    /// Legal edges of the job state machine.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Stopped)
                | (Running, Done)
                | (Running, Failed)
                | (Running, Stopped)
                | (Stopped, Queued)
                | (Failed, Queued)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "done" => Ok(JobStatus::Done),
            "failed" => Ok(JobStatus::Failed),
            "stopped" => Ok(JobStatus::Stopped),
            other => Err(Error::Validation(format!("unknown job status '{other}'"))),
        }
    }
}

/// One acquisition task tracked through its lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Fetcher kind that executes this job (e.g. `http`, `ytdlp`).
    pub kind: String,
    pub source_id: SourceId,
    pub target_rel_path: String,
    pub display_name: Option<String>,
    pub status: JobStatus,
    pub progress_percent: f64,
    /// Human-readable phase reported alongside progress.
    pub phase: Option<String>,
    pub error_message: Option<String>,
    pub result_media_id: Option<MediaId>,
    /// Kind-specific parameters handed to the fetcher verbatim.
    pub params: serde_json::Value,
    /// Incremented on every restart; stale workers compare against it.
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Parameters accepted by the orchestrator when a job is submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub kind: String,
    pub source_id: SourceId,
    pub target_rel_path: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_is_file_stem() {
        assert_eq!(title_from_rel_path("a/b/Movie.Name.2020.mkv"), "Movie.Name.2020");
        assert_eq!(title_from_rel_path("clip.mp4"), "clip");
        assert_eq!(title_from_rel_path("dir/.hidden"), ".hidden");
        assert_eq!(title_from_rel_path("noext"), "noext");
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Done,
            JobStatus::Failed,
            JobStatus::Stopped,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("downloading".parse::<JobStatus>().is_err());
    }

    #[test]
    fn done_is_not_reenterable() {
        assert!(!JobStatus::Done.can_transition_to(JobStatus::Queued));
        assert!(!JobStatus::Done.is_restartable());
    }

    #[test]
    fn stopped_and_failed_can_restart() {
        assert!(JobStatus::Stopped.can_transition_to(JobStatus::Queued));
        assert!(JobStatus::Failed.can_transition_to(JobStatus::Queued));
        assert!(!JobStatus::Running.can_transition_to(JobStatus::Queued));
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&JobStatus::Running).unwrap();
        assert_eq!(json, "\"running\"");
    }
}
