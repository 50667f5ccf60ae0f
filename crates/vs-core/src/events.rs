//! Application event system.
//!
//! [`EventBus`] wraps a `tokio::sync::broadcast` channel. Subscribers only
//! see events broadcast after they subscribed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::ids::{JobId, MediaId, SourceId};
use crate::models::JobStatus;

// ---------------------------------------------------------------------------
// EventPayload
// ---------------------------------------------------------------------------

/// Payload describing what happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    // -- Job lifecycle -------------------------------------------------------
    JobQueued {
        job_id: JobId,
        kind: String,
    },
    JobStarted {
        job_id: JobId,
    },
    JobProgress {
        job_id: JobId,
        progress: f64,
        phase: Option<String>,
    },
    JobCompleted {
        job_id: JobId,
        media_id: Option<MediaId>,
    },
    JobFailed {
        job_id: JobId,
        error: String,
    },
    JobStopped {
        job_id: JobId,
    },
    JobDeleted {
        job_id: JobId,
    },

    // -- Catalog -------------------------------------------------------------
    EntryAdded {
        media_id: MediaId,
        source_id: SourceId,
        rel_path: String,
    },
    EntryUpdated {
        media_id: MediaId,
    },
    EntryRemoved {
        media_id: MediaId,
    },
    EntryMoved {
        media_id: MediaId,
        source_id: SourceId,
        rel_path: String,
    },

    // -- Reconciliation ------------------------------------------------------
    RescanStarted {
        source_id: SourceId,
    },
    RescanCompleted {
        source_id: SourceId,
        added: u64,
        updated: u64,
        removed: u64,
    },
    RescanFailed {
        source_id: SourceId,
        message: String,
    },
    WatcherDegraded {
        source_id: SourceId,
        reason: String,
    },
}

impl EventPayload {
    /// Status a job reached, for payloads that describe a transition.
    pub fn job_status(&self) -> Option<(JobId, JobStatus)> {
        match self {
            EventPayload::JobQueued { job_id, .. } => Some((*job_id, JobStatus::Queued)),
            EventPayload::JobStarted { job_id } => Some((*job_id, JobStatus::Running)),
            EventPayload::JobCompleted { job_id, .. } => Some((*job_id, JobStatus::Done)),
            EventPayload::JobFailed { job_id, .. } => Some((*job_id, JobStatus::Failed)),
            EventPayload::JobStopped { job_id } => Some((*job_id, JobStatus::Stopped)),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// A timestamped event ready for broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

impl Event {
    /// Create a new event with a fresh UUID and the current timestamp.
    pub fn new(payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            payload,
        }
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Broadcast channel for application events.
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a new event bus. `capacity` bounds how far a subscriber may
    /// fall behind before it starts missing events.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to the broadcast channel.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Broadcast an event to all current subscribers.
    pub fn broadcast(&self, payload: EventPayload) {
        // Ignore send errors (no subscribers).
        let _ = self.tx.send(Event::new(payload));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.tx.receiver_count())
            .finish_non_exhaustive()
    }
}
