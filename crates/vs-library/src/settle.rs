//! Per-path debounce of change events.
//!
//! Paths are recorded with the time they were last touched and only handed
//! out once they have been quiet for the whole window. A burst of writes to
//! one file, or a delete immediately followed by a re-create, therefore
//! collapses into a single reconciliation of whatever is on disk afterwards.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use vs_core::paths::is_under;
use vs_core::SourceId;

use crate::change::ChangeKind;

#[derive(Debug, Clone, Copy)]
struct Pending {
    kind: ChangeKind,
    last_seen: Instant,
}

/// A path whose quiet period has elapsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettledPath {
    pub source_id: SourceId,
    pub rel_path: String,
    /// The most recent kind of change seen for the path.
    pub last_kind: ChangeKind,
}

#[derive(Debug)]
pub struct SettleTracker {
    window: Duration,
    pending: HashMap<(SourceId, String), Pending>,
}

impl SettleTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: HashMap::new(),
        }
    }

    /// Record (or refresh) a change for a path.
    pub fn record(&mut self, source_id: SourceId, rel_path: String, kind: ChangeKind, now: Instant) {
        self.pending.insert(
            (source_id, rel_path),
            Pending {
                kind,
                last_seen: now,
            },
        );
    }

    /// Remove and return every path quiet since at least `now - window`.
    pub fn take_settled(&mut self, now: Instant) -> Vec<SettledPath> {
        let window = self.window;
        let mut settled = Vec::new();
        self.pending.retain(|(source_id, rel_path), p| {
            if now.saturating_duration_since(p.last_seen) >= window {
                settled.push(SettledPath {
                    source_id: source_id.clone(),
                    rel_path: rel_path.clone(),
                    last_kind: p.kind,
                });
                false
            } else {
                true
            }
        });
        settled.sort_by(|a, b| {
            a.source_id
                .cmp(&b.source_id)
                .then_with(|| a.rel_path.cmp(&b.rel_path))
        });
        settled
    }

    /// Paths at or under `prefix` that are still inside their window.
    pub fn unsettled_under(&self, source_id: &SourceId, prefix: &str) -> HashSet<String> {
        self.pending
            .keys()
            .filter(|(s, p)| s == source_id && is_under(p, prefix))
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
