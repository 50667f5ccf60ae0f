//! Normalized filesystem change events.

use serde::{Deserialize, Serialize};
use vs_core::SourceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Modified,
    Removed,
    /// Old and new name reported as one pair; `new_rel_path` is set.
    Renamed,
}

/// One change under a storage root, with paths relative to that root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub source_id: SourceId,
    pub rel_path: String,
    pub new_rel_path: Option<String>,
}

impl ChangeEvent {
    pub fn created(source_id: SourceId, rel_path: impl Into<String>) -> Self {
        Self::single(ChangeKind::Created, source_id, rel_path)
    }

    pub fn modified(source_id: SourceId, rel_path: impl Into<String>) -> Self {
        Self::single(ChangeKind::Modified, source_id, rel_path)
    }

    pub fn removed(source_id: SourceId, rel_path: impl Into<String>) -> Self {
        Self::single(ChangeKind::Removed, source_id, rel_path)
    }

    pub fn renamed(
        source_id: SourceId,
        from: impl Into<String>,
        to: impl Into<String>,
    ) -> Self {
        Self {
            kind: ChangeKind::Renamed,
            source_id,
            rel_path: from.into(),
            new_rel_path: Some(to.into()),
        }
    }

    /// A rename whose old and new names both arrived.
    pub fn is_paired_rename(&self) -> bool {
        self.kind == ChangeKind::Renamed && self.new_rel_path.is_some()
    }

    fn single(kind: ChangeKind, source_id: SourceId, rel_path: impl Into<String>) -> Self {
        Self {
            kind,
            source_id,
            rel_path: rel_path.into(),
            new_rel_path: None,
        }
    }
}
