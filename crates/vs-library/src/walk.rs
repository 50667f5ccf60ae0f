//! Blocking directory walks that collect media files under a storage root.
//!
//! These run inside `spawn_blocking`; callers translate the result into
//! catalog mutations.

use std::collections::HashSet;
use std::fs::Metadata;
use std::io;
use std::path::Path;

use chrono::{DateTime, Utc};
use vs_core::paths::{extension_of, rel_path_of, resolve_under};

/// A media file seen on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct ScannedFile {
    pub rel_path: String,
    pub size_bytes: u64,
    pub modified_at: DateTime<Utc>,
}

/// Files found by a walk plus the number of entries that could not be read.
///
/// A walk with errors saw only part of the tree, so callers must not treat
/// paths it missed as deleted.
#[derive(Debug, Default)]
pub struct WalkResult {
    pub files: Vec<ScannedFile>,
    pub errors: usize,
}

/// Filter deciding which file names count as media.
#[derive(Debug, Clone)]
pub struct MediaFilter {
    extensions: HashSet<String>,
    ignore_suffixes: Vec<String>,
}

impl MediaFilter {
    pub fn new(extensions: HashSet<String>, ignore_suffixes: Vec<String>) -> Self {
        Self {
            extensions,
            ignore_suffixes,
        }
    }

    pub fn is_ignored(&self, rel_path: &str) -> bool {
        let name = rel_path.rsplit('/').next().unwrap_or(rel_path);
        self.ignore_suffixes.iter().any(|s| name.ends_with(s.as_str()))
    }

    pub fn matches(&self, rel_path: &str) -> bool {
        if self.is_ignored(rel_path) {
            return false;
        }
        extension_of(rel_path).is_some_and(|ext| self.extensions.contains(&ext))
    }
}

/// Size and mtime with best-effort defaults when the metadata is unusable.
pub fn scanned_from_metadata(rel_path: String, meta: Option<&Metadata>) -> ScannedFile {
    let size_bytes = meta.map(|m| m.len()).unwrap_or(0);
    let modified_at = meta
        .and_then(|m| m.modified().ok())
        .map(DateTime::<Utc>::from)
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
    ScannedFile {
        rel_path,
        size_bytes,
        modified_at,
    }
}

/// Walk `root/start_rel` (the whole root when `start_rel` is empty) and
/// collect matching files.
///
/// Fails only when the starting directory itself cannot be read; problems
/// deeper in the tree are logged and counted in [`WalkResult::errors`].
pub fn walk_media(root: &Path, start_rel: &str, filter: &MediaFilter) -> io::Result<WalkResult> {
    let start = resolve_under(root, start_rel);
    let meta = std::fs::metadata(&start)?;
    if !meta.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} is not a directory", start.display()),
        ));
    }
    // Surface permission problems on the start directory as a hard failure.
    std::fs::read_dir(&start)?;

    let mut result = WalkResult::default();
    for entry in walkdir::WalkDir::new(&start).follow_links(true) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!(root = %root.display(), error = %err, "Error walking directory");
                result.errors += 1;
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(rel_path) = rel_path_of(root, entry.path()) else {
            continue;
        };
        if !filter.matches(&rel_path) {
            continue;
        }
        let meta = entry.metadata().ok();
        result
            .files
            .push(scanned_from_metadata(rel_path, meta.as_ref()));
    }

    result.files.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
    Ok(result)
}
