//! User-driven library operations: moves, deletes, folders, browsing and
//! watch progress.
//!
//! Every operation that touches the filesystem holds the mutex of each
//! source it writes to, so it cannot race a rescan or a settled change on
//! the same root.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use vs_core::events::EventPayload;
use vs_core::paths::{is_under, normalize_rel_dir, normalize_rel_path, rebase, resolve_under};
use vs_core::{Error, MediaEntry, MediaId, Result, SourceId, WatchProgress};
use vs_db::pool::get_conn;
use vs_db::queries::watch_progress;

use crate::indexer::Library;
use crate::transcode::{can_play_directly, ConvertOutcome, Transcoder};

/// A catalog entry joined with its playback state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LibraryItem {
    #[serde(flatten)]
    pub entry: MediaEntry,
    pub position_secs: f64,
    pub can_play_directly: bool,
}

/// One row of a directory listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BrowseItem {
    pub name: String,
    pub rel_path: String,
    pub is_dir: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    /// The catalog entry for an indexed file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry: Option<MediaEntry>,
}

impl Library {
    /// Entries (optionally of one source) with their saved positions.
    pub fn list_items(&self, source_id: Option<&SourceId>) -> Result<Vec<LibraryItem>> {
        let entries = self.catalog().list(source_id);
        let conn = get_conn(&self.db)?;
        let positions: HashMap<MediaId, f64> = watch_progress::list_progress(&conn)?
            .into_iter()
            .map(|p| (p.media_id, p.position_secs))
            .collect();

        Ok(entries
            .into_iter()
            .map(|entry| LibraryItem {
                position_secs: positions.get(&entry.id).copied().unwrap_or(0.0),
                can_play_directly: can_play_directly(&entry.rel_path),
                entry,
            })
            .collect())
    }

    // -- moves --------------------------------------------------------------

    /// Move a media file to another path (possibly in another source),
    /// keeping its id.
    pub async fn move_media(
        &self,
        id: &MediaId,
        target_source: &SourceId,
        target_rel: &str,
    ) -> Result<MediaEntry> {
        let target_rel = normalize_rel_path(target_rel)?;
        if !self.filter().matches(&target_rel) {
            return Err(Error::Validation(format!(
                "'{target_rel}' does not have a media extension"
            )));
        }
        let target = self.source(target_source)?;

        loop {
            let entry = self
                .catalog()
                .find(id)
                .ok_or_else(|| Error::not_found("media entry", id))?;
            let _guards = self.lock_pair(&entry.source_id, target_source).await;

            // The entry may have moved while we waited for the locks.
            let Some(current) = self.catalog().find(id) else {
                return Err(Error::not_found("media entry", id));
            };
            if current.source_id != entry.source_id {
                continue;
            }
            if current.source_id == *target_source && current.rel_path == target_rel {
                return Ok(current);
            }

            let origin = self.source(&current.source_id)?;
            let from = resolve_under(&origin.root_path, &current.rel_path);
            let to = resolve_under(&target.root_path, &target_rel);

            if self.catalog().find_by_path(target_source, &target_rel).is_some()
                || tokio::fs::try_exists(&to).await?
            {
                return Err(Error::Conflict(format!(
                    "{target_source}/{target_rel} already exists"
                )));
            }
            if !tokio::fs::try_exists(&from).await? {
                return Err(Error::not_found(
                    "media file",
                    format!("{}/{}", current.source_id, current.rel_path),
                ));
            }

            if let Some(parent) = to.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            move_on_disk(&from, &to).await?;

            self.identities().reassign(
                &current.source_id,
                &current.rel_path,
                target_source,
                &target_rel,
            )?;
            let moved = self
                .catalog()
                .relocate(&[(current.id.clone(), target_source.clone(), target_rel.clone())])?
                .into_iter()
                .next()
                .ok_or_else(|| Error::not_found("media entry", id))?;

            tracing::info!(
                media_id = %moved.id,
                from = %format!("{}/{}", current.source_id, current.rel_path),
                to = %format!("{}/{}", moved.source_id, moved.rel_path),
                "Media moved"
            );
            self.events.broadcast(EventPayload::EntryMoved {
                media_id: moved.id.clone(),
                source_id: moved.source_id.clone(),
                rel_path: moved.rel_path.clone(),
            });
            return Ok(moved);
        }
    }

    /// Move a directory and keep the ids of every entry inside it.
    pub async fn move_folder(
        &self,
        source_id: &SourceId,
        folder: &str,
        target_source: &SourceId,
        target_folder: &str,
    ) -> Result<Vec<MediaEntry>> {
        let folder = normalize_rel_path(folder)?;
        let target_folder = normalize_rel_path(target_folder)?;
        if source_id == target_source && is_under(&target_folder, &folder) {
            return Err(Error::Validation(format!(
                "cannot move '{folder}' into itself"
            )));
        }
        let origin = self.source(source_id)?;
        let target = self.source(target_source)?;

        let _guards = self.lock_pair(source_id, target_source).await;
        let from = resolve_under(&origin.root_path, &folder);
        let to = resolve_under(&target.root_path, &target_folder);

        match tokio::fs::metadata(&from).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(Error::Validation(format!(
                    "{source_id}/{folder} is not a folder"
                )))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::not_found("folder", format!("{source_id}/{folder}")))
            }
            Err(e) => return Err(e.into()),
        }
        if tokio::fs::try_exists(&to).await? {
            return Err(Error::Conflict(format!(
                "{target_source}/{target_folder} already exists"
            )));
        }

        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        move_on_disk(&from, &to).await?;

        // Nothing exists at the target on disk, so anything catalogued there
        // is stale.
        self.remove_subtree(target_source, &target_folder)?;

        let moving = self.catalog().entries_under(source_id, &folder);
        let identity_moves: Vec<_> = moving
            .iter()
            .filter_map(|e| {
                rebase(&e.rel_path, &folder, &target_folder).map(|new_rel| {
                    (
                        source_id.clone(),
                        e.rel_path.clone(),
                        target_source.clone(),
                        new_rel,
                    )
                })
            })
            .collect();
        self.identities().reassign_many(&identity_moves)?;
        let moved =
            self.catalog()
                .relocate_prefix(source_id, &folder, target_source, &target_folder)?;

        tracing::info!(
            from = %format!("{source_id}/{folder}"),
            to = %format!("{target_source}/{target_folder}"),
            entries = moved.len(),
            "Folder moved"
        );
        for entry in &moved {
            self.events.broadcast(EventPayload::EntryMoved {
                media_id: entry.id.clone(),
                source_id: entry.source_id.clone(),
                rel_path: entry.rel_path.clone(),
            });
        }
        Ok(moved)
    }

    // -- deletes and folders --------------------------------------------------

    /// Unlink a media file and forget its entry, identity and progress.
    pub async fn delete_media(&self, id: &MediaId) -> Result<MediaEntry> {
        loop {
            let entry = self
                .catalog()
                .find(id)
                .ok_or_else(|| Error::not_found("media entry", id))?;
            let _guard = self.lock_source(&entry.source_id).await;
            let Some(current) = self.catalog().find(id) else {
                return Err(Error::not_found("media entry", id));
            };
            if current.source_id != entry.source_id {
                continue;
            }

            let source = self.source(&current.source_id)?;
            let abs = resolve_under(&source.root_path, &current.rel_path);
            match tokio::fs::remove_file(&abs).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            self.remove_entry(&current.source_id, &current.rel_path)?;
            tracing::info!(media_id = %current.id, rel_path = %current.rel_path, "Media deleted");
            return Ok(current);
        }
    }

    /// Delete a file or a whole directory. Returns how many catalog entries
    /// went with it; a path that is already gone is not an error.
    pub async fn delete_path(&self, source_id: &SourceId, rel_path: &str) -> Result<usize> {
        let rel_path = normalize_rel_path(rel_path)?;
        let source = self.source(source_id)?;
        let _guard = self.lock_source(source_id).await;
        let abs = resolve_under(&source.root_path, &rel_path);

        match tokio::fs::metadata(&abs).await {
            Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(&abs).await?,
            Ok(_) => tokio::fs::remove_file(&abs).await?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let removed = self.remove_subtree(source_id, &rel_path)?.len();
        tracing::info!(source_id = %source_id, rel_path, removed, "Path deleted");
        Ok(removed)
    }

    /// Create a directory (and its parents). Existing directories are fine.
    pub async fn create_folder(&self, source_id: &SourceId, rel_path: &str) -> Result<()> {
        let rel_path = normalize_rel_path(rel_path)?;
        let source = self.source(source_id)?;
        let abs = resolve_under(&source.root_path, &rel_path);

        match tokio::fs::metadata(&abs).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(Error::Conflict(format!(
                "{source_id}/{rel_path} exists and is not a folder"
            ))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tokio::fs::create_dir_all(&abs).await?;
                tracing::debug!(source_id = %source_id, rel_path, "Folder created");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// List the immediate children of a directory, folders first.
    pub async fn browse(&self, source_id: &SourceId, rel_dir: &str) -> Result<Vec<BrowseItem>> {
        let rel_dir = normalize_rel_dir(rel_dir)?;
        let source = self.source(source_id)?;
        let abs = resolve_under(&source.root_path, &rel_dir);

        let mut dir = match tokio::fs::read_dir(&abs).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::not_found("folder", format!("{source_id}/{rel_dir}")))
            }
            Err(e) => return Err(Error::source_io(source_id, format!("{rel_dir}: {e}"))),
        };

        let mut items = Vec::new();
        while let Some(child) = dir.next_entry().await? {
            let name = child.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            let rel_path = if rel_dir.is_empty() {
                name.clone()
            } else {
                format!("{rel_dir}/{name}")
            };
            // Follow symlinks like the walker does.
            let meta = match tokio::fs::metadata(child.path()).await {
                Ok(meta) => meta,
                Err(e) => {
                    tracing::debug!(path = %child.path().display(), error = %e, "Skipping unreadable entry");
                    continue;
                }
            };

            if meta.is_dir() {
                items.push(BrowseItem {
                    name,
                    rel_path,
                    is_dir: true,
                    size_bytes: None,
                    entry: None,
                });
            } else {
                let entry = self.catalog().find_by_path(source_id, &rel_path);
                items.push(BrowseItem {
                    name,
                    rel_path,
                    is_dir: false,
                    size_bytes: Some(meta.len()),
                    entry,
                });
            }
        }

        items.sort_by(|a, b| {
            b.is_dir
                .cmp(&a.is_dir)
                .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
        });
        Ok(items)
    }

    // -- watch progress -------------------------------------------------------

    /// Saved playback position in seconds; 0 when nothing was saved.
    pub fn get_progress(&self, id: &MediaId) -> Result<f64> {
        if self.catalog().find(id).is_none() {
            return Err(Error::not_found("media entry", id));
        }
        let conn = get_conn(&self.db)?;
        Ok(watch_progress::get_progress(&conn, id)?
            .map(|p| p.position_secs)
            .unwrap_or(0.0))
    }

    pub fn set_progress(&self, id: &MediaId, position_secs: f64) -> Result<WatchProgress> {
        if position_secs.is_nan() {
            return Err(Error::Validation("position must be a number".into()));
        }
        if self.catalog().find(id).is_none() {
            return Err(Error::not_found("media entry", id));
        }
        let conn = get_conn(&self.db)?;
        watch_progress::set_progress(&conn, id, position_secs.max(0.0))
    }

    // -- conversion -----------------------------------------------------------

    /// Produce a browser-playable copy of an entry and index it.
    pub async fn convert_media(
        &self,
        id: &MediaId,
        transcoder: &dyn Transcoder,
    ) -> Result<ConvertOutcome> {
        let entry = self
            .catalog()
            .find(id)
            .ok_or_else(|| Error::not_found("media entry", id))?;
        let source = self.source(&entry.source_id)?;
        let input = resolve_under(&source.root_path, &entry.rel_path);

        let outcome = transcoder.convert(&input).await?;
        if let Err(e) = self.ingest_path(&entry.source_id, &outcome.output_path).await {
            // The watcher or the next rescan will pick it up.
            tracing::warn!(
                media_id = %id,
                output = %outcome.output_path.display(),
                error = %e,
                "Failed to index converted file"
            );
        }
        Ok(outcome)
    }
}

/// Rename, falling back to copy-then-remove across filesystems.
async fn move_on_disk(from: &Path, to: &Path) -> Result<()> {
    match tokio::fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(e) if crosses_devices(&e) => {
            let (from, to): (PathBuf, PathBuf) = (from.to_path_buf(), to.to_path_buf());
            tokio::task::spawn_blocking(move || copy_then_remove(&from, &to))
                .await
                .map_err(|e| Error::Internal(format!("spawn_blocking join error: {e}")))?
                .map_err(Error::from)
        }
        Err(e) => Err(e.into()),
    }
}

/// A rename the OS refused only because it spans filesystems.
fn crosses_devices(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::CrossesDevices
}

fn copy_then_remove(from: &Path, to: &Path) -> io::Result<()> {
    if !from.is_dir() {
        std::fs::copy(from, to)?;
        return std::fs::remove_file(from);
    }

    for entry in walkdir::WalkDir::new(from) {
        let entry = entry?;
        let Ok(rest) = entry.path().strip_prefix(from) else {
            continue;
        };
        let dest = to.join(rest);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&dest)?;
        } else {
            std::fs::copy(entry.path(), &dest)?;
        }
    }
    std::fs::remove_dir_all(from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Arc;
    use vs_core::config::Config;
    use vs_core::events::EventBus;
    use vs_core::StorageSource;
    use vs_db::pool::init_memory_pool;

    struct Fixture {
        _dirs: Vec<tempfile::TempDir>,
        roots: Vec<PathBuf>,
        library: Library,
    }

    fn fixture(n: usize) -> Fixture {
        let dirs: Vec<_> = (0..n).map(|_| tempfile::tempdir().unwrap()).collect();
        let roots: Vec<PathBuf> = dirs.iter().map(|d| d.path().to_path_buf()).collect();
        let mut config = Config::default();
        config.library.sources = roots
            .iter()
            .enumerate()
            .map(|(i, root)| StorageSource {
                id: SourceId::from(format!("s{i}")),
                label: String::new(),
                root_path: root.clone(),
            })
            .collect();
        let library = Library::open(
            &config,
            init_memory_pool().unwrap(),
            Arc::new(EventBus::default()),
        )
        .unwrap();
        Fixture {
            _dirs: dirs,
            roots,
            library,
        }
    }

    fn write(root: &Path, rel: &str, body: &[u8]) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, body).unwrap();
    }

    fn s(i: usize) -> SourceId {
        SourceId::from(format!("s{i}"))
    }

    async fn indexed(fx: &Fixture, source: usize, rel: &str) -> MediaEntry {
        fx.library.rescan_source(&s(source)).await.unwrap();
        fx.library
            .catalog()
            .find_by_path(&s(source), rel)
            .unwrap()
    }

    #[tokio::test]
    async fn move_media_across_sources_keeps_id() {
        let fx = fixture(2);
        write(&fx.roots[0], "old.mp4", b"data");
        let entry = indexed(&fx, 0, "old.mp4").await;

        let moved = fx
            .library
            .move_media(&entry.id, &s(1), "a/b.mp4")
            .await
            .unwrap();
        assert_eq!(moved.id, entry.id);
        assert_eq!(moved.rel_path, "a/b.mp4");
        assert_eq!(moved.title, "b");
        assert!(fx.roots[1].join("a/b.mp4").exists());
        assert!(!fx.roots[0].join("old.mp4").exists());

        let found = fx.library.catalog().find(&entry.id).unwrap();
        assert_eq!(found.source_id, s(1));
        assert!(fx.library.catalog().find_by_path(&s(0), "old.mp4").is_none());
        assert!(fx.library.identities().lookup(&s(0), "old.mp4").is_none());

        // A rescan of both roots agrees with the move.
        let summary = fx.library.rescan_all().await;
        assert_eq!(summary.mutations(), 0);
    }

    #[tokio::test]
    async fn move_media_to_occupied_path_conflicts() {
        let fx = fixture(1);
        write(&fx.roots[0], "a.mp4", b"a");
        write(&fx.roots[0], "b.mp4", b"b");
        let a = indexed(&fx, 0, "a.mp4").await;

        let err = fx.library.move_media(&a.id, &s(0), "b.mp4").await.unwrap_err();
        assert_eq!(err.kind(), "conflict");
        assert!(fx.roots[0].join("a.mp4").exists());
    }

    #[tokio::test]
    async fn move_media_rejects_non_media_target() {
        let fx = fixture(1);
        write(&fx.roots[0], "a.mp4", b"a");
        let a = indexed(&fx, 0, "a.mp4").await;
        let err = fx.library.move_media(&a.id, &s(0), "a.txt").await.unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[tokio::test]
    async fn move_unknown_media_is_not_found() {
        let fx = fixture(1);
        let err = fx
            .library
            .move_media(&MediaId::from("nope"), &s(0), "x.mp4")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn progress_survives_move_and_dies_with_delete() {
        let fx = fixture(1);
        write(&fx.roots[0], "a.mp4", b"a");
        let a = indexed(&fx, 0, "a.mp4").await;

        assert_eq!(fx.library.get_progress(&a.id).unwrap(), 0.0);
        fx.library.set_progress(&a.id, 42.5).unwrap();
        fx.library.move_media(&a.id, &s(0), "b.mp4").await.unwrap();
        assert_eq!(fx.library.get_progress(&a.id).unwrap(), 42.5);

        let items = fx.library.list_items(Some(&s(0))).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].position_secs, 42.5);
        assert!(items[0].can_play_directly);

        fx.library.delete_media(&a.id).await.unwrap();
        assert!(!fx.roots[0].join("b.mp4").exists());
        assert_eq!(fx.library.get_progress(&a.id).unwrap_err().kind(), "not_found");
        let conn = get_conn(&fx.library.db).unwrap();
        assert!(watch_progress::get_progress(&conn, &a.id).unwrap().is_none());
    }

    #[tokio::test]
    async fn set_progress_clamps_and_validates() {
        let fx = fixture(1);
        write(&fx.roots[0], "a.mp4", b"a");
        let a = indexed(&fx, 0, "a.mp4").await;

        let saved = fx.library.set_progress(&a.id, -3.0).unwrap();
        assert_eq!(saved.position_secs, 0.0);
        assert_eq!(
            fx.library.set_progress(&a.id, f64::NAN).unwrap_err().kind(),
            "validation"
        );
        assert_eq!(
            fx.library
                .set_progress(&MediaId::from("missing"), 1.0)
                .unwrap_err()
                .kind(),
            "not_found"
        );
    }

    #[tokio::test]
    async fn move_folder_reassigns_contents() {
        let fx = fixture(1);
        write(&fx.roots[0], "show/s1/e1.mkv", b"1");
        write(&fx.roots[0], "show/s1/e2.mkv", b"2");
        fx.library.rescan_source(&s(0)).await.unwrap();
        let e1 = fx.library.catalog().find_by_path(&s(0), "show/s1/e1.mkv").unwrap();

        let moved = fx
            .library
            .move_folder(&s(0), "show", &s(0), "archive/show")
            .await
            .unwrap();
        assert_eq!(moved.len(), 2);
        let found = fx.library.catalog().find(&e1.id).unwrap();
        assert_eq!(found.rel_path, "archive/show/s1/e1.mkv");
        assert!(fx.roots[0].join("archive/show/s1/e2.mkv").exists());
        assert_eq!(fx.library.rescan_source(&s(0)).await.unwrap().mutations(), 0);
    }

    #[tokio::test]
    async fn move_folder_errors() {
        let fx = fixture(1);
        write(&fx.roots[0], "a/x.mp4", b"1");
        write(&fx.roots[0], "b/y.mp4", b"1");

        let missing = fx.library.move_folder(&s(0), "nope", &s(0), "z").await;
        assert_eq!(missing.unwrap_err().kind(), "not_found");
        let occupied = fx.library.move_folder(&s(0), "a", &s(0), "b").await;
        assert_eq!(occupied.unwrap_err().kind(), "conflict");
        let nested = fx.library.move_folder(&s(0), "a", &s(0), "a/inner").await;
        assert_eq!(nested.unwrap_err().kind(), "validation");
    }

    #[tokio::test]
    async fn delete_path_removes_directory_entries() {
        let fx = fixture(1);
        write(&fx.roots[0], "dir/a.mp4", b"1");
        write(&fx.roots[0], "dir/sub/b.mp4", b"1");
        write(&fx.roots[0], "keep.mp4", b"1");
        fx.library.rescan_source(&s(0)).await.unwrap();

        assert_eq!(fx.library.delete_path(&s(0), "dir").await.unwrap(), 2);
        assert!(!fx.roots[0].join("dir").exists());
        assert_eq!(fx.library.catalog().len(), 1);
        // Already gone.
        assert_eq!(fx.library.delete_path(&s(0), "dir").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn create_folder_is_idempotent() {
        let fx = fixture(1);
        fx.library.create_folder(&s(0), "a/b").await.unwrap();
        fx.library.create_folder(&s(0), "a/b").await.unwrap();
        assert!(fx.roots[0].join("a/b").is_dir());

        write(&fx.roots[0], "file.mp4", b"1");
        let err = fx.library.create_folder(&s(0), "file.mp4").await.unwrap_err();
        assert_eq!(err.kind(), "conflict");
        let err = fx.library.create_folder(&s(0), "../escape").await.unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[tokio::test]
    async fn browse_lists_folders_first() {
        let fx = fixture(1);
        write(&fx.roots[0], "b.mp4", b"12");
        write(&fx.roots[0], "A.txt", b"1");
        write(&fx.roots[0], "zdir/c.mp4", b"1");
        write(&fx.roots[0], ".hidden", b"1");
        fx.library.rescan_source(&s(0)).await.unwrap();

        let items = fx.library.browse(&s(0), "").await.unwrap();
        let names: Vec<_> = items.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["zdir", "A.txt", "b.mp4"]);
        assert!(items[0].is_dir);
        assert!(items[1].entry.is_none());
        assert_eq!(items[2].size_bytes, Some(2));
        assert!(items[2].entry.is_some());

        let nested = fx.library.browse(&s(0), "zdir").await.unwrap();
        assert_eq!(nested[0].rel_path, "zdir/c.mp4");

        let err = fx.library.browse(&s(0), "missing").await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    struct CopyTranscoder;

    #[async_trait]
    impl Transcoder for CopyTranscoder {
        async fn convert(&self, input: &Path) -> Result<ConvertOutcome> {
            let output = crate::transcode::FfmpegTranscoder::output_path_for(input);
            tokio::fs::copy(input, &output).await?;
            Ok(ConvertOutcome {
                message: "converted".into(),
                output_path: output,
            })
        }
    }

    #[tokio::test]
    async fn convert_indexes_the_output() {
        let fx = fixture(1);
        write(&fx.roots[0], "movie.mkv", b"abc");
        let entry = indexed(&fx, 0, "movie.mkv").await;

        let outcome = fx
            .library
            .convert_media(&entry.id, &CopyTranscoder)
            .await
            .unwrap();
        assert_eq!(outcome.message, "converted");
        assert!(fx
            .library
            .catalog()
            .find_by_path(&s(0), "movie_ios.mp4")
            .is_some());
    }

    #[test]
    fn only_cross_device_renames_fall_back_to_copy() {
        assert!(crosses_devices(&io::Error::from(io::ErrorKind::CrossesDevices)));
        assert!(!crosses_devices(&io::Error::from(io::ErrorKind::PermissionDenied)));
        assert!(!crosses_devices(&io::Error::from(io::ErrorKind::NotFound)));
    }

    #[test]
    fn copy_then_remove_moves_a_tree() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("from");
        std::fs::create_dir_all(from.join("season 1")).unwrap();
        std::fs::write(from.join("season 1/e01.mkv"), b"e01").unwrap();
        std::fs::write(from.join("poster.mp4"), b"p").unwrap();

        let to = dir.path().join("to");
        copy_then_remove(&from, &to).unwrap();

        assert!(!from.exists());
        assert_eq!(std::fs::read(to.join("season 1/e01.mkv")).unwrap(), b"e01");
        assert_eq!(std::fs::read(to.join("poster.mp4")).unwrap(), b"p");
    }
}
