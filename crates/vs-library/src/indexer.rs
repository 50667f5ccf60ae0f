//! The library indexer.
//!
//! [`Library`] owns the identity store and the catalog and keeps both in
//! line with the storage roots. Two triggers feed it:
//!
//! - full rescans, which walk a root and diff it against the catalog;
//! - change events from the watcher, which are debounced per path and then
//!   resolved by looking at what is actually on disk.
//!
//! Every mutation of a source's entries happens under that source's mutex,
//! so rescans, incremental updates and library operations never interleave
//! on the same root while different roots proceed in parallel.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{watch, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use vs_core::config::Config;
use vs_core::events::{EventBus, EventPayload};
use vs_core::paths::{normalize_rel_path, rebase, rel_path_of, resolve_under};
use vs_core::{title_from_rel_path, Error, MediaEntry, MediaId, Result, SourceId, StorageSource};
use vs_db::pool::DbPool;

use crate::catalog::{Catalog, UpsertOutcome};
use crate::change::{ChangeEvent, ChangeKind};
use crate::identity::IdentityStore;
use crate::settle::{SettleTracker, SettledPath};
use crate::walk::{scanned_from_metadata, walk_media, MediaFilter, ScannedFile, WalkResult};

// ---------------------------------------------------------------------------
// Summaries
// ---------------------------------------------------------------------------

/// Catalog mutations made while reconciling one source (or part of it).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceRescan {
    pub source_id: SourceId,
    pub added: u64,
    pub updated: u64,
    pub removed: u64,
    /// Entries under the walked tree that could not be read. When non-zero,
    /// missing paths were not treated as deleted.
    pub unreadable: usize,
}

impl SourceRescan {
    fn new(source_id: SourceId) -> Self {
        Self {
            source_id,
            added: 0,
            updated: 0,
            removed: 0,
            unreadable: 0,
        }
    }

    pub fn mutations(&self) -> u64 {
        self.added + self.updated + self.removed
    }

    fn count(&mut self, outcome: UpsertOutcome) {
        match outcome {
            UpsertOutcome::Inserted => self.added += 1,
            UpsertOutcome::Updated => self.updated += 1,
            UpsertOutcome::Unchanged => {}
        }
    }
}

/// A source whose rescan could not run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceFailure {
    pub source_id: SourceId,
    pub message: String,
}

/// Outcome of [`Library::rescan_all`]: one record per source.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RescanSummary {
    pub completed: Vec<SourceRescan>,
    pub failed: Vec<SourceFailure>,
}

impl RescanSummary {
    pub fn mutations(&self) -> u64 {
        self.completed.iter().map(SourceRescan::mutations).sum()
    }
}

// ---------------------------------------------------------------------------
// Library
// ---------------------------------------------------------------------------

pub struct Library {
    sources: RwLock<BTreeMap<SourceId, StorageSource>>,
    filter: MediaFilter,
    identities: IdentityStore,
    catalog: Catalog,
    pub(crate) db: DbPool,
    locks: Mutex<HashMap<SourceId, Arc<tokio::sync::Mutex<()>>>>,
    pending: Mutex<SettleTracker>,
    pub(crate) events: Arc<EventBus>,
    sources_version: watch::Sender<u64>,
}

impl Library {
    /// Load the persisted catalog and identities and prepare the storage
    /// roots described by `config`.
    ///
    /// Missing roots are created; a root that cannot be created is logged
    /// and will show up as a failed source on the next rescan.
    pub fn open(config: &Config, db: DbPool, events: Arc<EventBus>) -> Result<Self> {
        let mut sources = BTreeMap::new();
        for source in &config.library.sources {
            if sources.insert(source.id.clone(), source.clone()).is_some() {
                return Err(Error::Validation(format!(
                    "storage source '{}' is configured twice",
                    source.id
                )));
            }
            if let Err(e) = std::fs::create_dir_all(&source.root_path) {
                tracing::warn!(
                    source_id = %source.id,
                    root = %source.root_path.display(),
                    error = %e,
                    "Failed to create storage root"
                );
            }
        }

        let filter = MediaFilter::new(
            config.library.normalized_extensions(),
            config.watch.ignore_suffixes.clone(),
        );
        let identities = IdentityStore::load(db.clone())?;
        let catalog = Catalog::load(db.clone())?;
        let (sources_version, _) = watch::channel(0);

        tracing::info!(
            sources = sources.len(),
            entries = catalog.len(),
            identities = identities.len(),
            "Library loaded"
        );

        Ok(Self {
            sources: RwLock::new(sources),
            filter,
            identities,
            catalog,
            db,
            locks: Mutex::new(HashMap::new()),
            pending: Mutex::new(SettleTracker::new(config.watch.debounce())),
            events,
            sources_version,
        })
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn identities(&self) -> &IdentityStore {
        &self.identities
    }

    pub fn filter(&self) -> &MediaFilter {
        &self.filter
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Configured sources, ordered by id.
    pub fn sources(&self) -> Vec<StorageSource> {
        self.sources.read().values().cloned().collect()
    }

    pub fn source(&self, source_id: &SourceId) -> Result<StorageSource> {
        self.sources
            .read()
            .get(source_id)
            .cloned()
            .ok_or_else(|| Error::not_found("storage source", source_id))
    }

    /// Receiver that ticks whenever a source is repointed.
    pub fn subscribe_sources(&self) -> watch::Receiver<u64> {
        self.sources_version.subscribe()
    }

    /// Relabel and/or repoint a source. Repointing rescans it.
    pub async fn update_source(
        &self,
        source_id: &SourceId,
        label: Option<String>,
        root_path: Option<PathBuf>,
    ) -> Result<StorageSource> {
        let (updated, repointed) = {
            let _guard = self.lock_source(source_id).await;
            let mut sources = self.sources.write();
            let source = sources
                .get_mut(source_id)
                .ok_or_else(|| Error::not_found("storage source", source_id))?;
            if let Some(label) = label {
                source.label = label;
            }
            let mut repointed = false;
            if let Some(root) = root_path {
                if root != source.root_path {
                    std::fs::create_dir_all(&root)?;
                    source.root_path = root;
                    repointed = true;
                }
            }
            (source.clone(), repointed)
        };

        if repointed {
            tracing::info!(
                source_id = %source_id,
                root = %updated.root_path.display(),
                "Storage source repointed"
            );
            self.sources_version.send_modify(|v| *v += 1);
            self.rescan_source(source_id).await?;
        }
        Ok(updated)
    }

    // -- locking ------------------------------------------------------------

    fn source_mutex(&self, source_id: &SourceId) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(source_id.clone())
            .or_default()
            .clone()
    }

    pub(crate) async fn lock_source(&self, source_id: &SourceId) -> OwnedMutexGuard<()> {
        self.source_mutex(source_id).lock_owned().await
    }

    /// Lock two sources in a fixed order so concurrent cross-source moves
    /// cannot deadlock.
    pub(crate) async fn lock_pair(
        &self,
        a: &SourceId,
        b: &SourceId,
    ) -> (OwnedMutexGuard<()>, Option<OwnedMutexGuard<()>>) {
        if a == b {
            return (self.lock_source(a).await, None);
        }
        let (first, second) = if a < b { (a, b) } else { (b, a) };
        let g1 = self.lock_source(first).await;
        let g2 = self.lock_source(second).await;
        (g1, Some(g2))
    }

    // -- full rescan --------------------------------------------------------

    /// Rescan every source in parallel. Failures stay scoped to their source.
    pub async fn rescan_all(&self) -> RescanSummary {
        let sources = self.sources();
        let results = futures::future::join_all(
            sources.iter().map(|s| self.rescan_source(&s.id)),
        )
        .await;

        let mut summary = RescanSummary::default();
        for (source, result) in sources.iter().zip(results) {
            match result {
                Ok(done) => summary.completed.push(done),
                Err(e) => summary.failed.push(SourceFailure {
                    source_id: source.id.clone(),
                    message: e.to_string(),
                }),
            }
        }
        summary
    }

    /// Walk one root and bring its catalog entries in line with it.
    pub async fn rescan_source(&self, source_id: &SourceId) -> Result<SourceRescan> {
        let _guard = self.lock_source(source_id).await;
        let source = self.source(source_id)?;
        self.events.broadcast(EventPayload::RescanStarted {
            source_id: source_id.clone(),
        });
        let started = Instant::now();

        let walk = match self.walk(&source, "").await {
            Ok(walk) => walk,
            Err(e) => {
                tracing::warn!(source_id = %source_id, error = %e, "Rescan failed");
                self.events.broadcast(EventPayload::RescanFailed {
                    source_id: source_id.clone(),
                    message: e.to_string(),
                });
                return Err(e);
            }
        };

        let result = self.reconcile_subtree(&source, "", walk, &HashSet::new())?;
        tracing::info!(
            source_id = %source_id,
            added = result.added,
            updated = result.updated,
            removed = result.removed,
            unreadable = result.unreadable,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Rescan complete"
        );
        self.events.broadcast(EventPayload::RescanCompleted {
            source_id: source_id.clone(),
            added: result.added,
            updated: result.updated,
            removed: result.removed,
        });
        Ok(result)
    }

    async fn walk(&self, source: &StorageSource, start_rel: &str) -> Result<WalkResult> {
        let root = source.root_path.clone();
        let start = start_rel.to_string();
        let filter = self.filter.clone();
        tokio::task::spawn_blocking(move || walk_media(&root, &start, &filter))
            .await
            .map_err(|e| Error::Internal(format!("spawn_blocking join error: {e}")))?
            .map_err(|e| Error::source_io(&source.id, e))
    }

    /// Upsert everything a walk found and, if the walk was complete, drop
    /// catalogued paths under `prefix` that it did not see. Paths in
    /// `unsettled` are left exactly as they are.
    fn reconcile_subtree(
        &self,
        source: &StorageSource,
        prefix: &str,
        walk: WalkResult,
        unsettled: &HashSet<String>,
    ) -> Result<SourceRescan> {
        let mut result = SourceRescan::new(source.id.clone());
        result.unreadable = walk.errors;

        let mut seen = HashSet::with_capacity(walk.files.len());
        for file in walk.files {
            seen.insert(file.rel_path.clone());
            if unsettled.contains(&file.rel_path) {
                tracing::trace!(source_id = %source.id, rel_path = %file.rel_path, "Skipping unsettled file");
                continue;
            }
            result.count(self.upsert_scanned(&source.id, file)?);
        }

        if walk.errors > 0 {
            tracing::warn!(
                source_id = %source.id,
                prefix,
                unreadable = walk.errors,
                "Walk was incomplete; keeping entries that were not seen"
            );
            return Ok(result);
        }

        for entry in self.catalog.entries_under(&source.id, prefix) {
            if !seen.contains(&entry.rel_path) && !unsettled.contains(&entry.rel_path) {
                if self.remove_entry(&source.id, &entry.rel_path)?.is_some() {
                    result.removed += 1;
                }
            }
        }
        Ok(result)
    }

    fn upsert_scanned(&self, source_id: &SourceId, file: ScannedFile) -> Result<UpsertOutcome> {
        let id = match self.catalog.find_by_path(source_id, &file.rel_path) {
            Some(existing) => existing.id,
            None => self.identities.resolve_id(source_id, &file.rel_path)?,
        };
        let entry = MediaEntry {
            id: id.clone(),
            source_id: source_id.clone(),
            title: title_from_rel_path(&file.rel_path),
            rel_path: file.rel_path,
            size_bytes: file.size_bytes,
            modified_at: file.modified_at,
        };
        let rel_path = entry.rel_path.clone();
        let outcome = self.catalog.upsert(entry)?;
        match outcome {
            UpsertOutcome::Inserted => {
                tracing::debug!(media_id = %id, source_id = %source_id, rel_path, "Entry added");
                self.events.broadcast(EventPayload::EntryAdded {
                    media_id: id,
                    source_id: source_id.clone(),
                    rel_path,
                });
            }
            UpsertOutcome::Updated => {
                self.events.broadcast(EventPayload::EntryUpdated { media_id: id });
            }
            UpsertOutcome::Unchanged => {}
        }
        Ok(outcome)
    }

    /// Remove one entry and retire its identity.
    pub(crate) fn remove_entry(
        &self,
        source_id: &SourceId,
        rel_path: &str,
    ) -> Result<Option<MediaEntry>> {
        let Some(entry) = self.catalog.remove(source_id, rel_path)? else {
            return Ok(None);
        };
        self.identities.retire(source_id, rel_path)?;
        tracing::debug!(media_id = %entry.id, source_id = %source_id, rel_path, "Entry removed");
        self.events.broadcast(EventPayload::EntryRemoved {
            media_id: entry.id.clone(),
        });
        Ok(Some(entry))
    }

    /// Remove every entry at or under `prefix` and retire their identities.
    pub(crate) fn remove_subtree(&self, source_id: &SourceId, prefix: &str) -> Result<Vec<MediaEntry>> {
        let removed = self.catalog.remove_prefix(source_id, prefix)?;
        for entry in &removed {
            self.identities.retire(source_id, &entry.rel_path)?;
            self.events.broadcast(EventPayload::EntryRemoved {
                media_id: entry.id.clone(),
            });
        }
        Ok(removed)
    }

    // -- incremental updates -------------------------------------------------

    /// Route one change: paired renames are applied right away, everything
    /// else waits out the debounce window.
    pub async fn handle_change(&self, event: ChangeEvent) -> Result<()> {
        match event.new_rel_path.as_deref() {
            Some(to) if event.is_paired_rename() => {
                self.apply_rename(&event.source_id, &event.rel_path, to).await
            }
            _ => {
                self.enqueue(event);
                Ok(())
            }
        }
    }

    /// Record a change to be resolved once its path has settled.
    pub fn enqueue(&self, event: ChangeEvent) {
        self.enqueue_at(event, Instant::now());
    }

    pub(crate) fn enqueue_at(&self, event: ChangeEvent, now: Instant) {
        let mut paths = vec![(event.rel_path.as_str(), event.kind)];
        if let Some(to) = event.new_rel_path.as_deref() {
            paths = vec![
                (event.rel_path.as_str(), ChangeKind::Removed),
                (to, ChangeKind::Created),
            ];
        }

        let mut pending = self.pending.lock();
        for (raw, kind) in paths {
            let rel_path = match normalize_rel_path(raw) {
                Ok(p) => p,
                Err(e) => {
                    tracing::debug!(path = raw, error = %e, "Dropping change with unusable path");
                    continue;
                }
            };
            if self.filter.is_ignored(&rel_path) {
                continue;
            }
            tracing::trace!(source_id = %event.source_id, rel_path, ?kind, "Change queued");
            pending.record(event.source_id.clone(), rel_path, kind, now);
        }
    }

    /// Number of paths still waiting out their debounce window.
    pub fn pending_changes(&self) -> usize {
        self.pending.lock().len()
    }

    /// Apply every path whose debounce window has elapsed by `now`.
    ///
    /// Sources are applied concurrently, each in path order, so a source
    /// held by a long rescan does not delay the others. Returns how many
    /// paths were reconciled. A path that fails is logged and dropped; the
    /// periodic rescan catches up with it.
    pub async fn flush_settled(&self, now: Instant) -> usize {
        let settled = self.pending.lock().take_settled(now);
        let mut by_source: BTreeMap<SourceId, Vec<SettledPath>> = BTreeMap::new();
        for path in settled {
            by_source.entry(path.source_id.clone()).or_default().push(path);
        }
        futures::future::join_all(by_source.into_values().map(|paths| self.apply_settled(paths)))
            .await
            .into_iter()
            .sum()
    }

    async fn apply_settled(&self, paths: Vec<SettledPath>) -> usize {
        let mut applied = 0;
        for path in paths {
            match self.apply_now(&path.source_id, &path.rel_path).await {
                Ok(_) => applied += 1,
                Err(e) => tracing::warn!(
                    source_id = %path.source_id,
                    rel_path = %path.rel_path,
                    kind = ?path.last_kind,
                    error = %e,
                    "Failed to apply change"
                ),
            }
        }
        applied
    }

    /// Reconcile one path with the filesystem immediately.
    pub async fn apply_now(&self, source_id: &SourceId, rel_path: &str) -> Result<SourceRescan> {
        let _guard = self.lock_source(source_id).await;
        let source = self.source(source_id)?;
        self.reconcile_path(&source, rel_path).await
    }

    /// Stat `rel_path` and make the catalog agree with what is there: a
    /// media file is upserted, a directory is walked, an absent path drops
    /// its entry and anything that was beneath it. Caller holds the lock.
    pub(crate) async fn reconcile_path(
        &self,
        source: &StorageSource,
        rel_path: &str,
    ) -> Result<SourceRescan> {
        // An absent root says nothing about individual files.
        if let Err(e) = tokio::fs::metadata(&source.root_path).await {
            return Err(Error::source_io(&source.id, e));
        }

        let abs = resolve_under(&source.root_path, rel_path);
        let mut result = SourceRescan::new(source.id.clone());
        match tokio::fs::metadata(&abs).await {
            Ok(meta) if meta.is_dir() => {
                let walk = self.walk(source, rel_path).await?;
                // Children still being written settle on their own.
                let unsettled = self.pending.lock().unsettled_under(&source.id, rel_path);
                return self.reconcile_subtree(source, rel_path, walk, &unsettled);
            }
            Ok(meta) => {
                // A directory replaced by a file leaves stale children.
                for entry in self.catalog.entries_under(&source.id, rel_path) {
                    if entry.rel_path != rel_path
                        && self.remove_entry(&source.id, &entry.rel_path)?.is_some()
                    {
                        result.removed += 1;
                    }
                }
                if self.filter.matches(rel_path) {
                    let scanned = scanned_from_metadata(rel_path.to_string(), Some(&meta));
                    result.count(self.upsert_scanned(&source.id, scanned)?);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                result.removed = self.remove_subtree(&source.id, rel_path)?.len() as u64;
            }
            Err(e) => return Err(Error::source_io(&source.id, format!("{rel_path}: {e}"))),
        }
        Ok(result)
    }

    /// Apply a rename reported as an old/new pair, keeping the ids of every
    /// entry at or under `from`.
    ///
    /// When nothing is catalogued under `from` the pair is treated as a
    /// removal plus a creation and goes through the debounce like any
    /// other change.
    pub async fn apply_rename(&self, source_id: &SourceId, from: &str, to: &str) -> Result<()> {
        let (from, to) = match (normalize_rel_path(from), normalize_rel_path(to)) {
            (Ok(f), Ok(t)) => (f, t),
            _ => {
                self.enqueue(ChangeEvent::renamed(source_id.clone(), from, to));
                return Ok(());
            }
        };

        let guard = self.lock_source(source_id).await;
        let moving = self.catalog.entries_under(source_id, &from);
        if moving.is_empty() || from == to {
            drop(guard);
            self.enqueue(ChangeEvent::renamed(source_id.clone(), from, to));
            return Ok(());
        }

        let moving_ids: HashSet<MediaId> = moving.iter().map(|e| e.id.clone()).collect();
        for displaced in self.catalog.entries_under(source_id, &to) {
            if !moving_ids.contains(&displaced.id) {
                self.remove_entry(source_id, &displaced.rel_path)?;
            }
        }

        let mut identity_moves = Vec::new();
        let mut catalog_moves = Vec::new();
        for entry in moving {
            let Some(new_rel) = rebase(&entry.rel_path, &from, &to) else {
                continue;
            };
            if self.filter.matches(&new_rel) {
                identity_moves.push((
                    source_id.clone(),
                    entry.rel_path.clone(),
                    source_id.clone(),
                    new_rel.clone(),
                ));
                catalog_moves.push((entry.id, source_id.clone(), new_rel));
            } else {
                // Renamed to something that is no longer media.
                self.remove_entry(source_id, &entry.rel_path)?;
            }
        }

        self.identities.reassign_many(&identity_moves)?;
        for entry in self.catalog.relocate(&catalog_moves)? {
            tracing::debug!(
                media_id = %entry.id,
                rel_path = %entry.rel_path,
                "Entry renamed in place"
            );
            self.events.broadcast(EventPayload::EntryMoved {
                media_id: entry.id,
                source_id: entry.source_id,
                rel_path: entry.rel_path,
            });
        }

        // Pick up anything else the new location holds once it settles.
        self.pending
            .lock()
            .record(source_id.clone(), to, ChangeKind::Modified, Instant::now());
        Ok(())
    }

    /// Index a finished file, or every media file under a finished
    /// directory, without waiting for the debounce. Returns the entries now
    /// catalogued at or under that path.
    pub async fn ingest_path(&self, source_id: &SourceId, abs_path: &Path) -> Result<Vec<MediaEntry>> {
        let _guard = self.lock_source(source_id).await;
        let source = self.source(source_id)?;
        let rel_path = rel_path_of(&source.root_path, abs_path).ok_or_else(|| {
            Error::Validation(format!(
                "{} is not inside storage source '{}'",
                abs_path.display(),
                source_id
            ))
        })?;

        self.reconcile_path(&source, &rel_path).await?;
        Ok(self.catalog.entries_under(source_id, &rel_path))
    }
}

impl std::fmt::Debug for Library {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Library")
            .field("sources", &self.sources.read().len())
            .field("catalog", &self.catalog)
            .field("identities", &self.identities)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Periodic rescan
// ---------------------------------------------------------------------------

/// Rescan every source on a fixed interval until cancelled.
///
/// This bounds how stale the catalog can get when notifications are lost.
/// An interval of zero disables the loop.
pub async fn run_periodic_rescan(library: Arc<Library>, every: Duration, cancel: CancellationToken) {
    if every.is_zero() {
        tracing::info!("Periodic rescan disabled");
        return;
    }

    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let summary = library.rescan_all().await;
                tracing::info!(
                    completed = summary.completed.len(),
                    failed = summary.failed.len(),
                    mutations = summary.mutations(),
                    "Periodic rescan finished"
                );
            }
        }
    }

    tracing::debug!("Periodic rescan stopped");
}
