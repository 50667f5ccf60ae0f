//! The catalog of known media entries.
//!
//! Readers take a shared lock on an in-memory image and never see a
//! half-applied change: every mutation is first written to SQLite and then
//! swapped into the image under the write lock in one step.

use std::collections::HashMap;

use parking_lot::RwLock;
use vs_core::paths::{is_under, rebase};
use vs_core::{title_from_rel_path, MediaEntry, MediaId, Result, SourceId};
use vs_db::pool::{get_conn, DbPool};
use vs_db::queries::media_entries;

/// What an [`Catalog::upsert`] actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

#[derive(Default)]
struct CatalogState {
    by_id: HashMap<MediaId, MediaEntry>,
    by_path: HashMap<(SourceId, String), MediaId>,
}

impl CatalogState {
    fn insert(&mut self, entry: MediaEntry) {
        self.by_path.insert(
            (entry.source_id.clone(), entry.rel_path.clone()),
            entry.id.clone(),
        );
        self.by_id.insert(entry.id.clone(), entry);
    }

    fn take(&mut self, id: &MediaId) -> Option<MediaEntry> {
        let entry = self.by_id.remove(id)?;
        self.by_path
            .remove(&(entry.source_id.clone(), entry.rel_path.clone()));
        Some(entry)
    }

    /// Panics when a location would end up with two different entries.
    fn assert_path_free(&self, source_id: &SourceId, rel_path: &str, id: &MediaId) {
        if let Some(holder) = self.by_path.get(&(source_id.clone(), rel_path.to_string())) {
            assert!(
                holder == id,
                "catalog invariant violated: {source_id}/{rel_path} held by {holder}, not {id}"
            );
        }
    }
}

pub struct Catalog {
    db: DbPool,
    state: RwLock<CatalogState>,
}

impl Catalog {
    /// Load every persisted entry.
    pub fn load(db: DbPool) -> Result<Self> {
        let conn = get_conn(&db)?;
        let mut state = CatalogState::default();
        for entry in media_entries::list_entries(&conn, None)? {
            state.insert(entry);
        }
        drop(conn);

        Ok(Self {
            db,
            state: RwLock::new(state),
        })
    }

    /// Insert or refresh an entry.
    ///
    /// # Panics
    ///
    /// If the entry's location is already held by a different id.
    pub fn upsert(&self, entry: MediaEntry) -> Result<UpsertOutcome> {
        let mut state = self.state.write();
        state.assert_path_free(&entry.source_id, &entry.rel_path, &entry.id);

        let outcome = match state.by_id.get(&entry.id) {
            Some(existing) if existing.same_content(&entry) => return Ok(UpsertOutcome::Unchanged),
            Some(_) => UpsertOutcome::Updated,
            None => UpsertOutcome::Inserted,
        };

        let conn = get_conn(&self.db)?;
        media_entries::upsert_entry(&conn, &entry)?;

        state.take(&entry.id);
        state.insert(entry);
        Ok(outcome)
    }

    /// Remove the entry at a location.
    pub fn remove(&self, source_id: &SourceId, rel_path: &str) -> Result<Option<MediaEntry>> {
        let mut state = self.state.write();
        let Some(id) = state
            .by_path
            .get(&(source_id.clone(), rel_path.to_string()))
            .cloned()
        else {
            return Ok(None);
        };

        let conn = get_conn(&self.db)?;
        media_entries::delete_entries(&conn, std::slice::from_ref(&id))?;
        Ok(state.take(&id))
    }

    /// Remove every entry at or beneath `prefix` (a whole folder). An empty
    /// prefix clears the source.
    pub fn remove_prefix(&self, source_id: &SourceId, prefix: &str) -> Result<Vec<MediaEntry>> {
        let mut state = self.state.write();
        let ids: Vec<MediaId> = state
            .by_id
            .values()
            .filter(|e| &e.source_id == source_id && is_under(&e.rel_path, prefix))
            .map(|e| e.id.clone())
            .collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let conn = get_conn(&self.db)?;
        media_entries::delete_entries(&conn, &ids)?;

        let mut removed: Vec<MediaEntry> = ids.iter().filter_map(|id| state.take(id)).collect();
        removed.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
        Ok(removed)
    }

    /// Move entries to new locations, keeping their ids and metadata. Titles
    /// follow the new file names.
    ///
    /// # Panics
    ///
    /// If a target location is held by an entry that is not part of the
    /// batch.
    pub fn relocate(&self, moves: &[(MediaId, SourceId, String)]) -> Result<Vec<MediaEntry>> {
        let mut state = self.state.write();

        let moving: Vec<MediaId> = moves.iter().map(|(id, _, _)| id.clone()).collect();
        let mut updated = Vec::with_capacity(moves.len());
        for (id, source_id, rel_path) in moves {
            let Some(current) = state.by_id.get(id) else {
                continue;
            };
            if let Some(holder) = state.by_path.get(&(source_id.clone(), rel_path.clone())) {
                assert!(
                    moving.contains(holder),
                    "catalog invariant violated: {source_id}/{rel_path} held by {holder}"
                );
            }
            let mut entry = current.clone();
            entry.source_id = source_id.clone();
            entry.rel_path = rel_path.clone();
            entry.title = title_from_rel_path(rel_path);
            updated.push(entry);
        }
        if updated.is_empty() {
            return Ok(updated);
        }

        let conn = get_conn(&self.db)?;
        media_entries::relocate_entries(&conn, &updated)?;

        for entry in &updated {
            state.take(&entry.id);
        }
        for entry in &updated {
            state.insert(entry.clone());
        }
        Ok(updated)
    }

    /// Move every entry under `old_prefix` to the same relative position under
    /// `new_prefix`.
    pub fn relocate_prefix(
        &self,
        old_source: &SourceId,
        old_prefix: &str,
        new_source: &SourceId,
        new_prefix: &str,
    ) -> Result<Vec<MediaEntry>> {
        let moves: Vec<(MediaId, SourceId, String)> = self
            .entries_under(old_source, old_prefix)
            .into_iter()
            .filter_map(|e| {
                rebase(&e.rel_path, old_prefix, new_prefix)
                    .map(|rel| (e.id, new_source.clone(), rel))
            })
            .collect();
        self.relocate(&moves)
    }

    /// Entries, optionally restricted to one source, ordered by path.
    pub fn list(&self, source_id: Option<&SourceId>) -> Vec<MediaEntry> {
        let state = self.state.read();
        let mut entries: Vec<MediaEntry> = state
            .by_id
            .values()
            .filter(|e| source_id.map_or(true, |s| &e.source_id == s))
            .cloned()
            .collect();
        entries.sort_by(|a, b| {
            a.rel_path
                .cmp(&b.rel_path)
                .then_with(|| a.source_id.cmp(&b.source_id))
        });
        entries
    }

    /// Entries of one source at or beneath `prefix`.
    pub fn entries_under(&self, source_id: &SourceId, prefix: &str) -> Vec<MediaEntry> {
        let state = self.state.read();
        let mut entries: Vec<MediaEntry> = state
            .by_id
            .values()
            .filter(|e| &e.source_id == source_id && is_under(&e.rel_path, prefix))
            .cloned()
            .collect();
        entries.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
        entries
    }

    pub fn find(&self, id: &MediaId) -> Option<MediaEntry> {
        self.state.read().by_id.get(id).cloned()
    }

    pub fn find_by_path(&self, source_id: &SourceId, rel_path: &str) -> Option<MediaEntry> {
        let state = self.state.read();
        state
            .by_path
            .get(&(source_id.clone(), rel_path.to_string()))
            .and_then(|id| state.by_id.get(id))
            .cloned()
    }

    /// Case-insensitive substring match over title and path, ordered by path.
    pub fn search(&self, query: &str) -> Vec<MediaEntry> {
        let needle = query.to_lowercase();
        let state = self.state.read();
        let mut hits: Vec<MediaEntry> = state
            .by_id
            .values()
            .filter(|e| {
                e.title.to_lowercase().contains(&needle)
                    || e.rel_path.to_lowercase().contains(&needle)
            })
            .cloned()
            .collect();
        hits.sort_by(|a, b| {
            a.rel_path
                .cmp(&b.rel_path)
                .then_with(|| a.source_id.cmp(&b.source_id))
        });
        hits
    }

    pub fn len(&self) -> usize {
        self.state.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Catalog")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}
