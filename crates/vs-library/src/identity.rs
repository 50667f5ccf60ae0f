//! Stable identifiers for catalogued files.
//!
//! The store keeps the full `(source, path) -> id` mapping in memory and
//! writes every change through to the `identities` table first, so the
//! in-memory image never runs ahead of what survives a restart.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use vs_core::{Error, MediaId, Result, SourceId};
use vs_db::pool::{get_conn, DbPool};
use vs_db::queries::identities;

type Location = (SourceId, String);

#[derive(Default)]
struct IdentityState {
    by_path: HashMap<Location, MediaId>,
    taken: HashSet<MediaId>,
}

impl IdentityState {
    fn bind(&mut self, id: MediaId, source_id: SourceId, rel_path: String) {
        self.taken.insert(id.clone());
        self.by_path.insert((source_id, rel_path), id);
    }

    fn unbind(&mut self, source_id: &SourceId, rel_path: &str) -> Option<MediaId> {
        let id = self
            .by_path
            .remove(&(source_id.clone(), rel_path.to_string()))?;
        self.taken.remove(&id);
        Some(id)
    }
}

pub struct IdentityStore {
    db: DbPool,
    state: RwLock<IdentityState>,
}

impl IdentityStore {
    /// Load every persisted mapping.
    pub fn load(db: DbPool) -> Result<Self> {
        let conn = get_conn(&db)?;
        let mut state = IdentityState::default();
        for rec in identities::list_all(&conn)? {
            state.bind(rec.id, rec.source_id, rec.rel_path);
        }
        drop(conn);

        Ok(Self {
            db,
            state: RwLock::new(state),
        })
    }

    /// Return the id bound to a location, allocating and persisting one on
    /// first sight.
    ///
    /// A fresh id is derived from the location itself; if that value is
    /// already held elsewhere (its original owner was moved away) a random
    /// one is used so ids stay globally unique.
    pub fn resolve_id(&self, source_id: &SourceId, rel_path: &str) -> Result<MediaId> {
        if let Some(id) = self.lookup(source_id, rel_path) {
            return Ok(id);
        }

        let mut state = self.state.write();
        let key = (source_id.clone(), rel_path.to_string());
        if let Some(id) = state.by_path.get(&key) {
            return Ok(id.clone());
        }

        let mut id = MediaId::derive(source_id, rel_path);
        while state.taken.contains(&id) {
            id = MediaId::random();
        }

        let conn = get_conn(&self.db)?;
        identities::insert_identity(&conn, &id, source_id, rel_path)?;
        state.bind(id.clone(), key.0, key.1);

        tracing::trace!(media_id = %id, source_id = %source_id, rel_path, "Allocated id");
        Ok(id)
    }

    /// Transfer the id at the old location to the new one.
    pub fn reassign(
        &self,
        old_source: &SourceId,
        old_rel: &str,
        new_source: &SourceId,
        new_rel: &str,
    ) -> Result<MediaId> {
        let mut state = self.state.write();
        let id = state
            .by_path
            .get(&(old_source.clone(), old_rel.to_string()))
            .cloned()
            .ok_or_else(|| Error::not_found("identity", format!("{old_source}/{old_rel}")))?;
        if old_source == new_source && old_rel == new_rel {
            return Ok(id);
        }

        let conn = get_conn(&self.db)?;
        if !identities::reassign(&conn, old_source, old_rel, new_source, new_rel)? {
            return Err(Error::not_found("identity", format!("{old_source}/{old_rel}")));
        }

        state.unbind(new_source, new_rel);
        state.unbind(old_source, old_rel);
        state.bind(id.clone(), new_source.clone(), new_rel.to_string());
        Ok(id)
    }

    /// Transfer many ids at once (a folder move). Locations with no id are
    /// skipped. Returns the ids that moved.
    pub fn reassign_many(&self, moves: &[(SourceId, String, SourceId, String)]) -> Result<Vec<MediaId>> {
        if moves.is_empty() {
            return Ok(Vec::new());
        }

        let mut state = self.state.write();
        let conn = get_conn(&self.db)?;
        identities::reassign_many(&conn, moves)?;

        // Detach every moving id before rebinding so moves that swap
        // locations inside the batch do not clobber each other.
        let mut moved = Vec::new();
        for (old_source, old_rel, new_source, new_rel) in moves {
            if let Some(id) = state.unbind(old_source, old_rel) {
                moved.push((id, new_source.clone(), new_rel.clone()));
            }
        }
        for (_, new_source, new_rel) in &moved {
            state.unbind(new_source, new_rel);
        }
        for (id, new_source, new_rel) in &moved {
            state.bind(id.clone(), new_source.clone(), new_rel.clone());
        }
        Ok(moved.into_iter().map(|(id, _, _)| id).collect())
    }

    /// Forget the id bound to a location. Retired ids are never handed out
    /// again for a different location unless they are re-derived.
    pub fn retire(&self, source_id: &SourceId, rel_path: &str) -> Result<Option<MediaId>> {
        let mut state = self.state.write();
        if !state
            .by_path
            .contains_key(&(source_id.clone(), rel_path.to_string()))
        {
            return Ok(None);
        }

        let conn = get_conn(&self.db)?;
        identities::delete_by_path(&conn, source_id, rel_path)?;
        Ok(state.unbind(source_id, rel_path))
    }

    pub fn lookup(&self, source_id: &SourceId, rel_path: &str) -> Option<MediaId> {
        self.state
            .read()
            .by_path
            .get(&(source_id.clone(), rel_path.to_string()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.state.read().by_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for IdentityStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityStore")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}
