//! Record store boundary.
//!
//! The engine persists entries and child profiles through [`EntryStore`] and
//! [`RosterStore`]. [`MemoryStore`] implements both in memory; a DuckDB-backed
//! implementation lives in `kinlog-storage`.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, RwLock};

use crate::entry::EntryRecord;
use crate::error::{StoreError, StoreResult};
use crate::identity::{ChildId, TimelineId};
use crate::roster::ChildProfile;

/// Persistence for sealed entries.
pub trait EntryStore: Send + Sync {
    /// Inserts a new entry. Entries are immutable; an existing id is an error.
    fn put(&self, entry: &EntryRecord) -> StoreResult<String>;

    fn get(&self, id: &str) -> StoreResult<Option<EntryRecord>>;

    /// All entries targeting `timeline`, oldest first.
    fn query_by_target(&self, timeline: &TimelineId) -> StoreResult<Vec<EntryRecord>>;

    /// The `limit` most recent entries targeting `timeline`, newest first.
    fn query_recent(&self, timeline: &TimelineId, limit: usize) -> StoreResult<Vec<EntryRecord>>;

    /// Hard-deletes an entry. Returns whether anything was removed.
    fn delete(&self, id: &str) -> StoreResult<bool>;
}

/// Persistence for child profiles and their credential records.
pub trait RosterStore: Send + Sync {
    fn list_children(&self) -> StoreResult<Vec<ChildProfile>>;

    fn get_child(&self, id: ChildId) -> StoreResult<Option<ChildProfile>>;

    /// Inserts or replaces a profile.
    fn save_child(&self, profile: &ChildProfile) -> StoreResult<()>;

    fn remove_child(&self, id: ChildId) -> StoreResult<bool>;

    /// Issues a fresh child id. Ids are never reissued, not even after the
    /// child holding one is removed, because that child's entries stay in
    /// the store under the old id.
    fn allocate_child_id(&self) -> StoreResult<ChildId>;
}

/// Orders entries by timestamp, then id, so equal timestamps stay stable.
pub(crate) fn sort_oldest_first(entries: &mut [EntryRecord]) {
    entries.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
}

// ============================================================================
// MemoryStore
// ============================================================================

/// In-memory store, used for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, EntryRecord>>,
    children: RwLock<BTreeMap<ChildId, ChildProfile>>,
    last_child_id: Mutex<i64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry_count(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }
}

fn poisoned<E: std::fmt::Display>(err: E) -> StoreError {
    StoreError::Backend(format!("lock poisoned: {err}"))
}

impl EntryStore for MemoryStore {
    fn put(&self, entry: &EntryRecord) -> StoreResult<String> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        if entries.contains_key(&entry.id) {
            return Err(StoreError::Duplicate(entry.id.clone()));
        }
        entries.insert(entry.id.clone(), entry.clone());
        Ok(entry.id.clone())
    }

    fn get(&self, id: &str) -> StoreResult<Option<EntryRecord>> {
        let entries = self.entries.read().map_err(poisoned)?;
        Ok(entries.get(id).cloned())
    }

    fn query_by_target(&self, timeline: &TimelineId) -> StoreResult<Vec<EntryRecord>> {
        let entries = self.entries.read().map_err(poisoned)?;
        let mut matching: Vec<EntryRecord> = entries
            .values()
            .filter(|e| e.targets(timeline))
            .cloned()
            .collect();
        sort_oldest_first(&mut matching);
        Ok(matching)
    }

    fn query_recent(&self, timeline: &TimelineId, limit: usize) -> StoreResult<Vec<EntryRecord>> {
        let mut matching = self.query_by_target(timeline)?;
        matching.reverse();
        matching.truncate(limit);
        Ok(matching)
    }

    fn delete(&self, id: &str) -> StoreResult<bool> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        Ok(entries.remove(id).is_some())
    }
}

impl RosterStore for MemoryStore {
    fn list_children(&self) -> StoreResult<Vec<ChildProfile>> {
        let children = self.children.read().map_err(poisoned)?;
        Ok(children.values().cloned().collect())
    }

    fn get_child(&self, id: ChildId) -> StoreResult<Option<ChildProfile>> {
        let children = self.children.read().map_err(poisoned)?;
        Ok(children.get(&id).cloned())
    }

    fn save_child(&self, profile: &ChildProfile) -> StoreResult<()> {
        let mut children = self.children.write().map_err(poisoned)?;
        children.insert(profile.id, profile.clone());
        Ok(())
    }

    fn remove_child(&self, id: ChildId) -> StoreResult<bool> {
        let mut children = self.children.write().map_err(poisoned)?;
        Ok(children.remove(&id).is_some())
    }

    fn allocate_child_id(&self) -> StoreResult<ChildId> {
        let children = self.children.read().map_err(poisoned)?;
        let mut last = self.last_child_id.lock().map_err(poisoned)?;
        let highest = children.keys().next_back().map_or(0, |id| id.0);
        *last = (*last).max(highest) + 1;
        Ok(ChildId(*last))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: &str, ts: i64, target: TimelineId) -> EntryRecord {
        EntryRecord {
            id: id.into(),
            timestamp: ts,
            targets: vec![target],
            sealed: json!({}),
        }
    }

    #[test]
    fn put_rejects_duplicate_ids() {
        let store = MemoryStore::new();
        store.put(&record("a", 1, TimelineId::General)).unwrap();
        assert!(matches!(
            store.put(&record("a", 2, TimelineId::General)),
            Err(StoreError::Duplicate(_))
        ));
    }

    #[test]
    fn query_orders() {
        let store = MemoryStore::new();
        store.put(&record("a", 30, TimelineId::General)).unwrap();
        store.put(&record("b", 10, TimelineId::General)).unwrap();
        store.put(&record("c", 20, TimelineId::General)).unwrap();
        store.put(&record("d", 40, TimelineId::child(1))).unwrap();

        let all: Vec<_> = store
            .query_by_target(&TimelineId::General)
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(all, vec!["b", "c", "a"]);

        let recent: Vec<_> = store
            .query_recent(&TimelineId::General, 2)
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(recent, vec!["a", "c"]);
    }

    #[test]
    fn delete_reports_presence() {
        let store = MemoryStore::new();
        store.put(&record("a", 1, TimelineId::General)).unwrap();
        assert!(store.delete("a").unwrap());
        assert!(!store.delete("a").unwrap());
        assert_eq!(store.entry_count(), 0);
    }

    fn profile(id: i64) -> ChildProfile {
        ChildProfile {
            id: ChildId(id),
            display_name: format!("kid {id}"),
            created_at: id,
            credential: kinlog_crypto::CredentialRecord {
                wrapped_password: vec![1],
                salt: vec![2],
                nonce: vec![3],
                iterations: None,
            },
        }
    }

    #[test]
    fn child_ids_increase() {
        let store = MemoryStore::new();
        assert_eq!(store.allocate_child_id().unwrap(), ChildId(1));
        assert_eq!(store.allocate_child_id().unwrap(), ChildId(2));
    }

    #[test]
    fn removed_child_id_is_not_reissued() {
        let store = MemoryStore::new();
        let id = store.allocate_child_id().unwrap();
        store.save_child(&profile(id.0)).unwrap();
        assert!(store.remove_child(id).unwrap());
        assert_eq!(store.allocate_child_id().unwrap(), ChildId(2));
    }

    #[test]
    fn allocation_skips_past_saved_profiles() {
        let store = MemoryStore::new();
        store.save_child(&profile(7)).unwrap();
        assert_eq!(store.allocate_child_id().unwrap(), ChildId(8));
    }
}
