use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use duckdb::{params, Connection};
use kinlog_crypto::CredentialRecord;
use kinlog_timeline::{
    ChildId, ChildProfile, EntryRecord, EntryStore, RosterStore, StoreResult, TimelineId,
};
use tracing::{debug, warn};

use crate::error::{StorageError, StorageResult};

/// Entry and roster store backed by DuckDB.
#[derive(Clone)]
pub struct DuckDbStore {
    conn: Arc<Mutex<Connection>>,
}

impl DuckDbStore {
    /// Opens or creates a store at the given path.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let conn = crate::open_duckdb_with_wal_recovery(
            path,
            crate::DEFAULT_MEMORY_LIMIT,
            crate::DEFAULT_THREADS,
        )?;
        initialize_schema(&conn)?;
        debug!(path = %path.display(), "Timeline store opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Opens an in-memory store (for testing).
    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        initialize_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> StorageResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StorageError::LockPoisoned)
    }

    // ── Entries ──

    pub fn insert_entry(&self, entry: &EntryRecord) -> StorageResult<()> {
        let targets_json = serde_json::to_string(&entry.targets)?;
        let sealed_json = serde_json::to_string(&entry.sealed)?;

        let mut conn = self.lock()?;
        let exists: i64 = conn.query_row(
            "SELECT COUNT(*) FROM entries WHERE id = ?",
            params![entry.id],
            |row| row.get(0),
        )?;
        if exists > 0 {
            return Err(StorageError::Duplicate(entry.id.clone()));
        }

        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO entries (id, timestamp, targets_json, sealed_json) VALUES (?, ?, ?, ?)",
            params![entry.id, entry.timestamp, targets_json, sealed_json],
        )?;
        for target in &entry.targets {
            tx.execute(
                "INSERT OR IGNORE INTO entry_targets (entry_id, timeline) VALUES (?, ?)",
                params![entry.id, target.to_string()],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_entry(&self, id: &str) -> StorageResult<Option<EntryRecord>> {
        let conn = self.lock()?;
        let result = conn.query_row(
            "SELECT id, timestamp, targets_json, sealed_json FROM entries WHERE id = ?",
            params![id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            },
        );

        let (id, timestamp, targets_json, sealed_json) = match result {
            Ok(row) => row,
            Err(duckdb::Error::QueryReturnedNoRows) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut stmt =
            conn.prepare("SELECT timeline FROM entry_targets WHERE entry_id = ? ORDER BY timeline")?;
        let indexed: Vec<TimelineId> = stmt
            .query_map(params![id], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?
            .iter()
            .filter_map(|t| t.parse().ok())
            .collect();
        Ok(Some(entry_from_row(id, timestamp, &targets_json, sealed_json, indexed)))
    }

    /// Entries targeting `timeline`. Newest first when `newest_first`,
    /// otherwise oldest first; ties are ordered by id.
    pub fn entries_for(
        &self,
        timeline: &TimelineId,
        newest_first: bool,
        limit: Option<usize>,
    ) -> StorageResult<Vec<EntryRecord>> {
        let order = if newest_first { "DESC" } else { "ASC" };
        let limit = limit.map(|n| format!(" LIMIT {n}")).unwrap_or_default();
        let sql = format!(
            "SELECT e.id, e.timestamp, e.targets_json, e.sealed_json
             FROM entries e
             JOIN entry_targets t ON t.entry_id = e.id
             WHERE t.timeline = ?
             ORDER BY e.timestamp {order}, e.id {order}{limit}"
        );

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows: Vec<(String, i64, String, String)> = stmt
            .query_map(params![timeline.to_string()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<Result<_, _>>()?;

        drop(stmt);
        drop(conn);

        Ok(rows
            .into_iter()
            .map(|(id, timestamp, targets_json, sealed_json)| {
                entry_from_row(id, timestamp, &targets_json, sealed_json, vec![*timeline])
            })
            .collect())
    }

    pub fn delete_entry(&self, id: &str) -> StorageResult<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM entry_targets WHERE entry_id = ?", params![id])?;
        let removed = tx.execute("DELETE FROM entries WHERE id = ?", params![id])?;
        tx.commit()?;
        Ok(removed > 0)
    }

    pub fn entry_count(&self) -> StorageResult<usize> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM entries", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    // ── Children ──

    pub fn list_child_profiles(&self) -> StorageResult<Vec<ChildProfile>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, display_name, created_at, credential_json FROM children
             ORDER BY created_at ASC, id ASC",
        )?;
        let rows: Vec<(i64, String, i64, String)> = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<Result<_, _>>()?;

        drop(stmt);
        drop(conn);

        Ok(rows
            .into_iter()
            .map(|(id, display_name, created_at, credential_json)| ChildProfile {
                id: ChildId(id),
                display_name,
                created_at,
                credential: credential_from_json(ChildId(id), &credential_json),
            })
            .collect())
    }

    pub fn get_child_profile(&self, id: ChildId) -> StorageResult<Option<ChildProfile>> {
        let conn = self.lock()?;
        let result = conn.query_row(
            "SELECT display_name, created_at, credential_json FROM children WHERE id = ?",
            params![id.0],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                ))
            },
        );

        match result {
            Ok((display_name, created_at, credential_json)) => Ok(Some(ChildProfile {
                id,
                display_name,
                created_at,
                credential: credential_from_json(id, &credential_json),
            })),
            Err(duckdb::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn upsert_child_profile(&self, profile: &ChildProfile) -> StorageResult<()> {
        let credential_json = serde_json::to_string(&profile.credential)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO children (id, display_name, created_at, credential_json)
             VALUES (?, ?, ?, ?)",
            params![profile.id.0, profile.display_name, profile.created_at, credential_json],
        )?;
        Ok(())
    }

    pub fn delete_child_profile(&self, id: ChildId) -> StorageResult<bool> {
        let conn = self.lock()?;
        let removed = conn.execute("DELETE FROM children WHERE id = ?", params![id.0])?;
        Ok(removed > 0)
    }

    /// Issues the next child id and records it as the high-water mark, so an
    /// id stays spent after its child is removed.
    pub fn reserve_child_id(&self) -> StorageResult<ChildId> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let last: Option<i64> = tx.query_row(
            "SELECT MAX(value) FROM roster_meta WHERE key = 'last_child_id'",
            [],
            |row| row.get(0),
        )?;
        let highest: Option<i64> =
            tx.query_row("SELECT MAX(id) FROM children", [], |row| row.get(0))?;
        let next = last.unwrap_or(0).max(highest.unwrap_or(0)) + 1;
        tx.execute(
            "INSERT OR REPLACE INTO roster_meta (key, value) VALUES ('last_child_id', ?)",
            params![next],
        )?;
        tx.commit()?;
        Ok(ChildId(next))
    }
}

/// Parses a stored credential record. A record that no longer parses keeps
/// its child on the roster with empty key material, so the child is still a
/// discovery candidate and login reports the record as unreadable.
fn credential_from_json(child: ChildId, credential_json: &str) -> CredentialRecord {
    serde_json::from_str(credential_json).unwrap_or_else(|e| {
        warn!(%child, error = %e, "Unreadable credential record");
        CredentialRecord {
            wrapped_password: Vec::new(),
            salt: Vec::new(),
            nonce: Vec::new(),
            iterations: None,
        }
    })
}

/// Rebuilds an entry from its row. Damage never drops the row: a sealed body
/// that is not valid JSON is kept as a string so it surfaces as an
/// unrecognized entry, and an unreadable target list falls back to the
/// targets indexed for it.
fn entry_from_row(
    id: String,
    timestamp: i64,
    targets_json: &str,
    sealed_json: String,
    indexed_targets: Vec<TimelineId>,
) -> EntryRecord {
    let targets = serde_json::from_str(targets_json).unwrap_or_else(|e| {
        warn!(entry = %id, error = %e, "Unreadable target list, using indexed targets");
        indexed_targets
    });
    let sealed = serde_json::from_str(&sealed_json)
        .unwrap_or(serde_json::Value::String(sealed_json));
    EntryRecord {
        id,
        timestamp,
        targets,
        sealed,
    }
}

impl EntryStore for DuckDbStore {
    fn put(&self, entry: &EntryRecord) -> StoreResult<String> {
        self.insert_entry(entry)?;
        Ok(entry.id.clone())
    }

    fn get(&self, id: &str) -> StoreResult<Option<EntryRecord>> {
        Ok(self.get_entry(id)?)
    }

    fn query_by_target(&self, timeline: &TimelineId) -> StoreResult<Vec<EntryRecord>> {
        Ok(self.entries_for(timeline, false, None)?)
    }

    fn query_recent(&self, timeline: &TimelineId, limit: usize) -> StoreResult<Vec<EntryRecord>> {
        Ok(self.entries_for(timeline, true, Some(limit))?)
    }

    fn delete(&self, id: &str) -> StoreResult<bool> {
        Ok(self.delete_entry(id)?)
    }
}

impl RosterStore for DuckDbStore {
    fn list_children(&self) -> StoreResult<Vec<ChildProfile>> {
        Ok(self.list_child_profiles()?)
    }

    fn get_child(&self, id: ChildId) -> StoreResult<Option<ChildProfile>> {
        Ok(self.get_child_profile(id)?)
    }

    fn save_child(&self, profile: &ChildProfile) -> StoreResult<()> {
        Ok(self.upsert_child_profile(profile)?)
    }

    fn remove_child(&self, id: ChildId) -> StoreResult<bool> {
        Ok(self.delete_child_profile(id)?)
    }

    fn allocate_child_id(&self) -> StoreResult<ChildId> {
        Ok(self.reserve_child_id()?)
    }
}

fn initialize_schema(conn: &Connection) -> StorageResult<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS entries (
            id VARCHAR PRIMARY KEY,
            timestamp BIGINT NOT NULL,
            targets_json TEXT NOT NULL,
            sealed_json TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_entries_timestamp ON entries(timestamp);

        CREATE TABLE IF NOT EXISTS entry_targets (
            entry_id VARCHAR NOT NULL,
            timeline VARCHAR NOT NULL,
            PRIMARY KEY (entry_id, timeline)
        );
        CREATE INDEX IF NOT EXISTS idx_entry_targets_timeline ON entry_targets(timeline);

        CREATE TABLE IF NOT EXISTS children (
            id BIGINT PRIMARY KEY,
            display_name VARCHAR NOT NULL,
            created_at BIGINT NOT NULL,
            credential_json TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS roster_meta (
            key VARCHAR PRIMARY KEY,
            value BIGINT NOT NULL
        );
        "#,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: &str, ts: i64, targets: Vec<TimelineId>) -> EntryRecord {
        EntryRecord {
            id: id.into(),
            timestamp: ts,
            targets,
            sealed: json!({ "nonce": "AAAA" }),
        }
    }

    #[test]
    fn put_get_delete() {
        let store = DuckDbStore::open_in_memory().unwrap();
        let entry = record("a", 1, vec![TimelineId::General]);
        store.put(&entry).unwrap();
        assert_eq!(store.get("a").unwrap(), Some(entry));
        assert!(store.delete("a").unwrap());
        assert_eq!(store.get("a").unwrap(), None);
        assert!(!store.delete("a").unwrap());
    }

    #[test]
    fn duplicate_put_is_rejected() {
        let store = DuckDbStore::open_in_memory().unwrap();
        store.put(&record("a", 1, vec![TimelineId::General])).unwrap();
        let err = store.put(&record("a", 2, vec![TimelineId::General])).unwrap_err();
        assert!(matches!(err, kinlog_timeline::StoreError::Duplicate(_)));
    }

    #[test]
    fn queries_follow_targets_and_order() {
        let store = DuckDbStore::open_in_memory().unwrap();
        store.put(&record("a", 30, vec![TimelineId::General])).unwrap();
        store.put(&record("b", 10, vec![TimelineId::General, TimelineId::child(1)])).unwrap();
        store.put(&record("c", 20, vec![TimelineId::child(1)])).unwrap();

        let ids = |v: Vec<EntryRecord>| v.into_iter().map(|e| e.id).collect::<Vec<_>>();
        assert_eq!(ids(store.query_by_target(&TimelineId::General).unwrap()), vec!["b", "a"]);
        assert_eq!(ids(store.query_by_target(&TimelineId::child(1)).unwrap()), vec!["b", "c"]);
        assert_eq!(ids(store.query_recent(&TimelineId::child(1), 1).unwrap()), vec!["c"]);
        assert!(store.query_by_target(&TimelineId::child(2)).unwrap().is_empty());
    }

    #[test]
    fn unparseable_body_is_kept_as_string() {
        let store = DuckDbStore::open_in_memory().unwrap();
        {
            let conn = store.lock().unwrap();
            conn.execute(
                "INSERT INTO entries VALUES ('x', 1, '[\"general\"]', 'not json')",
                [],
            )
            .unwrap();
        }
        let entry = store.get("x").unwrap().unwrap();
        assert_eq!(entry.sealed, json!("not json"));
    }

    #[test]
    fn damaged_target_list_still_loads() {
        let store = DuckDbStore::open_in_memory().unwrap();
        {
            let conn = store.lock().unwrap();
            conn.execute(
                "INSERT INTO entries VALUES ('y', 1, 'garbage', '{\"keys\": 5}')",
                [],
            )
            .unwrap();
            conn.execute("INSERT INTO entry_targets VALUES ('y', 'child:3')", [])
                .unwrap();
        }

        let loaded = store.query_by_target(&TimelineId::child(3)).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].targets, vec![TimelineId::child(3)]);
        assert_eq!(
            store.get("y").unwrap().unwrap().targets,
            vec![TimelineId::child(3)]
        );
    }

    #[test]
    fn child_ids_are_not_reissued() {
        let store = DuckDbStore::open_in_memory().unwrap();
        let first = store.allocate_child_id().unwrap();
        assert_eq!(first, ChildId(1));
        assert_eq!(store.allocate_child_id().unwrap(), ChildId(2));
    }

    #[test]
    fn corrupt_credential_keeps_child_listed() {
        let store = DuckDbStore::open_in_memory().unwrap();
        {
            let conn = store.lock().unwrap();
            conn.execute("INSERT INTO children VALUES (4, 'Dee', 1, '{oops')", [])
                .unwrap();
        }
        let children = store.list_children().unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].id, ChildId(4));
        assert!(children[0].credential.nonce.is_empty());
        assert!(store.get_child(ChildId(4)).unwrap().is_some());
        assert_eq!(store.allocate_child_id().unwrap(), ChildId(5));
    }
}
