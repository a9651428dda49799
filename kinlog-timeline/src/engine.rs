//! Engine facade tying codecs, discovery, roster and session together.

use std::sync::Arc;

use kinlog_crypto::{unwrap_credential, wrap_credential, CryptoProvider, Opened, SystemCrypto};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::codec;
use crate::config::EngineConfig;
use crate::discovery::{DiscoveryOutcome, TimelineDiscovery, TimelineLoad, UnlockOutcome};
use crate::dispatch::{open_entry, open_entry_as, OpenedEntry};
use crate::entry::{now_millis, EntryRecord};
use crate::error::{EntryError, TimelineError, TimelineResult};
use crate::identity::{ChildId, TimelineId};
use crate::roster::{discovery_order, ChildProfile};
use crate::session::{CredentialFailure, SessionPasswords};
use crate::store::{EntryStore, RosterStore};

/// Timeline engine over a store that holds both entries and the roster.
pub struct TimelineEngine<S: EntryStore + RosterStore + 'static> {
    store: Arc<S>,
    crypto: Arc<dyn CryptoProvider>,
    config: EngineConfig,
    discovery: TimelineDiscovery<S>,
}

impl<S: EntryStore + RosterStore + 'static> TimelineEngine<S> {
    /// Creates an engine with an explicit crypto provider.
    ///
    /// The provider's own KDF parameters are used for new keys;
    /// `config.kdf_iterations` only matters for [`Self::with_system_crypto`].
    pub fn new(
        store: Arc<S>,
        crypto: Arc<dyn CryptoProvider>,
        config: EngineConfig,
    ) -> TimelineResult<Self> {
        config.validate()?;
        let discovery = TimelineDiscovery::new(
            Arc::clone(&store),
            Arc::clone(&crypto),
            config.probe_size,
            config.discovery,
        );
        Ok(Self {
            store,
            crypto,
            config,
            discovery,
        })
    }

    /// Creates an engine backed by [`SystemCrypto`], failing if the platform
    /// primitives are unavailable.
    pub fn with_system_crypto(store: Arc<S>, config: EngineConfig) -> TimelineResult<Self> {
        let crypto = SystemCrypto::new(config.kdf_params())?;
        Self::new(store, Arc::new(crypto), config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn crypto(&self) -> &dyn CryptoProvider {
        self.crypto.as_ref()
    }

    // ── Entries ──

    /// Seals `content` for one timeline and stores it. Returns the entry id.
    pub fn write_entry(
        &self,
        timeline: TimelineId,
        password: &str,
        timestamp: i64,
        content: &[u8],
    ) -> TimelineResult<String> {
        let record = self.seal_record(timeline, password, timestamp, content)?;
        let id = self.store.put(&record)?;
        debug!(%timeline, entry = %id, "Entry written");
        Ok(id)
    }

    /// Writes the same content to several timelines, one record per target.
    ///
    /// Every record is sealed before any is stored. If the store rejects one
    /// part-way through, the records already stored by this call are deleted
    /// again before the error is returned, so callers see all or nothing.
    pub fn write_to_many(
        &self,
        targets: &[(TimelineId, &str)],
        timestamp: i64,
        content: &[u8],
    ) -> TimelineResult<Vec<String>> {
        let records = targets
            .iter()
            .map(|(timeline, password)| self.seal_record(*timeline, password, timestamp, content))
            .collect::<TimelineResult<Vec<_>>>()?;

        let mut written = Vec::with_capacity(records.len());
        for record in &records {
            match self.store.put(record) {
                Ok(id) => written.push(id),
                Err(err) => {
                    for id in &written {
                        if let Err(cleanup) = self.store.delete(id) {
                            warn!(entry = %id, error = %cleanup, "Could not roll back partial write");
                        }
                    }
                    return Err(err.into());
                }
            }
        }
        debug!(targets = written.len(), "Entry written to several timelines");
        Ok(written)
    }

    fn seal_record(
        &self,
        timeline: TimelineId,
        password: &str,
        timestamp: i64,
        content: &[u8],
    ) -> TimelineResult<EntryRecord> {
        if password.is_empty() {
            return Err(TimelineError::EmptyPassword);
        }
        let envelope = codec::single::encrypt(self.crypto.as_ref(), password, content)?;
        Ok(EntryRecord {
            id: EntryRecord::new_id(),
            timestamp,
            targets: vec![timeline],
            sealed: serde_json::to_value(&envelope)?,
        })
    }

    /// Serializes `content` as JSON and writes it, timestamped now.
    pub fn write_content<T: Serialize>(
        &self,
        timeline: TimelineId,
        password: &str,
        content: &T,
    ) -> TimelineResult<String> {
        let bytes = serde_json::to_vec(content)?;
        self.write_entry(timeline, password, now_millis(), &bytes)
    }

    /// Opens a single entry by id.
    pub fn read_entry(&self, id: &str, password: &str) -> TimelineResult<OpenedEntry> {
        let record = self
            .store
            .get(id)?
            .ok_or_else(|| TimelineError::EntryNotFound(id.to_string()))?;
        open_entry(self.crypto.as_ref(), &record, password).map_err(|source| TimelineError::Entry {
            id: id.to_string(),
            source,
        })
    }

    pub fn delete_entry(&self, id: &str) -> TimelineResult<bool> {
        let removed = self.store.delete(id)?;
        if removed {
            debug!(entry = %id, "Entry deleted");
        }
        Ok(removed)
    }

    // ── Discovery ──

    /// Discovery candidates: General, then children in creation order.
    pub fn candidates(&self) -> TimelineResult<Vec<TimelineId>> {
        Ok(discovery_order(&self.store.list_children()?))
    }

    pub async fn discover(&self, password: &str) -> TimelineResult<DiscoveryOutcome> {
        let candidates = self.candidates()?;
        self.discovery.discover(password, &candidates).await
    }

    pub async fn unlock(&self, password: &str) -> TimelineResult<UnlockOutcome> {
        let candidates = self.candidates()?;
        self.discovery.unlock(password, &candidates).await
    }

    /// Loads a timeline whose password is already known.
    pub async fn open_timeline(
        &self,
        timeline: TimelineId,
        password: &str,
    ) -> TimelineResult<TimelineLoad> {
        self.discovery.load_timeline(timeline, password).await
    }

    // ── Children ──

    /// Adds a child whose password is recoverable with the parent password.
    pub fn add_child(
        &self,
        parent_password: &str,
        display_name: &str,
        child_password: &str,
    ) -> TimelineResult<ChildProfile> {
        if parent_password.is_empty() || child_password.is_empty() {
            return Err(TimelineError::EmptyPassword);
        }
        self.verify_parent_password(parent_password)?;

        let profile = ChildProfile {
            id: self.store.allocate_child_id()?,
            display_name: display_name.to_string(),
            created_at: now_millis(),
            credential: wrap_credential(self.crypto.as_ref(), child_password, parent_password)?,
        };
        self.store.save_child(&profile)?;
        info!(child = %profile.id, "Child added");
        Ok(profile)
    }

    /// Replaces a child's credential record. Entries already written under
    /// the old password are left as they are.
    pub fn change_child_password(
        &self,
        parent_password: &str,
        child: ChildId,
        new_password: &str,
    ) -> TimelineResult<ChildProfile> {
        if parent_password.is_empty() || new_password.is_empty() {
            return Err(TimelineError::EmptyPassword);
        }
        let mut profile = self
            .store
            .get_child(child)?
            .ok_or(TimelineError::ChildNotFound(child))?;

        if let Opened::WrongKey =
            unwrap_credential(self.crypto.as_ref(), &profile.credential, parent_password)?
        {
            return Err(TimelineError::ParentPasswordMismatch);
        }

        profile.credential = wrap_credential(self.crypto.as_ref(), new_password, parent_password)?;
        self.store.save_child(&profile)?;
        info!(%child, "Child password changed");
        Ok(profile)
    }

    pub fn remove_child(&self, child: ChildId) -> TimelineResult<()> {
        if !self.store.remove_child(child)? {
            return Err(TimelineError::ChildNotFound(child));
        }
        info!(%child, "Child removed");
        Ok(())
    }

    // ── Session ──

    pub fn new_session(&self) -> SessionPasswords {
        SessionPasswords::new(self.config.session_idle_timeout())
    }

    /// Rebuilds `session` from scratch for the parent.
    pub fn login_parent(
        &self,
        session: &mut SessionPasswords,
        parent_password: &str,
    ) -> TimelineResult<Vec<CredentialFailure>> {
        let roster = self.store.list_children()?;
        session.login_parent(self.crypto.as_ref(), parent_password, &roster)
    }

    /// Checks the parent password against the roster's credential records:
    /// any one that opens is proof enough. With no record to go on, the
    /// General timeline's most recent entries are tried instead. A family
    /// with no children and no General entries has nothing to check against,
    /// so any password is taken.
    fn verify_parent_password(&self, parent_password: &str) -> TimelineResult<()> {
        let roster = self.store.list_children()?;
        for child in &roster {
            match unwrap_credential(self.crypto.as_ref(), &child.credential, parent_password) {
                Ok(Opened::Plaintext(_)) => return Ok(()),
                Ok(Opened::WrongKey) => {}
                Err(e) => {
                    warn!(child = %child.id, error = %e, "Skipping unreadable credential record");
                }
            }
        }

        let recent = self
            .store
            .query_recent(&TimelineId::General, self.config.probe_size)?;
        if roster.is_empty() && recent.is_empty() {
            return Ok(());
        }
        for record in &recent {
            match open_entry_as(self.crypto.as_ref(), record, parent_password, &TimelineId::General) {
                Ok(_) => return Ok(()),
                Err(EntryError::Fault(e)) => return Err(e.into()),
                Err(_) => {}
            }
        }
        Err(TimelineError::ParentPasswordMismatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{StoreError, StoreResult};
    use crate::store::MemoryStore;
    use kinlog_crypto::KdfParams;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn engine() -> TimelineEngine<MemoryStore> {
        let crypto = SystemCrypto::new(KdfParams::new(1_000)).unwrap();
        TimelineEngine::new(
            Arc::new(MemoryStore::new()),
            Arc::new(crypto),
            EngineConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn write_then_read() {
        let engine = engine();
        let id = engine
            .write_entry(TimelineId::General, "pw", 1_000, b"hello")
            .unwrap();
        let opened = engine.read_entry(&id, "pw").unwrap();
        assert_eq!(opened.plaintext(), b"hello");
        assert_eq!(opened.timestamp, 1_000);
        assert_eq!(opened.targets, vec![TimelineId::General]);
    }

    #[test]
    fn read_with_wrong_password_names_entry() {
        let engine = engine();
        let id = engine
            .write_entry(TimelineId::General, "pw", 1, b"hello")
            .unwrap();
        match engine.read_entry(&id, "nope") {
            Err(TimelineError::Entry { id: failed, source }) => {
                assert_eq!(failed, id);
                assert!(source.is_mismatch());
            }
            other => panic!("expected entry mismatch, got {other:?}"),
        }
    }

    #[test]
    fn missing_entry() {
        assert!(matches!(
            engine().read_entry("nope", "pw"),
            Err(TimelineError::EntryNotFound(_))
        ));
    }

    #[test]
    fn write_to_many_makes_one_record_per_target() {
        let engine = engine();
        let ids = engine
            .write_to_many(
                &[(TimelineId::General, "parent"), (TimelineId::child(1), "kid")],
                5,
                b"shared",
            )
            .unwrap();
        assert_eq!(ids.len(), 2);
        assert_ne!(ids[0], ids[1]);
        assert!(engine.read_entry(&ids[1], "kid").is_ok());
        assert!(engine.read_entry(&ids[1], "parent").is_err());
    }

    #[test]
    fn write_to_many_with_one_empty_password_writes_nothing() {
        let engine = engine();
        assert!(matches!(
            engine.write_to_many(&[(TimelineId::General, "parent"), (TimelineId::child(1), "")], 5, b"x"),
            Err(TimelineError::EmptyPassword)
        ));
        assert_eq!(engine.store().entry_count(), 0);
    }

    /// Memory store whose entry writes start failing after a fixed number.
    struct FailingStore {
        inner: MemoryStore,
        puts_left: AtomicUsize,
    }

    impl EntryStore for FailingStore {
        fn put(&self, entry: &EntryRecord) -> StoreResult<String> {
            let budget = self.puts_left.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                n.checked_sub(1)
            });
            if budget.is_err() {
                return Err(StoreError::Backend("disk full".into()));
            }
            self.inner.put(entry)
        }
        fn get(&self, id: &str) -> StoreResult<Option<EntryRecord>> {
            self.inner.get(id)
        }
        fn query_by_target(&self, t: &TimelineId) -> StoreResult<Vec<EntryRecord>> {
            self.inner.query_by_target(t)
        }
        fn query_recent(&self, t: &TimelineId, n: usize) -> StoreResult<Vec<EntryRecord>> {
            self.inner.query_recent(t, n)
        }
        fn delete(&self, id: &str) -> StoreResult<bool> {
            self.inner.delete(id)
        }
    }

    impl RosterStore for FailingStore {
        fn list_children(&self) -> StoreResult<Vec<ChildProfile>> {
            self.inner.list_children()
        }
        fn get_child(&self, id: ChildId) -> StoreResult<Option<ChildProfile>> {
            self.inner.get_child(id)
        }
        fn save_child(&self, profile: &ChildProfile) -> StoreResult<()> {
            self.inner.save_child(profile)
        }
        fn remove_child(&self, id: ChildId) -> StoreResult<bool> {
            self.inner.remove_child(id)
        }
        fn allocate_child_id(&self) -> StoreResult<ChildId> {
            self.inner.allocate_child_id()
        }
    }

    #[test]
    fn write_to_many_rolls_back_on_store_failure() {
        let store = Arc::new(FailingStore {
            inner: MemoryStore::new(),
            puts_left: AtomicUsize::new(2),
        });
        let crypto = SystemCrypto::new(KdfParams::new(1_000)).unwrap();
        let engine =
            TimelineEngine::new(Arc::clone(&store), Arc::new(crypto), EngineConfig::default()).unwrap();

        let err = engine
            .write_to_many(
                &[
                    (TimelineId::General, "parent"),
                    (TimelineId::child(1), "kid"),
                    (TimelineId::child(2), "other"),
                ],
                5,
                b"shared",
            )
            .unwrap_err();
        assert!(matches!(err, TimelineError::Store(_)));
        assert_eq!(store.inner.entry_count(), 0);
    }

    #[test]
    fn empty_password_rejected_for_writes() {
        let engine = engine();
        assert!(matches!(
            engine.write_entry(TimelineId::General, "", 1, b"x"),
            Err(TimelineError::EmptyPassword)
        ));
    }

    #[test]
    fn add_child_requires_matching_parent() {
        let engine = engine();
        let first = engine.add_child("parent", "Ana", "ana-pw").unwrap();
        assert_eq!(first.id, ChildId(1));

        assert!(matches!(
            engine.add_child("not-parent", "Ben", "ben-pw"),
            Err(TimelineError::ParentPasswordMismatch)
        ));
        let second = engine.add_child("parent", "Ben", "ben-pw").unwrap();
        assert_eq!(second.id, ChildId(2));
    }

    #[test]
    fn first_child_checked_against_general_entries() {
        let engine = engine();
        engine
            .write_entry(TimelineId::General, "parent", 1, b"x")
            .unwrap();
        assert!(matches!(
            engine.add_child("other", "Ana", "ana-pw"),
            Err(TimelineError::ParentPasswordMismatch)
        ));
        assert!(engine.add_child("parent", "Ana", "ana-pw").is_ok());
    }

    #[test]
    fn damaged_first_record_does_not_block_add_child() {
        let engine = engine();
        let mut ana = engine.add_child("parent", "Ana", "ana-pw").unwrap();
        engine.add_child("parent", "Ben", "ben-pw").unwrap();
        ana.credential.nonce.truncate(3);
        engine.store().save_child(&ana).unwrap();

        assert!(engine.add_child("parent", "Cleo", "cleo-pw").is_ok());
        assert!(matches!(
            engine.add_child("stranger", "Dan", "dan-pw"),
            Err(TimelineError::ParentPasswordMismatch)
        ));
    }

    #[test]
    fn unverifiable_roster_rejects_parent() {
        let engine = engine();
        let mut ana = engine.add_child("parent", "Ana", "ana-pw").unwrap();
        ana.credential.nonce.truncate(3);
        engine.store().save_child(&ana).unwrap();

        assert!(matches!(
            engine.add_child("anything", "Ben", "ben-pw"),
            Err(TimelineError::ParentPasswordMismatch)
        ));
        let mut session = engine.new_session();
        assert!(engine.login_parent(&mut session, "anything").is_err());
        assert!(session.is_empty());
    }

    #[test]
    fn removed_child_id_is_never_reissued() {
        let engine = engine();
        let ana = engine.add_child("parent", "Ana", "ana-pw").unwrap();
        engine
            .write_entry(TimelineId::Child(ana.id), "ana-pw", 1, b"ana only")
            .unwrap();
        engine.remove_child(ana.id).unwrap();

        let ben = engine.add_child("parent", "Ben", "ben-pw").unwrap();
        assert_ne!(ben.id, ana.id);
        assert!(engine
            .store()
            .query_by_target(&TimelineId::Child(ben.id))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn change_and_remove_child() {
        let engine = engine();
        let child = engine.add_child("parent", "Ana", "old").unwrap();
        let before = child.credential.clone();

        let updated = engine.change_child_password("parent", child.id, "new").unwrap();
        assert_ne!(updated.credential, before);

        let mut session = engine.new_session();
        engine.login_parent(&mut session, "parent").unwrap();
        assert_eq!(session.password_for(&TimelineId::Child(child.id)), Some("new"));

        engine.remove_child(child.id).unwrap();
        assert!(matches!(
            engine.remove_child(child.id),
            Err(TimelineError::ChildNotFound(_))
        ));
        assert_eq!(engine.candidates().unwrap(), vec![TimelineId::General]);
    }

    #[test]
    fn change_password_with_wrong_parent() {
        let engine = engine();
        let child = engine.add_child("parent", "Ana", "old").unwrap();
        assert!(matches!(
            engine.change_child_password("wrong", child.id, "new"),
            Err(TimelineError::ParentPasswordMismatch)
        ));
        assert!(matches!(
            engine.change_child_password("parent", ChildId(42), "new"),
            Err(TimelineError::ChildNotFound(_))
        ));
    }

    #[test]
    fn invalid_config_rejected() {
        let crypto = SystemCrypto::new(KdfParams::new(1_000)).unwrap();
        let config = EngineConfig {
            probe_size: 0,
            ..EngineConfig::default()
        };
        assert!(TimelineEngine::new(Arc::new(MemoryStore::new()), Arc::new(crypto), config).is_err());
    }
}
