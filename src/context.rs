// src/context.rs
//
// Persistence context
//
// CRITICAL RULES:
// - Owns the identity map and the pending change set, nothing else
// - Shared by reference; exactly one context per unit of work
// - Never used concurrently from multiple threads without external
//   synchronization (the mutexes protect invariants, not throughput)
// - Writes are staged here and only reach the store on flush

use log::debug;
use serde_json::Value;
use std::collections::hash_map::Entry as MapEntry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::entity::{Entity, EntityState};
use crate::error::{Error, Result};
use crate::key::{CompositeKey, EntityKey};
use crate::store::{Applied, Store, StoreResult, StoredRecord, WriteOp};

/// How store work issued from async operations is executed.
///
/// `Inline` runs the store call on the calling task: right for in-process
/// stores whose operations are cheap. `Offload` moves the call to the
/// blocking thread pool: right for stores that do real file I/O. A job
/// already submitted under `Offload` keeps running even if the caller drops
/// the future.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecPolicy {
    #[default]
    Inline,
    Offload,
}

#[derive(Debug, Clone)]
struct TrackedEntry {
    payload: Value,
    token: Option<i64>,
    state: EntityState,
}

type TrackedSets = HashMap<String, HashMap<CompositeKey, TrackedEntry>>;

enum LocalHit {
    Miss,
    Deleted,
    Found(Value),
}

/// The shared persistence context: identity map plus pending change set.
///
/// Owned by exactly one [`crate::uow::UnitOfWork`] for its lifetime;
/// repositories, work areas and logical areas only hold references.
pub struct DataContext {
    store: Mutex<Option<Arc<dyn Store>>>,
    policy: ExecPolicy,
    tracked: Mutex<TrackedSets>,
}

impl DataContext {
    pub fn new(store: Arc<dyn Store>, policy: ExecPolicy) -> Self {
        Self {
            store: Mutex::new(Some(store)),
            policy,
            tracked: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> ExecPolicy {
        self.policy
    }

    /// Handle to the wrapped store, or [`Error::Disposed`] once released.
    pub fn store_handle(&self) -> Result<Arc<dyn Store>> {
        let guard = self
            .store
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.clone().ok_or(Error::Disposed)
    }

    /// Releases the store handle and evicts all tracked state. Idempotent:
    /// the second and later calls do nothing.
    pub(crate) fn release(&self) {
        let mut guard = self
            .store
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if guard.take().is_some() {
            self.lock_tracked().clear();
            debug!("context released");
        }
    }

    fn lock_tracked(&self) -> MutexGuard<'_, TrackedSets> {
        self.tracked
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn local_lookup(&self, set: &str, key: &CompositeKey) -> LocalHit {
        let tracked = self.lock_tracked();
        match tracked.get(set).and_then(|entries| entries.get(key)) {
            Some(entry) if entry.state == EntityState::Deleted => LocalHit::Deleted,
            Some(entry) => LocalHit::Found(entry.payload.clone()),
            None => LocalHit::Miss,
        }
    }

    /// Attaches a loaded record as `Unchanged`, unless the key is already
    /// tracked (the tracked instance wins).
    pub(crate) fn attach_loaded(&self, set: &str, record: &StoredRecord) {
        let mut tracked = self.lock_tracked();
        let entries = tracked.entry(set.to_string()).or_default();
        entries.entry(record.key.clone()).or_insert_with(|| TrackedEntry {
            payload: record.payload.clone(),
            token: Some(record.token),
            state: EntityState::Unchanged,
        });
    }

    /// Keyed lookup: identity map first, then the store. A store hit is
    /// attached as `Unchanged`; a key staged `Deleted` reads as absent.
    pub fn find<E: Entity>(&self, key: &CompositeKey) -> Result<Option<E>> {
        match self.local_lookup(E::SET, key) {
            LocalHit::Found(payload) => Ok(Some(serde_json::from_value(payload)?)),
            LocalHit::Deleted => Ok(None),
            LocalHit::Miss => {
                let store = self.store_handle()?;
                match store.get(E::SET, key)? {
                    Some(record) => {
                        self.attach_loaded(E::SET, &record);
                        Ok(Some(serde_json::from_value(record.payload)?))
                    }
                    None => Ok(None),
                }
            }
        }
    }

    /// Async form of [`DataContext::find`]; the store read follows the
    /// configured [`ExecPolicy`].
    pub async fn find_async<E: Entity>(&self, key: &CompositeKey) -> Result<Option<E>> {
        match self.local_lookup(E::SET, key) {
            LocalHit::Found(payload) => Ok(Some(serde_json::from_value(payload)?)),
            LocalHit::Deleted => Ok(None),
            LocalHit::Miss => {
                let lookup = key.clone();
                let record = self
                    .run_store(move |store| store.get(E::SET, &lookup))
                    .await?;
                match record {
                    Some(record) => {
                        self.attach_loaded(E::SET, &record);
                        Ok(Some(serde_json::from_value(record.payload)?))
                    }
                    None => Ok(None),
                }
            }
        }
    }

    /// Decodes a scanned record through the identity map: a tracked
    /// instance wins over the freshly-read payload, and an untracked record
    /// is attached as `Unchanged`. Records staged `Deleted` still decode
    /// from the store payload (queries read committed data).
    pub(crate) fn resolve_loaded<E: Entity>(&self, record: StoredRecord) -> Result<E> {
        match self.local_lookup(E::SET, &record.key) {
            LocalHit::Found(payload) => Ok(serde_json::from_value(payload)?),
            LocalHit::Deleted => Ok(serde_json::from_value(record.payload)?),
            LocalHit::Miss => {
                self.attach_loaded(E::SET, &record);
                Ok(serde_json::from_value(record.payload)?)
            }
        }
    }

    /// Current lifecycle state for a key; `Detached` when untracked.
    pub fn entry_state(&self, set: &str, key: &CompositeKey) -> EntityState {
        let tracked = self.lock_tracked();
        tracked
            .get(set)
            .and_then(|entries| entries.get(key))
            .map(|entry| entry.state)
            .unwrap_or(EntityState::Detached)
    }

    /// Stages an entity for insertion. A detached entity is tracked fresh as
    /// `Added`; an already-tracked one is re-marked `Added`.
    pub fn stage_insert<E: Entity>(&self, entity: &E) -> Result<()> {
        self.store_handle()?;
        let key = entity.key().encode();
        let payload = serde_json::to_value(entity)?;

        let mut tracked = self.lock_tracked();
        let entries = tracked.entry(E::SET.to_string()).or_default();
        match entries.entry(key) {
            MapEntry::Occupied(mut slot) => {
                let entry = slot.get_mut();
                entry.payload = payload;
                entry.state = EntityState::Added;
            }
            MapEntry::Vacant(slot) => {
                slot.insert(TrackedEntry {
                    payload,
                    token: None,
                    state: EntityState::Added,
                });
            }
        }
        Ok(())
    }

    /// Stages an entity for update. An untracked entity is attached first;
    /// entries already staged `Added` or `Deleted` keep that state (insert
    /// followed by update in the same scope still inserts).
    pub fn stage_update<E: Entity>(&self, entity: &E) -> Result<()> {
        self.store_handle()?;
        let key = entity.key().encode();
        let payload = serde_json::to_value(entity)?;

        let mut tracked = self.lock_tracked();
        let entries = tracked.entry(E::SET.to_string()).or_default();
        match entries.entry(key) {
            MapEntry::Occupied(mut slot) => {
                let entry = slot.get_mut();
                entry.payload = payload;
                if entry.state != EntityState::Added && entry.state != EntityState::Deleted {
                    entry.state = EntityState::Modified;
                }
            }
            MapEntry::Vacant(slot) => {
                slot.insert(TrackedEntry {
                    payload,
                    token: None,
                    state: EntityState::Modified,
                });
            }
        }
        Ok(())
    }

    /// Stages an entity for removal. A tracked entity is marked `Deleted`;
    /// an untracked one is attached, then removed; one staged `Added` is
    /// simply detached (there is nothing in the store to remove).
    pub fn stage_delete<E: Entity>(&self, entity: &E) -> Result<()> {
        self.store_handle()?;
        let key = entity.key().encode();

        let mut tracked = self.lock_tracked();
        let entries = tracked.entry(E::SET.to_string()).or_default();
        match entries.entry(key) {
            MapEntry::Occupied(mut slot) => {
                if slot.get().state == EntityState::Added {
                    slot.remove();
                } else {
                    slot.get_mut().state = EntityState::Deleted;
                }
            }
            MapEntry::Vacant(slot) => {
                slot.insert(TrackedEntry {
                    payload: serde_json::to_value(entity)?,
                    token: None,
                    state: EntityState::Deleted,
                });
            }
        }
        Ok(())
    }

    /// Number of entries staged for a write.
    pub fn pending_count(&self) -> usize {
        let tracked = self.lock_tracked();
        tracked
            .values()
            .flat_map(|entries| entries.values())
            .filter(|entry| entry.state != EntityState::Unchanged)
            .count()
    }

    /// Builds the ordered write batch for the pending change set. Entries
    /// are ordered by set and key so a batch is deterministic for a given
    /// change set.
    pub(crate) fn flush_plan(&self) -> Result<Vec<WriteOp>> {
        self.store_handle()?;
        let tracked = self.lock_tracked();

        let mut set_names: Vec<&String> = tracked.keys().collect();
        set_names.sort();

        let mut ops = Vec::new();
        for set in set_names {
            let entries = &tracked[set];
            let mut keys: Vec<&CompositeKey> = entries.keys().collect();
            keys.sort();
            for key in keys {
                let entry = &entries[key];
                match entry.state {
                    EntityState::Added => ops.push(WriteOp::Insert {
                        set: set.clone(),
                        key: key.clone(),
                        payload: entry.payload.clone(),
                    }),
                    EntityState::Modified => ops.push(WriteOp::Update {
                        set: set.clone(),
                        key: key.clone(),
                        payload: entry.payload.clone(),
                        expected: entry.token,
                    }),
                    EntityState::Deleted => ops.push(WriteOp::Delete {
                        set: set.clone(),
                        key: key.clone(),
                        expected: entry.token,
                    }),
                    EntityState::Unchanged | EntityState::Detached => {}
                }
            }
        }
        Ok(ops)
    }

    /// Settles the tracked state after a successful flush: inserts and
    /// updates become `Unchanged` with their new token, deletes are evicted.
    pub(crate) fn complete_flush(&self, applied: &[Applied]) {
        let mut tracked = self.lock_tracked();
        for outcome in applied {
            let Some(entries) = tracked.get_mut(&outcome.set) else {
                continue;
            };
            match outcome.token {
                Some(token) => {
                    if let Some(entry) = entries.get_mut(&outcome.key) {
                        entry.state = EntityState::Unchanged;
                        entry.token = Some(token);
                    }
                }
                None => {
                    entries.remove(&outcome.key);
                }
            }
        }
    }

    /// Runs a store job under the configured [`ExecPolicy`], keeping the
    /// store-level error intact for the caller to translate.
    pub(crate) async fn run_raw<T, F>(&self, job: F) -> Result<StoreResult<T>>
    where
        T: Send + 'static,
        F: FnOnce(Arc<dyn Store>) -> StoreResult<T> + Send + 'static,
    {
        let store = self.store_handle()?;
        match self.policy {
            ExecPolicy::Inline => Ok(job(store)),
            ExecPolicy::Offload => tokio::task::spawn_blocking(move || job(store))
                .await
                .map_err(|e| Error::Background(e.to_string())),
        }
    }

    /// Like [`DataContext::run_raw`] but folds the store error into the
    /// public error type.
    pub(crate) async fn run_store<T, F>(&self, job: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(Arc<dyn Store>) -> StoreResult<T> + Send + 'static,
    {
        Ok(self.run_raw(job).await??)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::EntityKey;
    use crate::store::MemoryStore;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        id: i64,
        body: String,
    }

    impl Entity for Note {
        const SET: &'static str = "notes";
        type Key = i64;

        fn key(&self) -> i64 {
            self.id
        }
    }

    fn ctx() -> DataContext {
        DataContext::new(Arc::new(MemoryStore::new()), ExecPolicy::Inline)
    }

    fn note(id: i64) -> Note {
        Note {
            id,
            body: format!("note {}", id),
        }
    }

    fn key_of(note: &Note) -> CompositeKey {
        note.key().encode()
    }

    #[test]
    fn insert_tracks_added() {
        let ctx = ctx();
        let n = note(1);
        ctx.stage_insert(&n).unwrap();
        assert_eq!(ctx.entry_state("notes", &key_of(&n)), EntityState::Added);
        assert_eq!(ctx.pending_count(), 1);
    }

    #[test]
    fn update_after_insert_stays_added() {
        let ctx = ctx();
        let mut n = note(1);
        ctx.stage_insert(&n).unwrap();
        n.body = "edited".to_string();
        ctx.stage_update(&n).unwrap();
        assert_eq!(ctx.entry_state("notes", &key_of(&n)), EntityState::Added);

        // The refreshed payload must be the one that gets inserted.
        let plan = ctx.flush_plan().unwrap();
        assert_eq!(plan.len(), 1);
        match &plan[0] {
            WriteOp::Insert { payload, .. } => assert_eq!(payload["body"], "edited"),
            other => panic!("expected insert, got {:?}", other),
        }
    }

    #[test]
    fn update_of_untracked_attaches_as_modified() {
        let ctx = ctx();
        let n = note(2);
        ctx.stage_update(&n).unwrap();
        assert_eq!(ctx.entry_state("notes", &key_of(&n)), EntityState::Modified);

        let plan = ctx.flush_plan().unwrap();
        match &plan[0] {
            WriteOp::Update { expected, .. } => assert_eq!(*expected, None),
            other => panic!("expected update, got {:?}", other),
        }
    }

    #[test]
    fn delete_of_added_detaches() {
        let ctx = ctx();
        let n = note(3);
        ctx.stage_insert(&n).unwrap();
        ctx.stage_delete(&n).unwrap();
        assert_eq!(ctx.entry_state("notes", &key_of(&n)), EntityState::Detached);
        assert_eq!(ctx.pending_count(), 0);
    }

    #[test]
    fn delete_of_untracked_attaches_then_removes() {
        let ctx = ctx();
        let n = note(4);
        ctx.stage_delete(&n).unwrap();
        assert_eq!(ctx.entry_state("notes", &key_of(&n)), EntityState::Deleted);
    }

    #[test]
    fn find_prefers_tracked_instance() {
        let ctx = ctx();
        let mut n = note(5);
        ctx.stage_insert(&n).unwrap();
        n.body = "tracked wins".to_string();
        ctx.stage_update(&n).unwrap();

        let found: Note = ctx.find(&key_of(&n)).unwrap().unwrap();
        assert_eq!(found.body, "tracked wins");
    }

    #[test]
    fn find_of_pending_delete_is_none() {
        let ctx = ctx();
        let n = note(6);
        ctx.stage_insert(&n).unwrap();
        // Commit path is exercised elsewhere; fake the settled state here.
        let applied = ctx.store_handle().unwrap().apply(ctx.flush_plan().unwrap()).unwrap();
        ctx.complete_flush(&applied);

        ctx.stage_delete(&n).unwrap();
        assert!(ctx.find::<Note>(&key_of(&n)).unwrap().is_none());
    }

    #[test]
    fn release_is_idempotent_and_blocks_later_use() {
        let ctx = ctx();
        ctx.release();
        ctx.release();
        assert!(matches!(ctx.find::<Note>(&1i64.encode()), Err(Error::Disposed)));
    }

    #[test]
    fn flush_settles_tokens() {
        let ctx = ctx();
        let n = note(7);
        ctx.stage_insert(&n).unwrap();
        let applied = ctx.store_handle().unwrap().apply(ctx.flush_plan().unwrap()).unwrap();
        ctx.complete_flush(&applied);

        assert_eq!(ctx.entry_state("notes", &key_of(&n)), EntityState::Unchanged);
        assert_eq!(ctx.pending_count(), 0);

        // A later update must carry the settled token.
        ctx.stage_update(&n).unwrap();
        let plan = ctx.flush_plan().unwrap();
        match &plan[0] {
            WriteOp::Update { expected, .. } => assert_eq!(*expected, Some(1)),
            other => panic!("expected update, got {:?}", other),
        }
    }
}
