//! In-memory state backend.
//!
//! Holds mappings, skips and target records in one process-local store.
//! Transactions stage their writes and publish them in a single step on
//! commit. An optional persistence hook (see [`super::file`]) saves the
//! state every `save_every` changes and on [`StateBackend::flush`]. A save
//! triggered by a change runs on the would-be state before it is published,
//! so a failed save leaves the previous state visible. Every saved state is
//! one the store actually passed through, so a record and its mapping are
//! always saved together.
//!
//! Tests use [`InMemoryStore::inject`] to force failures at each stage of a
//! write.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::debug;

use super::backend::{MappingStore, SkipLedger, StateBackend};
use super::{MappingEntry, SkipEntry, SkipReason};
use crate::core::{EntityType, TargetKey, TargetRecord};
use crate::error::{MigrateError, Result};
use crate::target::{StoredRecord, TargetFilter, TargetStore, WriteTransaction};

/// Failure injected into the write path, keyed by legacy id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Target insert is rejected as invalid data.
    RejectInsert(String),
    /// Target insert fails with an infrastructure error.
    FailInsert(String),
    /// Mapping insert fails with an infrastructure error.
    FailMapping(String),
    /// Commit fails after both writes were staged.
    FailCommit(String),
}

type Key = (EntityType, String);

/// Raw contents of an in-memory store.
#[derive(Debug, Clone, Default)]
pub struct MemoryState {
    pub(crate) mappings: HashMap<Key, MappingEntry>,
    pub(crate) skips: HashMap<Key, SkipReason>,
    pub(crate) records: HashMap<EntityType, BTreeMap<TargetKey, TargetRecord>>,
    pub(crate) next_key: i64,
}

impl MemoryState {
    pub(crate) fn record_count(&self) -> usize {
        self.records.values().map(BTreeMap::len).sum()
    }

    fn check_mapping(&self, entry: &MappingEntry, cleared: &[Key]) -> Result<()> {
        let key = (entry.entity_type, entry.legacy_id.clone());
        if self.mappings.contains_key(&key) {
            return Err(MigrateError::DuplicateMapping {
                entity_type: entry.entity_type,
                legacy_id: entry.legacy_id.clone(),
            });
        }
        if self.skips.contains_key(&key) && !cleared.contains(&key) {
            return Err(MigrateError::conflict(
                entry.entity_type,
                &entry.legacy_id,
                "record is marked skipped",
            ));
        }
        Ok(())
    }
}

pub(crate) type PersistFn = Arc<dyn Fn(&MemoryState) -> Result<()> + Send + Sync>;

/// Saves state through a [`PersistFn`] once enough changes piled up.
struct Persistence {
    save: PersistFn,
    save_every: usize,
}

struct Shared {
    state: Mutex<MemoryState>,
    faults: Mutex<Vec<Fault>>,
    persistence: Option<Persistence>,
    /// Changes applied since the last save.
    unsaved: Mutex<usize>,
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| MigrateError::State("in-memory state lock poisoned".into()))
}

impl Shared {
    fn has_fault(&self, fault: &Fault) -> Result<bool> {
        Ok(lock(&self.faults)?.contains(fault))
    }

    /// Apply `f` to the state. When a save is due the result is persisted
    /// before it is published.
    ///
    /// `f` must validate before it mutates: an error leaves the state as it
    /// was.
    fn update<T>(&self, f: impl FnOnce(&mut MemoryState) -> Result<T>) -> Result<T> {
        let mut state = lock(&self.state)?;
        let Some(persistence) = &self.persistence else {
            return f(&mut state);
        };

        let mut unsaved = lock(&self.unsaved)?;
        if *unsaved + 1 < persistence.save_every {
            let out = f(&mut state)?;
            *unsaved += 1;
            return Ok(out);
        }

        let mut next = state.clone();
        let out = f(&mut next)?;
        (persistence.save)(&next)?;
        *state = next;
        *unsaved = 0;
        Ok(out)
    }

    /// Save any changes not persisted yet.
    fn flush(&self) -> Result<()> {
        let Some(persistence) = &self.persistence else {
            return Ok(());
        };
        let state = lock(&self.state)?;
        let mut unsaved = lock(&self.unsaved)?;
        if *unsaved > 0 {
            (persistence.save)(&state)?;
            debug!("Saved {} buffered state changes", *unsaved);
            *unsaved = 0;
        }
        Ok(())
    }
}

/// Process-local backend for tests, dry runs and file-backed state.
#[derive(Clone)]
pub struct InMemoryStore {
    shared: Arc<Shared>,
    kind: &'static str,
}

impl InMemoryStore {
    /// Create an empty, non-persistent store.
    pub fn new() -> Self {
        Self::from_state(MemoryState::default(), None, "memory")
    }

    pub(crate) fn from_state(
        state: MemoryState,
        persist: Option<(PersistFn, usize)>,
        kind: &'static str,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                faults: Mutex::new(Vec::new()),
                persistence: persist.map(|(save, save_every)| Persistence {
                    save,
                    save_every: save_every.max(1),
                }),
                unsaved: Mutex::new(0),
            }),
            kind,
        }
    }

    /// Inject a failure into the write path.
    pub fn inject(&self, fault: Fault) -> Result<()> {
        lock(&self.shared.faults)?.push(fault);
        Ok(())
    }

    /// Remove all injected failures.
    pub fn clear_faults(&self) -> Result<()> {
        lock(&self.shared.faults)?.clear();
        Ok(())
    }

    /// Number of committed target records across all types.
    pub fn record_count(&self) -> Result<usize> {
        Ok(lock(&self.shared.state)?.record_count())
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

enum StagedOp {
    Insert(TargetKey, TargetRecord),
    PutMapping(MappingEntry),
    ClearSkip(Key),
}

/// Write transaction over an [`InMemoryStore`].
pub struct MemoryTransaction {
    shared: Arc<Shared>,
    staged: Vec<StagedOp>,
}

impl MemoryTransaction {
    fn cleared(&self) -> Vec<Key> {
        self.staged
            .iter()
            .filter_map(|op| match op {
                StagedOp::ClearSkip(key) => Some(key.clone()),
                _ => None,
            })
            .collect()
    }

    fn staged_mappings(&self) -> impl Iterator<Item = &MappingEntry> {
        self.staged.iter().filter_map(|op| match op {
            StagedOp::PutMapping(entry) => Some(entry),
            _ => None,
        })
    }

    fn staged_legacy_ids(&self) -> Vec<String> {
        self.staged
            .iter()
            .filter_map(|op| match op {
                StagedOp::Insert(_, record) => Some(record.legacy_id.clone()),
                StagedOp::PutMapping(entry) => Some(entry.legacy_id.clone()),
                StagedOp::ClearSkip(_) => None,
            })
            .collect()
    }
}

#[async_trait]
impl WriteTransaction for MemoryTransaction {
    async fn insert(&mut self, record: &TargetRecord) -> Result<TargetKey> {
        if self
            .shared
            .has_fault(&Fault::RejectInsert(record.legacy_id.clone()))?
        {
            return Err(MigrateError::Rejected(format!(
                "{} {} failed validation",
                record.entity_type, record.legacy_id
            )));
        }
        if self
            .shared
            .has_fault(&Fault::FailInsert(record.legacy_id.clone()))?
        {
            return Err(MigrateError::State(format!(
                "injected insert failure for {}",
                record.legacy_id
            )));
        }

        let key = {
            let mut state = lock(&self.shared.state)?;
            state.next_key += 1;
            TargetKey(state.next_key)
        };
        self.staged.push(StagedOp::Insert(key, record.clone()));
        Ok(key)
    }

    async fn put_mapping(&mut self, entry: &MappingEntry) -> Result<()> {
        if self
            .shared
            .has_fault(&Fault::FailMapping(entry.legacy_id.clone()))?
        {
            return Err(MigrateError::State(format!(
                "injected mapping failure for {}",
                entry.legacy_id
            )));
        }

        let duplicate_staged = self
            .staged_mappings()
            .any(|e| e.entity_type == entry.entity_type && e.legacy_id == entry.legacy_id);
        if duplicate_staged {
            return Err(MigrateError::DuplicateMapping {
                entity_type: entry.entity_type,
                legacy_id: entry.legacy_id.clone(),
            });
        }
        lock(&self.shared.state)?.check_mapping(entry, &self.cleared())?;

        self.staged.push(StagedOp::PutMapping(entry.clone()));
        Ok(())
    }

    async fn clear_skip(&mut self, entity_type: EntityType, legacy_id: &str) -> Result<()> {
        self.staged
            .push(StagedOp::ClearSkip((entity_type, legacy_id.to_string())));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        for legacy_id in self.staged_legacy_ids() {
            if self.shared.has_fault(&Fault::FailCommit(legacy_id.clone()))? {
                return Err(MigrateError::State(format!(
                    "injected commit failure for {}",
                    legacy_id
                )));
            }
        }

        let cleared = self.cleared();
        let MemoryTransaction { shared, staged } = *self;
        shared.update(|state| {
            for op in &staged {
                if let StagedOp::PutMapping(entry) = op {
                    state.check_mapping(entry, &cleared)?;
                }
            }
            for op in staged {
                match op {
                    StagedOp::Insert(key, record) => {
                        state
                            .records
                            .entry(record.entity_type)
                            .or_default()
                            .insert(key, record);
                    }
                    StagedOp::PutMapping(entry) => {
                        state
                            .mappings
                            .insert((entry.entity_type, entry.legacy_id.clone()), entry);
                    }
                    StagedOp::ClearSkip(key) => {
                        state.skips.remove(&key);
                    }
                }
            }
            Ok(())
        })
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        debug!("Discarding {} staged writes", self.staged.len());
        Ok(())
    }
}

#[async_trait]
impl MappingStore for InMemoryStore {
    async fn put(&self, entry: &MappingEntry) -> Result<()> {
        self.shared.update(|state| {
            state.check_mapping(entry, &[])?;
            state
                .mappings
                .insert((entry.entity_type, entry.legacy_id.clone()), entry.clone());
            Ok(())
        })
    }

    async fn resolve(&self, entity_type: EntityType, legacy_id: &str) -> Result<Option<TargetKey>> {
        let state = lock(&self.shared.state)?;
        Ok(state
            .mappings
            .get(&(entity_type, legacy_id.to_string()))
            .map(|e| e.target_key))
    }

    async fn list_by_type(
        &self,
        entity_type: EntityType,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<MappingEntry>> {
        let state = lock(&self.shared.state)?;
        let mut entries: Vec<MappingEntry> = state
            .mappings
            .values()
            .filter(|e| e.entity_type == entity_type)
            .cloned()
            .collect();
        entries.sort_by(|a, b| {
            a.create_time
                .cmp(&b.create_time)
                .then_with(|| a.legacy_id.cmp(&b.legacy_id))
        });
        Ok(entries.into_iter().skip(offset).take(limit).collect())
    }

    async fn count_by_type(&self, entity_type: EntityType) -> Result<u64> {
        let state = lock(&self.shared.state)?;
        Ok(state
            .mappings
            .keys()
            .filter(|(t, _)| *t == entity_type)
            .count() as u64)
    }
}

#[async_trait]
impl SkipLedger for InMemoryStore {
    async fn mark_skipped(
        &self,
        entity_type: EntityType,
        legacy_id: &str,
        reason: &SkipReason,
    ) -> Result<()> {
        let key = (entity_type, legacy_id.to_string());
        {
            let state = lock(&self.shared.state)?;
            if state.mappings.contains_key(&key) {
                return Err(MigrateError::conflict(
                    entity_type,
                    legacy_id,
                    "record is already migrated",
                ));
            }
            if state.skips.get(&key) == Some(reason) {
                return Ok(());
            }
        }

        self.shared.update(|state| {
            if state.mappings.contains_key(&key) {
                return Err(MigrateError::conflict(
                    entity_type,
                    legacy_id,
                    "record is already migrated",
                ));
            }
            state.skips.insert(key.clone(), reason.clone());
            Ok(())
        })
    }

    async fn is_skipped(&self, entity_type: EntityType, legacy_id: &str) -> Result<bool> {
        let state = lock(&self.shared.state)?;
        Ok(state.skips.contains_key(&(entity_type, legacy_id.to_string())))
    }

    async fn skipped_entries(&self, entity_type: EntityType) -> Result<Vec<SkipEntry>> {
        let state = lock(&self.shared.state)?;
        let mut entries: Vec<SkipEntry> = state
            .skips
            .iter()
            .filter(|((t, _), _)| *t == entity_type)
            .map(|((t, id), reason)| SkipEntry {
                entity_type: *t,
                legacy_id: id.clone(),
                reason: reason.clone(),
            })
            .collect();
        entries.sort_by(|a, b| a.legacy_id.cmp(&b.legacy_id));
        Ok(entries)
    }
}

#[async_trait]
impl TargetStore for InMemoryStore {
    async fn begin(&self) -> Result<Box<dyn WriteTransaction>> {
        Ok(Box::new(MemoryTransaction {
            shared: Arc::clone(&self.shared),
            staged: Vec::new(),
        }))
    }

    async fn search(&self, filter: &TargetFilter) -> Result<Vec<StoredRecord>> {
        let state = lock(&self.shared.state)?;
        let limit = filter.limit.unwrap_or(usize::MAX);

        let mut candidates: Vec<(&TargetKey, &TargetRecord)> = Vec::new();
        for (entity_type, by_key) in &state.records {
            if filter.entity_type.is_some_and(|want| want != *entity_type) {
                continue;
            }
            match filter.target_key {
                Some(key) => candidates.extend(by_key.get_key_value(&key)),
                None => candidates.extend(by_key.iter()),
            }
        }

        let mut found: Vec<StoredRecord> = candidates
            .into_iter()
            .map(|(key, record)| StoredRecord {
                target_key: *key,
                record: record.clone(),
            })
            .filter(|stored| filter.matches(stored))
            .collect();
        found.sort_by_key(|stored| stored.target_key);
        found.truncate(limit);
        Ok(found)
    }

    async fn get(
        &self,
        entity_type: EntityType,
        target_key: TargetKey,
    ) -> Result<Option<TargetRecord>> {
        let state = lock(&self.shared.state)?;
        Ok(state
            .records
            .get(&entity_type)
            .and_then(|by_key| by_key.get(&target_key))
            .cloned())
    }
}

#[async_trait]
impl StateBackend for InMemoryStore {
    async fn init_schema(&self) -> Result<()> {
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        self.kind
    }

    async fn flush(&self) -> Result<()> {
        self.shared.flush()
    }
}
