//! Target store interface.
//!
//! The target store receives transformed records. Writes happen inside a
//! [`WriteTransaction`] that also carries the Mapping Store insert, so a
//! record is never visible in one store without the other.

use async_trait::async_trait;

use crate::core::{EntityType, TargetKey, TargetRecord};
use crate::error::Result;
use crate::state::MappingEntry;

/// A target record together with its assigned key.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub target_key: TargetKey,
    pub record: TargetRecord,
}

/// Search criteria for [`TargetStore::search`]. Unset fields match anything.
#[derive(Debug, Clone, Default)]
pub struct TargetFilter {
    pub entity_type: Option<EntityType>,
    pub target_key: Option<TargetKey>,
    pub legacy_id: Option<String>,
    pub limit: Option<usize>,
}

impl TargetFilter {
    /// Filter for a single record by key.
    pub fn by_key(entity_type: EntityType, target_key: TargetKey) -> Self {
        Self {
            entity_type: Some(entity_type),
            target_key: Some(target_key),
            legacy_id: None,
            limit: Some(1),
        }
    }

    /// Filter for all records of one type.
    pub fn by_type(entity_type: EntityType) -> Self {
        Self {
            entity_type: Some(entity_type),
            ..Self::default()
        }
    }

    /// Whether a stored record satisfies this filter.
    pub fn matches(&self, stored: &StoredRecord) -> bool {
        self.entity_type
            .map_or(true, |t| t == stored.record.entity_type)
            && self.target_key.map_or(true, |k| k == stored.target_key)
            && self
                .legacy_id
                .as_deref()
                .map_or(true, |id| id == stored.record.legacy_id)
    }
}

/// One atomic unit spanning the target store and the Mapping Store.
///
/// Nothing written through a transaction is visible to other readers until
/// [`commit`](Self::commit) succeeds. Dropping an unfinished transaction
/// discards it.
#[async_trait]
pub trait WriteTransaction: Send {
    /// Insert a target record and return its newly assigned key.
    async fn insert(&mut self, record: &TargetRecord) -> Result<TargetKey>;

    /// Insert a mapping. Fails with `DuplicateMapping` if one exists.
    async fn put_mapping(&mut self, entry: &MappingEntry) -> Result<()>;

    /// Remove a skip entry for a record that is being migrated on retry.
    async fn clear_skip(&mut self, entity_type: EntityType, legacy_id: &str) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Write/query API of the target store.
#[async_trait]
pub trait TargetStore: Send + Sync {
    /// Start a write transaction.
    async fn begin(&self) -> Result<Box<dyn WriteTransaction>>;

    /// Committed records matching `filter`, ordered by target key.
    async fn search(&self, filter: &TargetFilter) -> Result<Vec<StoredRecord>>;

    /// Fetch one committed record.
    async fn get(&self, entity_type: EntityType, target_key: TargetKey) -> Result<Option<TargetRecord>> {
        Ok(self
            .search(&TargetFilter::by_key(entity_type, target_key))
            .await?
            .into_iter()
            .next()
            .map(|s| s.record))
    }
}
