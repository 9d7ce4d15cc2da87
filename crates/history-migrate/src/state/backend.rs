//! Storage traits for migration bookkeeping.
//!
//! The [`MappingStore`] and [`SkipLedger`] traits define the two halves of
//! the bookkeeping. A [`StateBackend`] provides both, plus the
//! [`TargetStore`] they must commit atomically with:
//!
//! - **In-memory**: [`InMemoryStore`](super::InMemoryStore), optionally
//!   persisted to a JSON snapshot file
//! - **PostgreSQL**: [`PgStateBackend`](super::PgStateBackend)
//!
//! The orchestrator works with `Arc<dyn StateBackend>` without knowing the
//! concrete type, so tests substitute a fresh in-memory backend per case.

use std::collections::BTreeMap;

use async_trait::async_trait;

use super::{MappingEntry, SkipEntry, SkipReason};
use crate::core::{EntityType, TargetKey};
use crate::error::Result;
use crate::target::TargetStore;

/// Persistent legacy id to target key table.
#[async_trait]
pub trait MappingStore: Send + Sync {
    /// Insert a mapping outside of a write transaction.
    ///
    /// Fails with `DuplicateMapping` if `(entity_type, legacy_id)` exists.
    async fn put(&self, entry: &MappingEntry) -> Result<()>;

    /// Resolve a legacy id to its target key, `None` if not migrated.
    async fn resolve(&self, entity_type: EntityType, legacy_id: &str) -> Result<Option<TargetKey>>;

    /// Whether the legacy record has been migrated.
    async fn exists(&self, entity_type: EntityType, legacy_id: &str) -> Result<bool> {
        Ok(self.resolve(entity_type, legacy_id).await?.is_some())
    }

    /// Page of mappings ordered by create time, then legacy id.
    async fn list_by_type(
        &self,
        entity_type: EntityType,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<MappingEntry>>;

    /// Number of mappings for a type.
    async fn count_by_type(&self, entity_type: EntityType) -> Result<u64>;
}

/// Record of legacy ids that could not be migrated.
#[async_trait]
pub trait SkipLedger: Send + Sync {
    /// Mark a record skipped.
    ///
    /// Idempotent for the same reason; a different reason replaces the old
    /// one. Fails with `ConflictingState` if the record is already mapped.
    async fn mark_skipped(
        &self,
        entity_type: EntityType,
        legacy_id: &str,
        reason: &SkipReason,
    ) -> Result<()>;

    async fn is_skipped(&self, entity_type: EntityType, legacy_id: &str) -> Result<bool>;

    /// Skip entries for one type, ordered by legacy id.
    async fn skipped_entries(&self, entity_type: EntityType) -> Result<Vec<SkipEntry>>;

    /// Skipped legacy ids for one type, ordered.
    async fn skipped_ids(&self, entity_type: EntityType) -> Result<Vec<String>> {
        Ok(self
            .skipped_entries(entity_type)
            .await?
            .into_iter()
            .map(|e| e.legacy_id)
            .collect())
    }

    /// Skip entries grouped by type. Every requested type gets a group,
    /// even when it is empty.
    async fn list_skipped(
        &self,
        entity_types: &[EntityType],
    ) -> Result<BTreeMap<EntityType, Vec<SkipEntry>>> {
        let mut grouped = BTreeMap::new();
        for entity_type in entity_types {
            grouped.insert(*entity_type, self.skipped_entries(*entity_type).await?);
        }
        Ok(grouped)
    }
}

/// Complete storage backend for a migration.
#[async_trait]
pub trait StateBackend: MappingStore + SkipLedger + TargetStore {
    /// Create tables/files if needed. Idempotent.
    async fn init_schema(&self) -> Result<()>;

    /// Backend type name for logging.
    fn backend_type(&self) -> &'static str;

    /// Persist changes the backend has buffered. Backends that write
    /// through on every commit have nothing to do.
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}
