//! Per-entity-type migration.
//!
//! An [`EntityMigrator`] runs one pass over one entity type. Every record in
//! the pass ends in exactly one [`RecordOutcome`]: migrated through the
//! [`TransactionalWriter`], recorded in the skip ledger, or fatal. Fatal
//! outcomes abort the pass; records committed before that stay committed.

pub mod transform;

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::core::{
    EntityDescriptor, EntityType, LegacyRecord, Lifecycle, LifecycleRule, Requirement, TargetKey,
};
use crate::error::{MigrateError, Result};
use crate::source::LegacySource;
use crate::state::{SkipReason, StateBackend};
use crate::writer::TransactionalWriter;

use self::transform::{close_if_open, transform, Transform};

/// Which legacy records a pass considers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Records neither migrated nor skipped yet.
    New,
    /// Exactly the records currently in the skip ledger.
    Skipped,
}

/// Outcome of migrating a single record.
#[derive(Debug)]
pub enum RecordOutcome {
    Migrated(TargetKey),
    Skipped(SkipReason),
    Fatal(MigrateError),
}

/// Counts for one pass over one entity type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigratorStats {
    pub migrated: u64,
    pub skipped: u64,
}

/// Everything a migrator needs, shared by all types in a run.
#[derive(Clone)]
pub struct MigrationContext {
    pub source: Arc<dyn LegacySource>,
    pub backend: Arc<dyn StateBackend>,
    pub writer: TransactionalWriter,

    /// Reference time for closing open records, fixed for the whole run.
    pub cutover: DateTime<Utc>,

    pub page_size: usize,
}

impl MigrationContext {
    pub fn new(
        source: Arc<dyn LegacySource>,
        backend: Arc<dyn StateBackend>,
        cutover: DateTime<Utc>,
        page_size: usize,
    ) -> Self {
        let writer = TransactionalWriter::new(Arc::clone(&backend));
        Self {
            source,
            backend,
            writer,
            cutover,
            page_size: page_size.max(1),
        }
    }
}

/// Migrates the records of one entity type.
pub struct EntityMigrator<'a> {
    ctx: &'a MigrationContext,
    descriptor: &'static EntityDescriptor,
}

impl<'a> EntityMigrator<'a> {
    pub fn new(ctx: &'a MigrationContext, entity_type: EntityType) -> Self {
        Self {
            ctx,
            descriptor: entity_type.descriptor(),
        }
    }

    pub fn entity_type(&self) -> EntityType {
        self.descriptor.entity_type
    }

    /// Run one pass over the records in `scope`.
    pub async fn migrate(&self, scope: Scope) -> Result<MigratorStats> {
        info!("Migrating {} ({:?} records)", self.entity_type(), scope);
        let stats = match scope {
            Scope::New => self.migrate_new().await?,
            Scope::Skipped => self.retry_skipped().await?,
        };
        info!(
            "Finished {}: {} migrated, {} skipped",
            self.entity_type(),
            stats.migrated,
            stats.skipped
        );
        Ok(stats)
    }

    async fn migrate_new(&self) -> Result<MigratorStats> {
        let entity_type = self.entity_type();
        let mut stats = MigratorStats::default();
        let mut cursor = None;

        loop {
            let page = self
                .ctx
                .source
                .query_records(entity_type, cursor.as_ref(), self.ctx.page_size)
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            cursor = Some(last.cursor());

            for record in &page {
                if self.ctx.backend.exists(entity_type, &record.legacy_id).await?
                    || self
                        .ctx
                        .backend
                        .is_skipped(entity_type, &record.legacy_id)
                        .await?
                {
                    continue;
                }
                self.apply(record, false, &mut stats).await?;
            }

            if page.len() < self.ctx.page_size {
                break;
            }
        }

        Ok(stats)
    }

    async fn retry_skipped(&self) -> Result<MigratorStats> {
        let entity_type = self.entity_type();
        let mut stats = MigratorStats::default();

        // The skip set is fixed before any retry so records skipped again
        // during this pass are not picked up twice.
        let ids = self.ctx.backend.skipped_ids(entity_type).await?;

        // Ids are fetched a page at a time but retried in cursor order
        // across the whole set.
        let mut records = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(self.ctx.page_size) {
            records.extend(self.ctx.source.fetch_records(entity_type, chunk).await?);
        }
        records.sort_by_key(|r| r.cursor());

        let found: HashSet<&str> = records.iter().map(|r| r.legacy_id.as_str()).collect();
        for id in ids.iter().filter(|id| !found.contains(id.as_str())) {
            warn!(
                entity_type = %entity_type,
                legacy_id = %id,
                "Skipped record no longer exists in the legacy store"
            );
            stats.skipped += 1;
        }

        for record in &records {
            self.apply(record, true, &mut stats).await?;
        }

        Ok(stats)
    }

    /// Migrate one record and settle its outcome in the stats and the ledger.
    async fn apply(
        &self,
        record: &LegacyRecord,
        retry: bool,
        stats: &mut MigratorStats,
    ) -> Result<()> {
        match self.migrate_record(record, retry).await {
            RecordOutcome::Migrated(key) => {
                debug!(
                    "Migrated {} {} -> {}",
                    record.entity_type, record.legacy_id, key
                );
                stats.migrated += 1;
                Ok(())
            }
            RecordOutcome::Skipped(reason) => {
                self.ctx
                    .backend
                    .mark_skipped(record.entity_type, &record.legacy_id, &reason)
                    .await?;
                warn!(
                    entity_type = %record.entity_type,
                    legacy_id = %record.legacy_id,
                    reason = %reason,
                    "Skipped record"
                );
                stats.skipped += 1;
                Ok(())
            }
            RecordOutcome::Fatal(e) => {
                error!(
                    entity_type = %record.entity_type,
                    legacy_id = %record.legacy_id,
                    "Aborting {} pass: {}",
                    record.entity_type,
                    e
                );
                Err(e)
            }
        }
    }

    /// Classify a single record. Never returns an error directly: faults
    /// come back as [`RecordOutcome::Fatal`].
    pub async fn migrate_record(&self, record: &LegacyRecord, retry: bool) -> RecordOutcome {
        match self.try_migrate(record, retry).await {
            Ok(outcome) => outcome,
            Err(e) => RecordOutcome::Fatal(e),
        }
    }

    async fn try_migrate(&self, record: &LegacyRecord, retry: bool) -> Result<RecordOutcome> {
        let references = match self.resolve_references(record).await? {
            Ok(references) => references,
            Err(missing) => return Ok(RecordOutcome::Skipped(missing)),
        };

        let mut target = match transform(record, references) {
            Ok(Transform::Ready(target)) => target,
            Ok(Transform::Unsupported(feature)) => {
                return Ok(RecordOutcome::Skipped(SkipReason::UnsupportedFeature(
                    feature,
                )))
            }
            Err(MigrateError::InvalidRecord(detail)) => {
                return Ok(RecordOutcome::Skipped(SkipReason::InvalidRecord(detail)))
            }
            Err(e) => return Err(e),
        };

        if let Some(lifecycle) = target.lifecycle.take() {
            target.lifecycle = Some(self.derive_lifecycle(lifecycle, &target.references).await?);
        }

        match self
            .ctx
            .writer
            .write_and_map(&target, record.create_time, retry)
            .await
        {
            Ok(key) => Ok(RecordOutcome::Migrated(key)),
            Err(MigrateError::Rejected(detail)) => {
                Ok(RecordOutcome::Skipped(SkipReason::WriteRejected(detail)))
            }
            Err(e) => Err(e),
        }
    }

    /// Resolve every reference the descriptor declares. `Err` carries the
    /// skip reason for the first reference that must resolve but does not.
    async fn resolve_references(
        &self,
        record: &LegacyRecord,
    ) -> Result<std::result::Result<BTreeMap<String, TargetKey>, SkipReason>> {
        let mut resolved = BTreeMap::new();

        for reference in self.descriptor.references {
            let Some(legacy_ref) = record.references.get(reference.role) else {
                if reference.requirement == Requirement::Mandatory {
                    return Ok(Err(SkipReason::MissingDependency(reference.target)));
                }
                continue;
            };

            match self.ctx.backend.resolve(reference.target, legacy_ref).await? {
                Some(key) => {
                    resolved.insert(reference.role.to_string(), key);
                }
                None if reference.requirement == Requirement::BestEffort => {
                    debug!(
                        "Dropping unresolved {} reference {} on {} {}",
                        reference.role, legacy_ref, record.entity_type, record.legacy_id
                    );
                }
                None => return Ok(Err(SkipReason::MissingDependency(reference.target))),
            }
        }

        Ok(Ok(resolved))
    }

    /// Apply the type's lifecycle rule.
    async fn derive_lifecycle(
        &self,
        lifecycle: Lifecycle,
        references: &BTreeMap<String, TargetKey>,
    ) -> Result<Lifecycle> {
        match self.descriptor.lifecycle {
            LifecycleRule::None => Ok(lifecycle),
            LifecycleRule::AutoClose => Ok(close_if_open(lifecycle, self.ctx.cutover)),
            LifecycleRule::CascadeFrom(role) => {
                if !lifecycle.is_open() {
                    return Ok(lifecycle);
                }
                let parent_end = match (self.descriptor.reference(role), references.get(role)) {
                    (Some(reference), Some(key)) => self
                        .ctx
                        .backend
                        .get(reference.target, *key)
                        .await?
                        .and_then(|parent| parent.lifecycle)
                        .and_then(|l| l.end_time),
                    _ => None,
                };
                Ok(close_if_open(
                    lifecycle,
                    parent_end.unwrap_or(self.ctx.cutover),
                ))
            }
        }
    }
}
