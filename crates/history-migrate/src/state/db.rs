//! Database-backed state storage.
//!
//! Stores mappings and skips in PostgreSQL tables within the
//! `_history_migrate` schema (configurable), and target records in the target
//! schema of the same database. Keeping all three in one database is what
//! lets a single PostgreSQL transaction couple the target insert with the
//! mapping insert.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Object, Pool};
use serde_json::Value;
use tokio_postgres::error::SqlState;
use tokio_postgres::Row;
use tracing::{debug, warn};

use super::backend::{MappingStore, SkipLedger, StateBackend};
use super::{MappingEntry, SkipEntry, SkipReason};
use crate::core::{EntityType, Lifecycle, Payload, RecordState, TargetKey, TargetRecord};
use crate::error::{MigrateError, Result};
use crate::pool::{is_data_error, quote_ident};
use crate::target::{StoredRecord, TargetFilter, TargetStore, WriteTransaction};

/// Table names for one backend instance.
#[derive(Debug, Clone)]
struct Tables {
    mapping: String,
    skip: String,
    record: String,
}

impl Tables {
    fn new(schema: &str, target_schema: &str) -> Self {
        Self {
            mapping: format!("{}.mapping", quote_ident(schema)),
            skip: format!("{}.skip", quote_ident(schema)),
            record: format!("{}.history_record", quote_ident(target_schema)),
        }
    }
}

/// PostgreSQL state backend.
pub struct PgStateBackend {
    pool: Pool,
    schema: String,
    target_schema: String,
    tables: Tables,
}

impl PgStateBackend {
    /// Create a new database state backend.
    pub fn new(pool: Pool, schema: impl Into<String>, target_schema: impl Into<String>) -> Self {
        let schema = schema.into();
        let target_schema = target_schema.into();
        let tables = Tables::new(&schema, &target_schema);
        Self {
            pool,
            schema,
            target_schema,
            tables,
        }
    }

    async fn conn(&self) -> Result<Object> {
        self.pool
            .get()
            .await
            .map_err(|e| MigrateError::pool(e.to_string(), "state backend"))
    }
}

fn duplicate_or(e: tokio_postgres::Error, entry: &MappingEntry) -> MigrateError {
    if e.code() == Some(&SqlState::UNIQUE_VIOLATION) {
        MigrateError::DuplicateMapping {
            entity_type: entry.entity_type,
            legacy_id: entry.legacy_id.clone(),
        }
    } else {
        MigrateError::Target(e)
    }
}

fn mapping_from_row(row: &Row) -> Result<MappingEntry> {
    let entity_type: String = row.get(0);
    Ok(MappingEntry {
        entity_type: entity_type.parse()?,
        legacy_id: row.get(1),
        target_key: TargetKey(row.get(2)),
        create_time: row.get(3),
    })
}

fn record_from_row(row: &Row) -> Result<StoredRecord> {
    let target_key: i64 = row.get(0);
    let entity_type: String = row.get(1);
    let legacy_id: String = row.get(2);
    let state: Option<String> = row.get(3);
    let start_time: Option<DateTime<Utc>> = row.get(4);
    let end_time: Option<DateTime<Utc>> = row.get(5);
    let refs: Value = row.get(6);
    let fields: Value = row.get(7);

    let lifecycle = match state {
        Some(s) => Some(Lifecycle {
            state: RecordState::parse(&s)?,
            start_time,
            end_time,
        }),
        None => None,
    };
    let references: BTreeMap<String, TargetKey> = serde_json::from_value(refs)?;
    let fields: Payload = match fields {
        Value::Object(map) => map,
        other => {
            return Err(MigrateError::State(format!(
                "target record {} has non-object fields: {}",
                target_key, other
            )))
        }
    };

    Ok(StoredRecord {
        target_key: TargetKey(target_key),
        record: TargetRecord {
            entity_type: entity_type.parse()?,
            legacy_id,
            references,
            lifecycle,
            fields,
        },
    })
}

/// Write transaction on a dedicated pooled connection.
pub struct PgWriteTransaction {
    conn: Option<Object>,
    tables: Tables,
    finished: bool,
}

impl PgWriteTransaction {
    fn client(&self) -> Result<&Object> {
        self.conn
            .as_ref()
            .ok_or_else(|| MigrateError::State("transaction connection already released".into()))
    }

    async fn finish(mut self: Box<Self>, statement: &str) -> Result<()> {
        self.client()?
            .batch_execute(statement)
            .await
            .map_err(MigrateError::Target)?;
        self.finished = true;
        Ok(())
    }
}

impl Drop for PgWriteTransaction {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if !self.finished {
                // The connection still has an open transaction; detach it
                // from the pool so it is closed instead of reused.
                warn!("Write transaction dropped without commit or rollback");
                drop(Object::take(conn));
            }
        }
    }
}

#[async_trait]
impl WriteTransaction for PgWriteTransaction {
    async fn insert(&mut self, record: &TargetRecord) -> Result<TargetKey> {
        let refs = serde_json::to_value(&record.references)?;
        let fields = Value::Object(record.fields.clone());
        let state = record.lifecycle.as_ref().map(|l| l.state.as_str());
        let start_time = record.lifecycle.as_ref().and_then(|l| l.start_time);
        let end_time = record.lifecycle.as_ref().and_then(|l| l.end_time);

        let row = self
            .client()?
            .query_one(
                &format!(
                    "INSERT INTO {} (entity_type, legacy_id, state, start_time, end_time, refs, fields)
                     VALUES ($1, $2, $3, $4, $5, $6, $7)
                     RETURNING target_key",
                    self.tables.record
                ),
                &[
                    &record.entity_type.as_str(),
                    &record.legacy_id,
                    &state,
                    &start_time,
                    &end_time,
                    &refs,
                    &fields,
                ],
            )
            .await
            .map_err(|e| match e.code() {
                Some(code) if is_data_error(code.code()) => MigrateError::Rejected(e.to_string()),
                _ => MigrateError::Target(e),
            })?;

        Ok(TargetKey(row.get(0)))
    }

    async fn put_mapping(&mut self, entry: &MappingEntry) -> Result<()> {
        let skipped = self
            .client()?
            .query_opt(
                &format!(
                    "SELECT 1 FROM {} WHERE entity_type = $1 AND legacy_id = $2",
                    self.tables.skip
                ),
                &[&entry.entity_type.as_str(), &entry.legacy_id],
            )
            .await?;
        if skipped.is_some() {
            return Err(MigrateError::conflict(
                entry.entity_type,
                &entry.legacy_id,
                "record is marked skipped",
            ));
        }

        self.client()?
            .execute(
                &format!(
                    "INSERT INTO {} (entity_type, legacy_id, target_key, create_time)
                     VALUES ($1, $2, $3, $4)",
                    self.tables.mapping
                ),
                &[
                    &entry.entity_type.as_str(),
                    &entry.legacy_id,
                    &entry.target_key.0,
                    &entry.create_time,
                ],
            )
            .await
            .map_err(|e| duplicate_or(e, entry))?;
        Ok(())
    }

    async fn clear_skip(&mut self, entity_type: EntityType, legacy_id: &str) -> Result<()> {
        self.client()?
            .execute(
                &format!(
                    "DELETE FROM {} WHERE entity_type = $1 AND legacy_id = $2",
                    self.tables.skip
                ),
                &[&entity_type.as_str(), &legacy_id],
            )
            .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.finish("COMMIT").await
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.finish("ROLLBACK").await
    }
}

#[async_trait]
impl MappingStore for PgStateBackend {
    async fn put(&self, entry: &MappingEntry) -> Result<()> {
        let conn = self.conn().await?;
        let inserted = conn
            .execute(
                &format!(
                    "INSERT INTO {} (entity_type, legacy_id, target_key, create_time)
                     SELECT $1::text, $2::text, $3::bigint, $4::timestamptz
                     WHERE NOT EXISTS (
                        SELECT 1 FROM {} WHERE entity_type = $1::text AND legacy_id = $2::text
                     )",
                    self.tables.mapping, self.tables.skip
                ),
                &[
                    &entry.entity_type.as_str(),
                    &entry.legacy_id,
                    &entry.target_key.0,
                    &entry.create_time,
                ],
            )
            .await
            .map_err(|e| duplicate_or(e, entry))?;

        if inserted == 0 {
            return Err(MigrateError::conflict(
                entry.entity_type,
                &entry.legacy_id,
                "record is marked skipped",
            ));
        }
        Ok(())
    }

    async fn resolve(&self, entity_type: EntityType, legacy_id: &str) -> Result<Option<TargetKey>> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                &format!(
                    "SELECT target_key FROM {} WHERE entity_type = $1 AND legacy_id = $2",
                    self.tables.mapping
                ),
                &[&entity_type.as_str(), &legacy_id],
            )
            .await?;
        Ok(row.map(|r| TargetKey(r.get(0))))
    }

    async fn list_by_type(
        &self,
        entity_type: EntityType,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<MappingEntry>> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                &format!(
                    "SELECT entity_type, legacy_id, target_key, create_time
                     FROM {}
                     WHERE entity_type = $1
                     ORDER BY create_time, legacy_id
                     OFFSET $2 LIMIT $3",
                    self.tables.mapping
                ),
                &[&entity_type.as_str(), &(offset as i64), &(limit as i64)],
            )
            .await?;
        rows.iter().map(mapping_from_row).collect()
    }

    async fn count_by_type(&self, entity_type: EntityType) -> Result<u64> {
        let conn = self.conn().await?;
        let row = conn
            .query_one(
                &format!(
                    "SELECT COUNT(*) FROM {} WHERE entity_type = $1",
                    self.tables.mapping
                ),
                &[&entity_type.as_str()],
            )
            .await?;
        let count: i64 = row.get(0);
        Ok(count as u64)
    }
}

#[async_trait]
impl SkipLedger for PgStateBackend {
    async fn mark_skipped(
        &self,
        entity_type: EntityType,
        legacy_id: &str,
        reason: &SkipReason,
    ) -> Result<()> {
        if self.exists(entity_type, legacy_id).await? {
            return Err(MigrateError::conflict(
                entity_type,
                legacy_id,
                "record is already migrated",
            ));
        }

        let conn = self.conn().await?;
        let changed = conn
            .execute(
                &format!(
                    "INSERT INTO {skip} AS s (entity_type, legacy_id, reason_code, reason_detail)
                     VALUES ($1, $2, $3, $4)
                     ON CONFLICT (entity_type, legacy_id) DO UPDATE SET
                        reason_code = EXCLUDED.reason_code,
                        reason_detail = EXCLUDED.reason_detail,
                        skipped_at = NOW()
                     WHERE s.reason_code IS DISTINCT FROM EXCLUDED.reason_code
                        OR s.reason_detail IS DISTINCT FROM EXCLUDED.reason_detail",
                    skip = self.tables.skip
                ),
                &[
                    &entity_type.as_str(),
                    &legacy_id,
                    &reason.code(),
                    &reason.detail(),
                ],
            )
            .await?;

        debug!(
            "Skip ledger {} {} ({} rows changed)",
            entity_type, legacy_id, changed
        );
        Ok(())
    }

    async fn is_skipped(&self, entity_type: EntityType, legacy_id: &str) -> Result<bool> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                &format!(
                    "SELECT 1 FROM {} WHERE entity_type = $1 AND legacy_id = $2",
                    self.tables.skip
                ),
                &[&entity_type.as_str(), &legacy_id],
            )
            .await?;
        Ok(row.is_some())
    }

    async fn skipped_entries(&self, entity_type: EntityType) -> Result<Vec<SkipEntry>> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                &format!(
                    "SELECT legacy_id, reason_code, reason_detail
                     FROM {}
                     WHERE entity_type = $1
                     ORDER BY legacy_id",
                    self.tables.skip
                ),
                &[&entity_type.as_str()],
            )
            .await?;

        rows.iter()
            .map(|row| {
                let code: String = row.get(1);
                let detail: String = row.get(2);
                Ok(SkipEntry {
                    entity_type,
                    legacy_id: row.get(0),
                    reason: SkipReason::from_parts(&code, &detail)?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl TargetStore for PgStateBackend {
    async fn begin(&self) -> Result<Box<dyn WriteTransaction>> {
        let conn = self.conn().await?;
        conn.batch_execute("BEGIN").await?;
        Ok(Box::new(PgWriteTransaction {
            conn: Some(conn),
            tables: self.tables.clone(),
            finished: false,
        }))
    }

    async fn search(&self, filter: &TargetFilter) -> Result<Vec<StoredRecord>> {
        let conn = self.conn().await?;
        let entity_type = filter.entity_type.map(|t| t.as_str());
        let target_key = filter.target_key.map(|k| k.0);
        let limit = filter.limit.map(|l| l as i64);

        let rows = conn
            .query(
                &format!(
                    "SELECT target_key, entity_type, legacy_id, state, start_time, end_time, refs, fields
                     FROM {}
                     WHERE ($1::text IS NULL OR entity_type = $1)
                       AND ($2::bigint IS NULL OR target_key = $2)
                       AND ($3::text IS NULL OR legacy_id = $3)
                     ORDER BY target_key
                     LIMIT $4",
                    self.tables.record
                ),
                &[&entity_type, &target_key, &filter.legacy_id, &limit],
            )
            .await?;
        rows.iter().map(record_from_row).collect()
    }
}

#[async_trait]
impl StateBackend for PgStateBackend {
    async fn init_schema(&self) -> Result<()> {
        let conn = self.conn().await?;

        conn.batch_execute(&format!(
            "CREATE SCHEMA IF NOT EXISTS {};
             CREATE SCHEMA IF NOT EXISTS {};",
            quote_ident(&self.schema),
            quote_ident(&self.target_schema)
        ))
        .await?;

        conn.batch_execute(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                entity_type TEXT NOT NULL,
                legacy_id TEXT COLLATE \"C\" NOT NULL,
                target_key BIGINT NOT NULL,
                create_time TIMESTAMPTZ NOT NULL,
                migrated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (entity_type, legacy_id)
            );
            CREATE INDEX IF NOT EXISTS idx_mapping_scan_order
                ON {} (entity_type, create_time, legacy_id);",
            self.tables.mapping, self.tables.mapping
        ))
        .await?;

        conn.batch_execute(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                entity_type TEXT NOT NULL,
                legacy_id TEXT COLLATE \"C\" NOT NULL,
                reason_code TEXT NOT NULL CHECK (reason_code IN (
                    'missing_dependency', 'unsupported_feature', 'write_rejected', 'invalid_record'
                )),
                reason_detail TEXT NOT NULL,
                skipped_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (entity_type, legacy_id)
            )",
            self.tables.skip
        ))
        .await?;

        conn.batch_execute(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                target_key BIGSERIAL PRIMARY KEY,
                entity_type TEXT NOT NULL,
                legacy_id TEXT COLLATE \"C\" NOT NULL,
                state TEXT CHECK (state IN ('active', 'completed', 'canceled', 'terminated')),
                start_time TIMESTAMPTZ,
                end_time TIMESTAMPTZ,
                refs JSONB NOT NULL DEFAULT '{{}}',
                fields JSONB NOT NULL DEFAULT '{{}}',
                CHECK (start_time IS NULL OR end_time IS NULL OR end_time >= start_time)
            )",
            self.tables.record
        ))
        .await?;

        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "postgres"
    }
}
