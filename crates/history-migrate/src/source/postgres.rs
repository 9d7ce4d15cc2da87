//! PostgreSQL legacy source.
//!
//! Reads one view per entity type from the configured schema. Each view
//! exposes `id`, `create_time` (timestamptz), one column per reference role
//! named after the role, and any number of payload columns. Rows are read
//! whole with `row_to_json` so views can evolve without code changes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Object, Pool};
use serde_json::Value;
use tokio_postgres::Row;
use tracing::debug;

use super::{Cursor, LegacySource};
use crate::core::{EntityType, LegacyRecord, Payload};
use crate::error::{MigrateError, Result};
use crate::pool::quote_ident;

/// PostgreSQL legacy source.
pub struct PgLegacySource {
    pool: Pool,
    schema: String,
}

impl PgLegacySource {
    pub fn new(pool: Pool, schema: impl Into<String>) -> Self {
        Self {
            pool,
            schema: schema.into(),
        }
    }

    fn view(&self, entity_type: EntityType) -> String {
        format!(
            "{}.{}",
            quote_ident(&self.schema),
            quote_ident(entity_type.as_str())
        )
    }

    async fn conn(&self) -> Result<Object> {
        self.pool
            .get()
            .await
            .map_err(|e| MigrateError::pool(e.to_string(), "legacy source"))
    }
}

/// Split a `row_to_json` document into a [`LegacyRecord`].
///
/// Reference roles declared for the type are lifted out of the payload;
/// a null reference column means the reference is not set.
pub(crate) fn record_from_json(
    entity_type: EntityType,
    legacy_id: String,
    create_time: DateTime<Utc>,
    row: Value,
) -> Result<LegacyRecord> {
    let mut payload: Payload = match row {
        Value::Object(map) => map,
        other => {
            return Err(MigrateError::InvalidRecord(format!(
                "{} {}: row is not an object: {}",
                entity_type, legacy_id, other
            )))
        }
    };
    payload.remove("id");
    payload.remove("create_time");

    let mut record = LegacyRecord::new(entity_type, legacy_id, create_time);
    for reference in entity_type.descriptor().references {
        match payload.remove(reference.role) {
            None | Some(Value::Null) => {}
            Some(Value::String(id)) => {
                record.references.insert(reference.role.to_string(), id);
            }
            Some(Value::Number(id)) => {
                record
                    .references
                    .insert(reference.role.to_string(), id.to_string());
            }
            Some(other) => {
                return Err(MigrateError::InvalidRecord(format!(
                    "{} {}: reference '{}' has unexpected value {}",
                    entity_type, record.legacy_id, reference.role, other
                )))
            }
        }
    }
    record.payload = payload;
    Ok(record)
}

fn record_from_row(entity_type: EntityType, row: &Row) -> Result<LegacyRecord> {
    let legacy_id: String = row.get(0);
    let create_time: DateTime<Utc> = row.get(1);
    let doc: Value = row.get(2);
    record_from_json(entity_type, legacy_id, create_time, doc)
}

// Ids compare byte-wise (`COLLATE "C"`), the same order as `Cursor`.

fn page_sql(view: &str) -> String {
    format!(
        "SELECT v.id::text, v.create_time, row_to_json(v)::jsonb
         FROM {} v
         WHERE $1::timestamptz IS NULL
            OR (v.create_time, v.id::text COLLATE \"C\") > ($1::timestamptz, $2::text)
         ORDER BY v.create_time, v.id::text COLLATE \"C\"
         LIMIT $3",
        view
    )
}

fn fetch_sql(view: &str) -> String {
    format!(
        "SELECT v.id::text, v.create_time, row_to_json(v)::jsonb
         FROM {} v
         WHERE v.id::text = ANY($1)
         ORDER BY v.create_time, v.id::text COLLATE \"C\"",
        view
    )
}

#[async_trait]
impl LegacySource for PgLegacySource {
    async fn query_records(
        &self,
        entity_type: EntityType,
        after: Option<&Cursor>,
        page_size: usize,
    ) -> Result<Vec<LegacyRecord>> {
        let conn = self.conn().await?;
        let after_time = after.map(|c| c.create_time);
        let after_id = after.map(|c| c.legacy_id.as_str());

        let sql = page_sql(&self.view(entity_type));
        let rows = conn
            .query(&sql, &[&after_time, &after_id, &(page_size as i64)])
            .await
            .map_err(MigrateError::Source)?;

        debug!("Read {} {} rows from legacy view", rows.len(), entity_type);
        rows.iter()
            .map(|row| record_from_row(entity_type, row))
            .collect()
    }

    async fn fetch_records(
        &self,
        entity_type: EntityType,
        ids: &[String],
    ) -> Result<Vec<LegacyRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn().await?;
        let sql = fetch_sql(&self.view(entity_type));
        let rows = conn
            .query(&sql, &[&ids])
            .await
            .map_err(MigrateError::Source)?;
        rows.iter()
            .map(|row| record_from_row(entity_type, row))
            .collect()
    }

    async fn count_records(&self, entity_type: EntityType) -> Result<u64> {
        let conn = self.conn().await?;
        let row = conn
            .query_one(
                &format!("SELECT COUNT(*) FROM {}", self.view(entity_type)),
                &[],
            )
            .await
            .map_err(MigrateError::Source)?;
        let count: i64 = row.get(0);
        Ok(count as u64)
    }

    fn source_type(&self) -> &'static str {
        "postgres"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_record_from_json_lifts_references() {
        let created = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let row = json!({
            "id": "ut-1",
            "create_time": "2024-03-01T10:00:00+00:00",
            "process_instance": 42,
            "flow_node": null,
            "name": "Approve invoice",
            "state": "COMPLETED"
        });

        let record =
            record_from_json(EntityType::UserTask, "ut-1".into(), created, row).unwrap();
        assert_eq!(record.references.len(), 1);
        assert_eq!(record.references["process_instance"], "42");
        assert_eq!(record.str_field("name"), Some("Approve invoice"));
        assert!(!record.payload.contains_key("id"));
        assert!(!record.payload.contains_key("flow_node"));
    }

    #[test]
    fn test_queries_order_ids_bytewise() {
        let page = page_sql("\"legacy\".flow_node");
        assert!(page.contains("FROM \"legacy\".flow_node v"));
        assert!(page.contains("(v.create_time, v.id::text COLLATE \"C\") > ($1::timestamptz, $2::text)"));
        assert!(page.contains("ORDER BY v.create_time, v.id::text COLLATE \"C\""));

        let fetch = fetch_sql("\"legacy\".flow_node");
        assert!(fetch.contains("ORDER BY v.create_time, v.id::text COLLATE \"C\""));
    }

    #[test]
    fn test_record_from_json_rejects_bad_reference() {
        let created = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let row = json!({ "id": "v-1", "process_instance": ["a"] });
        let err = record_from_json(EntityType::Variable, "v-1".into(), created, row).unwrap_err();
        assert!(matches!(err, MigrateError::InvalidRecord(_)));
    }
}
