//! In-memory legacy source, optionally loaded from a snapshot file.
//!
//! The snapshot is a YAML (or JSON) document keyed by entity type:
//!
//! ```yaml
//! process_definition:
//!   - id: def-1
//!     create_time: 2024-03-01T09:00:00Z
//!     fields: { key: invoice, version: 1 }
//! process_instance:
//!   - id: inst-1
//!     create_time: 2024-03-01T10:00:00Z
//!     references: { process_definition: def-1 }
//!     fields: { state: ACTIVE, start_time: 2024-03-01T10:00:00Z }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::path::Path;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::info;

use super::{Cursor, LegacySource};
use crate::core::{EntityType, LegacyRecord, Payload};
use crate::error::{MigrateError, Result};

/// One record in a snapshot file.
#[derive(Debug, Deserialize)]
struct FileRecord {
    id: String,
    create_time: DateTime<Utc>,
    #[serde(default)]
    references: BTreeMap<String, String>,
    #[serde(default)]
    fields: Payload,
}

#[derive(Debug, Default)]
struct TypeRecords {
    by_cursor: BTreeMap<Cursor, LegacyRecord>,
    by_id: HashMap<String, Cursor>,
}

/// Legacy records held in process memory.
#[derive(Debug, Default)]
pub struct InMemorySource {
    records: RwLock<HashMap<EntityType, TypeRecords>>,
}

impl InMemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a snapshot file.
    pub fn load_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let source = Self::from_yaml(&content)?;
        info!(
            "Loaded {} legacy records from {}",
            source.len()?,
            path.display()
        );
        Ok(source)
    }

    /// Parse a snapshot document.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let snapshot: BTreeMap<EntityType, Vec<FileRecord>> = serde_yaml::from_str(yaml)?;
        let source = Self::new();
        for (entity_type, records) in snapshot {
            for r in records {
                source.add(LegacyRecord {
                    entity_type,
                    legacy_id: r.id,
                    create_time: r.create_time,
                    references: r.references,
                    payload: r.fields,
                })?;
            }
        }
        Ok(source)
    }

    /// Add or replace a record, as the live legacy system would.
    pub fn add(&self, record: LegacyRecord) -> Result<()> {
        let mut records = self.write()?;
        let typed = records.entry(record.entity_type).or_default();
        if let Some(old) = typed.by_id.remove(&record.legacy_id) {
            typed.by_cursor.remove(&old);
        }
        let cursor = record.cursor();
        typed.by_id.insert(record.legacy_id.clone(), cursor.clone());
        typed.by_cursor.insert(cursor, record);
        Ok(())
    }

    /// Number of records across all types.
    pub fn len(&self) -> Result<usize> {
        Ok(self.read()?.values().map(|t| t.by_cursor.len()).sum())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<EntityType, TypeRecords>>> {
        self.records
            .read()
            .map_err(|_| MigrateError::State("legacy source lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<EntityType, TypeRecords>>> {
        self.records
            .write()
            .map_err(|_| MigrateError::State("legacy source lock poisoned".into()))
    }
}

#[async_trait]
impl LegacySource for InMemorySource {
    async fn query_records(
        &self,
        entity_type: EntityType,
        after: Option<&Cursor>,
        page_size: usize,
    ) -> Result<Vec<LegacyRecord>> {
        let records = self.read()?;
        let Some(typed) = records.get(&entity_type) else {
            return Ok(Vec::new());
        };
        let page = match after {
            Some(cursor) => typed
                .by_cursor
                .range((Bound::Excluded(cursor), Bound::Unbounded))
                .take(page_size)
                .map(|(_, r)| r.clone())
                .collect(),
            None => typed
                .by_cursor
                .values()
                .take(page_size)
                .cloned()
                .collect(),
        };
        Ok(page)
    }

    async fn fetch_records(
        &self,
        entity_type: EntityType,
        ids: &[String],
    ) -> Result<Vec<LegacyRecord>> {
        let records = self.read()?;
        let Some(typed) = records.get(&entity_type) else {
            return Ok(Vec::new());
        };
        let mut cursors: Vec<&Cursor> = ids.iter().filter_map(|id| typed.by_id.get(id)).collect();
        cursors.sort();
        cursors.dedup();
        Ok(cursors
            .into_iter()
            .filter_map(|c| typed.by_cursor.get(c).cloned())
            .collect())
    }

    async fn count_records(&self, entity_type: EntityType) -> Result<u64> {
        Ok(self
            .read()?
            .get(&entity_type)
            .map_or(0, |t| t.by_cursor.len() as u64))
    }

    fn source_type(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 10, m, 0).unwrap()
    }

    fn ids(records: &[LegacyRecord]) -> Vec<&str> {
        records.iter().map(|r| r.legacy_id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_keyset_paging() {
        let source = InMemorySource::new();
        for (id, m) in [("c", 1), ("a", 2), ("b", 2), ("d", 3)] {
            source
                .add(LegacyRecord::new(EntityType::ProcessDefinition, id, ts(m)))
                .unwrap();
        }

        let first = source
            .query_records(EntityType::ProcessDefinition, None, 2)
            .await
            .unwrap();
        assert_eq!(ids(&first), vec!["c", "a"]);

        let cursor = first.last().unwrap().cursor();
        let second = source
            .query_records(EntityType::ProcessDefinition, Some(&cursor), 2)
            .await
            .unwrap();
        assert_eq!(ids(&second), vec!["b", "d"]);

        let cursor = second.last().unwrap().cursor();
        let third = source
            .query_records(EntityType::ProcessDefinition, Some(&cursor), 2)
            .await
            .unwrap();
        assert!(third.is_empty());
    }

    #[tokio::test]
    async fn test_record_added_behind_cursor_is_found_by_fetch() {
        let source = InMemorySource::new();
        source
            .add(LegacyRecord::new(EntityType::Variable, "v2", ts(5)))
            .unwrap();
        source
            .add(LegacyRecord::new(EntityType::Variable, "v1", ts(1)))
            .unwrap();

        let fetched = source
            .fetch_records(
                EntityType::Variable,
                &["v2".to_string(), "v1".to_string(), "gone".to_string()],
            )
            .await
            .unwrap();
        assert_eq!(ids(&fetched), vec!["v1", "v2"]);
        assert_eq!(source.count_records(EntityType::Variable).await.unwrap(), 2);
        assert_eq!(source.count_records(EntityType::Incident).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_add_replaces_existing_id() {
        let source = InMemorySource::new();
        source
            .add(LegacyRecord::new(EntityType::Incident, "i1", ts(1)))
            .unwrap();
        source
            .add(LegacyRecord::new(EntityType::Incident, "i1", ts(2)).with_field("message", "boom"))
            .unwrap();

        let all = source
            .query_records(EntityType::Incident, None, 10)
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].create_time, ts(2));
        assert_eq!(all[0].str_field("message"), Some("boom"));
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
process_definition:
  - id: def-1
    create_time: 2024-03-01T09:00:00Z
    fields: { key: invoice }
process_instance:
  - id: inst-1
    create_time: 2024-03-01T10:00:00Z
    references: { process_definition: def-1 }
"#;
        let source = InMemorySource::from_yaml(yaml).unwrap();
        assert_eq!(source.len().unwrap(), 2);

        let records = source.read().unwrap();
        let inst = records[&EntityType::ProcessInstance]
            .by_cursor
            .values()
            .next()
            .unwrap();
        assert_eq!(inst.references["process_definition"], "def-1");
    }

    #[test]
    fn test_from_yaml_rejects_unknown_type() {
        let yaml = "job:\n  - id: j1\n    create_time: 2024-03-01T09:00:00Z\n";
        assert!(InMemorySource::from_yaml(yaml).is_err());
    }
}
