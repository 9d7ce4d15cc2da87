//! File-based state: an [`InMemoryStore`] persisted as a JSON snapshot.
//!
//! The snapshot is rewritten atomically (temp file, then rename) once every
//! `save_every` committed changes and whenever the store is flushed. The
//! orchestrator flushes after each entity pass, so a crash loses at most the
//! changes since the last save; the next run redoes those records. Snapshots
//! carry an HMAC-SHA256 over their contents keyed by the store id, so
//! accidental edits are detected on load.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{info, warn};

use super::memory::{InMemoryStore, MemoryState, PersistFn};
use super::{MappingEntry, SkipEntry};
use crate::core::{EntityType, TargetKey, TargetRecord};
use crate::error::{MigrateError, Result};

type HmacSha256 = Hmac<Sha256>;

/// A target record as stored in a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub target_key: TargetKey,
    pub record: TargetRecord,
}

/// Serialized contents of a file-backed store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Unique store identifier, also the HMAC key.
    pub store_id: String,

    /// When the snapshot was written.
    pub saved_at: DateTime<Utc>,

    /// Last target key handed out.
    pub next_key: i64,

    pub mappings: Vec<MappingEntry>,

    pub skips: Vec<SkipEntry>,

    pub records: Vec<SnapshotRecord>,

    /// HMAC-SHA256 signature for integrity validation.
    /// Computed over serialized snapshot (excluding this field).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hmac: Option<String>,
}

impl StateSnapshot {
    /// Build a snapshot from store contents, sorted for stable output.
    pub(crate) fn from_state(store_id: &str, state: &MemoryState) -> Self {
        let mut mappings: Vec<MappingEntry> = state.mappings.values().cloned().collect();
        mappings.sort_by(|a, b| {
            (a.entity_type, a.create_time, &a.legacy_id).cmp(&(
                b.entity_type,
                b.create_time,
                &b.legacy_id,
            ))
        });

        let mut skips: Vec<SkipEntry> = state
            .skips
            .iter()
            .map(|((entity_type, legacy_id), reason)| SkipEntry {
                entity_type: *entity_type,
                legacy_id: legacy_id.clone(),
                reason: reason.clone(),
            })
            .collect();
        skips.sort_by(|a, b| (a.entity_type, &a.legacy_id).cmp(&(b.entity_type, &b.legacy_id)));

        let mut records: Vec<SnapshotRecord> = state
            .records
            .values()
            .flat_map(|by_key| by_key.iter())
            .map(|(key, record)| SnapshotRecord {
                target_key: *key,
                record: record.clone(),
            })
            .collect();
        records.sort_by_key(|r| r.target_key);

        Self {
            store_id: store_id.to_string(),
            saved_at: Utc::now(),
            next_key: state.next_key,
            mappings,
            skips,
            records,
            hmac: None,
        }
    }

    pub(crate) fn into_state(self) -> MemoryState {
        let mappings: HashMap<_, _> = self
            .mappings
            .into_iter()
            .map(|e| ((e.entity_type, e.legacy_id.clone()), e))
            .collect();
        let skips: HashMap<_, _> = self
            .skips
            .into_iter()
            .map(|s| ((s.entity_type, s.legacy_id), s.reason))
            .collect();
        let mut records: HashMap<EntityType, BTreeMap<TargetKey, TargetRecord>> = HashMap::new();
        for r in self.records {
            records
                .entry(r.record.entity_type)
                .or_default()
                .insert(r.target_key, r.record);
        }

        MemoryState {
            mappings,
            skips,
            records,
            next_key: self.next_key,
        }
    }

    fn compute_hmac(&self) -> Result<String> {
        let mut unsigned = self.clone();
        unsigned.hmac = None;

        let content = serde_json::to_string(&unsigned)
            .map_err(|e| MigrateError::State(format!("Failed to serialize snapshot for HMAC: {}", e)))?;

        let mut mac = HmacSha256::new_from_slice(self.store_id.as_bytes())
            .map_err(|e| MigrateError::State(format!("Failed to create HMAC: {}", e)))?;

        mac.update(content.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Load a snapshot, validating its HMAC if present.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let snapshot: Self = serde_json::from_str(&content)?;

        if let Some(stored_hmac) = &snapshot.hmac {
            let expected = snapshot.compute_hmac()?;
            if stored_hmac != &expected {
                return Err(MigrateError::State(
                    "State file integrity check failed: HMAC mismatch".to_string(),
                ));
            }
        } else {
            warn!("State file has no HMAC signature, integrity cannot be verified");
        }

        Ok(snapshot)
    }

    /// Save the snapshot (atomic write with HMAC).
    pub fn save<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();

        self.hmac = Some(self.compute_hmac()?);

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| MigrateError::State(format!("Failed to serialize snapshot: {}", e)))?;

        let temp_path = path.with_extension("tmp");
        std::fs::write(&temp_path, &content)?;
        std::fs::rename(&temp_path, path)?;

        Ok(())
    }
}

fn persist_to(path: PathBuf, store_id: String) -> PersistFn {
    Arc::new(move |state: &MemoryState| StateSnapshot::from_state(&store_id, state).save(&path))
}

/// Open (or create) a file-backed store at `path`, saving every
/// `save_every` changes.
pub fn open<P: AsRef<Path>>(path: P, save_every: usize) -> Result<InMemoryStore> {
    let path = path.as_ref().to_path_buf();

    let (store_id, state) = if path.exists() {
        let snapshot = StateSnapshot::load(&path)?;
        info!(
            "Loaded state file {:?}: {} mappings, {} skips",
            path,
            snapshot.mappings.len(),
            snapshot.skips.len()
        );
        (snapshot.store_id.clone(), snapshot.into_state())
    } else {
        let store_id = uuid::Uuid::new_v4().to_string();
        let state = MemoryState::default();
        StateSnapshot::from_state(&store_id, &state).save(&path)?;
        info!("Created state file {:?}", path);
        (store_id, state)
    };

    Ok(InMemoryStore::from_state(
        state,
        Some((persist_to(path, store_id), save_every)),
        "file",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{MappingStore, SkipLedger, SkipReason, StateBackend};
    use crate::target::TargetStore;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn entry(legacy_id: &str, key: i64) -> MappingEntry {
        MappingEntry {
            entity_type: EntityType::ProcessDefinition,
            legacy_id: legacy_id.to_string(),
            target_key: TargetKey(key),
            create_time: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");

        {
            let store = open(&path, 1000).unwrap();
            let mut tx = store.begin().await.unwrap();
            let key = tx
                .insert(&TargetRecord::new(EntityType::ProcessDefinition, "d1"))
                .await
                .unwrap();
            tx.put_mapping(&entry("d1", key.0)).await.unwrap();
            tx.commit().await.unwrap();
            store
                .mark_skipped(
                    EntityType::ProcessInstance,
                    "p1",
                    &SkipReason::MissingDependency(EntityType::ProcessDefinition),
                )
                .await
                .unwrap();
            store.flush().await.unwrap();
        }

        let reopened = open(&path, 1000).unwrap();
        assert!(reopened
            .exists(EntityType::ProcessDefinition, "d1")
            .await
            .unwrap());
        assert!(reopened
            .is_skipped(EntityType::ProcessInstance, "p1")
            .await
            .unwrap());
        assert_eq!(reopened.record_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_keys_keep_increasing_after_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");

        let first = {
            let store = open(&path, 1).unwrap();
            let mut tx = store.begin().await.unwrap();
            let key = tx
                .insert(&TargetRecord::new(EntityType::ProcessDefinition, "d1"))
                .await
                .unwrap();
            tx.put_mapping(&entry("d1", key.0)).await.unwrap();
            tx.commit().await.unwrap();
            key
        };

        let store = open(&path, 1).unwrap();
        let mut tx = store.begin().await.unwrap();
        let second = tx
            .insert(&TargetRecord::new(EntityType::ProcessDefinition, "d2"))
            .await
            .unwrap();
        assert!(second > first);
    }

    #[tokio::test]
    async fn test_changes_are_saved_in_batches() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let store = open(&path, 2).unwrap();

        store.put(&entry("d1", 1)).await.unwrap();
        let on_disk = StateSnapshot::load(&path).unwrap();
        assert!(on_disk.mappings.is_empty());

        store.put(&entry("d2", 2)).await.unwrap();
        let on_disk = StateSnapshot::load(&path).unwrap();
        assert_eq!(on_disk.mappings.len(), 2);

        store.put(&entry("d3", 3)).await.unwrap();
        store.flush().await.unwrap();
        let reopened = open(&path, 2).unwrap();
        assert_eq!(
            reopened
                .count_by_type(EntityType::ProcessDefinition)
                .await
                .unwrap(),
            3
        );
    }

    #[test]
    fn test_tampered_snapshot_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        open(&path, 1).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let tampered = content.replace("\"next_key\": 0", "\"next_key\": 42");
        assert_ne!(content, tampered);
        std::fs::write(&path, tampered).unwrap();

        let err = StateSnapshot::load(&path).unwrap_err();
        assert!(matches!(err, MigrateError::State(_)));
    }

    #[test]
    fn test_snapshot_is_pretty_json() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        open(&path, 1).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains('\n'));
        assert!(content.contains("\"store_id\""));
        assert!(serde_json::from_str::<serde_json::Value>(&content).is_ok());
    }

    #[test]
    fn test_unsigned_snapshot_is_accepted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let snapshot = StateSnapshot::from_state("legacy-store", &MemoryState::default());
        std::fs::write(&path, serde_json::to_string(&snapshot).unwrap()).unwrap();

        let loaded = StateSnapshot::load(&path).unwrap();
        assert_eq!(loaded.store_id, "legacy-store");
    }
}
