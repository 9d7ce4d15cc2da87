//! Transactional writer: target insert and mapping insert as one unit.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error};

use crate::core::{TargetKey, TargetRecord};
use crate::error::Result;
use crate::state::{MappingEntry, StateBackend};
use crate::target::WriteTransaction;

/// Writes a transformed record and its mapping atomically.
#[derive(Clone)]
pub struct TransactionalWriter {
    backend: Arc<dyn StateBackend>,
}

impl TransactionalWriter {
    pub fn new(backend: Arc<dyn StateBackend>) -> Self {
        Self { backend }
    }

    /// Insert `record`, map its legacy id to the new key and commit.
    ///
    /// With `clear_skip` set the record's skip entry is removed in the same
    /// transaction. On any failure the transaction is rolled back and
    /// neither the record nor the mapping is visible.
    pub async fn write_and_map(
        &self,
        record: &TargetRecord,
        create_time: DateTime<Utc>,
        clear_skip: bool,
    ) -> Result<TargetKey> {
        let mut tx = self.backend.begin().await?;

        match Self::stage(tx.as_mut(), record, create_time, clear_skip).await {
            Ok(key) => {
                tx.commit().await?;
                debug!(
                    "Committed {} {} as target key {}",
                    record.entity_type, record.legacy_id, key
                );
                Ok(key)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    error!(
                        "Rollback failed for {} {}: {}",
                        record.entity_type, record.legacy_id, rollback_err
                    );
                }
                Err(e)
            }
        }
    }

    async fn stage(
        tx: &mut dyn WriteTransaction,
        record: &TargetRecord,
        create_time: DateTime<Utc>,
        clear_skip: bool,
    ) -> Result<TargetKey> {
        let target_key = tx.insert(record).await?;
        if clear_skip {
            tx.clear_skip(record.entity_type, &record.legacy_id).await?;
        }
        tx.put_mapping(&MappingEntry {
            entity_type: record.entity_type,
            legacy_id: record.legacy_id.clone(),
            target_key,
            create_time,
        })
        .await?;
        Ok(target_key)
    }
}
