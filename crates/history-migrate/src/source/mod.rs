//! Legacy datastore access.
//!
//! The engine only reads from the legacy store. Reads are paged on a
//! `(create_time, legacy_id)` keyset so that rows inserted between pages, or
//! between runs, are still picked up exactly once.

pub mod memory;
pub mod postgres;

pub use memory::InMemorySource;
pub use postgres::PgLegacySource;

pub use crate::core::Cursor;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::SourceConfig;
use crate::core::{EntityType, LegacyRecord};
use crate::error::{MigrateError, Result};
use crate::pool::create_pool;

/// Read-only view of the legacy datastore.
#[async_trait]
pub trait LegacySource: Send + Sync {
    /// Records of one type strictly after `after`, ordered by
    /// `(create_time, legacy_id)`, at most `page_size` of them.
    async fn query_records(
        &self,
        entity_type: EntityType,
        after: Option<&Cursor>,
        page_size: usize,
    ) -> Result<Vec<LegacyRecord>>;

    /// Records of one type with the given ids, ordered by
    /// `(create_time, legacy_id)`. Unknown ids are left out.
    async fn fetch_records(&self, entity_type: EntityType, ids: &[String])
        -> Result<Vec<LegacyRecord>>;

    /// Total number of legacy records of one type.
    async fn count_records(&self, entity_type: EntityType) -> Result<u64>;

    /// Source type name for logging.
    fn source_type(&self) -> &'static str;
}

/// Open the legacy source described by the configuration.
pub async fn open_source(config: &SourceConfig) -> Result<Arc<dyn LegacySource>> {
    match config.r#type.as_str() {
        "file" => {
            let path = config
                .path
                .as_ref()
                .ok_or_else(|| MigrateError::Config("source.path is required".into()))?;
            Ok(Arc::new(InMemorySource::load_file(path)?))
        }
        "postgres" => {
            let conn = config
                .postgres
                .as_ref()
                .ok_or_else(|| MigrateError::Config("source.postgres is required".into()))?;
            let pool = create_pool(conn, "legacy source").await?;
            Ok(Arc::new(PgLegacySource::new(pool, config.schema.clone())))
        }
        other => Err(MigrateError::Config(format!(
            "Unknown source type: {}",
            other
        ))),
    }
}
