//! Migration bookkeeping: the Mapping Store and the Skip Ledger.
//!
//! A legacy record is either unseen, migrated (it has a [`MappingEntry`])
//! or skipped (it has a [`SkipEntry`]). Migrated and skipped are mutually
//! exclusive; backends enforce this in [`SkipLedger::mark_skipped`] and in
//! the write transaction that creates mappings.

pub mod backend;
pub mod db;
pub mod file;
pub mod memory;

pub use backend::{MappingStore, SkipLedger, StateBackend};
pub use db::PgStateBackend;
pub use file::StateSnapshot;
pub use memory::{Fault, InMemoryStore};

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::StateConfig;
use crate::core::{EntityType, TargetKey};
use crate::error::{MigrateError, Result};
use crate::pool::create_pool;

/// Legacy id to target key correspondence, created once per migrated record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingEntry {
    pub entity_type: EntityType,
    pub legacy_id: String,
    pub target_key: TargetKey,

    /// Creation time of the legacy record, used for ordering.
    pub create_time: DateTime<Utc>,
}

/// A legacy record that could not be migrated, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipEntry {
    pub entity_type: EntityType,
    pub legacy_id: String,
    pub reason: SkipReason,
}

/// Fixed vocabulary of skip reasons.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", content = "detail", rename_all = "snake_case")]
pub enum SkipReason {
    /// A required reference is not yet in the Mapping Store.
    MissingDependency(EntityType),
    /// The legacy record uses something the target cannot represent.
    UnsupportedFeature(String),
    /// The target store rejected the transformed record.
    WriteRejected(String),
    /// The legacy record could not be decoded (missing required field,
    /// malformed timestamp).
    InvalidRecord(String),
}

impl SkipReason {
    /// Persisted reason code.
    pub fn code(&self) -> &'static str {
        match self {
            SkipReason::MissingDependency(_) => "missing_dependency",
            SkipReason::UnsupportedFeature(_) => "unsupported_feature",
            SkipReason::WriteRejected(_) => "write_rejected",
            SkipReason::InvalidRecord(_) => "invalid_record",
        }
    }

    /// Persisted reason detail.
    pub fn detail(&self) -> String {
        match self {
            SkipReason::MissingDependency(t) => t.as_str().to_string(),
            SkipReason::UnsupportedFeature(d)
            | SkipReason::WriteRejected(d)
            | SkipReason::InvalidRecord(d) => d.clone(),
        }
    }

    /// Rebuild a reason from its persisted `(code, detail)` pair.
    pub fn from_parts(code: &str, detail: &str) -> Result<Self> {
        match code {
            "missing_dependency" => Ok(SkipReason::MissingDependency(detail.parse()?)),
            "unsupported_feature" => Ok(SkipReason::UnsupportedFeature(detail.to_string())),
            "write_rejected" => Ok(SkipReason::WriteRejected(detail.to_string())),
            "invalid_record" => Ok(SkipReason::InvalidRecord(detail.to_string())),
            _ => Err(MigrateError::State(format!("Invalid skip reason code: {}", code))),
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::MissingDependency(t) => write!(f, "missing {}", t.display_name()),
            SkipReason::UnsupportedFeature(d) => write!(f, "unsupported: {}", d),
            SkipReason::WriteRejected(d) => write!(f, "write rejected: {}", d),
            SkipReason::InvalidRecord(d) => write!(f, "invalid record: {}", d),
        }
    }
}

/// Open the state backend described by the configuration and make sure
/// its schema exists.
pub async fn open_backend(config: &StateConfig) -> Result<Arc<dyn StateBackend>> {
    let backend: Arc<dyn StateBackend> = match config.r#type.as_str() {
        "memory" => Arc::new(InMemoryStore::new()),
        "file" => {
            let path = config
                .path
                .as_ref()
                .ok_or_else(|| MigrateError::Config("state.path is required".into()))?;
            Arc::new(file::open(path, config.get_save_every())?)
        }
        "postgres" => {
            let conn = config
                .postgres
                .as_ref()
                .ok_or_else(|| MigrateError::Config("state.postgres is required".into()))?;
            let pool = create_pool(conn, "state backend").await?;
            Arc::new(PgStateBackend::new(
                pool,
                config.schema.clone(),
                config.target_schema.clone(),
            ))
        }
        other => {
            return Err(MigrateError::Config(format!(
                "Unknown state type: {}",
                other
            )))
        }
    };

    backend.init_schema().await?;
    info!("Using {} state backend", backend.backend_type());
    Ok(backend)
}
