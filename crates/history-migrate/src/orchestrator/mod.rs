//! Migration orchestrator - main workflow coordinator.
//!
//! Walks the entity catalog in dependency order and runs one
//! [`EntityMigrator`] pass per selected type, or produces a read-only
//! [`Listing`] of mappings or skips.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::config::Config;
use crate::core::{validate_order, EntityDescriptor, EntityType, CATALOG};
use crate::error::{MigrateError, Result};
use crate::migrator::{EntityMigrator, MigrationContext, MigratorStats, Scope};
use crate::report::{Listing, MappingGroup, SkipGroup};
use crate::source::{open_source, LegacySource};
use crate::state::{open_backend, StateBackend};

/// What a run does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Migrate records never seen before. Skipped records are left alone.
    Migrate,
    /// Re-attempt exactly the records in the skip ledger.
    RetrySkipped,
    ListMappings,
    ListSkipped,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Migrate => "migrate",
            RunMode::RetrySkipped => "retry_skipped",
            RunMode::ListMappings => "list_mappings",
            RunMode::ListSkipped => "list_skipped",
        }
    }

    /// Whether the mode writes anything.
    pub fn is_read_only(&self) -> bool {
        matches!(self, RunMode::ListMappings | RunMode::ListSkipped)
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Entity types a run is restricted to. Empty means all types.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityFilter {
    types: Vec<EntityType>,
}

impl EntityFilter {
    /// No restriction.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn only(types: impl IntoIterator<Item = EntityType>) -> Self {
        let mut types: Vec<EntityType> = types.into_iter().collect();
        types.sort();
        types.dedup();
        Self { types }
    }

    pub fn includes(&self, entity_type: EntityType) -> bool {
        self.types.is_empty() || self.types.contains(&entity_type)
    }
}

/// Per-type counts of a migrate or retry run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityReport {
    pub entity_type: EntityType,

    /// Legacy records of this type when the pass started.
    pub legacy_total: u64,

    pub migrated: u64,
    pub skipped: u64,
}

/// Result of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    /// Unique run identifier.
    pub run_id: String,

    pub mode: RunMode,

    /// Reference time used to close open records.
    pub cutover: DateTime<Utc>,

    /// When the run started.
    pub started_at: DateTime<Utc>,

    /// When the run completed.
    pub completed_at: DateTime<Utc>,

    /// Total duration in seconds.
    pub duration_seconds: f64,

    /// One entry per processed type, in catalog order (migrate and retry).
    pub entities: Vec<EntityReport>,

    /// Listing output (list modes).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listing: Option<Listing>,
}

impl RunReport {
    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn total_migrated(&self) -> u64 {
        self.entities.iter().map(|e| e.migrated).sum()
    }

    pub fn total_skipped(&self) -> u64 {
        self.entities.iter().map(|e| e.skipped).sum()
    }

    /// Counts for one type, if it was processed.
    pub fn entity(&self, entity_type: EntityType) -> Option<&EntityReport> {
        self.entities.iter().find(|e| e.entity_type == entity_type)
    }
}

/// Connectivity of the source and the state backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub source_type: String,
    pub source_connected: bool,
    pub source_latency_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_error: Option<String>,

    pub state_type: String,
    pub state_connected: bool,
    pub state_latency_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_error: Option<String>,

    pub healthy: bool,
}

/// Migration orchestrator.
pub struct Orchestrator {
    source: Arc<dyn LegacySource>,
    backend: Arc<dyn StateBackend>,
    catalog: &'static [EntityDescriptor],
    cutover: Option<DateTime<Utc>>,
    page_size: usize,
}

impl Orchestrator {
    /// Create an orchestrator over an already opened source and backend.
    ///
    /// Fails if the entity catalog is not a valid dependency order.
    pub fn new(source: Arc<dyn LegacySource>, backend: Arc<dyn StateBackend>) -> Result<Self> {
        validate_order(CATALOG)?;
        Ok(Self {
            source,
            backend,
            catalog: CATALOG,
            cutover: None,
            page_size: 500,
        })
    }

    /// Open the source and state backend described by `config`.
    pub async fn from_config(config: &Config) -> Result<Self> {
        info!(
            config_hash = %config.hash(),
            source = %config.source.r#type,
            state = %config.state.r#type,
            "Opening source and state backends"
        );
        let source = open_source(&config.source).await?;
        let backend = open_backend(&config.state).await?;
        Ok(Self::new(source, backend)?.with_page_size(config.migration.get_page_size()))
    }

    /// Fix the cutover timestamp instead of sampling it when a run starts.
    pub fn with_cutover(mut self, cutover: DateTime<Utc>) -> Self {
        self.cutover = Some(cutover);
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn selected(&self, filter: &EntityFilter) -> Vec<EntityType> {
        self.catalog
            .iter()
            .map(|d| d.entity_type)
            .filter(|t| filter.includes(*t))
            .collect()
    }

    /// Run one mode over the selected entity types.
    ///
    /// Migrate and retry runs stop at the first fatal error; everything
    /// committed before it stays committed and a later run picks up from
    /// there.
    pub async fn run(&self, mode: RunMode, filter: &EntityFilter) -> Result<RunReport> {
        let started_at = Utc::now();
        let timer = Instant::now();
        let run_id = uuid::Uuid::new_v4().to_string();
        let cutover = self.cutover.unwrap_or(started_at);
        let types = self.selected(filter);

        info!(
            "Starting {} run {} over {} entity types (source: {}, state: {})",
            mode,
            run_id,
            types.len(),
            self.source.source_type(),
            self.backend.backend_type()
        );

        let mut entities = Vec::new();
        let mut listing = None;

        match mode {
            RunMode::Migrate | RunMode::RetrySkipped => {
                info!("Cutover timestamp: {}", cutover.to_rfc3339());
                let ctx = MigrationContext::new(
                    Arc::clone(&self.source),
                    Arc::clone(&self.backend),
                    cutover,
                    self.page_size,
                );
                let scope = if mode == RunMode::Migrate {
                    Scope::New
                } else {
                    Scope::Skipped
                };

                for entity_type in types {
                    let legacy_total = self.source.count_records(entity_type).await?;
                    let pass = EntityMigrator::new(&ctx, entity_type).migrate(scope).await;
                    // Save buffered state even when the pass failed.
                    let flushed = self.backend.flush().await;
                    let stats: MigratorStats = pass
                        .and_then(|stats| flushed.map(|()| stats))
                        .inspect_err(|e| {
                            error!("{} run {} failed on {}: {}", mode, run_id, entity_type, e)
                        })?;
                    entities.push(EntityReport {
                        entity_type,
                        legacy_total,
                        migrated: stats.migrated,
                        skipped: stats.skipped,
                    });
                }
            }
            RunMode::ListMappings => listing = Some(self.list_mappings(&types).await?),
            RunMode::ListSkipped => listing = Some(self.list_skipped(&types).await?),
        }

        let completed_at = Utc::now();
        let report = RunReport {
            run_id,
            mode,
            cutover,
            started_at,
            completed_at,
            duration_seconds: timer.elapsed().as_secs_f64(),
            entities,
            listing,
        };

        if mode.is_read_only() {
            info!(
                "{} run finished: {} entries",
                mode,
                report.listing.as_ref().map_or(0, Listing::total)
            );
        } else {
            info!(
                "{} run finished: {} migrated, {} skipped in {:.1}s",
                mode,
                report.total_migrated(),
                report.total_skipped(),
                report.duration_seconds
            );
        }

        Ok(report)
    }

    async fn list_mappings(&self, types: &[EntityType]) -> Result<Listing> {
        let mut groups = Vec::with_capacity(types.len());
        for &entity_type in types {
            let mut entries = Vec::new();
            loop {
                let page = self
                    .backend
                    .list_by_type(entity_type, entries.len(), self.page_size)
                    .await?;
                let done = page.len() < self.page_size;
                entries.extend(page);
                if done {
                    break;
                }
            }
            groups.push(MappingGroup {
                entity_type,
                entries,
            });
        }
        Ok(Listing::Mappings { groups })
    }

    async fn list_skipped(&self, types: &[EntityType]) -> Result<Listing> {
        let groups = self
            .backend
            .list_skipped(types)
            .await?
            .into_iter()
            .map(|(entity_type, entries)| SkipGroup {
                entity_type,
                entries,
            })
            .collect();
        Ok(Listing::Skipped { groups })
    }

    /// Check that the source and the state backend answer queries.
    pub async fn health_check(&self) -> Result<HealthCheckResult> {
        let first_type = self.catalog.first().map(|d| d.entity_type).ok_or_else(|| {
            MigrateError::Catalog("entity catalog is empty".into())
        })?;

        let start = Instant::now();
        let source_result = self.source.count_records(first_type).await;
        let source_latency_ms = start.elapsed().as_millis() as u64;

        let start = Instant::now();
        let state_result = self.backend.count_by_type(first_type).await;
        let state_latency_ms = start.elapsed().as_millis() as u64;

        let result = HealthCheckResult {
            source_type: self.source.source_type().to_string(),
            source_connected: source_result.is_ok(),
            source_latency_ms,
            source_error: source_result.err().map(|e| e.to_string()),
            state_type: self.backend.backend_type().to_string(),
            state_connected: state_result.is_ok(),
            state_latency_ms,
            state_error: state_result.err().map(|e| e.to_string()),
            healthy: false,
        };
        Ok(HealthCheckResult {
            healthy: result.source_connected && result.state_connected,
            ..result
        })
    }
}
