//! # history-migrate
//!
//! Incremental migration of workflow execution history from a legacy
//! datastore into a target datastore.
//!
//! The engine migrates one entity type at a time in a fixed dependency
//! order and guarantees:
//!
//! - **Exactly-once migration** via a persistent mapping store
//! - **Skip ledger** with reasons for records that cannot be migrated yet
//! - **Retry of skipped records** without touching migrated ones
//! - **Atomic write coupling** of each target record with its mapping
//! - **Consistent closure** of still-open instances at a per-run cutover
//!
//! ## Example
//!
//! ```rust,no_run
//! use history_migrate::{Config, EntityFilter, Orchestrator, RunMode};
//!
//! #[tokio::main]
//! async fn main() -> history_migrate::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let orchestrator = Orchestrator::from_config(&config).await?;
//!     let report = orchestrator.run(RunMode::Migrate, &EntityFilter::all()).await?;
//!     println!("Migrated {} records", report.total_migrated());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod migrator;
pub mod orchestrator;
pub mod pool;
pub mod report;
pub mod source;
pub mod state;
pub mod target;
pub mod writer;

// Re-exports for convenient access
pub use config::{Config, MigrationConfig, PgConnectionConfig, SourceConfig, StateConfig};
pub use self::core::{EntityType, LegacyRecord, Lifecycle, RecordState, TargetKey, TargetRecord};
pub use error::{MigrateError, Result};
pub use migrator::{EntityMigrator, MigrationContext, MigratorStats, RecordOutcome, Scope};
pub use orchestrator::{
    EntityFilter, EntityReport, HealthCheckResult, Orchestrator, RunMode, RunReport,
};
pub use report::Listing;
pub use source::{InMemorySource, LegacySource, PgLegacySource};
pub use state::{
    Fault, InMemoryStore, MappingEntry, MappingStore, PgStateBackend, SkipEntry, SkipLedger,
    SkipReason, StateBackend,
};
pub use target::{TargetFilter, TargetStore, WriteTransaction};
pub use writer::TransactionalWriter;
