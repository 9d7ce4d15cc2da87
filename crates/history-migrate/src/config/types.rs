//! Configuration type definitions.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Legacy datastore configuration.
    pub source: SourceConfig,

    /// Mapping store, skip ledger and target record storage.
    pub state: StateConfig,

    /// Migration behavior configuration.
    #[serde(default)]
    pub migration: MigrationConfig,
}

/// Legacy datastore configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Source type: "file" or "postgres".
    #[serde(default = "default_file")]
    pub r#type: String,

    /// Snapshot file with legacy records (file sources).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    /// Schema holding one view per entity type (postgres sources).
    #[serde(default = "default_legacy_schema")]
    pub schema: String,

    /// Connection settings (postgres sources).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postgres: Option<PgConnectionConfig>,
}

/// State storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    /// Backend type: "memory", "file" or "postgres".
    #[serde(default = "default_file")]
    pub r#type: String,

    /// State snapshot file (file backend).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    /// Commits between snapshot saves (file backend, default: 1000). The
    /// snapshot is also saved at the end of every entity pass.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save_every: Option<usize>,

    /// Schema for the mapping and skip tables (postgres backend).
    #[serde(default = "default_state_schema")]
    pub schema: String,

    /// Schema for migrated target records (postgres backend).
    #[serde(default = "default_target_schema")]
    pub target_schema: String,

    /// Connection settings (postgres backend).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postgres: Option<PgConnectionConfig>,
}

impl StateConfig {
    pub fn get_save_every(&self) -> usize {
        self.save_every.unwrap_or(1000)
    }
}

/// PostgreSQL connection settings.
#[derive(Clone, Serialize, Deserialize)]
pub struct PgConnectionConfig {
    pub host: String,

    /// Database port (default: 5432).
    #[serde(default = "default_pg_port")]
    pub port: u16,

    pub database: String,

    pub user: String,

    #[serde(default)]
    pub password: String,

    /// Maximum pooled connections (default: 4).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<usize>,
}

impl PgConnectionConfig {
    pub fn get_max_connections(&self) -> usize {
        self.max_connections.unwrap_or(4)
    }
}

impl fmt::Debug for PgConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

/// Migration behavior configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MigrationConfig {
    /// Legacy records read per page (default: 500).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_size: Option<usize>,

    /// Entity types to process when no filter is given on the command line.
    /// Empty means all types.
    #[serde(default)]
    pub entity_types: Vec<String>,
}

impl MigrationConfig {
    pub fn get_page_size(&self) -> usize {
        self.page_size.unwrap_or(500)
    }
}

// Default value functions for serde
fn default_file() -> String {
    "file".to_string()
}

fn default_pg_port() -> u16 {
    5432
}

fn default_legacy_schema() -> String {
    "legacy".to_string()
}

fn default_state_schema() -> String {
    "_history_migrate".to_string()
}

fn default_target_schema() -> String {
    "history".to_string()
}
