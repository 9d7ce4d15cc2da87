//! Configuration validation.

use super::{Config, PgConnectionConfig};
use crate::error::{MigrateError, Result};

fn validate_connection(section: &str, conn: Option<&PgConnectionConfig>) -> Result<()> {
    let conn = conn.ok_or_else(|| {
        MigrateError::Config(format!("{}.postgres is required for type 'postgres'", section))
    })?;
    if conn.host.is_empty() {
        return Err(MigrateError::Config(format!("{}.postgres.host is required", section)));
    }
    if conn.database.is_empty() {
        return Err(MigrateError::Config(format!(
            "{}.postgres.database is required",
            section
        )));
    }
    if conn.user.is_empty() {
        return Err(MigrateError::Config(format!("{}.postgres.user is required", section)));
    }
    if let Some(0) = conn.max_connections {
        return Err(MigrateError::Config(format!(
            "{}.postgres.max_connections must be at least 1",
            section
        )));
    }
    Ok(())
}

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    // Source validation
    match config.source.r#type.as_str() {
        "file" => {
            if config.source.path.is_none() {
                return Err(MigrateError::Config(
                    "source.path is required for type 'file'".into(),
                ));
            }
        }
        "postgres" => validate_connection("source", config.source.postgres.as_ref())?,
        other => {
            return Err(MigrateError::Config(format!(
                "source.type must be 'file' or 'postgres', got '{}'",
                other
            )))
        }
    }

    // State validation
    match config.state.r#type.as_str() {
        "memory" => {}
        "file" => {
            if config.state.path.is_none() {
                return Err(MigrateError::Config(
                    "state.path is required for type 'file'".into(),
                ));
            }
        }
        "postgres" => {
            validate_connection("state", config.state.postgres.as_ref())?;
            if config.state.schema == config.state.target_schema {
                return Err(MigrateError::Config(
                    "state.schema and state.target_schema must differ".into(),
                ));
            }
        }
        other => {
            return Err(MigrateError::Config(format!(
                "state.type must be 'memory', 'file' or 'postgres', got '{}'",
                other
            )))
        }
    }

    if let Some(0) = config.state.save_every {
        return Err(MigrateError::Config(
            "state.save_every must be at least 1".into(),
        ));
    }

    // Migration config validation - only check if explicitly set
    if let Some(0) = config.migration.page_size {
        return Err(MigrateError::Config(
            "migration.page_size must be at least 1".into(),
        ));
    }
    config.entity_types()?;

    Ok(())
}
