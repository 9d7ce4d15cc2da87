//! Error types for the migration library.

use thiserror::Error;

use crate::core::EntityType;

/// Main error type for migration operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// The entity catalog is not a valid dependency order.
    #[error("Invalid entity catalog: {0}")]
    Catalog(String),

    /// Legacy database connection or query error
    #[error("Source database error: {0}")]
    Source(#[source] tokio_postgres::Error),

    /// Target database connection or query error
    #[error("Target database error: {0}")]
    Target(#[from] tokio_postgres::Error),

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// State storage error (file backend, corrupt snapshot, etc.)
    #[error("State error: {0}")]
    State(String),

    /// A mapping already exists for this legacy record.
    #[error("Duplicate mapping for {entity_type} {legacy_id}")]
    DuplicateMapping {
        entity_type: EntityType,
        legacy_id: String,
    },

    /// A record would end up both migrated and skipped.
    #[error("Conflicting state for {entity_type} {legacy_id}: {message}")]
    ConflictingState {
        entity_type: EntityType,
        legacy_id: String,
        message: String,
    },

    /// The target store rejected a single record.
    #[error("Write rejected: {0}")]
    Rejected(String),

    /// A legacy record could not be decoded.
    #[error("Invalid legacy record: {0}")]
    InvalidRecord(String),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MigrateError {
    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl Into<String>, context: impl Into<String>) -> Self {
        MigrateError::Pool {
            message: message.into(),
            context: context.into(),
        }
    }

    /// Create a ConflictingState error
    pub fn conflict(
        entity_type: EntityType,
        legacy_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        MigrateError::ConflictingState {
            entity_type,
            legacy_id: legacy_id.into(),
            message: message.into(),
        }
    }

    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> u8 {
        match self {
            MigrateError::Config(_) | MigrateError::Catalog(_) => 1,
            MigrateError::Source(_) | MigrateError::InvalidRecord(_) => 2,
            MigrateError::Target(_) | MigrateError::Pool { .. } | MigrateError::Rejected(_) => 3,
            MigrateError::State(_)
            | MigrateError::DuplicateMapping { .. }
            | MigrateError::ConflictingState { .. } => 4,
            MigrateError::Io(_) => 7,
            MigrateError::Yaml(_) => 1,
            MigrateError::Json(_) => 8,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(MigrateError::Config("x".into()).exit_code(), 1);
        assert_eq!(MigrateError::pool("x", "y").exit_code(), 3);
        assert_eq!(
            MigrateError::DuplicateMapping {
                entity_type: EntityType::Variable,
                legacy_id: "v".into()
            }
            .exit_code(),
            4
        );
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert_eq!(MigrateError::Io(io).exit_code(), 7);
    }

    #[test]
    fn test_format_detailed_includes_cause() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "config.yaml");
        let err = MigrateError::Io(io);
        let detailed = err.format_detailed();
        assert!(detailed.starts_with("Error: IO error"));
    }

    #[test]
    fn test_conflict_message() {
        let err = MigrateError::conflict(EntityType::FlowNode, "fn-1", "already mapped");
        assert_eq!(
            err.to_string(),
            "Conflicting state for flow_node fn-1: already mapped"
        );
    }
}
