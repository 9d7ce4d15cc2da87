//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;

use crate::core::EntityType;
use crate::error::Result;
use sha2::{Digest, Sha256};
use std::path::Path;

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }

    /// Compute a SHA256 hash of the configuration.
    pub fn hash(&self) -> String {
        let yaml = serde_yaml::to_string(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(yaml.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Entity types selected by `migration.entity_types`, in catalog order.
    /// Empty means no restriction.
    pub fn entity_types(&self) -> Result<Vec<EntityType>> {
        let mut types = self
            .migration
            .entity_types
            .iter()
            .map(|s| s.parse::<EntityType>())
            .collect::<Result<Vec<_>>>()?;
        types.sort();
        types.dedup();
        Ok(types)
    }
}
