//! Operator listings of mappings and skips.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::EntityType;
use crate::state::{MappingEntry, SkipEntry};

/// Mappings of one entity type, in scan order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingGroup {
    pub entity_type: EntityType,
    pub entries: Vec<MappingEntry>,
}

/// Skip entries of one entity type, ordered by legacy id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkipGroup {
    pub entity_type: EntityType,
    pub entries: Vec<SkipEntry>,
}

/// Result of a listing mode. Every requested entity type has a group, even
/// when it is empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Listing {
    Mappings { groups: Vec<MappingGroup> },
    Skipped { groups: Vec<SkipGroup> },
}

impl Listing {
    /// Total entries across all groups.
    pub fn total(&self) -> usize {
        match self {
            Listing::Mappings { groups } => groups.iter().map(|g| g.entries.len()).sum(),
            Listing::Skipped { groups } => groups.iter().map(|g| g.entries.len()).sum(),
        }
    }
}

fn write_group<T>(
    f: &mut fmt::Formatter<'_>,
    entity_type: EntityType,
    entries: &[T],
    line: impl Fn(&mut fmt::Formatter<'_>, &T) -> fmt::Result,
) -> fmt::Result {
    writeln!(f, "{}:", entity_type)?;
    if entries.is_empty() {
        return writeln!(f, "  (none)");
    }
    for entry in entries {
        line(f, entry)?;
    }
    Ok(())
}

impl fmt::Display for Listing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Listing::Mappings { groups } => {
                for g in groups {
                    write_group(f, g.entity_type, &g.entries, |f, e| {
                        writeln!(f, "  {} -> {}", e.legacy_id, e.target_key)
                    })?;
                }
            }
            Listing::Skipped { groups } => {
                for g in groups {
                    write_group(f, g.entity_type, &g.entries, |f, e| {
                        writeln!(f, "  {}: {}", e.legacy_id, e.reason)
                    })?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TargetKey;
    use crate::state::SkipReason;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_mapping_listing_text() {
        let listing = Listing::Mappings {
            groups: vec![
                MappingGroup {
                    entity_type: EntityType::ProcessDefinition,
                    entries: vec![MappingEntry {
                        entity_type: EntityType::ProcessDefinition,
                        legacy_id: "def-1".into(),
                        target_key: TargetKey(1),
                        create_time: Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap(),
                    }],
                },
                MappingGroup {
                    entity_type: EntityType::Variable,
                    entries: vec![],
                },
            ],
        };

        assert_eq!(
            listing.to_string(),
            "process_definition:\n  def-1 -> 1\nvariable:\n  (none)\n"
        );
        assert_eq!(listing.total(), 1);
    }

    #[test]
    fn test_skip_listing_text() {
        let listing = Listing::Skipped {
            groups: vec![SkipGroup {
                entity_type: EntityType::ProcessInstance,
                entries: vec![SkipEntry {
                    entity_type: EntityType::ProcessInstance,
                    legacy_id: "pi-1".into(),
                    reason: SkipReason::MissingDependency(EntityType::ProcessDefinition),
                }],
            }],
        };

        assert_eq!(
            listing.to_string(),
            "process_instance:\n  pi-1: missing process definition\n"
        );
    }

    #[test]
    fn test_listing_json_shape() {
        let listing = Listing::Skipped { groups: vec![] };
        let json = serde_json::to_value(&listing).unwrap();
        assert_eq!(json["kind"], "skipped");
    }
}
