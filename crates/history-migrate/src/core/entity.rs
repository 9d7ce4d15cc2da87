//! Entity catalog: the closed set of migrated entity types and their
//! dependencies.
//!
//! The catalog is a fixed, ordered list of [`EntityDescriptor`]s. Order is
//! the migration order; every reference must point to a type that appears
//! earlier in the list (or to the type itself for optional parent links).
//! [`validate_order`] checks this once when the orchestrator starts.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{MigrateError, Result};

/// One category of historical record.
///
/// Variant order matches catalog order, so `Ord` sorts in migration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    ProcessDefinition,
    DecisionDefinition,
    ProcessInstance,
    FlowNode,
    UserTask,
    Variable,
    Incident,
    DecisionInstance,
}

impl EntityType {
    /// All entity types in migration order.
    pub const ALL: [EntityType; 8] = [
        EntityType::ProcessDefinition,
        EntityType::DecisionDefinition,
        EntityType::ProcessInstance,
        EntityType::FlowNode,
        EntityType::UserTask,
        EntityType::Variable,
        EntityType::Incident,
        EntityType::DecisionInstance,
    ];

    /// Stable identifier used in config, persistence and CLI output.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::ProcessDefinition => "process_definition",
            EntityType::DecisionDefinition => "decision_definition",
            EntityType::ProcessInstance => "process_instance",
            EntityType::FlowNode => "flow_node",
            EntityType::UserTask => "user_task",
            EntityType::Variable => "variable",
            EntityType::Incident => "incident",
            EntityType::DecisionInstance => "decision_instance",
        }
    }

    /// Human-readable name used in skip reasons.
    pub fn display_name(&self) -> &'static str {
        match self {
            EntityType::ProcessDefinition => "process definition",
            EntityType::DecisionDefinition => "decision definition",
            EntityType::ProcessInstance => "process instance",
            EntityType::FlowNode => "flow node",
            EntityType::UserTask => "user task",
            EntityType::Variable => "variable",
            EntityType::Incident => "incident",
            EntityType::DecisionInstance => "decision instance",
        }
    }

    /// Look up the catalog descriptor for this type.
    pub fn descriptor(&self) -> &'static EntityDescriptor {
        CATALOG
            .iter()
            .find(|d| d.entity_type == *self)
            .unwrap_or_else(|| unreachable!("every entity type has a descriptor"))
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = MigrateError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        EntityType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == normalized)
            .ok_or_else(|| MigrateError::Config(format!("Unknown entity type: {}", s)))
    }
}

/// How strictly a foreign reference must resolve before a record migrates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requirement {
    /// Must be present and mapped, otherwise the record is skipped.
    Mandatory,
    /// Must be mapped if the legacy record carries it.
    WhenSet,
    /// Resolved if possible, dropped otherwise.
    BestEffort,
}

/// A foreign reference from one entity type to another.
#[derive(Debug, Clone, Copy)]
pub struct Reference {
    /// Role name, also the key in [`LegacyRecord::references`](crate::core::LegacyRecord).
    pub role: &'static str,
    pub target: EntityType,
    pub requirement: Requirement,
}

/// Derived-state rule applied to a record's lifecycle before writing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleRule {
    /// The type has no lifecycle.
    None,
    /// Open records are closed at the run's cutover timestamp.
    AutoClose,
    /// Open records adopt the end time of the record behind this role.
    CascadeFrom(&'static str),
}

/// Static description of an entity type.
#[derive(Debug, Clone, Copy)]
pub struct EntityDescriptor {
    pub entity_type: EntityType,
    pub references: &'static [Reference],
    pub lifecycle: LifecycleRule,
}

impl EntityDescriptor {
    /// Find a reference by role.
    pub fn reference(&self, role: &str) -> Option<&Reference> {
        self.references.iter().find(|r| r.role == role)
    }
}

const fn reference(role: &'static str, target: EntityType, requirement: Requirement) -> Reference {
    Reference {
        role,
        target,
        requirement,
    }
}

/// The entity catalog in migration order.
pub static CATALOG: &[EntityDescriptor] = &[
    EntityDescriptor {
        entity_type: EntityType::ProcessDefinition,
        references: &[],
        lifecycle: LifecycleRule::None,
    },
    EntityDescriptor {
        entity_type: EntityType::DecisionDefinition,
        references: &[],
        lifecycle: LifecycleRule::None,
    },
    EntityDescriptor {
        entity_type: EntityType::ProcessInstance,
        references: &[
            reference(
                "process_definition",
                EntityType::ProcessDefinition,
                Requirement::Mandatory,
            ),
            reference(
                "parent_process_instance",
                EntityType::ProcessInstance,
                Requirement::WhenSet,
            ),
        ],
        lifecycle: LifecycleRule::AutoClose,
    },
    EntityDescriptor {
        entity_type: EntityType::FlowNode,
        references: &[
            reference(
                "process_instance",
                EntityType::ProcessInstance,
                Requirement::Mandatory,
            ),
            reference(
                "process_definition",
                EntityType::ProcessDefinition,
                Requirement::Mandatory,
            ),
        ],
        lifecycle: LifecycleRule::CascadeFrom("process_instance"),
    },
    EntityDescriptor {
        entity_type: EntityType::UserTask,
        references: &[
            reference(
                "process_instance",
                EntityType::ProcessInstance,
                Requirement::Mandatory,
            ),
            reference("flow_node", EntityType::FlowNode, Requirement::WhenSet),
        ],
        lifecycle: LifecycleRule::CascadeFrom("process_instance"),
    },
    EntityDescriptor {
        entity_type: EntityType::Variable,
        references: &[
            reference(
                "process_instance",
                EntityType::ProcessInstance,
                Requirement::Mandatory,
            ),
            reference("flow_node", EntityType::FlowNode, Requirement::BestEffort),
        ],
        lifecycle: LifecycleRule::None,
    },
    EntityDescriptor {
        entity_type: EntityType::Incident,
        references: &[
            reference(
                "process_instance",
                EntityType::ProcessInstance,
                Requirement::Mandatory,
            ),
            reference("flow_node", EntityType::FlowNode, Requirement::BestEffort),
        ],
        lifecycle: LifecycleRule::CascadeFrom("process_instance"),
    },
    EntityDescriptor {
        entity_type: EntityType::DecisionInstance,
        references: &[
            reference(
                "decision_definition",
                EntityType::DecisionDefinition,
                Requirement::Mandatory,
            ),
            reference(
                "process_instance",
                EntityType::ProcessInstance,
                Requirement::WhenSet,
            ),
            reference("flow_node", EntityType::FlowNode, Requirement::BestEffort),
        ],
        lifecycle: LifecycleRule::None,
    },
];

/// Check that `catalog` is a valid topological order.
///
/// Each type may appear once; every reference must target an earlier type,
/// or the type itself when the reference is not mandatory; cascade roles
/// must name a reference whose target has a lifecycle.
pub fn validate_order(catalog: &[EntityDescriptor]) -> Result<()> {
    let mut seen: HashSet<EntityType> = HashSet::new();

    for descriptor in catalog {
        let entity_type = descriptor.entity_type;
        if seen.contains(&entity_type) {
            return Err(MigrateError::Catalog(format!(
                "{} appears more than once",
                entity_type
            )));
        }

        for r in descriptor.references {
            if r.target == entity_type {
                if r.requirement == Requirement::Mandatory {
                    return Err(MigrateError::Catalog(format!(
                        "{} has a mandatory self-reference '{}'",
                        entity_type, r.role
                    )));
                }
                continue;
            }
            if !seen.contains(&r.target) {
                return Err(MigrateError::Catalog(format!(
                    "{} references {} via '{}' before it is migrated",
                    entity_type, r.target, r.role
                )));
            }
        }

        if let LifecycleRule::CascadeFrom(role) = descriptor.lifecycle {
            let parent = descriptor.reference(role).ok_or_else(|| {
                MigrateError::Catalog(format!(
                    "{} cascades from unknown role '{}'",
                    entity_type, role
                ))
            })?;
            let parent_rule = catalog
                .iter()
                .find(|d| d.entity_type == parent.target)
                .map(|d| d.lifecycle)
                .unwrap_or(LifecycleRule::None);
            if parent_rule == LifecycleRule::None {
                return Err(MigrateError::Catalog(format!(
                    "{} cascades from {} which has no lifecycle",
                    entity_type, parent.target
                )));
            }
        }

        seen.insert(entity_type);
    }

    Ok(())
}
