//! Legacy to target record transformation.
//!
//! Each entity type copies a fixed set of payload fields under their target
//! names. Types with a lifecycle also get a [`Lifecycle`] built from the
//! legacy `state`, `start_time` and `end_time` fields. Closing open
//! lifecycles is done afterwards by [`close_if_open`], which the migrator
//! applies with the right timestamp for each type.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::core::{EntityType, LegacyRecord, Lifecycle, RecordState, TargetKey, TargetRecord};
use crate::error::{MigrateError, Result};

/// Result of transforming one legacy record.
#[derive(Debug, Clone, PartialEq)]
pub enum Transform {
    Ready(TargetRecord),
    /// The record uses a feature the target cannot represent.
    Unsupported(String),
}

/// A payload field copied to the target record.
struct Field {
    legacy: &'static str,
    target: &'static str,
    required: bool,
}

const fn field(legacy: &'static str, target: &'static str) -> Field {
    Field {
        legacy,
        target,
        required: false,
    }
}

const fn required(legacy: &'static str, target: &'static str) -> Field {
    Field {
        legacy,
        target,
        required: true,
    }
}

const PROCESS_DEFINITION_FIELDS: &[Field] = &[
    required("key", "bpmn_process_id"),
    field("name", "name"),
    field("version", "version"),
    field("resource_name", "resource_name"),
    field("tenant_id", "tenant_id"),
];

const DECISION_DEFINITION_FIELDS: &[Field] = &[
    required("key", "decision_id"),
    field("name", "name"),
    field("version", "version"),
    field("decision_requirements_key", "decision_requirements_id"),
    field("tenant_id", "tenant_id"),
];

const PROCESS_INSTANCE_FIELDS: &[Field] = &[
    field("business_key", "business_key"),
    field("tenant_id", "tenant_id"),
];

const FLOW_NODE_FIELDS: &[Field] = &[
    required("activity_id", "element_id"),
    required("activity_type", "element_type"),
    field("activity_name", "name"),
    field("tenant_id", "tenant_id"),
];

const USER_TASK_FIELDS: &[Field] = &[
    required("task_definition_key", "element_id"),
    field("name", "name"),
    field("assignee", "assignee"),
    field("priority", "priority"),
    field("due_date", "due_date"),
    field("tenant_id", "tenant_id"),
];

const VARIABLE_FIELDS: &[Field] = &[
    required("name", "name"),
    field("value", "value"),
    field("serializer", "value_type"),
    field("tenant_id", "tenant_id"),
];

const INCIDENT_FIELDS: &[Field] = &[
    required("incident_type", "error_type"),
    field("message", "error_message"),
    field("tenant_id", "tenant_id"),
];

const DECISION_INSTANCE_FIELDS: &[Field] = &[
    field("hit_policy", "hit_policy"),
    field("evaluation_time", "evaluation_date"),
    field("inputs", "evaluated_inputs"),
    field("outputs", "evaluated_outputs"),
    field("tenant_id", "tenant_id"),
];

fn fields(entity_type: EntityType) -> &'static [Field] {
    match entity_type {
        EntityType::ProcessDefinition => PROCESS_DEFINITION_FIELDS,
        EntityType::DecisionDefinition => DECISION_DEFINITION_FIELDS,
        EntityType::ProcessInstance => PROCESS_INSTANCE_FIELDS,
        EntityType::FlowNode => FLOW_NODE_FIELDS,
        EntityType::UserTask => USER_TASK_FIELDS,
        EntityType::Variable => VARIABLE_FIELDS,
        EntityType::Incident => INCIDENT_FIELDS,
        EntityType::DecisionInstance => DECISION_INSTANCE_FIELDS,
    }
}

fn has_lifecycle(entity_type: EntityType) -> bool {
    matches!(
        entity_type,
        EntityType::ProcessInstance
            | EntityType::FlowNode
            | EntityType::UserTask
            | EntityType::Incident
    )
}

/// Feature check run before anything is copied. `Some` names the
/// unsupported feature.
fn unsupported_feature(record: &LegacyRecord) -> Option<String> {
    match record.entity_type {
        EntityType::Variable => {
            let serializer = record.str_field("serializer")?;
            serializer
                .eq_ignore_ascii_case("java_serialized")
                .then(|| "java serialized variable value".to_string())
        }
        EntityType::DecisionInstance => {
            let collect = record
                .str_field("hit_policy")
                .is_some_and(|p| p.eq_ignore_ascii_case("COLLECT"));
            let aggregation = record.str_field("aggregation");
            match (collect, aggregation) {
                (true, Some(agg)) => Some(format!("COLLECT hit policy with {} aggregation", agg)),
                _ => None,
            }
        }
        EntityType::FlowNode => record
            .str_field("activity_type")
            .filter(|t| t.eq_ignore_ascii_case("compensation_event"))
            .map(|_| "compensation event".to_string()),
        _ => None,
    }
}

fn lifecycle(record: &LegacyRecord) -> Result<std::result::Result<Lifecycle, String>> {
    let end_time = record.time_field("end_time")?;
    let state = match record.str_field("state") {
        Some(s) => match RecordState::from_legacy(s) {
            Some(state) => state,
            None => return Ok(Err(format!("state {}", s))),
        },
        None if end_time.is_some() => RecordState::Completed,
        None => RecordState::Active,
    };
    let start_time = record
        .time_field("start_time")?
        .unwrap_or(record.create_time);

    Ok(Ok(Lifecycle {
        state,
        start_time: Some(start_time),
        end_time,
    }))
}

/// Transform a legacy record, substituting resolved target keys.
///
/// Fails with [`MigrateError::InvalidRecord`] only when the record cannot be
/// decoded (a missing required field or a malformed timestamp). The
/// migrator records that as a skip.
pub fn transform(
    record: &LegacyRecord,
    references: BTreeMap<String, TargetKey>,
) -> Result<Transform> {
    if let Some(feature) = unsupported_feature(record) {
        return Ok(Transform::Unsupported(feature));
    }

    let mut target = TargetRecord::new(record.entity_type, record.legacy_id.clone());
    target.references = references;

    for f in fields(record.entity_type) {
        match record.payload.get(f.legacy) {
            None | Some(Value::Null) if f.required => {
                return Err(MigrateError::InvalidRecord(format!(
                    "required field '{}' is missing",
                    f.legacy
                )))
            }
            None | Some(Value::Null) => {}
            Some(value) => {
                target.fields.insert(f.target.to_string(), value.clone());
            }
        }
    }

    if has_lifecycle(record.entity_type) {
        match lifecycle(record)? {
            Ok(l) => target.lifecycle = Some(l),
            Err(feature) => return Ok(Transform::Unsupported(feature)),
        }
    }

    Ok(Transform::Ready(target))
}

/// Close an open lifecycle at `at`.
///
/// An open lifecycle becomes canceled and ends at `at`, or at its own start
/// when `at` is earlier; a lifecycle that already ended keeps its own state
/// and end time.
pub fn close_if_open(lifecycle: Lifecycle, at: DateTime<Utc>) -> Lifecycle {
    if lifecycle.is_open() {
        let end_time = lifecycle.start_time.map_or(at, |start| start.max(at));
        Lifecycle {
            state: RecordState::Canceled,
            end_time: Some(end_time),
            ..lifecycle
        }
    } else {
        lifecycle
    }
}
