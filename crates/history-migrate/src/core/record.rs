//! Legacy and target record types.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::entity::EntityType;
use crate::error::{MigrateError, Result};

/// Entity-specific fields carried alongside the engine-level attributes.
pub type Payload = serde_json::Map<String, Value>;

/// Opaque key assigned by the target store on insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetKey(pub i64);

impl fmt::Display for TargetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Keyset position in a legacy scan: creation time, ties broken by id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Cursor {
    pub create_time: DateTime<Utc>,
    pub legacy_id: String,
}

/// One row of the legacy store, as read by a [`LegacySource`](crate::source::LegacySource).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyRecord {
    pub entity_type: EntityType,
    pub legacy_id: String,
    pub create_time: DateTime<Utc>,

    /// Foreign legacy ids keyed by reference role.
    #[serde(default)]
    pub references: BTreeMap<String, String>,

    #[serde(default)]
    pub payload: Payload,
}

impl LegacyRecord {
    pub fn new(
        entity_type: EntityType,
        legacy_id: impl Into<String>,
        create_time: DateTime<Utc>,
    ) -> Self {
        Self {
            entity_type,
            legacy_id: legacy_id.into(),
            create_time,
            references: BTreeMap::new(),
            payload: Payload::new(),
        }
    }

    pub fn with_reference(mut self, role: impl Into<String>, legacy_id: impl Into<String>) -> Self {
        self.references.insert(role.into(), legacy_id.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// Scan position of this record.
    pub fn cursor(&self) -> Cursor {
        Cursor {
            create_time: self.create_time,
            legacy_id: self.legacy_id.clone(),
        }
    }

    /// String payload field, `None` if missing or null.
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    /// RFC 3339 timestamp payload field.
    pub fn time_field(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        match self.payload.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => DateTime::parse_from_rfc3339(s)
                .map(|t| Some(t.with_timezone(&Utc)))
                .map_err(|e| {
                    MigrateError::InvalidRecord(format!(
                        "field '{}' is not a timestamp: {}",
                        key, e
                    ))
                }),
            Some(other) => Err(MigrateError::InvalidRecord(format!(
                "field '{}' has unexpected value {}",
                key, other
            ))),
        }
    }
}

/// Lifecycle state of a target record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordState {
    Active,
    Completed,
    Canceled,
    Terminated,
}

impl RecordState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordState::Active => "active",
            RecordState::Completed => "completed",
            RecordState::Canceled => "canceled",
            RecordState::Terminated => "terminated",
        }
    }

    /// Map a legacy state name onto a target state.
    ///
    /// Suspended counts as active; both flavours of termination collapse.
    pub fn from_legacy(state: &str) -> Option<Self> {
        match state.to_ascii_uppercase().as_str() {
            "ACTIVE" | "SUSPENDED" | "CREATED" | "OPEN" => Some(RecordState::Active),
            "COMPLETED" | "RESOLVED" => Some(RecordState::Completed),
            "CANCELED" | "CANCELLED" | "DELETED" => Some(RecordState::Canceled),
            "EXTERNALLY_TERMINATED" | "INTERNALLY_TERMINATED" | "TERMINATED" => {
                Some(RecordState::Terminated)
            }
            _ => None,
        }
    }

    /// Parse the value produced by [`as_str`](Self::as_str).
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(RecordState::Active),
            "completed" => Ok(RecordState::Completed),
            "canceled" => Ok(RecordState::Canceled),
            "terminated" => Ok(RecordState::Terminated),
            _ => Err(MigrateError::State(format!("Invalid record state: {}", s))),
        }
    }
}

/// Start/end bookkeeping for records that run for a period of time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lifecycle {
    pub state: RecordState,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl Lifecycle {
    /// A record is open while its recorded state is active. An active
    /// record with a stray end time is still open.
    pub fn is_open(&self) -> bool {
        self.state == RecordState::Active
    }
}

/// Transformed representation written to the target store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetRecord {
    pub entity_type: EntityType,
    pub legacy_id: String,

    /// Resolved target keys keyed by reference role.
    #[serde(default)]
    pub references: BTreeMap<String, TargetKey>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lifecycle: Option<Lifecycle>,

    #[serde(default)]
    pub fields: Payload,
}

impl TargetRecord {
    pub fn new(entity_type: EntityType, legacy_id: impl Into<String>) -> Self {
        Self {
            entity_type,
            legacy_id: legacy_id.into(),
            references: BTreeMap::new(),
            lifecycle: None,
            fields: Payload::new(),
        }
    }
}
