//! Core domain types shared by every part of the engine.
//!
//! - [`entity`]: the entity catalog and its dependency order
//! - [`record`]: legacy records, target records and lifecycles

pub mod entity;
pub mod record;

pub use entity::{
    validate_order, EntityDescriptor, EntityType, LifecycleRule, Reference, Requirement, CATALOG,
};
pub use record::{Cursor, LegacyRecord, Lifecycle, Payload, RecordState, TargetKey, TargetRecord};
