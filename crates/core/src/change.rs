//! Field-level change detection.
//!
//! Entities are compared through their serialized form: every top-level field
//! of the JSON object is a "field" for the purposes of change events.

use serde_json::{Map, Value};

use crate::entity::Entity;

/// Value of a single entity field (arbitrary serializable value).
pub type FieldValue = Value;

/// Bookkeeping fields that never produce change events.
pub const IGNORED_FIELDS: &[&str] = &["updated"];

/// One changed field: `(old, new)` as of a single save.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDiff {
    pub field: String,
    pub old: FieldValue,
    pub new: FieldValue,
}

/// Diff two serialized entity states, field by field.
///
/// Non-object values are treated as empty objects. Fields missing on one side
/// compare as `null`. Output is ordered by field name.
pub fn diff_values(before: &Value, after: &Value) -> Vec<FieldDiff> {
    let empty = Map::new();
    let before = before.as_object().unwrap_or(&empty);
    let after = after.as_object().unwrap_or(&empty);

    let mut fields: Vec<&String> = before.keys().chain(after.keys()).collect();
    fields.sort();
    fields.dedup();

    fields
        .into_iter()
        .filter(|f| !IGNORED_FIELDS.contains(&f.as_str()))
        .filter_map(|f| {
            let old = before.get(f).cloned().unwrap_or(Value::Null);
            let new = after.get(f).cloned().unwrap_or(Value::Null);
            (old != new).then(|| FieldDiff {
                field: f.clone(),
                old,
                new,
            })
        })
        .collect()
}

/// Diff an entity against its previously stored state (`None` for a fresh insert).
pub fn diff_entities<E: Entity>(before: Option<&E>, after: &E) -> Result<Vec<FieldDiff>, serde_json::Error> {
    let before = match before {
        Some(b) => serde_json::to_value(b)?,
        None => Value::Null,
    };
    let after = serde_json::to_value(after)?;
    Ok(diff_values(&before, &after))
}
