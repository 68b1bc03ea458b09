use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use modelhooks_core::{Entity, EntityId, FieldDiff, FieldValue};

/// Number of hex characters of the content hash appended to event ids.
const CHANGE_HASH_LEN: usize = 12;

/// One field's change on one entity as of one save.
///
/// Events are:
/// - **immutable facts** except for the two retry counters
/// - **deduplicated by `id`**: two events with the same id are the same
///   logical change and must produce the same idempotent effect
///
/// `entity_id` and `field` are optional on the wire so that malformed
/// payloads still deserialize and can be retired as poison events by the
/// dispatcher instead of failing forever at decode time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Deterministic idempotency key.
    #[serde(default)]
    pub id: String,
    /// Logical collection name of the owning entity.
    #[serde(alias = "model")]
    pub entity_type: String,
    #[serde(default)]
    pub entity_id: Option<EntityId>,
    /// Entity timestamp as of the save (integer seconds); keys only, never ordering.
    #[serde(default)]
    pub updated: Option<i64>,
    #[serde(default)]
    pub field: String,
    #[serde(default)]
    pub old: FieldValue,
    #[serde(default)]
    pub new: FieldValue,
    /// Execution-retry counter, bumped by the dispatcher job on handler failure.
    #[serde(default)]
    pub attempt: u32,
    /// Delivery-retry counter, bumped by the fallback sweeper.
    #[serde(default)]
    pub enqueue_attempts: u32,
}

impl ChangeEvent {
    pub fn new(
        entity_type: impl Into<String>,
        entity_id: EntityId,
        updated: Option<i64>,
        field: impl Into<String>,
        old: FieldValue,
        new: FieldValue,
    ) -> Self {
        let entity_type = entity_type.into();
        let field = field.into();
        let id = derive_event_id(&entity_type, entity_id, updated, &field, &old, &new);
        Self {
            id,
            entity_type,
            entity_id: Some(entity_id),
            updated,
            field,
            old,
            new,
            attempt: 0,
            enqueue_attempts: 0,
        }
    }

    /// Build the event for one detected field change of a just-saved entity.
    pub fn from_diff<E: Entity>(entity: &E, diff: &FieldDiff) -> Self {
        Self::new(
            E::ENTITY_TYPE,
            entity.id(),
            entity.updated(),
            diff.field.clone(),
            diff.old.clone(),
            diff.new.clone(),
        )
    }
}

/// Derive the idempotency key of a change.
///
/// Format: `{entity_type}:{entity_id}:{updated}:{field}:{hash}` where `hash`
/// is a short SHA-256 prefix over `(old, new)`. The hash separates two
/// different changes of the same field saved within the same second.
pub fn derive_event_id(
    entity_type: &str,
    entity_id: EntityId,
    updated: Option<i64>,
    field: &str,
    old: &FieldValue,
    new: &FieldValue,
) -> String {
    let updated = updated.map_or_else(|| "none".to_string(), |u| u.to_string());
    format!(
        "{entity_type}:{entity_id}:{updated}:{field}:{}",
        change_hash(old, new)
    )
}

fn change_hash(old: &FieldValue, new: &FieldValue) -> String {
    let mut hasher = Sha256::new();
    hasher.update(old.to_string().as_bytes());
    hasher.update([0x1f]);
    hasher.update(new.to_string().as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..CHANGE_HASH_LEN].to_string()
}
