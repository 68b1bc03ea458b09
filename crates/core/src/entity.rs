//! Entity contract: identity, collection name, and the persistence boundary.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::id::EntityId;

/// A persisted entity with a stable logical collection name.
///
/// `ENTITY_TYPE` is the name change events carry (e.g. `"users"`); workers use
/// it to find the loader for the entity, so it must be unique per process.
pub trait Entity: Clone + core::fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Logical collection name (e.g. `"users"`).
    const ENTITY_TYPE: &'static str;

    /// Returns the entity identifier.
    fn id(&self) -> EntityId;

    /// Timestamp (integer seconds) of the last save, if the entity was ever saved.
    fn updated(&self) -> Option<i64>;

    /// Stamp the entity with the time of the save in progress.
    fn touch(&mut self, at: i64);
}

/// Persistence error surfaced by a [`Repository`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum RepositoryError {
    #[error("entity not found: {entity_type}/{id}")]
    NotFound { entity_type: &'static str, id: EntityId },
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Load/save boundary for one entity type.
///
/// `save` is where field-level change detection hooks in: implementations
/// compute the diff against the stored state and notify the change pipeline
/// after persisting. Notification failures never fail the save.
#[async_trait]
pub trait Repository<E: Entity>: Send + Sync {
    async fn get(&self, id: EntityId) -> Result<Option<E>, RepositoryError>;

    async fn save(&self, entity: &mut E) -> Result<(), RepositoryError>;
}

#[async_trait]
impl<E, R> Repository<E> for Arc<R>
where
    E: Entity,
    R: Repository<E> + ?Sized,
{
    async fn get(&self, id: EntityId) -> Result<Option<E>, RepositoryError> {
        (**self).get(id).await
    }

    async fn save(&self, entity: &mut E) -> Result<(), RepositoryError> {
        (**self).save(entity).await
    }
}
