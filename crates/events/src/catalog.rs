//! Entity catalog: `entity_type` → loader for the current entity state.
//!
//! Built once at startup by each entity module registering its repository;
//! read-only afterwards.

use std::any::Any;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;

use modelhooks_core::{Entity, EntityId, Repository, RepositoryError};

/// An entity loaded by the dispatcher, erased to be passed through the
/// registry. Handler adapters downcast it back to their concrete type.
pub type LoadedEntity = Arc<dyn Any + Send + Sync>;

/// Loads the current state of one entity type by id.
#[async_trait]
pub trait EntityLoader: Send + Sync {
    async fn load(&self, id: EntityId) -> Result<Option<LoadedEntity>, RepositoryError>;
}

struct RepositoryLoader<E, R> {
    repository: R,
    _entity: PhantomData<fn() -> E>,
}

#[async_trait]
impl<E, R> EntityLoader for RepositoryLoader<E, R>
where
    E: Entity,
    R: Repository<E>,
{
    async fn load(&self, id: EntityId) -> Result<Option<LoadedEntity>, RepositoryError> {
        let entity = self.repository.get(id).await?;
        Ok(entity.map(|e| Arc::new(e) as LoadedEntity))
    }
}

/// Static map of known entity types.
#[derive(Clone, Default)]
pub struct EntityCatalog {
    loaders: HashMap<&'static str, Arc<dyn EntityLoader>>,
}

impl EntityCatalog {
    pub fn builder() -> EntityCatalogBuilder {
        EntityCatalogBuilder::default()
    }

    pub fn loader(&self, entity_type: &str) -> Option<&Arc<dyn EntityLoader>> {
        self.loaders.get(entity_type)
    }

    pub fn contains(&self, entity_type: &str) -> bool {
        self.loaders.contains_key(entity_type)
    }

    pub fn entity_types(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.loaders.keys().copied()
    }
}

impl core::fmt::Debug for EntityCatalog {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EntityCatalog")
            .field("entity_types", &self.loaders.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[derive(Default)]
pub struct EntityCatalogBuilder {
    loaders: HashMap<&'static str, Arc<dyn EntityLoader>>,
}

impl EntityCatalogBuilder {
    /// Register the repository serving `E::ENTITY_TYPE`.
    ///
    /// Registering the same entity type twice replaces the earlier loader.
    pub fn register<E, R>(&mut self, repository: R) -> &mut Self
    where
        E: Entity,
        R: Repository<E> + 'static,
    {
        let loader = RepositoryLoader::<E, R> {
            repository,
            _entity: PhantomData,
        };
        self.loaders.insert(E::ENTITY_TYPE, Arc::new(loader));
        self
    }

    pub fn build(&mut self) -> EntityCatalog {
        EntityCatalog {
            loaders: std::mem::take(&mut self.loaders),
        }
    }
}
