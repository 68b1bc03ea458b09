//! Handler registry: `(entity_type, field)` → ordered handler factories.
//!
//! The registry is assembled once by an explicit registration pass over all
//! handler modules (see [`HandlerRegistryBuilder::on_change`]) and is
//! immutable afterwards, so lookups need no locking. Registration order
//! within a key is execution order.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;

use modelhooks_core::Entity;

use crate::catalog::LoadedEntity;
use crate::handler::{ChangeHandler, FieldChange, HandlerError, handler_name};
use crate::ChangeEvent;

/// A registered handler type: builds a fresh handler per event and runs it.
#[async_trait]
pub trait HandlerFactory: Send + Sync {
    fn handler_name(&self) -> &'static str;

    async fn run(&self, entity: &LoadedEntity, event: &ChangeEvent) -> Result<(), HandlerError>;
}

struct TypedFactory<E, F> {
    name: &'static str,
    build: F,
    _entity: PhantomData<fn() -> E>,
}

#[async_trait]
impl<E, H, F> HandlerFactory for TypedFactory<E, F>
where
    E: Entity,
    H: ChangeHandler + 'static,
    F: Fn(FieldChange<E>) -> H + Send + Sync,
{
    fn handler_name(&self) -> &'static str {
        self.name
    }

    async fn run(&self, entity: &LoadedEntity, event: &ChangeEvent) -> Result<(), HandlerError> {
        let entity = entity
            .downcast_ref::<E>()
            .ok_or(HandlerError::EntityMismatch {
                expected: E::ENTITY_TYPE,
            })?
            .clone();

        let handler = (self.build)(FieldChange::from_event(entity, event));
        handler.run().await
    }
}

type FieldHandlers = HashMap<&'static str, Vec<Arc<dyn HandlerFactory>>>;

/// Immutable handler registry.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    entries: HashMap<&'static str, FieldHandlers>,
}

impl HandlerRegistry {
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::default()
    }

    /// Handlers for `(entity_type, field)` in registration order; empty if none.
    pub fn lookup(&self, entity_type: &str, field: &str) -> &[Arc<dyn HandlerFactory>] {
        self.entries
            .get(entity_type)
            .and_then(|fields| fields.get(field))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn has_handlers(&self, entity_type: &str, field: &str) -> bool {
        !self.lookup(entity_type, field).is_empty()
    }

    /// Total number of registrations.
    pub fn len(&self) -> usize {
        self.entries
            .values()
            .flat_map(|fields| fields.values())
            .map(Vec::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl core::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut keys: Vec<(&str, &str, Vec<&str>)> = self
            .entries
            .iter()
            .flat_map(|(entity_type, fields)| {
                fields.iter().map(move |(field, handlers)| {
                    (*entity_type, *field, handlers.iter().map(|h| h.handler_name()).collect())
                })
            })
            .collect();
        keys.sort();
        f.debug_struct("HandlerRegistry").field("entries", &keys).finish()
    }
}

#[derive(Default)]
pub struct HandlerRegistryBuilder {
    entries: HashMap<&'static str, FieldHandlers>,
}

impl HandlerRegistryBuilder {
    /// Register a handler for changes of `field` on entity type `E`.
    ///
    /// `factory` builds one handler per event; it typically captures shared
    /// dependencies (repositories, clients) the handler needs.
    pub fn on_change<E, H, F>(&mut self, field: &'static str, factory: F) -> &mut Self
    where
        E: Entity,
        H: ChangeHandler + 'static,
        F: Fn(FieldChange<E>) -> H + Send + Sync + 'static,
    {
        let entry = TypedFactory::<E, F> {
            name: handler_name::<H>(),
            build: factory,
            _entity: PhantomData,
        };
        self.entries
            .entry(E::ENTITY_TYPE)
            .or_default()
            .entry(field)
            .or_default()
            .push(Arc::new(entry));
        self
    }

    pub fn build(&mut self) -> HandlerRegistry {
        HandlerRegistry {
            entries: std::mem::take(&mut self.entries),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("handler registry already installed")]
pub struct AlreadyInstalled;

static GLOBAL: OnceLock<Arc<HandlerRegistry>> = OnceLock::new();

/// Install the process-wide registry. May be called once.
pub fn install(registry: HandlerRegistry) -> Result<Arc<HandlerRegistry>, AlreadyInstalled> {
    let registry = Arc::new(registry);
    GLOBAL
        .set(registry.clone())
        .map_err(|_| AlreadyInstalled)?;
    Ok(registry)
}

/// The process-wide registry, if installed.
pub fn global() -> Option<Arc<HandlerRegistry>> {
    GLOBAL.get().cloned()
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde::{Deserialize, Serialize};
    use serde_json::json;

    use modelhooks_core::EntityId;

    use super::*;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Widget {
        id: EntityId,
        updated: Option<i64>,
    }

    impl Entity for Widget {
        const ENTITY_TYPE: &'static str = "widgets";

        fn id(&self) -> EntityId {
            self.id
        }

        fn updated(&self) -> Option<i64> {
            self.updated
        }

        fn touch(&mut self, at: i64) {
            self.updated = Some(at);
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Gadget {
        id: EntityId,
    }

    impl Entity for Gadget {
        const ENTITY_TYPE: &'static str = "gadgets";

        fn id(&self) -> EntityId {
            self.id
        }

        fn updated(&self) -> Option<i64> {
            None
        }

        fn touch(&mut self, _at: i64) {}
    }

    struct Recorder {
        tag: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl ChangeHandler for Recorder {
        async fn validate(&self) -> bool {
            true
        }

        async fn execute(&self) -> Result<(), HandlerError> {
            self.log.lock().unwrap().push(self.tag);
            Ok(())
        }
    }

    fn recorder<E: 'static>(
        tag: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
    ) -> impl Fn(FieldChange<E>) -> Recorder + Send + Sync + 'static {
        move |_change| Recorder { tag, log: log.clone() }
    }

    #[test]
    fn lookup_is_scoped_to_entity_and_field() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = HandlerRegistry::builder()
            .on_change::<Widget, _, _>("color", recorder("a", log.clone()))
            .build();

        assert!(registry.has_handlers("widgets", "color"));
        assert!(!registry.has_handlers("widgets", "size"));
        assert!(!registry.has_handlers("gadgets", "color"));
        assert!(registry.lookup("unknown", "color").is_empty());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn handlers_run_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = HandlerRegistry::builder()
            .on_change::<Widget, _, _>("color", recorder("first", log.clone()))
            .on_change::<Widget, _, _>("color", recorder("second", log.clone()))
            .build();

        let entity: LoadedEntity = Arc::new(Widget { id: EntityId::new(1), updated: Some(5) });
        let event = ChangeEvent::new("widgets", EntityId::new(1), Some(5), "color", json!("red"), json!("blue"));

        for factory in registry.lookup("widgets", "color") {
            factory.run(&entity, &event).await.unwrap();
        }

        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn mismatched_entity_is_rejected() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = HandlerRegistry::builder()
            .on_change::<Widget, _, _>("color", recorder("a", log.clone()))
            .build();

        let wrong: LoadedEntity = Arc::new(Gadget { id: EntityId::new(1) });
        let event = ChangeEvent::new("widgets", EntityId::new(1), None, "color", json!(1), json!(2));

        let err = registry.lookup("widgets", "color")[0].run(&wrong, &event).await.unwrap_err();
        assert!(matches!(err, HandlerError::EntityMismatch { expected: "widgets" }));
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn global_registry_installs_once() {
        let registry = install(HandlerRegistry::default()).unwrap();
        assert!(registry.is_empty());
        assert!(global().is_some());
        assert!(install(HandlerRegistry::default()).is_err());
    }

    #[test]
    fn handler_names_are_short() {
        assert_eq!(handler_name::<Recorder>(), "Recorder");
        assert_eq!(handler_name::<Vec<u8>>(), "Vec");

        let registry = HandlerRegistry::builder()
            .on_change::<Widget, _, _>("color", recorder("a", Arc::new(Mutex::new(Vec::new()))))
            .build();
        assert_eq!(registry.lookup("widgets", "color")[0].handler_name(), "Recorder");
    }
}
