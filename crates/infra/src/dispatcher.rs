//! Worker-side event dispatcher.
//!
//! Per event id: `NEW → LOCKED → {DONE | RELEASED-FOR-RETRY}`.
//!
//! - A done marker short-circuits the event, checked again once the lock is held
//! - The lock (`SET NX` with TTL) admits one in-flight execution per id and
//!   is released only by the dispatch that took it
//! - Poison events (unknown type, missing id/field, no handlers, entity gone)
//!   are marked done so they are never retried
//! - Handlers run sequentially in registration order; the first failure
//!   aborts the chain and is returned to the caller for backoff
//! - A panicking handler is caught and reported like a failure
//! - The lock is released on every path
//!
//! Store failures are tolerated: an unreadable done marker counts as absent
//! and a failed lock acquisition counts as acquired.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use modelhooks_core::RepositoryError;
use modelhooks_events::{ChangeEvent, EntityCatalog, HandlerError, HandlerRegistry};

use crate::config::EventSettings;
use crate::idempotency::{IdempotencyStore, done_key, lock_key};

/// How a dispatch ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A done marker existed; nothing ran.
    AlreadyDone,
    /// Another worker holds the lock; nothing ran.
    LockHeld,
    /// Unknown entity type or missing `entity_id`/`field`; marked done.
    Invalid,
    /// No handlers registered for `(entity_type, field)`; marked done.
    NoHandlers,
    /// The entity no longer exists; marked done.
    EntityMissing,
    /// Every handler ran; marked done.
    Completed { handlers: usize },
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("handler {handler} failed: {source}")]
    Handler {
        handler: &'static str,
        #[source]
        source: HandlerError,
    },
    #[error("failed to load {entity_type} entity: {source}")]
    Load {
        entity_type: String,
        #[source]
        source: RepositoryError,
    },
    #[error("handler chain panicked: {message}")]
    Panicked { message: String },
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

pub struct EventDispatcher<S> {
    registry: Arc<HandlerRegistry>,
    catalog: Arc<EntityCatalog>,
    store: S,
    lock_ttl: Duration,
    done_ttl: Duration,
}

impl<S: IdempotencyStore> EventDispatcher<S> {
    pub fn new(registry: Arc<HandlerRegistry>, catalog: Arc<EntityCatalog>, store: S) -> Self {
        let settings = EventSettings::default();
        Self {
            registry,
            catalog,
            store,
            lock_ttl: settings.lock_ttl,
            done_ttl: settings.done_ttl,
        }
    }

    pub fn with_settings(mut self, settings: &EventSettings) -> Self {
        self.lock_ttl = settings.lock_ttl;
        self.done_ttl = settings.done_ttl;
        self
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Run all handlers for `event` at most once in effect.
    pub async fn dispatch(&self, event: &ChangeEvent) -> Result<DispatchOutcome, DispatchError> {
        let event_id = event.id.as_str();

        if self.is_done(event_id).await {
            debug!(event_id, "event already processed");
            return Ok(DispatchOutcome::AlreadyDone);
        }
        let token = Uuid::now_v7().to_string();
        if !self.acquire_lock(event_id, &token).await {
            debug!(event_id, "event locked by another worker");
            return Ok(DispatchOutcome::LockHeld);
        }
        // The previous holder may have finished between the check and the lock.
        if self.is_done(event_id).await {
            debug!(event_id, "event processed while acquiring the lock");
            self.release_lock(event_id, &token).await;
            return Ok(DispatchOutcome::AlreadyDone);
        }

        let result = match AssertUnwindSafe(self.dispatch_locked(event)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(&*panic);
                error!(event_id, %message, "handler chain panicked");
                Err(DispatchError::Panicked { message })
            }
        };
        self.release_lock(event_id, &token).await;
        result
    }

    async fn dispatch_locked(&self, event: &ChangeEvent) -> Result<DispatchOutcome, DispatchError> {
        let event_id = event.id.as_str();
        let entity_type = event.entity_type.as_str();
        let field = event.field.as_str();

        let (loader, entity_id) = match (self.catalog.loader(entity_type), event.entity_id) {
            (Some(loader), Some(entity_id)) if !field.is_empty() => (loader, entity_id),
            _ => {
                warn!(
                    event_id,
                    entity_type,
                    entity_id = ?event.entity_id,
                    field,
                    "invalid event"
                );
                self.mark_done(event_id).await;
                return Ok(DispatchOutcome::Invalid);
            }
        };

        let handlers = self.registry.lookup(entity_type, field);
        if handlers.is_empty() {
            debug!(event_id, entity_type, field, "no handlers registered");
            self.mark_done(event_id).await;
            return Ok(DispatchOutcome::NoHandlers);
        }

        let entity = loader
            .load(entity_id)
            .await
            .map_err(|source| DispatchError::Load {
                entity_type: entity_type.to_string(),
                source,
            })?;
        let Some(entity) = entity else {
            info!(event_id, entity_type, %entity_id, "entity no longer exists");
            self.mark_done(event_id).await;
            return Ok(DispatchOutcome::EntityMissing);
        };

        for factory in handlers {
            factory
                .run(&entity, event)
                .await
                .map_err(|source| DispatchError::Handler {
                    handler: factory.handler_name(),
                    source,
                })?;
        }

        self.mark_done(event_id).await;
        Ok(DispatchOutcome::Completed {
            handlers: handlers.len(),
        })
    }

    async fn is_done(&self, event_id: &str) -> bool {
        if event_id.is_empty() {
            return false;
        }
        match self.store.exists(&done_key(event_id)).await {
            Ok(done) => done,
            Err(error) => {
                warn!(event_id, %error, "done marker check failed; treating as not done");
                false
            }
        }
    }

    async fn acquire_lock(&self, event_id: &str, token: &str) -> bool {
        if event_id.is_empty() {
            return true;
        }
        match self.store.set_if_absent(&lock_key(event_id), token, self.lock_ttl).await {
            Ok(acquired) => acquired,
            Err(error) => {
                warn!(event_id, %error, "lock acquisition failed; proceeding unlocked");
                true
            }
        }
    }

    async fn mark_done(&self, event_id: &str) {
        if event_id.is_empty() {
            return;
        }
        if let Err(error) = self.store.set(&done_key(event_id), self.done_ttl).await {
            warn!(event_id, %error, "failed to write done marker");
        }
    }

    async fn release_lock(&self, event_id: &str, token: &str) {
        if event_id.is_empty() {
            return;
        }
        match self.store.delete_if_equals(&lock_key(event_id), token).await {
            Ok(true) => {}
            Ok(false) => debug!(event_id, "lock expired or taken over before release"),
            Err(error) => warn!(event_id, %error, "failed to release lock"),
        }
    }
}

impl<S> core::fmt::Debug for EventDispatcher<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("registry", &self.registry)
            .field("catalog", &self.catalog)
            .field("lock_ttl", &self.lock_ttl)
            .field("done_ttl", &self.done_ttl)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    use modelhooks_core::{Entity, EntityId, Repository};
    use modelhooks_events::{ChangeHandler, FieldChange};

    use super::*;
    use crate::idempotency::{InMemoryIdempotencyStore, StoreError};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Note {
        id: EntityId,
        updated: Option<i64>,
    }

    impl Entity for Note {
        const ENTITY_TYPE: &'static str = "notes";

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

    struct Notes(Vec<Note>);

    #[async_trait]
    impl Repository<Note> for Notes {
        async fn get(&self, id: EntityId) -> Result<Option<Note>, RepositoryError> {
            Ok(self.0.iter().find(|n| n.id == id).cloned())
        }

        async fn save(&self, _entity: &mut Note) -> Result<(), RepositoryError> {
            Ok(())
        }
    }

    type Log = Arc<Mutex<Vec<String>>>;

    struct Step {
        tag: &'static str,
        fail: bool,
        log: Log,
        change: FieldChange<Note>,
    }

    #[async_trait]
    impl ChangeHandler for Step {
        async fn validate(&self) -> bool {
            true
        }

        async fn execute(&self) -> Result<(), HandlerError> {
            self.log
                .lock()
                .unwrap()
                .push(format!("{}:{}", self.tag, self.change.entity.id));
            if self.fail {
                Err(HandlerError::failed("boom"))
            } else {
                Ok(())
            }
        }
    }

    fn step(
        tag: &'static str,
        fail: bool,
        log: Log,
    ) -> impl Fn(FieldChange<Note>) -> Step + Send + Sync + 'static {
        move |change| Step {
            tag,
            fail,
            log: log.clone(),
            change,
        }
    }

    /// Sleeps before recording, so a second dispatch can overlap it.
    struct Sleepy {
        log: Log,
    }

    #[async_trait]
    impl ChangeHandler for Sleepy {
        async fn validate(&self) -> bool {
            true
        }

        async fn execute(&self) -> Result<(), HandlerError> {
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.log.lock().unwrap().push("sleepy".to_string());
            Ok(())
        }
    }

    struct Panics;

    #[async_trait]
    impl ChangeHandler for Panics {
        async fn validate(&self) -> bool {
            true
        }

        async fn execute(&self) -> Result<(), HandlerError> {
            panic!("handler blew up")
        }
    }

    /// Simulates the lock expiring mid-run and another worker taking it.
    struct LockThief {
        store: Arc<InMemoryIdempotencyStore>,
        lock: String,
    }

    #[async_trait]
    impl ChangeHandler for LockThief {
        async fn validate(&self) -> bool {
            true
        }

        async fn execute(&self) -> Result<(), HandlerError> {
            self.store.delete(&self.lock).await.unwrap();
            self.store
                .set_if_absent(&self.lock, "other-worker", Duration::from_secs(60))
                .await
                .unwrap();
            Ok(())
        }
    }

    /// In-memory store whose second lock attempt stalls before reaching the store.
    #[derive(Default)]
    struct StallingStore {
        inner: InMemoryIdempotencyStore,
        lock_attempts: AtomicUsize,
    }

    #[async_trait]
    impl IdempotencyStore for StallingStore {
        async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
            if self.lock_attempts.fetch_add(1, Ordering::SeqCst) == 1 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            self.inner.set_if_absent(key, value, ttl).await
        }

        async fn set(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
            self.inner.set(key, ttl).await
        }

        async fn exists(&self, key: &str) -> Result<bool, StoreError> {
            self.inner.exists(key).await
        }

        async fn delete(&self, key: &str) -> Result<(), StoreError> {
            self.inner.delete(key).await
        }

        async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool, StoreError> {
            self.inner.delete_if_equals(key, value).await
        }
    }

    fn notes_catalog() -> Arc<EntityCatalog> {
        Arc::new(
            EntityCatalog::builder()
                .register::<Note, _>(Notes(vec![Note { id: EntityId::new(1), updated: Some(10) }]))
                .build(),
        )
    }

    struct Fixture {
        dispatcher: EventDispatcher<Arc<InMemoryIdempotencyStore>>,
        store: Arc<InMemoryIdempotencyStore>,
        log: Log,
    }

    fn fixture(fail_second: bool) -> Fixture {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let registry = HandlerRegistry::builder()
            .on_change::<Note, _, _>("title", step("first", false, log.clone()))
            .on_change::<Note, _, _>("title", step("second", fail_second, log.clone()))
            .build();
        let store = Arc::new(InMemoryIdempotencyStore::new());

        Fixture {
            dispatcher: EventDispatcher::new(Arc::new(registry), notes_catalog(), store.clone()),
            store,
            log,
        }
    }

    fn event(entity_type: &str, id: i64, field: &str) -> ChangeEvent {
        ChangeEvent::new(entity_type, EntityId::new(id), Some(10), field, json!("a"), json!("b"))
    }

    #[tokio::test]
    async fn runs_handlers_in_order_and_marks_done() {
        let f = fixture(false);
        let e = event("notes", 1, "title");

        let outcome = f.dispatcher.dispatch(&e).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Completed { handlers: 2 });
        assert_eq!(*f.log.lock().unwrap(), vec!["first:1", "second:1"]);
        assert_eq!(f.store.keys(), vec![done_key(&e.id)]);

        let again = f.dispatcher.dispatch(&e).await.unwrap();
        assert_eq!(again, DispatchOutcome::AlreadyDone);
        assert_eq!(f.log.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn held_lock_skips_without_error() {
        let f = fixture(false);
        let e = event("notes", 1, "title");
        f.store
            .set_if_absent(&lock_key(&e.id), "other-worker", Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(f.dispatcher.dispatch(&e).await.unwrap(), DispatchOutcome::LockHeld);
        assert!(f.log.lock().unwrap().is_empty());
        // The other worker's lock is left alone.
        assert!(f.store.exists(&lock_key(&e.id)).await.unwrap());
    }

    #[tokio::test]
    async fn done_marker_is_rechecked_after_locking() {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let sleepy_log = log.clone();
        let registry = HandlerRegistry::builder()
            .on_change::<Note, _, _>("title", move |_: FieldChange<Note>| Sleepy {
                log: sleepy_log.clone(),
            })
            .build();
        let store = Arc::new(StallingStore::default());
        let dispatcher = EventDispatcher::new(Arc::new(registry), notes_catalog(), store.clone());
        let e = event("notes", 1, "title");

        // The second dispatch passes the done check, then stalls on the lock
        // until the first has finished and released it.
        let (a, b) = tokio::join!(dispatcher.dispatch(&e), dispatcher.dispatch(&e));

        let mut outcomes = vec![a.unwrap(), b.unwrap()];
        outcomes.sort_by_key(|o| matches!(o, DispatchOutcome::AlreadyDone));
        assert_eq!(
            outcomes,
            vec![DispatchOutcome::Completed { handlers: 1 }, DispatchOutcome::AlreadyDone]
        );
        assert_eq!(log.lock().unwrap().len(), 1);
        assert_eq!(store.inner.keys(), vec![done_key(&e.id)]);
    }

    #[tokio::test]
    async fn failure_releases_lock_without_done_marker() {
        let f = fixture(true);
        let e = event("notes", 1, "title");

        let err = f.dispatcher.dispatch(&e).await.unwrap_err();
        assert!(matches!(err, DispatchError::Handler { handler: "Step", .. }));
        assert_eq!(*f.log.lock().unwrap(), vec!["first:1", "second:1"]);
        assert!(f.store.keys().is_empty());
    }

    #[tokio::test]
    async fn panicking_handler_releases_lock() {
        let registry = HandlerRegistry::builder()
            .on_change::<Note, _, _>("title", |_: FieldChange<Note>| Panics)
            .build();
        let store = Arc::new(InMemoryIdempotencyStore::new());
        let dispatcher = EventDispatcher::new(Arc::new(registry), notes_catalog(), store.clone());
        let e = event("notes", 1, "title");

        let err = dispatcher.dispatch(&e).await.unwrap_err();
        match err {
            DispatchError::Panicked { message } => assert_eq!(message, "handler blew up"),
            other => panic!("unexpected error: {other}"),
        }
        assert!(store.keys().is_empty());
    }

    #[tokio::test]
    async fn release_leaves_a_foreign_lock_alone() {
        let e = event("notes", 1, "title");
        let store = Arc::new(InMemoryIdempotencyStore::new());
        let thief_store = store.clone();
        let lock = lock_key(&e.id);
        let registry = HandlerRegistry::builder()
            .on_change::<Note, _, _>("title", move |_: FieldChange<Note>| LockThief {
                store: thief_store.clone(),
                lock: lock.clone(),
            })
            .build();
        let dispatcher = EventDispatcher::new(Arc::new(registry), notes_catalog(), store.clone());

        assert_eq!(
            dispatcher.dispatch(&e).await.unwrap(),
            DispatchOutcome::Completed { handlers: 1 }
        );
        assert!(store.exists(&lock_key(&e.id)).await.unwrap());
        assert!(store.delete_if_equals(&lock_key(&e.id), "other-worker").await.unwrap());
    }

    #[tokio::test]
    async fn poison_events_are_marked_done() {
        let f = fixture(false);

        let unknown = event("unknown_model", 1, "title");
        assert_eq!(f.dispatcher.dispatch(&unknown).await.unwrap(), DispatchOutcome::Invalid);

        let mut no_field = event("notes", 1, "title");
        no_field.field.clear();
        no_field.id = "notes:1:10::x".to_string();
        assert_eq!(f.dispatcher.dispatch(&no_field).await.unwrap(), DispatchOutcome::Invalid);

        let unhandled = event("notes", 1, "body");
        assert_eq!(f.dispatcher.dispatch(&unhandled).await.unwrap(), DispatchOutcome::NoHandlers);

        let missing = event("notes", 99, "title");
        assert_eq!(f.dispatcher.dispatch(&missing).await.unwrap(), DispatchOutcome::EntityMissing);

        assert!(f.log.lock().unwrap().is_empty());
        for e in [&unknown, &no_field, &unhandled, &missing] {
            assert!(f.store.exists(&done_key(&e.id)).await.unwrap());
            assert!(!f.store.exists(&lock_key(&e.id)).await.unwrap());
        }
    }

    #[tokio::test]
    async fn empty_id_always_runs() {
        let f = fixture(false);
        let mut e = event("notes", 1, "title");
        e.id.clear();

        f.dispatcher.dispatch(&e).await.unwrap();
        f.dispatcher.dispatch(&e).await.unwrap();
        assert_eq!(f.log.lock().unwrap().len(), 4);
        assert!(f.store.keys().is_empty());
    }

    #[tokio::test]
    async fn store_outage_fails_open() {
        let f = fixture(false);
        f.store.set_available(false);

        let outcome = f.dispatcher.dispatch(&event("notes", 1, "title")).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Completed { handlers: 2 });
    }
}
