use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;

use modelhooks_core::{Entity, EntityId, Repository, RepositoryError};

use super::ChangeNotifier;

/// In-memory repository for tests/dev.
///
/// `save` stamps `updated`, persists, and hands the field diff against the
/// previous state to the optional [`ChangeNotifier`].
#[derive(Debug)]
pub struct InMemoryRepository<E> {
    rows: RwLock<HashMap<EntityId, E>>,
    notifier: OnceLock<ChangeNotifier>,
    available: AtomicBool,
}

impl<E: Entity> InMemoryRepository<E> {
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(HashMap::new()),
            notifier: OnceLock::new(),
            available: AtomicBool::new(true),
        }
    }

    pub fn with_notifier(self, notifier: ChangeNotifier) -> Self {
        self.attach_notifier(notifier);
        self
    }

    /// Attach the notifier after construction, for handlers that need the
    /// repository before the registry exists. Returns `false` if one is
    /// already attached.
    pub fn attach_notifier(&self, notifier: ChangeNotifier) -> bool {
        self.notifier.set(notifier).is_ok()
    }

    /// Store `entity` as-is, bypassing timestamps and change detection.
    pub fn seed(&self, entity: E) {
        if let Ok(mut rows) = self.rows.write() {
            rows.insert(entity.id(), entity);
        }
    }

    pub fn remove(&self, id: EntityId) -> Option<E> {
        self.rows.write().ok()?.remove(&id)
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), RepositoryError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RepositoryError::Storage("in-memory repository is offline".to_string()))
        }
    }
}

impl<E: Entity> Default for InMemoryRepository<E> {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned() -> RepositoryError {
    RepositoryError::Storage("repository lock poisoned".to_string())
}

#[async_trait]
impl<E: Entity> Repository<E> for InMemoryRepository<E> {
    async fn get(&self, id: EntityId) -> Result<Option<E>, RepositoryError> {
        self.check_available()?;
        let rows = self.rows.read().map_err(|_| poisoned())?;
        Ok(rows.get(&id).cloned())
    }

    async fn save(&self, entity: &mut E) -> Result<(), RepositoryError> {
        self.check_available()?;
        entity.touch(Utc::now().timestamp());

        let before = {
            let mut rows = self.rows.write().map_err(|_| poisoned())?;
            rows.insert(entity.id(), entity.clone())
        };

        if let Some(notifier) = self.notifier.get() {
            notifier.notify(before.as_ref(), entity);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};

    use modelhooks_events::{
        ChangeHandler, FieldChange, HandlerError, HandlerRegistry, InMemoryBroker,
    };

    use super::*;
    use crate::enqueue::EventEnqueuer;
    use crate::fallback::InMemoryFallbackQueue;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Task {
        id: EntityId,
        title: String,
        done: bool,
        updated: Option<i64>,
    }

    impl Entity for Task {
        const ENTITY_TYPE: &'static str = "tasks";

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

    struct Noop;

    #[async_trait]
    impl ChangeHandler for Noop {
        async fn execute(&self) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    fn repo(broker: Arc<InMemoryBroker>) -> InMemoryRepository<Task> {
        let registry = HandlerRegistry::builder()
            .on_change::<Task, _, _>("done", |_: FieldChange<Task>| Noop)
            .build();
        let enqueuer = EventEnqueuer::new(broker, Arc::new(InMemoryFallbackQueue::new()));
        InMemoryRepository::new().with_notifier(ChangeNotifier::new(Arc::new(registry), Arc::new(enqueuer)))
    }

    fn task() -> Task {
        Task {
            id: EntityId::new(1),
            title: "write docs".to_string(),
            done: false,
            updated: None,
        }
    }

    /// Let spawned background sends run.
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn save_enqueues_only_handled_fields() {
        let broker = Arc::new(InMemoryBroker::new());
        let repo = repo(broker.clone());

        let mut t = task();
        repo.save(&mut t).await.unwrap();
        settle().await;
        // Insert: `done` went from absent to false.
        assert_eq!(broker.ready().len(), 1);

        t.title = "write more docs".to_string();
        repo.save(&mut t).await.unwrap();
        settle().await;
        assert_eq!(broker.ready().len(), 1);

        t.done = true;
        repo.save(&mut t).await.unwrap();
        settle().await;
        let events = broker.ready();
        assert_eq!(events.len(), 2);
        let last = &events[1];
        assert_eq!(last.field, "done");
        assert_eq!(last.old, serde_json::json!(false));
        assert_eq!(last.new, serde_json::json!(true));
        assert_eq!(last.updated, t.updated);
    }

    #[tokio::test]
    async fn save_stamps_updated_and_persists() {
        let repo = InMemoryRepository::<Task>::new();
        let mut t = task();
        repo.save(&mut t).await.unwrap();

        assert!(t.updated.is_some());
        let stored = repo.get(t.id).await.unwrap().unwrap();
        assert_eq!(stored.updated, t.updated);
    }

    #[tokio::test]
    async fn offline_repository_errors() {
        let repo = InMemoryRepository::<Task>::new();
        repo.set_available(false);
        assert!(matches!(
            repo.get(EntityId::new(1)).await,
            Err(RepositoryError::Storage(_))
        ));
    }
}
