use std::sync::Arc;

use tracing::info;
#[cfg(not(feature = "redis"))]
use tracing::warn;

use modelhooks_events::{Broker, EntityCatalog, HandlerRegistry};
use modelhooks_infra::{
    ChangeNotifier, EventDispatcher, EventEnqueuer, EventProcessor, EventWorker, FallbackQueue,
    IdempotencyStore, InMemoryRepository, PipelineConfig, RetrySweeper, WorkerHandle,
};
use modelhooks_users::User;

/// Running pipeline: background tasks plus the producer-side handles.
pub struct Pipeline {
    users: Arc<InMemoryRepository<User>>,
    enqueuer: Arc<EventEnqueuer>,
    tasks: Vec<WorkerHandle>,
}

impl Pipeline {
    /// Repository whose saves feed the pipeline.
    pub fn users(&self) -> &Arc<InMemoryRepository<User>> {
        &self.users
    }

    /// Flush pending sends, then stop the background tasks.
    pub async fn shutdown(self) {
        self.enqueuer.shutdown().await;
        for task in self.tasks {
            let name = task.name();
            task.shutdown().await;
            info!(task = name, "stopped");
        }
    }
}

/// Build the handler registry and entity catalog from every entity module.
pub fn registries(users: Arc<InMemoryRepository<User>>) -> (HandlerRegistry, EntityCatalog) {
    let mut registry = HandlerRegistry::builder();
    let mut catalog = EntityCatalog::builder();
    modelhooks_users::register(&mut registry, &mut catalog, users);
    (registry.build(), catalog.build())
}

/// Connect the backends and spawn the worker and the sweeper.
#[cfg(feature = "redis")]
pub async fn start(
    config: &PipelineConfig,
    registry: Arc<HandlerRegistry>,
    catalog: EntityCatalog,
    users: Arc<InMemoryRepository<User>>,
) -> anyhow::Result<Pipeline> {
    use anyhow::Context;
    use modelhooks_infra::broker::RedisBroker;
    use modelhooks_infra::fallback::RedisFallbackQueue;
    use modelhooks_infra::idempotency::RedisIdempotencyStore;

    let conn = modelhooks_infra::redis_support::connect(&config.redis_url)
        .await
        .with_context(|| format!("failed to connect to redis at {}", config.redis_url))?;
    info!(redis_url = %config.redis_url, "connected to redis");

    let store = RedisIdempotencyStore::new(conn.clone());
    let broker = Arc::new(RedisBroker::new(
        conn.clone(),
        config.queue_key(),
        config.schedule_key(),
    ));
    let fallback = Arc::new(RedisFallbackQueue::new(conn, config.fallback_key()));

    Ok(spawn(config, registry, catalog, users, store, broker, fallback))
}

/// Spawn the worker and the sweeper over in-memory backends.
#[cfg(not(feature = "redis"))]
pub async fn start(
    config: &PipelineConfig,
    registry: Arc<HandlerRegistry>,
    catalog: EntityCatalog,
    users: Arc<InMemoryRepository<User>>,
) -> anyhow::Result<Pipeline> {
    use modelhooks_infra::{InMemoryBroker, InMemoryFallbackQueue, InMemoryIdempotencyStore};

    warn!("built without the redis feature; events live in process memory only");
    Ok(spawn(
        config,
        registry,
        catalog,
        users,
        InMemoryIdempotencyStore::new(),
        Arc::new(InMemoryBroker::new()),
        Arc::new(InMemoryFallbackQueue::new()),
    ))
}

fn spawn<S, B, Q>(
    config: &PipelineConfig,
    registry: Arc<HandlerRegistry>,
    catalog: EntityCatalog,
    users: Arc<InMemoryRepository<User>>,
    store: S,
    broker: Arc<B>,
    fallback: Arc<Q>,
) -> Pipeline
where
    S: IdempotencyStore + 'static,
    B: Broker + 'static,
    Q: FallbackQueue + 'static,
{
    let enqueuer = Arc::new(EventEnqueuer::with_pool(
        broker.clone(),
        fallback.clone(),
        &config.enqueue,
    ));
    users.attach_notifier(ChangeNotifier::new(registry.clone(), enqueuer.clone()));

    let dispatcher = EventDispatcher::new(registry, Arc::new(catalog), store).with_settings(&config.event);
    let processor = EventProcessor::new(Arc::new(dispatcher), broker.clone(), config.event.retry.clone());

    let worker = EventWorker::new(Arc::new(processor), config.worker.clone()).spawn();
    let sweeper = RetrySweeper::new(fallback, broker, config.fallback.clone()).spawn();

    Pipeline {
        users,
        enqueuer,
        tasks: vec![worker, sweeper],
    }
}
