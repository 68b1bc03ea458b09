//! Infrastructure layer: the delivery and execution side of the change-event
//! pipeline.
//!
//! - `enqueue`: producer-side, never-failing hand-off to the broker
//! - `fallback`: durable side queue for events the broker refused
//! - `idempotency`: execution locks and done markers
//! - `dispatcher`: worker-side, lock-guarded handler execution
//! - `jobs`: backoff rescheduling and the fallback sweeper
//! - `workers`: long-running consumer tasks
//! - `repository`: save-time change detection glue
//!
//! Redis adapters are compiled with the `redis` feature.

pub mod broker;
pub mod config;
pub mod dispatcher;
pub mod enqueue;
pub mod fallback;
pub mod idempotency;
pub mod jobs;
#[cfg(feature = "redis")]
pub mod redis_support;
pub mod repository;
pub mod workers;


pub use broker::{Broker, BrokerError, InMemoryBroker};
pub use config::{ConfigError, PipelineConfig};
pub use dispatcher::{DispatchError, DispatchOutcome, EventDispatcher};
pub use enqueue::{EnqueueOutcome, EventEnqueuer};
pub use fallback::{FallbackEntry, FallbackError, FallbackQueue, InMemoryFallbackQueue};
pub use idempotency::{IdempotencyStore, InMemoryIdempotencyStore, StoreError};
pub use jobs::{EventProcessor, ProcessError, ProcessOutcome, RetryPolicy, RetrySweeper, SweepReport};
pub use repository::{ChangeNotifier, InMemoryRepository};
pub use workers::{EventWorker, WorkerHandle, WorkerStats};
