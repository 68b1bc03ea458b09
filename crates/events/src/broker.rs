//! Work queue / broker abstraction (contract only).
//!
//! The broker is the primary delivery channel between the process that saves
//! entities and the worker processes that run handlers. Only its contract
//! matters here:
//!
//! - **enqueue**: deliver a job as soon as a worker is free
//! - **schedule_at**: deliver a job not before a given instant
//! - **claim_next**: consumer side, take the next ready job (if any)
//!
//! ## Delivery Guarantees
//!
//! The broker provides **at-least-once delivery**: jobs may be delivered more
//! than once (redelivery after crashes, the fallback sweeper racing a late
//! success). Consumers deduplicate by [`ChangeEvent::id`].

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::ChangeEvent;

#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    /// The broker could not be reached or refused the job.
    #[error("broker unavailable: {0}")]
    Unavailable(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("broker command failed: {0}")]
    Command(String),
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Enqueue a job for immediate delivery.
    async fn enqueue(&self, event: ChangeEvent) -> Result<(), BrokerError>;

    /// Enqueue a job for delivery at (or after) `at`.
    async fn schedule_at(&self, at: DateTime<Utc>, event: ChangeEvent) -> Result<(), BrokerError>;

    /// Claim the next job that is ready for execution.
    async fn claim_next(&self) -> Result<Option<ChangeEvent>, BrokerError>;
}

#[async_trait]
impl<B> Broker for Arc<B>
where
    B: Broker + ?Sized,
{
    async fn enqueue(&self, event: ChangeEvent) -> Result<(), BrokerError> {
        (**self).enqueue(event).await
    }

    async fn schedule_at(&self, at: DateTime<Utc>, event: ChangeEvent) -> Result<(), BrokerError> {
        (**self).schedule_at(at, event).await
    }

    async fn claim_next(&self) -> Result<Option<ChangeEvent>, BrokerError> {
        (**self).claim_next().await
    }
}
