//! Fallback queue: durable FIFO side channel for events that failed to reach
//! the broker.
//!
//! Producers push wrapped entries; the retry sweeper pops them and re-enqueues.
//! Older producers pushed bare events, so decoding accepts both shapes.

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis_queue;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use modelhooks_events::ChangeEvent;

pub use in_memory::InMemoryFallbackQueue;
#[cfg(feature = "redis")]
pub use redis_queue::RedisFallbackQueue;

/// Reason recorded for entries decoded from bare legacy payloads.
pub const LEGACY_REASON: &str = "legacy";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackEntry {
    pub event: ChangeEvent,
    #[serde(default)]
    pub reason: String,
    #[serde(default = "Utc::now")]
    pub queued_at: DateTime<Utc>,
    #[serde(default)]
    pub enqueue_attempts: u32,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Payload {
    Wrapped(FallbackEntry),
    Bare(ChangeEvent),
}

impl FallbackEntry {
    pub fn new(event: ChangeEvent, reason: impl Into<String>) -> Self {
        let enqueue_attempts = event.enqueue_attempts;
        Self {
            event,
            reason: reason.into(),
            queued_at: Utc::now(),
            enqueue_attempts,
        }
    }

    /// Count one more delivery attempt, on the entry and on the event.
    pub fn bump_attempts(&mut self) -> u32 {
        self.enqueue_attempts += 1;
        self.event.enqueue_attempts = self.enqueue_attempts;
        self.enqueue_attempts
    }

    pub fn encode(&self) -> Result<String, FallbackError> {
        serde_json::to_string(self).map_err(|e| FallbackError::Serialization(e.to_string()))
    }

    /// Decode a stored payload, wrapped or bare.
    ///
    /// A bare event becomes an entry with no prior delivery attempts.
    pub fn decode(raw: &str) -> Result<Self, FallbackError> {
        let payload: Payload =
            serde_json::from_str(raw).map_err(|e| FallbackError::Decode(e.to_string()))?;
        Ok(match payload {
            Payload::Wrapped(entry) => entry,
            Payload::Bare(mut event) => {
                event.enqueue_attempts = 0;
                Self {
                    event,
                    reason: LEGACY_REASON.to_string(),
                    queued_at: Utc::now(),
                    enqueue_attempts: 0,
                }
            }
        })
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum FallbackError {
    #[error("fallback queue unavailable: {0}")]
    Unavailable(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    /// The popped payload was not a fallback entry; it has been consumed.
    #[error("undecodable fallback payload: {0}")]
    Decode(String),
}

#[async_trait]
pub trait FallbackQueue: Send + Sync {
    /// Append to the tail.
    async fn push(&self, entry: FallbackEntry) -> Result<(), FallbackError>;

    /// Remove and return the head without waiting.
    async fn pop_nowait(&self) -> Result<Option<FallbackEntry>, FallbackError>;

    async fn len(&self) -> Result<usize, FallbackError>;
}

#[async_trait]
impl<Q> FallbackQueue for Arc<Q>
where
    Q: FallbackQueue + ?Sized,
{
    async fn push(&self, entry: FallbackEntry) -> Result<(), FallbackError> {
        (**self).push(entry).await
    }

    async fn pop_nowait(&self) -> Result<Option<FallbackEntry>, FallbackError> {
        (**self).pop_nowait().await
    }

    async fn len(&self) -> Result<usize, FallbackError> {
        (**self).len().await
    }
}
