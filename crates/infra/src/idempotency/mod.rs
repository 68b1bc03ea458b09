//! Idempotency store: short-lived execution locks and long-lived done markers.
//!
//! The store is the only synchronization point between workers. Lock
//! acquisition must be a single atomic "set if absent with TTL" round trip,
//! never a check followed by a write.

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis_store;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

pub use in_memory::InMemoryIdempotencyStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisIdempotencyStore;

const LOCK_PREFIX: &str = "event:lock:";
const DONE_PREFIX: &str = "event:done:";

/// Key of the execution lock for an event id.
pub fn lock_key(event_id: &str) -> String {
    format!("{LOCK_PREFIX}{event_id}")
}

/// Key of the done marker for an event id.
pub fn done_key(event_id: &str) -> String {
    format!("{DONE_PREFIX}{event_id}")
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("idempotency store unavailable: {0}")]
    Unavailable(String),
    #[error("idempotency store command failed: {0}")]
    Command(String),
}

/// Shared key-value store with per-key expiry.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Atomically create `key` holding `value` with `ttl` if it does not exist.
    ///
    /// Returns `true` if this call created the key.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Create or overwrite `key` with `ttl`.
    async fn set(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Atomically delete `key` only while it still holds `value`.
    ///
    /// Returns `true` if the key was deleted.
    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool, StoreError>;
}

#[async_trait]
impl<S> IdempotencyStore for Arc<S>
where
    S: IdempotencyStore + ?Sized,
{
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        (**self).set_if_absent(key, value, ttl).await
    }

    async fn set(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        (**self).set(key, ttl).await
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        (**self).exists(key).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        (**self).delete(key).await
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        (**self).delete_if_equals(key, value).await
    }
}
