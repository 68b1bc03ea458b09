use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{IdempotencyStore, StoreError};

#[derive(Debug)]
struct Slot {
    value: String,
    expires: Instant,
}

impl Slot {
    fn new(value: &str, ttl: Duration) -> Self {
        Self {
            value: value.to_string(),
            expires: Instant::now() + ttl,
        }
    }
}

/// In-memory idempotency store for tests/dev.
///
/// Keys expire lazily on access. `set_available(false)` makes every
/// operation fail with [`StoreError::Unavailable`].
#[derive(Debug)]
pub struct InMemoryIdempotencyStore {
    keys: Mutex<HashMap<String, Slot>>,
    available: AtomicBool,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Live (non-expired) keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let now = Instant::now();
        let Ok(keys) = self.keys.lock() else {
            return vec![];
        };
        let mut live: Vec<String> = keys
            .iter()
            .filter(|(_, slot)| slot.expires > now)
            .map(|(k, _)| k.clone())
            .collect();
        live.sort();
        live
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Slot>>, StoreError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store is offline".to_string()));
        }
        let mut keys = self
            .keys
            .lock()
            .map_err(|_| StoreError::Unavailable("store lock poisoned".to_string()))?;
        let now = Instant::now();
        keys.retain(|_, slot| slot.expires > now);
        Ok(keys)
    }
}

impl Default for InMemoryIdempotencyStore {
    fn default() -> Self {
        Self {
            keys: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut keys = self.guard()?;
        if keys.contains_key(key) {
            return Ok(false);
        }
        keys.insert(key.to_string(), Slot::new(value, ttl));
        Ok(true)
    }

    async fn set(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        self.guard()?.insert(key.to_string(), Slot::new("1", ttl));
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.guard()?.contains_key(key))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.guard()?.remove(key);
        Ok(())
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        let mut keys = self.guard()?;
        if keys.get(key).is_some_and(|slot| slot.value == value) {
            keys.remove(key);
            return Ok(true);
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_if_absent_is_exclusive() {
        let store = InMemoryIdempotencyStore::new();
        let ttl = Duration::from_secs(60);

        assert!(store.set_if_absent("k", "a", ttl).await.unwrap());
        assert!(!store.set_if_absent("k", "b", ttl).await.unwrap());

        store.delete("k").await.unwrap();
        assert!(store.set_if_absent("k", "b", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn delete_if_equals_only_removes_own_value() {
        let store = InMemoryIdempotencyStore::new();
        store.set_if_absent("k", "owner", Duration::from_secs(60)).await.unwrap();

        assert!(!store.delete_if_equals("k", "intruder").await.unwrap());
        assert!(store.exists("k").await.unwrap());

        assert!(store.delete_if_equals("k", "owner").await.unwrap());
        assert!(!store.exists("k").await.unwrap());
        assert!(!store.delete_if_equals("k", "owner").await.unwrap());
    }

    #[tokio::test]
    async fn keys_expire() {
        let store = InMemoryIdempotencyStore::new();
        store.set("k", Duration::from_millis(10)).await.unwrap();
        assert!(store.exists("k").await.unwrap());

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!store.exists("k").await.unwrap());
        assert!(store.set_if_absent("k", "a", Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn offline_store_fails_every_operation() {
        let store = InMemoryIdempotencyStore::new();
        store.set_available(false);

        assert!(store.set_if_absent("k", "a", Duration::from_secs(1)).await.is_err());
        assert!(store.exists("k").await.is_err());
        assert!(store.delete("k").await.is_err());
        assert!(store.delete_if_equals("k", "a").await.is_err());
    }
}
