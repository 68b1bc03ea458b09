use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use super::{FallbackEntry, FallbackError, FallbackQueue};

/// In-memory fallback queue for tests/dev.
///
/// Entries are stored encoded, like the durable queue, so that legacy raw
/// payloads can be injected with [`InMemoryFallbackQueue::push_raw`].
#[derive(Debug)]
pub struct InMemoryFallbackQueue {
    items: Mutex<VecDeque<String>>,
    available: AtomicBool,
}

impl InMemoryFallbackQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Append an already-encoded payload.
    pub fn push_raw(&self, raw: impl Into<String>) {
        if let Ok(mut items) = self.items.lock() {
            items.push_back(raw.into());
        }
    }

    /// Decoded snapshot of the queue, head first. Undecodable payloads are skipped.
    pub fn entries(&self) -> Vec<FallbackEntry> {
        self.items
            .lock()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|raw| FallbackEntry::decode(raw).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn check_available(&self) -> Result<(), FallbackError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(FallbackError::Unavailable("in-memory fallback queue is offline".to_string()))
        }
    }
}

impl Default for InMemoryFallbackQueue {
    fn default() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            available: AtomicBool::new(true),
        }
    }
}

fn poisoned() -> FallbackError {
    FallbackError::Unavailable("fallback queue lock poisoned".to_string())
}

#[async_trait]
impl FallbackQueue for InMemoryFallbackQueue {
    async fn push(&self, entry: FallbackEntry) -> Result<(), FallbackError> {
        self.check_available()?;
        let raw = entry.encode()?;
        self.items.lock().map_err(|_| poisoned())?.push_back(raw);
        Ok(())
    }

    async fn pop_nowait(&self) -> Result<Option<FallbackEntry>, FallbackError> {
        self.check_available()?;
        let raw = self.items.lock().map_err(|_| poisoned())?.pop_front();
        raw.map(|raw| FallbackEntry::decode(&raw)).transpose()
    }

    async fn len(&self) -> Result<usize, FallbackError> {
        self.check_available()?;
        Ok(self.items.lock().map_err(|_| poisoned())?.len())
    }
}
