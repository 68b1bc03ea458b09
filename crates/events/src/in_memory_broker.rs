//! In-memory broker for tests/dev.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::ChangeEvent;
use crate::broker::{Broker, BrokerError};

#[derive(Debug, Default)]
struct State {
    ready: VecDeque<ChangeEvent>,
    scheduled: Vec<(DateTime<Utc>, ChangeEvent)>,
}

/// In-memory broker.
///
/// - FIFO for immediate jobs
/// - Scheduled jobs become ready once their time has passed
/// - `set_available(false)` makes producer calls fail, to exercise the
///   fallback and backoff paths
#[derive(Debug)]
pub struct InMemoryBroker {
    state: Mutex<State>,
    available: AtomicBool,
    accepted: AtomicU64,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle producer-side availability (`enqueue` / `schedule_at`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Jobs ready for immediate delivery, oldest first.
    pub fn ready(&self) -> Vec<ChangeEvent> {
        self.state
            .lock()
            .map(|s| s.ready.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Jobs waiting for their scheduled time.
    pub fn scheduled(&self) -> Vec<(DateTime<Utc>, ChangeEvent)> {
        self.state
            .lock()
            .map(|s| s.scheduled.clone())
            .unwrap_or_default()
    }

    /// Make every scheduled job ready regardless of its time.
    pub fn release_scheduled(&self) -> usize {
        let Ok(mut state) = self.state.lock() else {
            return 0;
        };
        let mut due: Vec<_> = state.scheduled.drain(..).collect();
        due.sort_by_key(|(at, _)| *at);
        let count = due.len();
        state.ready.extend(due.into_iter().map(|(_, e)| e));
        count
    }

    /// Total number of jobs accepted by `enqueue` and `schedule_at`.
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), BrokerError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::Unavailable("in-memory broker is offline".to_string()))
        }
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self {
            state: Mutex::new(State::default()),
            available: AtomicBool::new(true),
            accepted: AtomicU64::new(0),
        }
    }
}

fn poisoned() -> BrokerError {
    BrokerError::Unavailable("broker state lock poisoned".to_string())
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn enqueue(&self, event: ChangeEvent) -> Result<(), BrokerError> {
        self.check_available()?;
        self.state.lock().map_err(|_| poisoned())?.ready.push_back(event);
        self.accepted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn schedule_at(&self, at: DateTime<Utc>, event: ChangeEvent) -> Result<(), BrokerError> {
        self.check_available()?;
        self.state
            .lock()
            .map_err(|_| poisoned())?
            .scheduled
            .push((at, event));
        self.accepted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn claim_next(&self) -> Result<Option<ChangeEvent>, BrokerError> {
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        let now = Utc::now();

        // Promote due scheduled jobs in time order.
        let mut due = Vec::new();
        state.scheduled.retain(|(at, e)| {
            if *at <= now {
                due.push((*at, e.clone()));
                false
            } else {
                true
            }
        });
        due.sort_by_key(|(at, _)| *at);
        state.ready.extend(due.into_iter().map(|(_, e)| e));

        Ok(state.ready.pop_front())
    }
}
