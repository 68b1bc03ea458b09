//! Producer-side event enqueuer.
//!
//! `enqueue` is called from entity saves and never blocks them on the broker
//! and never fails them:
//!
//! - Inside a tokio runtime the event is handed to a bounded channel drained
//!   by a small pool of sender tasks (or spawned directly when the pool is
//!   full or absent) and the call returns immediately; `shutdown` waits for
//!   both kinds of background send
//! - Outside a runtime the send runs to completion on a throwaway
//!   current-thread runtime
//! - A failed broker send pushes the event to the fallback queue; a failed
//!   push is logged and the event is dropped

use std::sync::{Arc, Mutex};

use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

use modelhooks_events::{Broker, ChangeEvent};

use crate::config::EnqueueSettings;
use crate::fallback::{FallbackEntry, FallbackQueue};

/// What `enqueue` did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Handed to a background send; its result is only logged.
    Submitted,
    /// Delivered to the broker before returning.
    Sent,
    /// The broker refused it; stored in the fallback queue.
    Fallback,
    /// Neither the broker nor the fallback queue accepted it.
    Dropped,
}

struct Delivery {
    broker: Arc<dyn Broker>,
    fallback: Arc<dyn FallbackQueue>,
}

impl Delivery {
    async fn deliver(&self, event: ChangeEvent) -> EnqueueOutcome {
        let error = match self.broker.enqueue(event.clone()).await {
            Ok(()) => {
                debug!(event_id = %event.id, "event enqueued");
                return EnqueueOutcome::Sent;
            }
            Err(error) => error,
        };

        warn!(event_id = %event.id, %error, "broker enqueue failed; using fallback queue");
        let entry = FallbackEntry::new(event, error.to_string());
        let event_id = entry.event.id.clone();
        match self.fallback.push(entry).await {
            Ok(()) => EnqueueOutcome::Fallback,
            Err(push_error) => {
                error!(event_id, error = %push_error, "fallback queue push failed; event dropped");
                EnqueueOutcome::Dropped
            }
        }
    }
}

struct SendPool {
    tx: mpsc::Sender<ChangeEvent>,
    senders: Vec<JoinHandle<()>>,
}

pub struct EventEnqueuer {
    delivery: Arc<Delivery>,
    pool: Mutex<Option<SendPool>>,
    /// Sends spawned outside the pool.
    overflow: TaskTracker,
}

impl EventEnqueuer {
    /// Enqueuer without a send pool: every asynchronous send is its own task.
    pub fn new(broker: Arc<dyn Broker>, fallback: Arc<dyn FallbackQueue>) -> Self {
        Self {
            delivery: Arc::new(Delivery { broker, fallback }),
            pool: Mutex::new(None),
            overflow: TaskTracker::new(),
        }
    }

    /// Enqueuer with a pool of `settings.senders` tasks behind a bounded
    /// channel. Must be called inside a tokio runtime to get the pool;
    /// otherwise behaves like [`EventEnqueuer::new`].
    pub fn with_pool(
        broker: Arc<dyn Broker>,
        fallback: Arc<dyn FallbackQueue>,
        settings: &EnqueueSettings,
    ) -> Self {
        let enqueuer = Self::new(broker, fallback);
        let Ok(handle) = Handle::try_current() else {
            debug!("no runtime; enqueuer starts without a send pool");
            return enqueuer;
        };

        let (tx, rx) = mpsc::channel::<ChangeEvent>(settings.channel_capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let senders = (0..settings.senders.max(1))
            .map(|_| {
                let rx = rx.clone();
                let delivery = enqueuer.delivery.clone();
                handle.spawn(async move {
                    loop {
                        let next = rx.lock().await.recv().await;
                        match next {
                            Some(event) => {
                                delivery.deliver(event).await;
                            }
                            None => break,
                        }
                    }
                })
            })
            .collect();

        if let Ok(mut pool) = enqueuer.pool.lock() {
            *pool = Some(SendPool { tx, senders });
        }
        enqueuer
    }

    /// Hand `event` to the broker without blocking or failing the caller.
    pub fn enqueue(&self, event: ChangeEvent) -> EnqueueOutcome {
        let Ok(handle) = Handle::try_current() else {
            return self.enqueue_blocking(event);
        };

        let Err(event) = self.try_submit(event) else {
            return EnqueueOutcome::Submitted;
        };

        let delivery = self.delivery.clone();
        self.overflow.spawn_on(
            async move {
                delivery.deliver(event).await;
            },
            &handle,
        );
        EnqueueOutcome::Submitted
    }

    /// Hand the event to the send pool; gives it back if the pool is absent,
    /// closed or full.
    fn try_submit(&self, event: ChangeEvent) -> Result<(), ChangeEvent> {
        let Ok(guard) = self.pool.lock() else {
            return Err(event);
        };
        let Some(pool) = guard.as_ref() else {
            return Err(event);
        };
        match pool.tx.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(event)) => {
                debug!(event_id = %event.id, "send pool saturated; spawning send");
                Err(event)
            }
            Err(TrySendError::Closed(event)) => Err(event),
        }
    }

    fn enqueue_blocking(&self, event: ChangeEvent) -> EnqueueOutcome {
        match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(runtime) => runtime.block_on(self.delivery.deliver(event)),
            Err(error) => {
                error!(event_id = %event.id, %error, "could not start a runtime to enqueue; event dropped");
                EnqueueOutcome::Dropped
            }
        }
    }

    /// Stop accepting pooled sends and wait for every background send,
    /// pooled or spawned, to finish.
    pub async fn shutdown(&self) {
        let pool = self.pool.lock().ok().and_then(|mut p| p.take());
        if let Some(SendPool { tx, senders }) = pool {
            drop(tx);
            for sender in senders {
                if let Err(e) = sender.await {
                    error!(error = ?e, "enqueue sender panicked");
                }
            }
        }

        self.overflow.close();
        self.overflow.wait().await;
    }
}

impl core::fmt::Debug for EventEnqueuer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let pooled = self.pool.lock().map(|p| p.is_some()).unwrap_or(false);
        f.debug_struct("EventEnqueuer")
            .field("pooled", &pooled)
            .field("overflow_sends", &self.overflow.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use modelhooks_core::EntityId;
    use modelhooks_events::InMemoryBroker;

    use super::*;
    use crate::fallback::InMemoryFallbackQueue;

    fn event(n: i64) -> ChangeEvent {
        ChangeEvent::new("users", EntityId::new(n), Some(1), "referrer", json!(null), json!(n))
    }

    fn parts() -> (Arc<InMemoryBroker>, Arc<InMemoryFallbackQueue>) {
        (Arc::new(InMemoryBroker::new()), Arc::new(InMemoryFallbackQueue::new()))
    }

    #[test]
    fn without_runtime_sends_synchronously() {
        let (broker, fallback) = parts();
        let enqueuer = EventEnqueuer::new(broker.clone(), fallback.clone());

        assert_eq!(enqueuer.enqueue(event(1)), EnqueueOutcome::Sent);
        assert_eq!(broker.ready().len(), 1);
    }

    #[test]
    fn broker_failure_goes_to_fallback() {
        let (broker, fallback) = parts();
        broker.set_available(false);
        let enqueuer = EventEnqueuer::new(broker.clone(), fallback.clone());

        assert_eq!(enqueuer.enqueue(event(1)), EnqueueOutcome::Fallback);
        let entries = fallback.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].event, event(1));
        assert!(entries[0].reason.contains("offline"));
    }

    #[test]
    fn double_failure_is_dropped_not_raised() {
        let (broker, fallback) = parts();
        broker.set_available(false);
        fallback.set_available(false);
        let enqueuer = EventEnqueuer::new(broker, fallback);

        assert_eq!(enqueuer.enqueue(event(1)), EnqueueOutcome::Dropped);
    }

    #[tokio::test]
    async fn inside_runtime_returns_immediately_and_pool_delivers() {
        let (broker, fallback) = parts();
        let settings = EnqueueSettings { senders: 2, channel_capacity: 1 };
        let enqueuer = EventEnqueuer::with_pool(broker.clone(), fallback.clone(), &settings);

        for n in 0..5 {
            assert_eq!(enqueuer.enqueue(event(n)), EnqueueOutcome::Submitted);
        }
        enqueuer.shutdown().await;

        assert_eq!(broker.ready().len(), 5);
    }

    #[tokio::test]
    async fn shutdown_waits_for_overflow_sends() {
        let (broker, fallback) = parts();
        let settings = EnqueueSettings { senders: 1, channel_capacity: 1 };
        let enqueuer = EventEnqueuer::with_pool(broker.clone(), fallback.clone(), &settings);

        for n in 0..20 {
            assert_eq!(enqueuer.enqueue(event(n)), EnqueueOutcome::Submitted);
        }
        enqueuer.shutdown().await;

        assert_eq!(broker.ready().len() + fallback.entries().len(), 20);
    }

    #[tokio::test]
    async fn shutdown_without_pool_waits_for_spawned_sends() {
        let (broker, fallback) = parts();
        let enqueuer = EventEnqueuer::new(broker.clone(), fallback);

        for n in 0..10 {
            assert_eq!(enqueuer.enqueue(event(n)), EnqueueOutcome::Submitted);
        }
        enqueuer.shutdown().await;

        assert_eq!(broker.ready().len(), 10);
    }

    #[tokio::test]
    async fn background_failure_lands_in_fallback() {
        let (broker, fallback) = parts();
        broker.set_available(false);
        let enqueuer = EventEnqueuer::with_pool(broker, fallback.clone(), &EnqueueSettings::default());

        assert_eq!(enqueuer.enqueue(event(1)), EnqueueOutcome::Submitted);
        enqueuer.shutdown().await;

        assert_eq!(fallback.len().await.unwrap(), 1);
    }
}
