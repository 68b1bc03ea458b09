//! Fallback retry sweeper.
//!
//! On a fixed interval, pops up to `batch_size` entries from the fallback
//! queue and re-enqueues each on the broker. Entries that still cannot be
//! delivered go back to the tail until `max_enqueue_retries` is spent, then
//! are logged as dropped.

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use modelhooks_events::Broker;

use crate::config::FallbackSettings;
use crate::fallback::{FallbackError, FallbackQueue};
use crate::workers::WorkerHandle;

/// Counters of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct SweepReport {
    pub delivered: usize,
    pub requeued: usize,
    /// Retry budget spent; logged and discarded.
    pub dropped: usize,
    /// Requeue push failed; logged and lost.
    pub lost: usize,
    /// Payloads that were not fallback entries.
    pub undecodable: usize,
}

impl SweepReport {
    pub fn processed(&self) -> usize {
        self.delivered + self.requeued + self.dropped + self.lost + self.undecodable
    }
}

pub struct RetrySweeper<Q, B> {
    fallback: Q,
    broker: B,
    settings: FallbackSettings,
}

impl<Q, B> RetrySweeper<Q, B>
where
    Q: FallbackQueue,
    B: Broker,
{
    pub fn new(fallback: Q, broker: B, settings: FallbackSettings) -> Self {
        Self {
            fallback,
            broker,
            settings,
        }
    }

    /// One sweep over at most `batch_size` entries.
    ///
    /// Stops early when the queue is empty or cannot be read. Entries requeued
    /// during the sweep wait for the next one.
    pub async fn sweep_once(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let limit = match self.fallback.len().await {
            Ok(len) => len.min(self.settings.batch_size),
            Err(_) => self.settings.batch_size,
        };

        for _ in 0..limit {
            let mut entry = match self.fallback.pop_nowait().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(FallbackError::Decode(reason)) => {
                    error!(%reason, "discarding undecodable fallback payload");
                    report.undecodable += 1;
                    continue;
                }
                Err(error) => {
                    warn!(%error, "fallback queue pop failed; ending sweep");
                    break;
                }
            };

            let enqueue_attempts = entry.bump_attempts();
            let event_id = entry.event.id.clone();

            let Err(error) = self.broker.enqueue(entry.event.clone()).await else {
                debug!(event_id, enqueue_attempts, "fallback event delivered");
                report.delivered += 1;
                continue;
            };

            if enqueue_attempts > self.settings.max_enqueue_retries {
                error!(
                    event = ?entry.event,
                    enqueue_attempts,
                    %error,
                    "model event enqueue retries exhausted"
                );
                report.dropped += 1;
                continue;
            }

            match self.fallback.push(entry).await {
                Ok(()) => {
                    warn!(event_id, enqueue_attempts, %error, "fallback event requeued");
                    report.requeued += 1;
                }
                Err(push_error) => {
                    error!(event_id, enqueue_attempts, error = %push_error, "fallback queue requeue failed");
                    report.lost += 1;
                }
            }
        }

        if report.processed() > 0 {
            info!(
                delivered = report.delivered,
                requeued = report.requeued,
                dropped = report.dropped,
                lost = report.lost,
                undecodable = report.undecodable,
                "fallback sweep finished"
            );
        }
        report
    }
}

impl<Q, B> RetrySweeper<Q, B>
where
    Q: FallbackQueue + 'static,
    B: Broker + 'static,
{
    /// Run `sweep_once` every `sweep_interval` until shut down.
    pub fn spawn(self) -> WorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let period = self.settings.sweep_interval.max(std::time::Duration::from_millis(1));

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_secs = period.as_secs(), "fallback sweeper started");

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => {
                        self.sweep_once().await;
                    }
                }
            }

            info!("fallback sweeper stopped");
        });

        WorkerHandle::new("fallback-sweeper", shutdown_tx, join)
    }
}

impl<Q, B> core::fmt::Debug for RetrySweeper<Q, B> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RetrySweeper")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;

    use modelhooks_core::EntityId;
    use modelhooks_events::{ChangeEvent, InMemoryBroker};

    use super::*;
    use crate::fallback::{FallbackEntry, InMemoryFallbackQueue};

    fn settings(batch_size: usize) -> FallbackSettings {
        FallbackSettings {
            batch_size,
            max_enqueue_retries: 2,
            sweep_interval: Duration::from_millis(10),
        }
    }

    fn entry(n: i64) -> FallbackEntry {
        let event = ChangeEvent::new("users", EntityId::new(n), Some(1), "referrer", json!(null), json!(n));
        FallbackEntry::new(event, "broker down")
    }

    struct Fixture {
        queue: Arc<InMemoryFallbackQueue>,
        broker: Arc<InMemoryBroker>,
        sweeper: RetrySweeper<Arc<InMemoryFallbackQueue>, Arc<InMemoryBroker>>,
    }

    fn fixture(batch_size: usize) -> Fixture {
        let queue = Arc::new(InMemoryFallbackQueue::new());
        let broker = Arc::new(InMemoryBroker::new());
        let sweeper = RetrySweeper::new(queue.clone(), broker.clone(), settings(batch_size));
        Fixture { queue, broker, sweeper }
    }

    #[tokio::test]
    async fn delivers_and_drains() {
        let f = fixture(10);
        f.queue.push(entry(1)).await.unwrap();
        f.queue.push(entry(2)).await.unwrap();

        let report = f.sweeper.sweep_once().await;
        assert_eq!(report.delivered, 2);
        assert_eq!(f.queue.len().await.unwrap(), 0);

        let delivered = f.broker.ready();
        assert_eq!(delivered.len(), 2);
        assert_eq!(delivered[0].enqueue_attempts, 1);
    }

    #[tokio::test]
    async fn batch_size_bounds_one_sweep() {
        let f = fixture(2);
        for n in 0..5 {
            f.queue.push(entry(n)).await.unwrap();
        }

        assert_eq!(f.sweeper.sweep_once().await.delivered, 2);
        assert_eq!(f.queue.len().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn requeues_until_budget_then_drops() {
        let f = fixture(10);
        f.broker.set_available(false);
        f.queue.push(entry(1)).await.unwrap();

        assert_eq!(f.sweeper.sweep_once().await.requeued, 1);
        assert_eq!(f.sweeper.sweep_once().await.requeued, 1);
        assert_eq!(f.queue.entries()[0].enqueue_attempts, 2);

        let report = f.sweeper.sweep_once().await;
        assert_eq!(report.dropped, 1);
        assert_eq!(f.queue.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn legacy_and_garbage_payloads() {
        let f = fixture(10);
        f.queue.push_raw("{{{");
        f.queue.push_raw(
            json!({"id": "users:3:1:referrer", "model": "users", "entity_id": 3, "field": "referrer"})
                .to_string(),
        );

        let report = f.sweeper.sweep_once().await;
        assert_eq!(report.undecodable, 1);
        assert_eq!(report.delivered, 1);
        assert_eq!(f.broker.ready()[0].id, "users:3:1:referrer");
        assert_eq!(f.broker.ready()[0].enqueue_attempts, 1);
    }

    #[tokio::test]
    async fn unreadable_queue_ends_sweep() {
        let f = fixture(10);
        f.queue.push(entry(1)).await.unwrap();
        f.queue.set_available(false);

        assert_eq!(f.sweeper.sweep_once().await, SweepReport::default());
    }

    #[tokio::test]
    async fn spawned_sweeper_runs_and_stops() {
        let f = fixture(10);
        f.queue.push(entry(1)).await.unwrap();
        let broker = f.broker.clone();

        let handle = f.sweeper.spawn();
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.shutdown().await;

        assert_eq!(broker.ready().len(), 1);
    }
}
