use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use modelhooks_events::Broker;

use super::WorkerHandle;
use crate::config::WorkerSettings;
use crate::idempotency::IdempotencyStore;
use crate::jobs::{EventProcessor, ProcessError, ProcessOutcome};

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct WorkerStats {
    pub claimed: u64,
    pub dispatched: u64,
    pub retries_scheduled: u64,
    /// Terminal failures handed to dead-letter handling.
    pub failed: u64,
    pub claim_errors: u64,
}

/// Broker consumer.
///
/// - Claims up to `max_concurrent` events at a time and processes them
///   concurrently
/// - Sleeps `poll_interval` only when the broker has nothing ready
/// - Terminal processing failures are logged as dead-lettered
pub struct EventWorker<S, B> {
    name: String,
    processor: Arc<EventProcessor<S, B>>,
    settings: WorkerSettings,
    stats: Arc<Mutex<WorkerStats>>,
}

impl<S, B> EventWorker<S, B>
where
    S: IdempotencyStore + 'static,
    B: Broker + 'static,
{
    pub fn new(processor: Arc<EventProcessor<S, B>>, settings: WorkerSettings) -> Self {
        Self {
            name: format!("event-worker-{}", Uuid::now_v7()),
            processor,
            settings,
            stats: Arc::new(Mutex::new(WorkerStats::default())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Claim and process one batch. Returns how many events were claimed.
    pub async fn run_batch(&self) -> usize {
        let mut tasks = JoinSet::new();

        for _ in 0..self.settings.max_concurrent.max(1) {
            match self.processor.broker().claim_next().await {
                Ok(Some(event)) => {
                    let processor = self.processor.clone();
                    tasks.spawn(async move { processor.process_event(event).await });
                }
                Ok(None) => break,
                Err(e) => {
                    error!(worker = %self.name, error = %e, "failed to claim event");
                    self.record(|s| s.claim_errors += 1);
                    break;
                }
            }
        }

        let claimed = tasks.len();
        if claimed > 0 {
            debug!(worker = %self.name, claimed, "processing event batch");
            self.record(|s| s.claimed += claimed as u64);
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => self.record_result(result),
                Err(e) => {
                    error!(worker = %self.name, error = ?e, "event task panicked");
                    self.record(|s| s.failed += 1);
                }
            }
        }

        claimed
    }

    /// Process batches until the broker has nothing ready.
    pub async fn drain(&self) -> WorkerStats {
        while self.run_batch().await > 0 {}
        self.stats()
    }

    /// Run the consumer loop in a background task.
    pub fn spawn(self) -> WorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let join = tokio::spawn(async move {
            self.run(&mut shutdown_rx).await;
        });
        WorkerHandle::new("event-worker", shutdown_tx, join)
    }

    #[instrument(skip(self, shutdown_rx), fields(worker = %self.name))]
    async fn run(&self, shutdown_rx: &mut mpsc::Receiver<()>) {
        info!(
            poll_interval_ms = self.settings.poll_interval.as_millis() as u64,
            max_concurrent = self.settings.max_concurrent,
            "event worker started"
        );

        loop {
            if shutdown_rx.try_recv().is_ok() {
                break;
            }

            if self.run_batch().await == 0 {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = sleep(self.settings.poll_interval) => {}
                }
            }
        }

        info!(stats = ?self.stats(), "event worker stopped");
    }

    fn record_result(&self, result: Result<ProcessOutcome, ProcessError>) {
        match result {
            Ok(ProcessOutcome::Dispatched(_)) => self.record(|s| s.dispatched += 1),
            Ok(ProcessOutcome::RetryScheduled { .. }) => self.record(|s| s.retries_scheduled += 1),
            Err(err) => {
                error!(
                    worker = %self.name,
                    attempt = err.attempt(),
                    error = %err,
                    "event dead-lettered"
                );
                self.record(|s| s.failed += 1);
            }
        }
    }

    fn record(&self, update: impl FnOnce(&mut WorkerStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            update(&mut stats);
        }
    }
}

impl<S, B> core::fmt::Debug for EventWorker<S, B> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventWorker")
            .field("name", &self.name)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}
