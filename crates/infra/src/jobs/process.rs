//! `process_event`: the broker job that dispatches one event and reschedules
//! it with exponential backoff when a handler fails.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{error, instrument};

use modelhooks_events::{Broker, BrokerError, ChangeEvent};

use super::policy::RetryPolicy;
use crate::dispatcher::{DispatchError, DispatchOutcome, EventDispatcher};
use crate::idempotency::IdempotencyStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The dispatcher finished (including the no-op outcomes).
    Dispatched(DispatchOutcome),
    /// A handler failed; the same event was rescheduled.
    RetryScheduled { attempt: u32, at: DateTime<Utc> },
}

/// Terminal failure, surfaced to the broker's own dead-letter handling.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("event {event_id} failed after {attempt} attempts: {source}")]
    Exhausted {
        event_id: String,
        attempt: u32,
        #[source]
        source: DispatchError,
    },
    #[error("event {event_id} failed and its retry could not be scheduled ({schedule_error}): {source}")]
    ScheduleFailed {
        event_id: String,
        attempt: u32,
        schedule_error: BrokerError,
        #[source]
        source: DispatchError,
    },
}

impl ProcessError {
    pub fn attempt(&self) -> u32 {
        match self {
            Self::Exhausted { attempt, .. } | Self::ScheduleFailed { attempt, .. } => *attempt,
        }
    }
}

/// Dispatches events and owns the execution-retry policy.
pub struct EventProcessor<S, B> {
    dispatcher: Arc<EventDispatcher<S>>,
    broker: B,
    policy: RetryPolicy,
}

impl<S, B> EventProcessor<S, B>
where
    S: IdempotencyStore,
    B: Broker,
{
    pub fn new(dispatcher: Arc<EventDispatcher<S>>, broker: B, policy: RetryPolicy) -> Self {
        Self {
            dispatcher,
            broker,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn broker(&self) -> &B {
        &self.broker
    }

    /// Dispatch `event`; on handler failure bump `attempt` and reschedule the
    /// same event (same id) after the backoff delay.
    ///
    /// Returns `Err` once the retry budget is spent or the retry cannot be
    /// scheduled.
    #[instrument(
        skip(self, event),
        fields(event_id = %event.id, entity_type = %event.entity_type, field = %event.field)
    )]
    pub async fn process_event(&self, mut event: ChangeEvent) -> Result<ProcessOutcome, ProcessError> {
        let failure = match self.dispatcher.dispatch(&event).await {
            Ok(outcome) => return Ok(ProcessOutcome::Dispatched(outcome)),
            Err(failure) => failure,
        };

        event.attempt += 1;
        let attempt = event.attempt;
        error!(
            event = ?event,
            attempt,
            error = %failure,
            "model event processing failed"
        );

        if !self.policy.should_retry(attempt) {
            return Err(ProcessError::Exhausted {
                event_id: event.id,
                attempt,
                source: failure,
            });
        }

        let delay = self.policy.delay_for_attempt(attempt);
        let at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|delay| Utc::now().checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let event_id = event.id.clone();

        match self.broker.schedule_at(at, event).await {
            Ok(()) => Ok(ProcessOutcome::RetryScheduled { attempt, at }),
            Err(schedule_error) => {
                error!(event_id, attempt, error = %schedule_error, "model event retry schedule failed");
                Err(ProcessError::ScheduleFailed {
                    event_id,
                    attempt,
                    schedule_error,
                    source: failure,
                })
            }
        }
    }
}

impl<S, B> core::fmt::Debug for EventProcessor<S, B> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventProcessor")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}
