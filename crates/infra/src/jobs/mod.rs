//! Broker jobs: event processing with backoff, and the fallback sweep.
//!
//! ## Components
//!
//! - `RetryPolicy`: exponential backoff with a cap, per event
//! - `EventProcessor`: dispatches one event, reschedules it on failure
//! - `RetrySweeper`: drains the fallback queue back into the broker

pub mod policy;
pub mod process;
pub mod sweeper;

pub use policy::RetryPolicy;
pub use process::{EventProcessor, ProcessError, ProcessOutcome};
pub use sweeper::{RetrySweeper, SweepReport};
