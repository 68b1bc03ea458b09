//! Repositories and the save-time change detection glue.

pub mod in_memory;

use std::sync::Arc;

use tracing::{debug, warn};

use modelhooks_core::{Entity, diff_entities};
use modelhooks_events::{ChangeEvent, HandlerRegistry};

use crate::enqueue::EventEnqueuer;

pub use in_memory::InMemoryRepository;

/// Turns the field diff of a save into enqueued change events.
///
/// Only fields with at least one registered handler produce events.
#[derive(Debug, Clone)]
pub struct ChangeNotifier {
    registry: Arc<HandlerRegistry>,
    enqueuer: Arc<EventEnqueuer>,
}

impl ChangeNotifier {
    pub fn new(registry: Arc<HandlerRegistry>, enqueuer: Arc<EventEnqueuer>) -> Self {
        Self { registry, enqueuer }
    }

    /// Enqueue one event per handled changed field of `after` relative to
    /// `before`. Returns how many were enqueued; never fails.
    pub fn notify<E: Entity>(&self, before: Option<&E>, after: &E) -> usize {
        let diffs = match diff_entities(before, after) {
            Ok(diffs) => diffs,
            Err(error) => {
                warn!(
                    entity_type = E::ENTITY_TYPE,
                    entity_id = %after.id(),
                    %error,
                    "change detection failed; no events for this save"
                );
                return 0;
            }
        };

        let mut enqueued = 0;
        for diff in diffs
            .iter()
            .filter(|d| self.registry.has_handlers(E::ENTITY_TYPE, &d.field))
        {
            let event = ChangeEvent::from_diff(after, diff);
            debug!(event_id = %event.id, "enqueueing change event");
            self.enqueuer.enqueue(event);
            enqueued += 1;
        }
        enqueued
    }
}
