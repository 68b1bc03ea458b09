use async_trait::async_trait;
use tracing::{debug, info};

use modelhooks_core::{DomainError, Entity, FieldValue, RepositoryError};

use crate::ChangeEvent;

/// Input a handler is constructed from, once per event.
///
/// `entity` is the **current** entity loaded by the worker, not the snapshot
/// the event was built from; `old`/`new` are the values recorded at save time.
#[derive(Debug, Clone)]
pub struct FieldChange<E> {
    pub entity: E,
    pub field: String,
    pub old: FieldValue,
    pub new: FieldValue,
    pub updated: Option<i64>,
    pub event_id: String,
}

impl<E: Entity> FieldChange<E> {
    pub fn from_event(entity: E, event: &ChangeEvent) -> Self {
        Self {
            entity,
            field: event.field.clone(),
            old: event.old.clone(),
            new: event.new.clone(),
            updated: event.updated,
            event_id: event.id.clone(),
        }
    }
}

/// Error raised by handler execution.
///
/// Any error aborts the remaining handlers of the event and sends the whole
/// event into execution backoff.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("entity type mismatch: handler expects {expected}, loaded entity is not one")]
    EntityMismatch { expected: &'static str },
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

/// Name of handler type `H` in logs and errors: its type name without the
/// module path or generic arguments.
pub fn handler_name<H: ?Sized>() -> &'static str {
    let full = std::any::type_name::<H>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// A reaction to one field change (handler contract).
///
/// Handlers are ephemeral: the dispatcher builds one per event from a
/// [`FieldChange`], calls [`ChangeHandler::run`] once and drops it.
///
/// ## Idempotency
///
/// The pipeline already deduplicates by event id, but an event may be
/// re-executed after a later handler in the same chain failed. `execute`
/// must therefore tolerate re-invocation for the same event.
#[async_trait]
pub trait ChangeHandler: Send + Sync {
    /// Read-only precondition check. Handlers opt in by overriding this.
    async fn validate(&self) -> bool {
        false
    }

    /// Perform the side effect.
    async fn execute(&self) -> Result<(), HandlerError>;

    /// Validate, then execute only if validation passed.
    async fn run(&self) -> Result<(), HandlerError> {
        let handler = handler_name::<Self>();
        info!(handler, "executing handler");

        let result = if self.validate().await {
            debug!(handler, "handler validated");
            self.execute().await
        } else {
            debug!(handler, "handler skipped by validation");
            Ok(())
        };

        info!(handler, ok = result.is_ok(), "executed handler");
        result
    }
}
