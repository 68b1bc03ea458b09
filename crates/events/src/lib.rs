//! Model-change events: the event type, handler contract, registry, and the
//! broker contract they travel through.

pub mod broker;
pub mod catalog;
pub mod event;
pub mod handler;
pub mod in_memory_broker;
pub mod registry;

pub use broker::{Broker, BrokerError};
pub use catalog::{EntityCatalog, EntityCatalogBuilder, EntityLoader, LoadedEntity};
pub use event::{ChangeEvent, derive_event_id};
pub use handler::{ChangeHandler, FieldChange, HandlerError, handler_name};
pub use in_memory_broker::InMemoryBroker;
pub use registry::{
    AlreadyInstalled, HandlerFactory, HandlerRegistry, HandlerRegistryBuilder, global, install,
};
