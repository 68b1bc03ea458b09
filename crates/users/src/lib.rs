//! Users module: the `users` entity and its change handlers.
//!
//! Call [`register`] once at startup to add this module's handlers and its
//! entity loader to the process-wide tables.

pub mod bonus_referrer;
pub mod user;

use std::sync::Arc;

use modelhooks_core::Repository;
use modelhooks_events::{EntityCatalogBuilder, FieldChange, HandlerRegistryBuilder};

pub use bonus_referrer::{BonusReferrer, FRENS_BONUS};
pub use user::User;

/// Register handlers for `users` changes.
pub fn register_handlers(registry: &mut HandlerRegistryBuilder, users: Arc<dyn Repository<User>>) {
    registry.on_change::<User, _, _>("referrer", move |change: FieldChange<User>| {
        BonusReferrer::new(change, users.clone())
    });
}

/// Register the `users` loader.
pub fn register_entities(catalog: &mut EntityCatalogBuilder, users: Arc<dyn Repository<User>>) {
    catalog.register::<User, _>(users);
}

/// Register both handlers and the entity loader.
pub fn register(
    registry: &mut HandlerRegistryBuilder,
    catalog: &mut EntityCatalogBuilder,
    users: Arc<dyn Repository<User>>,
) {
    register_handlers(registry, users.clone());
    register_entities(catalog, users);
}
