//! `modelhooks-core` — persistence-facing building blocks.
//!
//! This crate contains **pure** primitives (no IO): entity identity, the
//! repository contract, and field-level change detection.

pub mod change;
pub mod entity;
pub mod error;
pub mod id;

pub use change::{FieldDiff, FieldValue, IGNORED_FIELDS, diff_entities, diff_values};
pub use entity::{Entity, Repository, RepositoryError};
pub use error::{DomainError, DomainResult};
pub use id::EntityId;
