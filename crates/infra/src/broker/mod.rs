//! Broker adapters. The contract and the in-memory broker live in
//! `modelhooks_events::broker`.

#[cfg(feature = "redis")]
pub mod redis_list;

pub use modelhooks_events::{Broker, BrokerError, InMemoryBroker};
#[cfg(feature = "redis")]
pub use redis_list::RedisBroker;
