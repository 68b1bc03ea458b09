//! Shared Redis connection plumbing for the Redis-backed adapters.

use redis::aio::ConnectionManager;

pub use redis::RedisError;

/// Open a reconnecting connection manager for `redis_url`.
///
/// The manager is cheap to clone; every adapter holds its own clone.
pub async fn connect(redis_url: &str) -> Result<ConnectionManager, RedisError> {
    let client = redis::Client::open(redis_url)?;
    ConnectionManager::new(client).await
}

/// Whether an error means the server could not be reached (as opposed to a
/// rejected command).
pub(crate) fn is_unavailable(err: &RedisError) -> bool {
    err.is_io_error() || err.is_connection_refusal() || err.is_connection_dropped() || err.is_timeout()
}
