//! Redis list-backed fallback queue (`RPUSH` / `LPOP`, JSON payloads).

use async_trait::async_trait;
use redis::aio::ConnectionManager;

use super::{FallbackEntry, FallbackError, FallbackQueue};

#[derive(Clone)]
pub struct RedisFallbackQueue {
    conn: ConnectionManager,
    key: String,
}

impl RedisFallbackQueue {
    /// `key` is typically `PipelineConfig::fallback_key()`.
    pub fn new(conn: ConnectionManager, key: impl Into<String>) -> Self {
        Self {
            conn,
            key: key.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl core::fmt::Debug for RedisFallbackQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisFallbackQueue")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

fn queue_error(err: redis::RedisError) -> FallbackError {
    FallbackError::Unavailable(err.to_string())
}

#[async_trait]
impl FallbackQueue for RedisFallbackQueue {
    async fn push(&self, entry: FallbackEntry) -> Result<(), FallbackError> {
        let payload = entry.encode()?;
        let mut conn = self.conn.clone();
        let _: u64 = redis::cmd("RPUSH")
            .arg(&self.key)
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(queue_error)?;
        Ok(())
    }

    async fn pop_nowait(&self) -> Result<Option<FallbackEntry>, FallbackError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("LPOP")
            .arg(&self.key)
            .query_async(&mut conn)
            .await
            .map_err(queue_error)?;
        raw.map(|raw| FallbackEntry::decode(&raw)).transpose()
    }

    async fn len(&self) -> Result<usize, FallbackError> {
        let mut conn = self.conn.clone();
        let len: usize = redis::cmd("LLEN")
            .arg(&self.key)
            .query_async(&mut conn)
            .await
            .map_err(queue_error)?;
        Ok(len)
    }
}
