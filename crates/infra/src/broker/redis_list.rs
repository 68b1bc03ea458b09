//! Redis-backed broker: list queue + sorted-set schedule source.
//!
//! ## Keys
//!
//! - **Queue** (`{project}:taskiq`): list of JSON events, `RPUSH` / `LPOP`
//! - **Schedule** (`{project}:taskiq:schedule`): sorted set scored by due time
//!   (unix millis); members are `{job_id}|{event json}` so equal events
//!   scheduled twice stay distinct
//!
//! Consumers promote due schedule entries to the queue before each pop. The
//! promotion runs as a Lua script so an entry is moved exactly once even when
//! several workers poll concurrently.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::Script;
use redis::aio::ConnectionManager;
use tracing::{debug, instrument};
use uuid::Uuid;

use modelhooks_events::{Broker, BrokerError, ChangeEvent};

use crate::redis_support::is_unavailable;

/// Max schedule entries promoted per poll.
const PROMOTE_BATCH: u32 = 100;

const PROMOTE_DUE: &str = r"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
local moved = 0
for _, member in ipairs(due) do
  if redis.call('ZREM', KEYS[1], member) == 1 then
    local sep = string.find(member, '|', 1, true)
    redis.call('RPUSH', KEYS[2], string.sub(member, sep + 1))
    moved = moved + 1
  end
end
return moved
";

#[derive(Clone)]
pub struct RedisBroker {
    conn: ConnectionManager,
    queue_key: String,
    schedule_key: String,
    promote: Script,
}

impl RedisBroker {
    pub fn new(
        conn: ConnectionManager,
        queue_key: impl Into<String>,
        schedule_key: impl Into<String>,
    ) -> Self {
        Self {
            conn,
            queue_key: queue_key.into(),
            schedule_key: schedule_key.into(),
            promote: Script::new(PROMOTE_DUE),
        }
    }

    async fn promote_due(&self, conn: &mut ConnectionManager) -> Result<u64, BrokerError> {
        let mut invocation = self.promote.prepare_invoke();
        invocation
            .key(&self.schedule_key)
            .key(&self.queue_key)
            .arg(Utc::now().timestamp_millis())
            .arg(PROMOTE_BATCH);
        let moved: u64 = invocation.invoke_async(conn).await.map_err(broker_error)?;
        if moved > 0 {
            debug!(moved, "promoted scheduled jobs");
        }
        Ok(moved)
    }
}

impl core::fmt::Debug for RedisBroker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisBroker")
            .field("queue_key", &self.queue_key)
            .field("schedule_key", &self.schedule_key)
            .finish_non_exhaustive()
    }
}

fn broker_error(err: redis::RedisError) -> BrokerError {
    if is_unavailable(&err) {
        BrokerError::Unavailable(err.to_string())
    } else {
        BrokerError::Command(err.to_string())
    }
}

fn encode(event: &ChangeEvent) -> Result<String, BrokerError> {
    serde_json::to_string(event).map_err(|e| BrokerError::Serialization(e.to_string()))
}

#[async_trait]
impl Broker for RedisBroker {
    #[instrument(skip(self, event), fields(event_id = %event.id), err)]
    async fn enqueue(&self, event: ChangeEvent) -> Result<(), BrokerError> {
        let payload = encode(&event)?;
        let mut conn = self.conn.clone();
        let _: u64 = redis::cmd("RPUSH")
            .arg(&self.queue_key)
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(broker_error)?;
        Ok(())
    }

    #[instrument(skip(self, event), fields(event_id = %event.id, at = %at), err)]
    async fn schedule_at(&self, at: DateTime<Utc>, event: ChangeEvent) -> Result<(), BrokerError> {
        let member = format!("{}|{}", Uuid::now_v7(), encode(&event)?);
        let mut conn = self.conn.clone();
        let _: u64 = redis::cmd("ZADD")
            .arg(&self.schedule_key)
            .arg(at.timestamp_millis())
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(broker_error)?;
        Ok(())
    }

    async fn claim_next(&self) -> Result<Option<ChangeEvent>, BrokerError> {
        let mut conn = self.conn.clone();
        self.promote_due(&mut conn).await?;

        let raw: Option<String> = redis::cmd("LPOP")
            .arg(&self.queue_key)
            .query_async(&mut conn)
            .await
            .map_err(broker_error)?;

        raw.map(|raw| {
            serde_json::from_str(&raw).map_err(|e| BrokerError::Serialization(e.to_string()))
        })
        .transpose()
    }
}
