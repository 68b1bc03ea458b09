//! Pipeline configuration.
//!
//! | Variable | Default | Meaning |
//! |----------|---------|---------|
//! | `PROJECT_NAME` | `app` | Prefix of broker/fallback keys |
//! | `REDIS_URL` | `redis://localhost:6379` | Redis for broker, store and fallback queue |
//! | `EVENT_MAX_ATTEMPTS` | `5` | Execution retries per event |
//! | `EVENT_BASE_DELAY_SECS` | `30` | First retry delay |
//! | `EVENT_MAX_DELAY_SECS` | `1800` | Retry delay cap |
//! | `EVENT_LOCK_TTL_SECS` | `300` | Execution lock lifetime |
//! | `EVENT_DONE_TTL_SECS` | `604800` | Done marker lifetime |
//! | `FALLBACK_BATCH_SIZE` | `100` | Entries per sweep |
//! | `FALLBACK_MAX_ENQUEUE_RETRIES` | `5` | Delivery retries per fallback entry |
//! | `FALLBACK_SWEEP_INTERVAL_SECS` | `60` | Sweep schedule |
//! | `ENQUEUE_SENDERS` | `2` | Background send tasks |
//! | `ENQUEUE_CHANNEL_CAPACITY` | `1024` | Pending sends before spilling |
//! | `WORKER_POLL_INTERVAL_MS` | `500` | Idle broker poll interval |
//! | `WORKER_MAX_CONCURRENT` | `4` | Concurrent events per worker |

use std::str::FromStr;
use std::time::Duration;

use crate::jobs::RetryPolicy;

pub const DEFAULT_PROJECT_NAME: &str = "app";
pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?} ({reason})")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Execution-side settings (dispatcher + backoff).
#[derive(Debug, Clone, PartialEq)]
pub struct EventSettings {
    pub retry: RetryPolicy,
    pub lock_ttl: Duration,
    pub done_ttl: Duration,
}

impl Default for EventSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            lock_ttl: Duration::from_secs(300),
            done_ttl: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

/// Fallback queue sweeper settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackSettings {
    pub batch_size: usize,
    pub max_enqueue_retries: u32,
    pub sweep_interval: Duration,
}

impl Default for FallbackSettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_enqueue_retries: 5,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Producer-side send pool settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueSettings {
    pub senders: usize,
    pub channel_capacity: usize,
}

impl Default for EnqueueSettings {
    fn default() -> Self {
        Self {
            senders: 2,
            channel_capacity: 1024,
        }
    }
}

/// Broker consumer settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    pub poll_interval: Duration,
    pub max_concurrent: usize,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            max_concurrent: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub project_name: String,
    pub redis_url: String,
    pub event: EventSettings,
    pub fallback: FallbackSettings,
    pub enqueue: EnqueueSettings,
    pub worker: WorkerSettings,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            project_name: DEFAULT_PROJECT_NAME.to_string(),
            redis_url: DEFAULT_REDIS_URL.to_string(),
            event: EventSettings::default(),
            fallback: FallbackSettings::default(),
            enqueue: EnqueueSettings::default(),
            worker: WorkerSettings::default(),
        }
    }
}

impl PipelineConfig {
    /// Load from process environment; absent variables use defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let secs = |var: &'static str, default: Duration| -> Result<Duration, ConfigError> {
            Ok(Duration::from_secs(parse(&lookup, var, default.as_secs())?))
        };

        let retry = RetryPolicy::exponential(
            parse(&lookup, "EVENT_MAX_ATTEMPTS", defaults.event.retry.max_attempts)?,
            secs("EVENT_BASE_DELAY_SECS", defaults.event.retry.base_delay)?,
            secs("EVENT_MAX_DELAY_SECS", defaults.event.retry.max_delay)?,
        );

        Ok(Self {
            project_name: lookup("PROJECT_NAME").unwrap_or(defaults.project_name),
            redis_url: lookup("REDIS_URL").unwrap_or(defaults.redis_url),
            event: EventSettings {
                retry,
                lock_ttl: secs("EVENT_LOCK_TTL_SECS", defaults.event.lock_ttl)?,
                done_ttl: secs("EVENT_DONE_TTL_SECS", defaults.event.done_ttl)?,
            },
            fallback: FallbackSettings {
                batch_size: parse(&lookup, "FALLBACK_BATCH_SIZE", defaults.fallback.batch_size)?,
                max_enqueue_retries: parse(
                    &lookup,
                    "FALLBACK_MAX_ENQUEUE_RETRIES",
                    defaults.fallback.max_enqueue_retries,
                )?,
                sweep_interval: secs(
                    "FALLBACK_SWEEP_INTERVAL_SECS",
                    defaults.fallback.sweep_interval,
                )?,
            },
            enqueue: EnqueueSettings {
                senders: parse(&lookup, "ENQUEUE_SENDERS", defaults.enqueue.senders)?.max(1),
                channel_capacity: parse(
                    &lookup,
                    "ENQUEUE_CHANNEL_CAPACITY",
                    defaults.enqueue.channel_capacity,
                )?
                .max(1),
            },
            worker: WorkerSettings {
                poll_interval: Duration::from_millis(parse(
                    &lookup,
                    "WORKER_POLL_INTERVAL_MS",
                    defaults.worker.poll_interval.as_millis() as u64,
                )?),
                max_concurrent: parse(
                    &lookup,
                    "WORKER_MAX_CONCURRENT",
                    defaults.worker.max_concurrent,
                )?
                .max(1),
            },
        })
    }

    pub fn with_project_name(mut self, name: impl Into<String>) -> Self {
        self.project_name = name.into();
        self
    }

    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.event.retry = retry;
        self
    }

    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.event.lock_ttl = ttl;
        self
    }

    pub fn with_done_ttl(mut self, ttl: Duration) -> Self {
        self.event.done_ttl = ttl;
        self
    }

    pub fn with_fallback(mut self, fallback: FallbackSettings) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn with_enqueue(mut self, enqueue: EnqueueSettings) -> Self {
        self.enqueue = enqueue;
        self
    }

    pub fn with_worker(mut self, worker: WorkerSettings) -> Self {
        self.worker = worker;
        self
    }

    /// Redis list used as the immediate job queue.
    pub fn queue_key(&self) -> String {
        format!("{}:taskiq", self.project_name)
    }

    /// Redis sorted set holding delayed jobs.
    pub fn schedule_key(&self) -> String {
        format!("{}:taskiq:schedule", self.project_name)
    }

    /// Redis list backing the fallback queue.
    pub fn fallback_key(&self) -> String {
        format!("{}:events:fallback", self.project_name)
    }
}

fn parse<T, F>(lookup: &F, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            reason: e.to_string(),
            value,
        }),
    }
}
