//! Environment configuration.
//!
//! Every option has a default; a value that does not parse is logged and
//! replaced by the default rather than failing startup.

use std::time::Duration;

use tracing::warn;

use agentq_core::WorkerId;

use crate::backend::Keyspace;
use crate::jobs::executor::{DEFAULT_JOB_TIMEOUT, WorkerConfig};
use crate::jobs::heartbeat::{self, DEFAULT_HEARTBEAT_TTL};
use crate::jobs::queue::{DEFAULT_DEQUEUE_BLOCK, DEFAULT_PUMP_LIMIT};
use crate::jobs::store::{DEFAULT_IDEMPOTENCY_TTL, DEFAULT_JOB_TTL};
use crate::jobs::types::RetryPolicy;
use crate::submission::DEFAULT_QUEUE;

pub mod env {
    pub const REDIS_URL: &str = "AGENTQ_REDIS_URL";
    pub const REDIS_SOCKET_TIMEOUT_SECONDS: &str = "AGENTQ_REDIS_SOCKET_TIMEOUT_SECONDS";
    pub const KEY_PREFIX: &str = "AGENTQ_KEY_PREFIX";
    pub const QUEUE_NAME: &str = "AGENTQ_QUEUE_NAME";
    pub const WORKER_ID: &str = "AGENTQ_WORKER_ID";
    pub const WORKER_HEARTBEAT_TTL_SECONDS: &str = "AGENTQ_WORKER_HEARTBEAT_TTL_SECONDS";
    pub const JOB_TIMEOUT_SECONDS: &str = "AGENTQ_JOB_TIMEOUT_SECONDS";
    pub const JOB_MAX_ATTEMPTS: &str = "AGENTQ_JOB_MAX_ATTEMPTS";
    pub const JOB_TTL_SECONDS: &str = "AGENTQ_JOB_TTL_SECONDS";
    pub const IDEMPOTENCY_TTL_SECONDS: &str = "AGENTQ_IDEMPOTENCY_TTL_SECONDS";
    pub const RETRY_BACKOFF_CAP_SECONDS: &str = "AGENTQ_RETRY_BACKOFF_CAP_SECONDS";
    pub const DEQUEUE_BLOCK_SECONDS: &str = "AGENTQ_DEQUEUE_BLOCK_SECONDS";
    pub const PUMP_LIMIT: &str = "AGENTQ_PUMP_LIMIT";
}

/// Default Redis URL.
pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379/0";

#[derive(Debug, Clone, PartialEq)]
pub struct AgentqConfig {
    pub redis_url: String,
    pub redis_socket_timeout: Duration,
    pub key_prefix: String,
    pub queue_name: String,
    pub worker_id: WorkerId,
    pub heartbeat_ttl: Duration,
    pub job_timeout: Duration,
    pub max_attempts: u32,
    pub job_ttl: Duration,
    /// Never longer than `job_ttl`.
    pub idempotency_ttl: Duration,
    pub backoff_cap: Duration,
    pub dequeue_block: Duration,
    pub pump_limit: usize,
}

impl Default for AgentqConfig {
    fn default() -> Self {
        Self {
            redis_url: DEFAULT_REDIS_URL.to_string(),
            redis_socket_timeout: Duration::from_secs(10),
            key_prefix: Keyspace::DEFAULT_PREFIX.to_string(),
            queue_name: DEFAULT_QUEUE.to_string(),
            worker_id: default_worker_id(),
            heartbeat_ttl: DEFAULT_HEARTBEAT_TTL,
            job_timeout: DEFAULT_JOB_TIMEOUT,
            max_attempts: RetryPolicy::default().max_attempts,
            job_ttl: DEFAULT_JOB_TTL,
            idempotency_ttl: DEFAULT_IDEMPOTENCY_TTL,
            backoff_cap: RetryPolicy::default().backoff_cap,
            dequeue_block: DEFAULT_DEQUEUE_BLOCK,
            pump_limit: DEFAULT_PUMP_LIMIT,
        }
    }
}

fn default_worker_id() -> WorkerId {
    WorkerId::from_host(&heartbeat::hostname(), std::process::id())
}

impl AgentqConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let worker_id = match get(env::WORKER_ID) {
            Some(raw) => WorkerId::new(raw.trim()).unwrap_or_else(|e| {
                warn!(var = env::WORKER_ID, error = %e, "invalid worker id; using default");
                defaults.worker_id.clone()
            }),
            None => defaults.worker_id.clone(),
        };

        let job_ttl = secs(&get, env::JOB_TTL_SECONDS, defaults.job_ttl);
        let idempotency_ttl =
            secs(&get, env::IDEMPOTENCY_TTL_SECONDS, defaults.idempotency_ttl).min(job_ttl);

        Self {
            redis_url: get(env::REDIS_URL).unwrap_or(defaults.redis_url),
            redis_socket_timeout: secs(
                &get,
                env::REDIS_SOCKET_TIMEOUT_SECONDS,
                defaults.redis_socket_timeout,
            ),
            key_prefix: get(env::KEY_PREFIX).unwrap_or(defaults.key_prefix),
            queue_name: get(env::QUEUE_NAME).unwrap_or(defaults.queue_name),
            worker_id,
            heartbeat_ttl: secs(&get, env::WORKER_HEARTBEAT_TTL_SECONDS, defaults.heartbeat_ttl),
            job_timeout: secs(&get, env::JOB_TIMEOUT_SECONDS, defaults.job_timeout),
            max_attempts: positive(&get, env::JOB_MAX_ATTEMPTS, defaults.max_attempts),
            job_ttl,
            idempotency_ttl,
            backoff_cap: secs(&get, env::RETRY_BACKOFF_CAP_SECONDS, defaults.backoff_cap),
            dequeue_block: secs(&get, env::DEQUEUE_BLOCK_SECONDS, defaults.dequeue_block),
            pump_limit: positive(&get, env::PUMP_LIMIT, defaults.pump_limit),
        }
    }

    pub fn keyspace(&self) -> Keyspace {
        Keyspace::new(self.key_prefix.clone())
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig::default()
            .with_job_timeout(self.job_timeout)
            .with_dequeue_block(self.dequeue_block)
            .with_pump_limit(self.pump_limit)
            .with_backoff_cap(self.backoff_cap)
    }

    #[cfg(feature = "redis")]
    pub fn redis_backend_config(&self) -> crate::backend::RedisBackendConfig {
        crate::backend::RedisBackendConfig {
            url: self.redis_url.clone(),
            socket_timeout: self.redis_socket_timeout,
        }
    }
}

/// Whole or fractional seconds; negative, NaN and out-of-range values are invalid.
fn secs(get: &impl Fn(&str) -> Option<String>, key: &str, default: Duration) -> Duration {
    let Some(raw) = get(key) else {
        return default;
    };
    match raw.trim().parse::<f64>().map(Duration::try_from_secs_f64) {
        Ok(Ok(d)) => d,
        _ => {
            warn!(var = key, value = %raw, "invalid duration; using default");
            default
        }
    }
}

fn positive<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: std::str::FromStr + PartialOrd + Default + Copy,
{
    let Some(raw) = get(key) else {
        return default;
    };
    match raw.trim().parse::<T>() {
        Ok(v) if v > T::default() => v,
        _ => {
            warn!(var = key, value = %raw, "invalid positive integer; using default");
            default
        }
    }
}
