//! Backing store abstraction.
//!
//! The queue, job records, idempotency index and heartbeats all live in one
//! shared, atomic, networked key-value store with Redis semantics. [`Backend`]
//! names exactly the primitives that the rest of the crate relies on; every
//! method maps to a single Redis command, so each call is atomic on its own.
//!
//! Implementations:
//! - [`InMemoryBackend`]: single-process keyspace for tests and local runs.
//! - `RedisBackend` (feature `redis`): the production store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use agentq_core::{JobId, WorkerId};

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis_kv;

pub use in_memory::InMemoryBackend;
#[cfg(feature = "redis")]
pub use redis_kv::{RedisBackend, RedisBackendConfig};

/// Result type for backend calls.
pub type BackendResult<T> = Result<T, BackendError>;

/// Shared handle used by every component.
pub type SharedBackend = Arc<dyn Backend>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    #[error("backend connection error: {0}")]
    Connection(String),

    #[error("backend command error: {0}")]
    Command(String),

    #[error("wrong value type stored at key {0}")]
    WrongType(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Redis-compatible primitives.
///
/// Missing keys behave like Redis: reads return empty/`None`, counters start at 0.
pub trait Backend: Send + Sync {
    /// `PING`
    fn ping(&self) -> BackendResult<()>;

    /// `GET key`
    fn get(&self, key: &str) -> BackendResult<Option<String>>;

    /// `SET key value PX ttl`
    fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> BackendResult<()>;

    /// `SET key value PX ttl NX`; returns whether the value was written.
    fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> BackendResult<bool>;

    /// `PEXPIRE key ttl`; returns whether the key existed.
    fn expire(&self, key: &str, ttl: Duration) -> BackendResult<bool>;

    /// `LPUSH key value`; returns the new length.
    fn lpush(&self, key: &str, value: &str) -> BackendResult<u64>;

    /// `BRPOP key timeout`; `None` when the timeout elapses with nothing to pop.
    /// A zero timeout never blocks.
    fn brpop(&self, key: &str, timeout: Duration) -> BackendResult<Option<String>>;

    /// `LLEN key`
    fn llen(&self, key: &str) -> BackendResult<u64>;

    /// `ZADD key score member`
    fn zadd(&self, key: &str, member: &str, score: f64) -> BackendResult<()>;

    /// `ZPOPMIN key 1`
    fn zpopmin(&self, key: &str) -> BackendResult<Option<(String, f64)>>;

    /// `ZCARD key`
    fn zcard(&self, key: &str) -> BackendResult<u64>;

    /// `HSET key field value [field value ...]`
    fn hset(&self, key: &str, fields: &[(&str, String)]) -> BackendResult<()>;

    /// `HSETNX key field value`; returns whether the field was written.
    fn hsetnx(&self, key: &str, field: &str, value: &str) -> BackendResult<bool>;

    /// `HGET key field`
    fn hget(&self, key: &str, field: &str) -> BackendResult<Option<String>>;

    /// `HGETALL key`; empty when the key does not exist.
    fn hgetall(&self, key: &str) -> BackendResult<HashMap<String, String>>;

    /// `HINCRBY key field delta`; returns the new value.
    fn hincrby(&self, key: &str, field: &str, delta: i64) -> BackendResult<i64>;
}

/// Key layout shared by every component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keyspace {
    prefix: String,
}

impl Keyspace {
    pub const DEFAULT_PREFIX: &'static str = "agentq";

    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Ready list for a queue.
    pub fn ready(&self, queue: &str) -> String {
        format!("{}:q:{}", self.prefix, queue)
    }

    /// Delayed sorted set for a queue (score = due epoch seconds).
    pub fn delayed(&self, queue: &str) -> String {
        format!("{}:q:{}:delayed", self.prefix, queue)
    }

    /// Job record hash.
    pub fn job(&self, job_id: &JobId) -> String {
        format!("{}:job:{}", self.prefix, job_id)
    }

    /// Idempotency index entry for `(agent, key)`.
    pub fn idempotency(&self, agent: &str, key: &str) -> String {
        format!("{}:idem:{}:{}", self.prefix, agent, key)
    }

    /// Worker heartbeat.
    pub fn worker(&self, worker_id: &WorkerId) -> String {
        format!("{}:worker:{}", self.prefix, worker_id)
    }
}

impl Default for Keyspace {
    fn default() -> Self {
        Self::new(Self::DEFAULT_PREFIX)
    }
}

/// Current wall-clock time as fractional epoch seconds (delayed-queue scores).
pub fn now_unix() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}
