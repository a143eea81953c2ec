//! Redis-backed store (the production backend).
//!
//! Each [`Backend`] call is exactly one Redis command, so the atomicity the
//! queue relies on (claim-once `BRPOP`, `ZPOPMIN`, `SET NX`) comes from Redis
//! itself. A single connection is cached and reused; any command error drops it
//! so the next call reconnects with a fresh socket.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tracing::{debug, warn};

use super::{Backend, BackendError, BackendResult};
use crate::config::DEFAULT_REDIS_URL;

/// Connection settings.
#[derive(Debug, Clone)]
pub struct RedisBackendConfig {
    pub url: String,
    /// Connect/read/write timeout for ordinary commands. `BRPOP` extends the read
    /// timeout by its own block time.
    pub socket_timeout: Duration,
}

impl Default for RedisBackendConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_REDIS_URL.to_string(),
            socket_timeout: Duration::from_secs(10),
        }
    }
}

pub struct RedisBackend {
    client: redis::Client,
    config: RedisBackendConfig,
    cached: Mutex<Option<redis::Connection>>,
}

impl core::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisBackend")
            .field("config", &self.config)
            .finish()
    }
}

impl RedisBackend {
    /// Create a backend. No connection is opened until the first command.
    pub fn new(config: RedisBackendConfig) -> BackendResult<Self> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| BackendError::Connection(e.to_string()))?;
        Ok(Self {
            client,
            config,
            cached: Mutex::new(None),
        })
    }

    pub fn from_url(url: impl Into<String>) -> BackendResult<Self> {
        Self::new(RedisBackendConfig {
            url: url.into(),
            ..RedisBackendConfig::default()
        })
    }

    fn connect(&self) -> BackendResult<redis::Connection> {
        let timeout = self.config.socket_timeout;
        let conn = self
            .client
            .get_connection_with_timeout(timeout)
            .map_err(|e| BackendError::Connection(e.to_string()))?;
        conn.set_read_timeout(Some(timeout))
            .map_err(|e| BackendError::Connection(e.to_string()))?;
        conn.set_write_timeout(Some(timeout))
            .map_err(|e| BackendError::Connection(e.to_string()))?;
        debug!("redis connection opened");
        Ok(conn)
    }

    /// Run one command on the cached connection (or a new one).
    ///
    /// The connection is taken out of the cache while the command runs, so a
    /// long `BRPOP` never blocks other callers; they simply open their own.
    fn run<T, F>(&self, op: &'static str, f: F) -> BackendResult<T>
    where
        F: FnOnce(&mut redis::Connection) -> redis::RedisResult<T>,
    {
        let cached = self
            .cached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let mut conn = match cached {
            Some(conn) => conn,
            None => self.connect()?,
        };

        match f(&mut conn) {
            Ok(value) => {
                let mut slot = self.cached.lock().unwrap_or_else(PoisonError::into_inner);
                if slot.is_none() {
                    *slot = Some(conn);
                }
                Ok(value)
            }
            Err(e) => {
                warn!(op, error = %e, "redis command failed; dropping connection");
                if e.is_io_error() || e.is_connection_dropped() || e.is_timeout() {
                    Err(BackendError::Connection(format!("{op} failed: {e}")))
                } else {
                    Err(BackendError::Command(format!("{op} failed: {e}")))
                }
            }
        }
    }
}

fn millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis())
        .unwrap_or(u64::MAX)
        .max(1)
}

impl Backend for RedisBackend {
    fn ping(&self) -> BackendResult<()> {
        self.run("PING", |conn| redis::cmd("PING").query::<String>(conn))
            .map(|_| ())
    }

    fn get(&self, key: &str) -> BackendResult<Option<String>> {
        self.run("GET", |conn| redis::cmd("GET").arg(key).query(conn))
    }

    fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> BackendResult<()> {
        self.run("SET PX", |conn| {
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("PX")
                .arg(millis(ttl))
                .query(conn)
        })
    }

    fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> BackendResult<bool> {
        let reply: Option<String> = self.run("SET PX NX", |conn| {
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("PX")
                .arg(millis(ttl))
                .arg("NX")
                .query(conn)
        })?;
        Ok(reply.is_some())
    }

    fn expire(&self, key: &str, ttl: Duration) -> BackendResult<bool> {
        self.run("PEXPIRE", |conn| {
            redis::cmd("PEXPIRE").arg(key).arg(millis(ttl)).query(conn)
        })
    }

    fn lpush(&self, key: &str, value: &str) -> BackendResult<u64> {
        self.run("LPUSH", |conn| redis::cmd("LPUSH").arg(key).arg(value).query(conn))
    }

    fn brpop(&self, key: &str, timeout: Duration) -> BackendResult<Option<String>> {
        if timeout.is_zero() {
            return self.run("RPOP", |conn| redis::cmd("RPOP").arg(key).query(conn));
        }

        let socket_timeout = self.config.socket_timeout;
        let reply: Option<(String, String)> = self.run("BRPOP", |conn| {
            conn.set_read_timeout(Some(timeout + socket_timeout))?;
            let reply = redis::cmd("BRPOP")
                .arg(key)
                .arg(timeout.as_secs_f64())
                .query(conn);
            conn.set_read_timeout(Some(socket_timeout))?;
            reply
        })?;
        Ok(reply.map(|(_key, value)| value))
    }

    fn llen(&self, key: &str) -> BackendResult<u64> {
        self.run("LLEN", |conn| redis::cmd("LLEN").arg(key).query(conn))
    }

    fn zadd(&self, key: &str, member: &str, score: f64) -> BackendResult<()> {
        self.run("ZADD", |conn| {
            redis::cmd("ZADD")
                .arg(key)
                .arg(score)
                .arg(member)
                .query::<()>(conn)
        })
    }

    fn zpopmin(&self, key: &str) -> BackendResult<Option<(String, f64)>> {
        let popped: Vec<(String, f64)> =
            self.run("ZPOPMIN", |conn| redis::cmd("ZPOPMIN").arg(key).arg(1).query(conn))?;
        Ok(popped.into_iter().next())
    }

    fn zcard(&self, key: &str) -> BackendResult<u64> {
        self.run("ZCARD", |conn| redis::cmd("ZCARD").arg(key).query(conn))
    }

    fn hset(&self, key: &str, fields: &[(&str, String)]) -> BackendResult<()> {
        if fields.is_empty() {
            return Ok(());
        }
        self.run("HSET", |conn| {
            let mut cmd = redis::cmd("HSET");
            cmd.arg(key);
            for (field, value) in fields {
                cmd.arg(*field).arg(value.as_str());
            }
            cmd.query::<()>(conn)
        })
    }

    fn hsetnx(&self, key: &str, field: &str, value: &str) -> BackendResult<bool> {
        self.run("HSETNX", |conn| {
            redis::cmd("HSETNX").arg(key).arg(field).arg(value).query(conn)
        })
    }

    fn hget(&self, key: &str, field: &str) -> BackendResult<Option<String>> {
        self.run("HGET", |conn| redis::cmd("HGET").arg(key).arg(field).query(conn))
    }

    fn hgetall(&self, key: &str) -> BackendResult<HashMap<String, String>> {
        self.run("HGETALL", |conn| redis::cmd("HGETALL").arg(key).query(conn))
    }

    fn hincrby(&self, key: &str, field: &str, delta: i64) -> BackendResult<i64> {
        self.run("HINCRBY", |conn| {
            redis::cmd("HINCRBY").arg(key).arg(field).arg(delta).query(conn)
        })
    }
}
