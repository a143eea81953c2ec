//! In-process backend for tests, benches and single-host development.
//!
//! One mutex guards the whole keyspace, which makes every call atomic with
//! respect to every other call, the same guarantee Redis gives per command.
//! TTLs are enforced lazily: an expired key is dropped the next time it is
//! touched.

use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::{Backend, BackendError, BackendResult};

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    List(VecDeque<String>),
    ZSet(HashMap<String, f64>),
    Hash(HashMap<String, String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    fn is_empty_collection(&self) -> bool {
        match &self.value {
            Value::Str(_) => false,
            Value::List(l) => l.is_empty(),
            Value::ZSet(z) => z.is_empty(),
            Value::Hash(h) => h.is_empty(),
        }
    }
}

type Keyspace = HashMap<String, Entry>;

/// Mutex-guarded keyspace with Redis-like semantics.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    keys: Mutex<Keyspace>,
    pushed: Condvar,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remaining time to live of a key, if it exists and has one.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let mut keys = self.lock();
        let entry = live(&mut keys, key)?;
        entry
            .expires_at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Whether a key currently exists.
    pub fn exists(&self, key: &str) -> bool {
        let mut keys = self.lock();
        live(&mut keys, key).is_some()
    }

    /// Snapshot of a sorted set, lowest score first.
    pub fn zset_snapshot(&self, key: &str) -> Vec<(String, f64)> {
        let mut keys = self.lock();
        match live(&mut keys, key).map(|e| &e.value) {
            Some(Value::ZSet(set)) => {
                let mut items: Vec<_> = set.iter().map(|(m, s)| (m.clone(), *s)).collect();
                items.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
                items
            }
            _ => Vec::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Keyspace> {
        self.keys.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Look up a key, dropping it first if it has expired.
fn live<'a>(keys: &'a mut Keyspace, key: &str) -> Option<&'a mut Entry> {
    if keys.get(key).is_some_and(|e| e.is_expired(Instant::now())) {
        keys.remove(key);
    }
    keys.get_mut(key)
}

/// Drop a collection key once its last element is gone (Redis does the same).
fn drop_if_empty(keys: &mut Keyspace, key: &str) {
    if keys.get(key).is_some_and(Entry::is_empty_collection) {
        keys.remove(key);
    }
}

fn list_mut<'a>(keys: &'a mut Keyspace, key: &str) -> BackendResult<&'a mut VecDeque<String>> {
    live(keys, key);
    let entry = keys
        .entry(key.to_string())
        .or_insert_with(|| Entry::new(Value::List(VecDeque::new())));
    match &mut entry.value {
        Value::List(list) => Ok(list),
        _ => Err(BackendError::WrongType(key.to_string())),
    }
}

fn zset_mut<'a>(keys: &'a mut Keyspace, key: &str) -> BackendResult<&'a mut HashMap<String, f64>> {
    live(keys, key);
    let entry = keys
        .entry(key.to_string())
        .or_insert_with(|| Entry::new(Value::ZSet(HashMap::new())));
    match &mut entry.value {
        Value::ZSet(set) => Ok(set),
        _ => Err(BackendError::WrongType(key.to_string())),
    }
}

fn hash_mut<'a>(keys: &'a mut Keyspace, key: &str) -> BackendResult<&'a mut HashMap<String, String>> {
    live(keys, key);
    let entry = keys
        .entry(key.to_string())
        .or_insert_with(|| Entry::new(Value::Hash(HashMap::new())));
    match &mut entry.value {
        Value::Hash(hash) => Ok(hash),
        _ => Err(BackendError::WrongType(key.to_string())),
    }
}

fn pop_back(keys: &mut Keyspace, key: &str) -> BackendResult<Option<String>> {
    let popped = match live(keys, key).map(|e| &mut e.value) {
        None => return Ok(None),
        Some(Value::List(list)) => list.pop_back(),
        Some(_) => return Err(BackendError::WrongType(key.to_string())),
    };
    drop_if_empty(keys, key);
    Ok(popped)
}

impl Backend for InMemoryBackend {
    fn ping(&self) -> BackendResult<()> {
        Ok(())
    }

    fn get(&self, key: &str) -> BackendResult<Option<String>> {
        let mut keys = self.lock();
        match live(&mut keys, key).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Str(s)) => Ok(Some(s.clone())),
            Some(_) => Err(BackendError::WrongType(key.to_string())),
        }
    }

    fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> BackendResult<()> {
        let mut keys = self.lock();
        keys.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: Instant::now().checked_add(ttl),
            },
        );
        Ok(())
    }

    fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> BackendResult<bool> {
        let mut keys = self.lock();
        if live(&mut keys, key).is_some() {
            return Ok(false);
        }
        keys.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: Instant::now().checked_add(ttl),
            },
        );
        Ok(true)
    }

    fn expire(&self, key: &str, ttl: Duration) -> BackendResult<bool> {
        let mut keys = self.lock();
        match live(&mut keys, key) {
            Some(entry) => {
                entry.expires_at = Instant::now().checked_add(ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn lpush(&self, key: &str, value: &str) -> BackendResult<u64> {
        let len = {
            let mut keys = self.lock();
            let list = list_mut(&mut keys, key)?;
            list.push_front(value.to_string());
            list.len() as u64
        };
        self.pushed.notify_all();
        Ok(len)
    }

    fn brpop(&self, key: &str, timeout: Duration) -> BackendResult<Option<String>> {
        // No representable deadline means block until a push.
        let deadline = Instant::now().checked_add(timeout);
        let mut keys = self.lock();
        loop {
            if let Some(value) = pop_back(&mut keys, key)? {
                return Ok(Some(value));
            }
            keys = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    self.pushed
                        .wait_timeout(keys, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => self
                    .pushed
                    .wait(keys)
                    .unwrap_or_else(PoisonError::into_inner),
            };
        }
    }

    fn llen(&self, key: &str) -> BackendResult<u64> {
        let mut keys = self.lock();
        match live(&mut keys, key).map(|e| &e.value) {
            None => Ok(0),
            Some(Value::List(list)) => Ok(list.len() as u64),
            Some(_) => Err(BackendError::WrongType(key.to_string())),
        }
    }

    fn zadd(&self, key: &str, member: &str, score: f64) -> BackendResult<()> {
        let mut keys = self.lock();
        zset_mut(&mut keys, key)?.insert(member.to_string(), score);
        Ok(())
    }

    fn zpopmin(&self, key: &str) -> BackendResult<Option<(String, f64)>> {
        let mut keys = self.lock();
        let popped = match live(&mut keys, key).map(|e| &mut e.value) {
            None => return Ok(None),
            Some(Value::ZSet(set)) => {
                // Lowest score wins; ties break lexicographically like Redis.
                let min = set
                    .iter()
                    .min_by(|a, b| a.1.total_cmp(b.1).then_with(|| a.0.cmp(b.0)))
                    .map(|(m, s)| (m.clone(), *s));
                if let Some((member, _)) = &min {
                    set.remove(member);
                }
                min
            }
            Some(_) => return Err(BackendError::WrongType(key.to_string())),
        };
        drop_if_empty(&mut keys, key);
        Ok(popped)
    }

    fn zcard(&self, key: &str) -> BackendResult<u64> {
        let mut keys = self.lock();
        match live(&mut keys, key).map(|e| &e.value) {
            None => Ok(0),
            Some(Value::ZSet(set)) => Ok(set.len() as u64),
            Some(_) => Err(BackendError::WrongType(key.to_string())),
        }
    }

    fn hset(&self, key: &str, fields: &[(&str, String)]) -> BackendResult<()> {
        let mut keys = self.lock();
        let hash = hash_mut(&mut keys, key)?;
        for (field, value) in fields {
            hash.insert((*field).to_string(), value.clone());
        }
        Ok(())
    }

    fn hsetnx(&self, key: &str, field: &str, value: &str) -> BackendResult<bool> {
        let mut keys = self.lock();
        let hash = hash_mut(&mut keys, key)?;
        if hash.contains_key(field) {
            return Ok(false);
        }
        hash.insert(field.to_string(), value.to_string());
        Ok(true)
    }

    fn hget(&self, key: &str, field: &str) -> BackendResult<Option<String>> {
        let mut keys = self.lock();
        match live(&mut keys, key).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Hash(hash)) => Ok(hash.get(field).cloned()),
            Some(_) => Err(BackendError::WrongType(key.to_string())),
        }
    }

    fn hgetall(&self, key: &str) -> BackendResult<HashMap<String, String>> {
        let mut keys = self.lock();
        match live(&mut keys, key).map(|e| &e.value) {
            None => Ok(HashMap::new()),
            Some(Value::Hash(hash)) => Ok(hash.clone()),
            Some(_) => Err(BackendError::WrongType(key.to_string())),
        }
    }

    fn hincrby(&self, key: &str, field: &str, delta: i64) -> BackendResult<i64> {
        let mut keys = self.lock();
        let hash = hash_mut(&mut keys, key)?;
        let current = match hash.get(field) {
            None => 0,
            Some(raw) => raw.parse::<i64>().map_err(|_| {
                BackendError::Command(format!("hash value at {key}.{field} is not an integer"))
            })?,
        };
        let next = current + delta;
        hash.insert(field.to_string(), next.to_string());
        Ok(next)
    }
}
