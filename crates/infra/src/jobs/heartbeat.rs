//! Worker liveness records.
//!
//! Each worker periodically overwrites `{prefix}:worker:{id}` with a JSON blob
//! and a short TTL. A worker that stops beating simply disappears.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use agentq_core::{JobId, WorkerId};

use crate::backend::{BackendError, BackendResult, Keyspace, SharedBackend, now_unix};

/// Default heartbeat TTL.
pub const DEFAULT_HEARTBEAT_TTL: Duration = Duration::from_secs(30);

const MIN_REFRESH_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatRecord {
    pub worker_id: WorkerId,
    pub ts_unix: f64,
    pub hostname: String,
    pub pid: u32,
    /// Job being executed at the time of the beat, if any.
    pub current_job: Option<JobId>,
    /// Agents this worker can run.
    pub agents: Vec<String>,
}

#[derive(Clone)]
pub struct Heartbeat {
    backend: SharedBackend,
    keys: Keyspace,
    worker_id: WorkerId,
    hostname: String,
    agents: Vec<String>,
    ttl: Duration,
}

impl core::fmt::Debug for Heartbeat {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Heartbeat")
            .field("worker_id", &self.worker_id)
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl Heartbeat {
    pub fn new(
        backend: SharedBackend,
        keys: Keyspace,
        worker_id: WorkerId,
        agents: Vec<String>,
    ) -> Self {
        Self {
            backend,
            keys,
            worker_id,
            hostname: hostname(),
            agents,
            ttl: DEFAULT_HEARTBEAT_TTL,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    /// How often to beat so the record never lapses: a third of the TTL.
    pub fn refresh_interval(&self) -> Duration {
        (self.ttl / 3).max(MIN_REFRESH_INTERVAL)
    }

    pub fn beat(&self, current_job: Option<&JobId>) -> BackendResult<()> {
        let record = HeartbeatRecord {
            worker_id: self.worker_id.clone(),
            ts_unix: now_unix(),
            hostname: self.hostname.clone(),
            pid: std::process::id(),
            current_job: current_job.copied(),
            agents: self.agents.clone(),
        };
        let blob = serde_json::to_string(&record)
            .map_err(|e| BackendError::Serialization(e.to_string()))?;
        self.backend
            .set_ex(&self.keys.worker(&self.worker_id), &blob, self.ttl)
    }

    /// Read any worker's last heartbeat; `None` if absent or expired.
    pub fn read(
        backend: &SharedBackend,
        keys: &Keyspace,
        worker_id: &WorkerId,
    ) -> BackendResult<Option<HeartbeatRecord>> {
        let Some(raw) = backend.get(&keys.worker(worker_id))? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| BackendError::Serialization(e.to_string()))
    }
}

/// Host name of this machine, or `"unknown"`.
pub fn hostname() -> String {
    #[cfg(unix)]
    {
        match nix::unistd::gethostname() {
            Ok(name) => return name.to_string_lossy().into_owned(),
            Err(e) => warn!(error = %e, "gethostname failed"),
        }
    }
    "unknown".to_string()
}
