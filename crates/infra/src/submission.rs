//! Submission contract: the operations an outer API layer exposes to callers.

use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use agentq_agents::{AgentMetadata, AgentRegistry, SelfTestReport};
use agentq_core::{JobId, JobStatus};

use crate::backend::{Keyspace, SharedBackend};
use crate::jobs::queue::{JobQueue, QueueError};
use crate::jobs::store::{JobStore, JobStoreError};
use crate::jobs::types::{JobError, JobRecord, NewJob, RetryPolicy};

/// Interval between status reads while waiting for a job.
pub const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Queue used when a request names none.
pub const DEFAULT_QUEUE: &str = "default";

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("unknown agent: {name}")]
    UnknownAgent { name: String, known: Vec<String> },

    #[error("invalid submission: {0}")]
    Validation(String),

    #[error("unknown job id: {0}")]
    NotFound(JobId),

    #[error(transparent)]
    Store(JobStoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl From<JobStoreError> for SubmitError {
    fn from(err: JobStoreError) -> Self {
        match err {
            JobStoreError::NotFound(job_id) => SubmitError::NotFound(job_id),
            JobStoreError::Validation(msg) => SubmitError::Validation(msg),
            other => SubmitError::Store(other),
        }
    }
}

/// A job submission.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub agent: String,
    pub payload: JsonValue,
    pub idempotency_key: Option<String>,
    /// Falls back to the service default.
    pub max_attempts: Option<u32>,
    /// Falls back to the service default.
    pub queue: Option<String>,
    /// Block until the job is terminal or this much time has passed.
    pub wait: Option<Duration>,
}

impl SubmitRequest {
    pub fn new(agent: impl Into<String>, payload: JsonValue) -> Self {
        Self {
            agent: agent.into(),
            payload,
            idempotency_key: None,
            max_attempts: None,
            queue: None,
            wait: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn wait_for(mut self, timeout: Duration) -> Self {
        self.wait = Some(timeout);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmitResponse {
    pub job_id: JobId,
    /// An idempotency key matched an existing job.
    pub reused: bool,
    pub status: JobStatus,
}

/// Caller-safe projection of a job record. Never includes the payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobView {
    pub job_id: JobId,
    pub agent: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub cancel_requested: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JsonValue>,
    pub error: Option<JobError>,
}

impl JobView {
    fn project(job: JobRecord, include_result: bool) -> Self {
        Self {
            job_id: job.job_id,
            agent: job.agent,
            status: job.status,
            created_at: job.created_at,
            started_at: job.started_at,
            finished_at: job.finished_at,
            attempts: job.attempts,
            max_attempts: job.max_attempts,
            cancel_requested: job.cancel_requested,
            result: if include_result { job.result } else { None },
            error: job.error,
        }
    }
}

/// Queue health. Depths are `None` when the backend is unreachable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueHealth {
    pub queue: String,
    pub depth: Option<u64>,
    pub delayed_depth: Option<u64>,
    pub backend_ok: bool,
}

/// Submit, inspect and cancel jobs.
#[derive(Clone)]
pub struct JobService {
    backend: SharedBackend,
    keys: Keyspace,
    store: JobStore,
    registry: Option<AgentRegistry>,
    default_queue: String,
    default_max_attempts: u32,
    poll_interval: Duration,
}

impl core::fmt::Debug for JobService {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobService")
            .field("store", &self.store)
            .field("registry", &self.registry)
            .field("default_queue", &self.default_queue)
            .field("default_max_attempts", &self.default_max_attempts)
            .finish()
    }
}

impl JobService {
    pub fn new(backend: SharedBackend, keys: Keyspace, store: JobStore) -> Self {
        Self {
            backend,
            keys,
            store,
            registry: None,
            default_queue: DEFAULT_QUEUE.to_string(),
            default_max_attempts: RetryPolicy::default().max_attempts,
            poll_interval: WAIT_POLL_INTERVAL,
        }
    }

    /// Reject submissions for agents the registry does not know.
    pub fn with_registry(mut self, registry: AgentRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_default_queue(mut self, queue: impl Into<String>) -> Self {
        self.default_queue = queue.into();
        self
    }

    pub fn with_default_max_attempts(mut self, max_attempts: u32) -> Self {
        self.default_max_attempts = max_attempts;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub fn queue(&self, name: &str) -> JobQueue {
        JobQueue::new(self.backend.clone(), &self.keys, name)
    }

    /// Create and enqueue a job. A reused job is never enqueued again.
    pub fn submit(&self, request: SubmitRequest) -> Result<SubmitResponse, SubmitError> {
        if let Some(registry) = &self.registry {
            if !registry.contains(&request.agent) {
                return Err(SubmitError::UnknownAgent {
                    name: request.agent,
                    known: registry.names(),
                });
            }
        }
        let max_attempts = request.max_attempts.unwrap_or(self.default_max_attempts);
        if max_attempts == 0 {
            return Err(SubmitError::Validation("max_attempts must be at least 1".into()));
        }

        let mut new = NewJob::new(request.agent.clone(), request.payload)
            .with_max_attempts(max_attempts);
        if let Some(key) = request.idempotency_key {
            new = new.with_idempotency_key(key);
        }

        let created = self.store.create(&new)?;
        let queue_name = request.queue.as_deref().unwrap_or(&self.default_queue);
        if created.reused {
            info!(job_id = %created.job_id, agent = %request.agent, "submission reused existing job");
        } else {
            self.queue(queue_name).enqueue(&created.job_id)?;
            info!(job_id = %created.job_id, agent = %request.agent, queue = %queue_name, "job submitted");
        }

        // A reused id can point at a record its creator has not written yet.
        let status = match request.wait {
            Some(timeout) => self.poll(&created.job_id, timeout, created.reused)?,
            None if created.reused => self.current_status(&created.job_id, true)?,
            None => JobStatus::Queued,
        };

        Ok(SubmitResponse {
            job_id: created.job_id,
            reused: created.reused,
            status,
        })
    }

    /// Poll until the job is terminal or `timeout` passes; returns the last
    /// observed status either way.
    pub fn wait(&self, job_id: &JobId, timeout: Duration) -> Result<JobStatus, SubmitError> {
        self.poll(job_id, timeout, false)
    }

    fn poll(
        &self,
        job_id: &JobId,
        timeout: Duration,
        missing_is_queued: bool,
    ) -> Result<JobStatus, SubmitError> {
        // A timeout past the end of `Instant` waits for a terminal status.
        let deadline = Instant::now().checked_add(timeout);
        loop {
            let status = self.current_status(job_id, missing_is_queued)?;
            if status.is_terminal() {
                return Ok(status);
            }
            let pause = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        debug!(job_id = %job_id, status = %status, "wait deadline passed");
                        return Ok(status);
                    }
                    self.poll_interval.min(deadline - now)
                }
                None => self.poll_interval,
            };
            thread::sleep(pause);
        }
    }

    fn current_status(
        &self,
        job_id: &JobId,
        missing_is_queued: bool,
    ) -> Result<JobStatus, SubmitError> {
        match self.store.status(job_id) {
            Err(JobStoreError::NotFound(_)) if missing_is_queued => Ok(JobStatus::Queued),
            other => Ok(other?),
        }
    }

    pub fn status(&self, job_id: &JobId, include_result: bool) -> Result<JobView, SubmitError> {
        let job = self
            .store
            .get(job_id)?
            .ok_or(SubmitError::NotFound(*job_id))?;
        Ok(JobView::project(job, include_result))
    }

    /// Advisory: the flag is only honored when a worker claims the job.
    pub fn cancel(&self, job_id: &JobId) -> Result<(), SubmitError> {
        self.store.request_cancel(job_id)?;
        info!(job_id = %job_id, "cancellation requested");
        Ok(())
    }

    pub fn health(&self, queue: &str) -> QueueHealth {
        let backend_ok = match self.backend.ping() {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "backend ping failed");
                false
            }
        };
        let queue_handle = self.queue(queue);
        let (depth, delayed_depth) = if backend_ok {
            (
                queue_handle.queue_depth().ok(),
                queue_handle.delayed_depth().ok(),
            )
        } else {
            (None, None)
        };
        QueueHealth {
            queue: queue.to_string(),
            depth,
            delayed_depth,
            backend_ok,
        }
    }

    pub fn agents(&self) -> Vec<AgentMetadata> {
        self.registry
            .as_ref()
            .map(AgentRegistry::list)
            .unwrap_or_default()
    }

    pub fn agent_health(&self) -> Vec<SelfTestReport> {
        self.registry
            .as_ref()
            .map(AgentRegistry::health)
            .unwrap_or_default()
    }
}
