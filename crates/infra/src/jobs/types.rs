//! Core job types and policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use agentq_core::{JobId, JobStatus};

/// Error codes stored in [`JobError::code`].
pub mod error_codes {
    /// Hard wall-clock timeout; the child process was killed.
    pub const TIMEOUT: &str = "timeout";
    /// The child process exited (or could not start) without returning a message.
    pub const WORKER_ERROR: &str = "worker_error";
    /// Transient failure; the job sits in the delayed queue awaiting retry.
    pub const RETRY_SCHEDULED: &str = "retry_scheduled";
    /// Permanent agent failure, or transient failures with attempts exhausted.
    pub const AGENT_FAILED: &str = "agent_failed";
    /// Cancellation was requested before the job was executed.
    pub const CANCELLED: &str = "cancelled";
    /// The stored error blob could not be decoded.
    pub const PARSE_ERROR: &str = "parse_error";
}

/// Structured error attached to a job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub details: JsonValue,
}

impl JobError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: JsonValue::Null,
        }
    }

    pub fn with_details(mut self, details: JsonValue) -> Self {
        self.details = details;
        self
    }

    pub fn is(&self, code: &str) -> bool {
        self.code == code
    }
}

/// One unit of work, as stored in the job record store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: JobId,
    /// Name of the agent that executes the payload.
    pub agent: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub max_attempts: u32,
    /// Immutable agent input, set at creation.
    pub payload: JsonValue,
    /// Agent output; only set on success.
    pub result: Option<JsonValue>,
    pub error: Option<JobError>,
    /// Advisory flag, observed only when the job is claimed.
    pub cancel_requested: bool,
}

/// Input to [`JobStore::create`](super::store::JobStore::create).
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub agent: String,
    pub payload: JsonValue,
    pub idempotency_key: Option<String>,
    pub max_attempts: u32,
}

impl NewJob {
    pub fn new(agent: impl Into<String>, payload: JsonValue) -> Self {
        Self {
            agent: agent.into(),
            payload,
            idempotency_key: None,
            max_attempts: RetryPolicy::default().max_attempts,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

/// Outcome of [`JobStore::create`](super::store::JobStore::create).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreatedJob {
    pub job_id: JobId,
    /// `true` when an idempotency key matched an existing job; nothing was written
    /// and the caller must not enqueue again.
    pub reused: bool,
}

/// Retry policy configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Default attempt ceiling for new jobs.
    pub max_attempts: u32,
    /// Maximum delay cap.
    pub backoff_cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_cap: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff_cap: Duration) -> Self {
        Self {
            max_attempts,
            backoff_cap,
        }
    }

    /// Delay before the retry that follows attempt `attempt` (1-indexed):
    /// `min(cap, 2^(attempt-1))` seconds.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let secs = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
        Duration::from_secs(secs).min(self.backoff_cap)
    }

    /// Check if more attempts are allowed.
    pub fn should_retry(attempt: u32, max_attempts: u32) -> bool {
        attempt < max_attempts
    }
}
