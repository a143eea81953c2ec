//! Job record store.
//!
//! One hash per job (`{prefix}:job:{id}`), TTL'd at creation, plus an
//! idempotency index (`{prefix}:idem:{agent}:{key}` → job id) with its own,
//! shorter TTL. Records are never deleted explicitly; they expire.
//!
//! Every mutation is a partial write of the fields it owns, so the worker's
//! status updates and an operator's cancel request never clobber each other.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Value as JsonValue, json};
use tracing::{debug, warn};

use agentq_core::{DomainError, JobId, JobStatus};

use super::types::{CreatedJob, JobError, JobRecord, NewJob, error_codes};
use crate::backend::{BackendError, Keyspace, SharedBackend};

/// Hash field names.
mod field {
    pub const JOB_ID: &str = "job_id";
    pub const AGENT: &str = "agent";
    pub const STATUS: &str = "status";
    pub const CREATED_AT: &str = "created_at";
    pub const STARTED_AT: &str = "started_at";
    pub const FINISHED_AT: &str = "finished_at";
    pub const ATTEMPTS: &str = "attempts";
    pub const MAX_ATTEMPTS: &str = "max_attempts";
    pub const PAYLOAD: &str = "payload";
    pub const RESULT: &str = "result";
    pub const ERROR: &str = "error";
    pub const CANCEL_REQUESTED: &str = "cancel_requested";
}

/// Default record TTL (7 days).
pub const DEFAULT_JOB_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Default idempotency index TTL (1 day).
pub const DEFAULT_IDEMPOTENCY_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("invalid job: {0}")]
    Validation(String),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("corrupt job record {job_id}: field {field}: {reason}")]
    Corrupt {
        job_id: JobId,
        field: &'static str,
        reason: String,
    },

    #[error("idempotency key {0} could not be claimed or resolved")]
    IdempotencyConflict(String),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

pub type JobStoreResult<T> = Result<T, JobStoreError>;

/// Which lifecycle timestamp a status change stamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stamp {
    None,
    /// Set `started_at` (only if not already set).
    Started,
    /// Set `finished_at` (only if not already set).
    Finished,
}

/// Durable, addressable job records on top of a [`Backend`](crate::backend::Backend).
#[derive(Clone)]
pub struct JobStore {
    backend: SharedBackend,
    keys: Keyspace,
    job_ttl: Duration,
    idempotency_ttl: Duration,
}

impl core::fmt::Debug for JobStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobStore")
            .field("keys", &self.keys)
            .field("job_ttl", &self.job_ttl)
            .field("idempotency_ttl", &self.idempotency_ttl)
            .finish()
    }
}

impl JobStore {
    pub fn new(backend: SharedBackend, keys: Keyspace) -> Self {
        Self {
            backend,
            keys,
            job_ttl: DEFAULT_JOB_TTL,
            idempotency_ttl: DEFAULT_IDEMPOTENCY_TTL,
        }
    }

    /// Set both TTLs. The idempotency TTL is clamped to the record TTL so an index
    /// entry never outlives the job it points at.
    pub fn with_ttls(mut self, job_ttl: Duration, idempotency_ttl: Duration) -> Self {
        self.job_ttl = job_ttl;
        self.idempotency_ttl = idempotency_ttl.min(job_ttl);
        self
    }

    pub fn job_ttl(&self) -> Duration {
        self.job_ttl
    }

    pub fn idempotency_ttl(&self) -> Duration {
        self.idempotency_ttl
    }

    /// Create a job, or return the live job registered under the same
    /// `(agent, idempotency_key)`.
    ///
    /// The index entry is claimed with `SET NX` before the record is written, so
    /// concurrent submissions with one key agree on a single job id. Enqueueing is
    /// the caller's job, and must be skipped when `reused` is set.
    pub fn create(&self, new: &NewJob) -> JobStoreResult<CreatedJob> {
        if new.agent.trim().is_empty() {
            return Err(JobStoreError::Validation("agent must not be empty".into()));
        }
        if new.max_attempts == 0 {
            return Err(JobStoreError::Validation("max_attempts must be at least 1".into()));
        }

        let job_id = JobId::new();

        if let Some(idempotency_key) = &new.idempotency_key {
            if idempotency_key.is_empty() {
                return Err(JobStoreError::Validation("idempotency key must not be empty".into()));
            }
            if let Some(existing) = self.claim_idempotency_key(&new.agent, idempotency_key, job_id)? {
                debug!(job_id = %existing, agent = %new.agent, "idempotency key matched existing job");
                return Ok(CreatedJob {
                    job_id: existing,
                    reused: true,
                });
            }
        }

        let key = self.keys.job(&job_id);
        self.backend.hset(
            &key,
            &[
                (field::JOB_ID, job_id.to_string()),
                (field::AGENT, new.agent.clone()),
                (field::STATUS, JobStatus::Queued.as_str().to_string()),
                (field::CREATED_AT, Utc::now().to_rfc3339()),
                (field::ATTEMPTS, "0".to_string()),
                (field::MAX_ATTEMPTS, new.max_attempts.to_string()),
                (field::PAYLOAD, encode(&new.payload)?),
                (field::CANCEL_REQUESTED, "0".to_string()),
            ],
        )?;
        self.backend.expire(&key, self.job_ttl)?;

        debug!(job_id = %job_id, agent = %new.agent, "job created");
        Ok(CreatedJob {
            job_id,
            reused: false,
        })
    }

    /// Returns `Some(existing)` if another job already owns the key.
    fn claim_idempotency_key(
        &self,
        agent: &str,
        idempotency_key: &str,
        job_id: JobId,
    ) -> JobStoreResult<Option<JobId>> {
        let key = self.keys.idempotency(agent, idempotency_key);
        // Two rounds: the winner's entry may expire between our SET NX and GET.
        for _ in 0..2 {
            if self
                .backend
                .set_nx_ex(&key, &job_id.to_string(), self.idempotency_ttl)?
            {
                return Ok(None);
            }
            if let Some(raw) = self.backend.get(&key)? {
                let existing = raw.parse::<JobId>().map_err(|e| {
                    JobStoreError::IdempotencyConflict(format!("{key}: {e}"))
                })?;
                return Ok(Some(existing));
            }
        }
        Err(JobStoreError::IdempotencyConflict(key))
    }

    /// Load a job record. `Ok(None)` when it does not exist (or has expired).
    ///
    /// Corrupt `result`/`error` blobs decode to sentinels rather than failing.
    pub fn get(&self, job_id: &JobId) -> JobStoreResult<Option<JobRecord>> {
        let fields = self.backend.hgetall(&self.keys.job(job_id))?;
        if fields.is_empty() {
            return Ok(None);
        }
        decode_record(*job_id, &fields).map(Some)
    }

    /// Current status only.
    pub fn status(&self, job_id: &JobId) -> JobStoreResult<JobStatus> {
        let raw = self
            .backend
            .hget(&self.keys.job(job_id), field::STATUS)?
            .ok_or(JobStoreError::NotFound(*job_id))?;
        raw.parse::<JobStatus>()
            .map_err(|e| JobStoreError::Corrupt {
                job_id: *job_id,
                field: field::STATUS,
                reason: e.to_string(),
            })
    }

    /// Move a job to `next`, validating the transition.
    ///
    /// Lifecycle timestamps are written with `HSETNX`, so `started_at` and
    /// `finished_at` keep their first value across retries.
    pub fn update_status(&self, job_id: &JobId, next: JobStatus, stamp: Stamp) -> JobStoreResult<()> {
        let current = self.status(job_id)?;
        current.transition_to(next)?;

        let key = self.keys.job(job_id);
        self.backend
            .hset(&key, &[(field::STATUS, next.as_str().to_string())])?;
        match stamp {
            Stamp::None => {}
            Stamp::Started => {
                self.backend
                    .hsetnx(&key, field::STARTED_AT, &Utc::now().to_rfc3339())?;
            }
            Stamp::Finished => {
                self.backend
                    .hsetnx(&key, field::FINISHED_AT, &Utc::now().to_rfc3339())?;
            }
        }
        debug!(job_id = %job_id, from = %current, to = %next, "job status updated");
        Ok(())
    }

    /// Atomically bump the attempt counter; returns the new count.
    pub fn increment_attempts(&self, job_id: &JobId) -> JobStoreResult<u32> {
        self.ensure_exists(job_id)?;
        let attempts = self
            .backend
            .hincrby(&self.keys.job(job_id), field::ATTEMPTS, 1)?;
        Ok(u32::try_from(attempts).unwrap_or(u32::MAX))
    }

    pub fn set_result(&self, job_id: &JobId, result: &JsonValue) -> JobStoreResult<()> {
        self.ensure_exists(job_id)?;
        self.backend
            .hset(&self.keys.job(job_id), &[(field::RESULT, encode(result)?)])?;
        Ok(())
    }

    pub fn set_error(&self, job_id: &JobId, error: &JobError) -> JobStoreResult<()> {
        self.ensure_exists(job_id)?;
        let blob = serde_json::to_string(error)
            .map_err(|e| BackendError::Serialization(e.to_string()))?;
        self.backend
            .hset(&self.keys.job(job_id), &[(field::ERROR, blob)])?;
        Ok(())
    }

    /// Set the advisory cancellation flag. Touches nothing else.
    pub fn request_cancel(&self, job_id: &JobId) -> JobStoreResult<()> {
        self.ensure_exists(job_id)?;
        self.backend
            .hset(&self.keys.job(job_id), &[(field::CANCEL_REQUESTED, "1".to_string())])?;
        Ok(())
    }

    fn ensure_exists(&self, job_id: &JobId) -> JobStoreResult<()> {
        match self.backend.hget(&self.keys.job(job_id), field::STATUS)? {
            Some(_) => Ok(()),
            None => Err(JobStoreError::NotFound(*job_id)),
        }
    }
}

fn encode(value: &JsonValue) -> Result<String, BackendError> {
    serde_json::to_string(value).map_err(|e| BackendError::Serialization(e.to_string()))
}

fn decode_record(job_id: JobId, fields: &HashMap<String, String>) -> JobStoreResult<JobRecord> {
    let corrupt = |field: &'static str, reason: String| JobStoreError::Corrupt {
        job_id,
        field,
        reason,
    };
    let required = |name: &'static str| {
        fields
            .get(name)
            .ok_or_else(|| corrupt(name, "missing".to_string()))
    };

    let status = required(field::STATUS)?
        .parse::<JobStatus>()
        .map_err(|e| corrupt(field::STATUS, e.to_string()))?;
    let created_at = parse_time(required(field::CREATED_AT)?)
        .ok_or_else(|| corrupt(field::CREATED_AT, "not an RFC 3339 timestamp".to_string()))?;
    let payload = serde_json::from_str(required(field::PAYLOAD)?)
        .map_err(|e| corrupt(field::PAYLOAD, e.to_string()))?;

    Ok(JobRecord {
        job_id,
        agent: fields.get(field::AGENT).cloned().unwrap_or_default(),
        status,
        created_at,
        started_at: optional_time(job_id, fields, field::STARTED_AT),
        finished_at: optional_time(job_id, fields, field::FINISHED_AT),
        attempts: parse_count(fields, field::ATTEMPTS, 0),
        max_attempts: parse_count(fields, field::MAX_ATTEMPTS, 1),
        payload,
        result: fields.get(field::RESULT).map(|raw| decode_result(job_id, raw)),
        error: fields.get(field::ERROR).map(|raw| decode_error(job_id, raw)),
        cancel_requested: matches!(
            fields.get(field::CANCEL_REQUESTED).map(String::as_str),
            Some("1" | "true")
        ),
    })
}

fn parse_time(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn optional_time(
    job_id: JobId,
    fields: &HashMap<String, String>,
    name: &'static str,
) -> Option<DateTime<Utc>> {
    let raw = fields.get(name)?;
    let parsed = parse_time(raw);
    if parsed.is_none() {
        warn!(job_id = %job_id, field = name, raw = %raw, "unparsable timestamp in job record");
    }
    parsed
}

fn parse_count(fields: &HashMap<String, String>, name: &str, default: u32) -> u32 {
    fields
        .get(name)
        .and_then(|raw| raw.parse::<u32>().ok())
        .unwrap_or(default)
}

fn decode_result(job_id: JobId, raw: &str) -> JsonValue {
    serde_json::from_str(raw).unwrap_or_else(|e| {
        warn!(job_id = %job_id, error = %e, "failed to parse stored job result");
        json!({ "parse_error": "failed to parse stored result" })
    })
}

fn decode_error(job_id: JobId, raw: &str) -> JobError {
    serde_json::from_str(raw).unwrap_or_else(|e| {
        warn!(job_id = %job_id, error = %e, "failed to parse stored job error");
        JobError::new(error_codes::PARSE_ERROR, "failed to parse stored error")
            .with_details(json!({ "raw": raw }))
    })
}
