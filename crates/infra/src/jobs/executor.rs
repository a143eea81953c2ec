//! Worker execution loop with retry and backoff logic.
//!
//! A worker owns no job state in memory: every decision is read from and
//! written to the job record store, so any number of workers can compete for
//! the same queue. Each worker runs at most one child process at a time.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::json;
use tracing::{debug, error, info, warn};

use agentq_core::{JobId, JobStatus};

use super::classify::{ErrorClassifier, HandlerFailure, MarkerClassifier};
use super::heartbeat::Heartbeat;
use super::isolation::{JobRunner, RunOutcome};
use super::queue::{DEFAULT_DEQUEUE_BLOCK, DEFAULT_PUMP_LIMIT, JobQueue, QueueError};
use super::store::{JobStore, JobStoreError, Stamp};
use super::types::{JobError, JobRecord, RetryPolicy, error_codes};

/// Default hard wall-clock limit per attempt.
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(60);

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Hard limit for one attempt; the child is killed when it passes.
    pub job_timeout: Duration,
    /// How long one claim blocks on an empty queue.
    pub dequeue_block: Duration,
    /// Delayed entries promoted per iteration.
    pub pump_limit: usize,
    /// Cap for the exponential retry backoff.
    pub backoff_cap: Duration,
    /// Pause after an iteration that found no work.
    pub idle_sleep: Duration,
    /// Pause after an iteration that failed on the store.
    pub error_sleep: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            job_timeout: DEFAULT_JOB_TIMEOUT,
            dequeue_block: DEFAULT_DEQUEUE_BLOCK,
            pump_limit: DEFAULT_PUMP_LIMIT,
            backoff_cap: RetryPolicy::default().backoff_cap,
            idle_sleep: Duration::from_millis(200),
            error_sleep: Duration::from_secs(1),
        }
    }
}

impl WorkerConfig {
    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_dequeue_block(mut self, block: Duration) -> Self {
        self.dequeue_block = block;
        self
    }

    pub fn with_pump_limit(mut self, limit: usize) -> Self {
        self.pump_limit = limit;
        self
    }

    pub fn with_backoff_cap(mut self, cap: Duration) -> Self {
        self.backoff_cap = cap;
        self
    }

    pub fn with_idle_sleep(mut self, sleep: Duration) -> Self {
        self.idle_sleep = sleep;
        self
    }
}

/// Store or queue failure inside one iteration. Agent failures never surface
/// here; they are recorded on the job.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Store(#[from] JobStoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("failed to start worker thread: {0}")]
    Spawn(#[from] io::Error),
}

/// What one [`Worker::process_one`] call did.
#[derive(Debug, Clone, PartialEq)]
pub enum Processed {
    /// Nothing to claim.
    Idle,
    /// Claimed an id that was missing, corrupt or not queued.
    Skipped(JobId),
    Cancelled(JobId),
    Succeeded(JobId),
    RetryScheduled { job_id: JobId, delay: Duration },
    /// Terminal failure; `code` is the stored error code.
    Failed { job_id: JobId, code: &'static str },
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct WorkerStats {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retried: u64,
    pub cancelled: u64,
    pub timed_out: u64,
    pub skipped: u64,
    pub uptime_secs: u64,
}

impl WorkerStats {
    fn record(&mut self, processed: &Processed) {
        match processed {
            Processed::Idle => return,
            Processed::Skipped(_) => self.skipped += 1,
            Processed::Cancelled(_) => self.cancelled += 1,
            Processed::Succeeded(_) => self.succeeded += 1,
            Processed::RetryScheduled { .. } => self.retried += 1,
            Processed::Failed { code, .. } => {
                self.failed += 1;
                if *code == error_codes::TIMEOUT {
                    self.timed_out += 1;
                }
            }
        }
        self.processed += 1;
    }
}

/// Handle to control a worker running on a background thread.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: Arc<AtomicBool>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerHandle {
    /// Request graceful shutdown and wait for the current iteration to finish.
    pub fn shutdown(mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Competing consumer over one queue.
pub struct Worker<R: JobRunner> {
    store: JobStore,
    queue: JobQueue,
    heartbeat: Heartbeat,
    runner: R,
    classifier: Arc<dyn ErrorClassifier>,
    retry: RetryPolicy,
    config: WorkerConfig,
    stats: Arc<Mutex<WorkerStats>>,
}

impl<R: JobRunner> core::fmt::Debug for Worker<R> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Worker")
            .field("worker_id", self.heartbeat.worker_id())
            .field("queue", &self.queue.name())
            .field("config", &self.config)
            .finish()
    }
}

impl<R: JobRunner + 'static> Worker<R> {
    pub fn new(
        store: JobStore,
        queue: JobQueue,
        heartbeat: Heartbeat,
        runner: R,
        config: WorkerConfig,
    ) -> Self {
        let retry = RetryPolicy {
            backoff_cap: config.backoff_cap,
            ..RetryPolicy::default()
        };
        Self {
            store,
            queue,
            heartbeat,
            runner,
            classifier: Arc::new(MarkerClassifier::default()),
            retry,
            config,
            stats: Arc::new(Mutex::new(WorkerStats::default())),
        }
    }

    /// Replace the default transient-error heuristic.
    pub fn with_classifier(mut self, classifier: impl ErrorClassifier + 'static) -> Self {
        self.classifier = Arc::new(classifier);
        self
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// One full iteration: promote, claim, execute, record.
    pub fn process_one(&self) -> Result<Processed, WorkerError> {
        let processed = self.iterate()?;
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(&processed);
        Ok(processed)
    }

    fn iterate(&self) -> Result<Processed, WorkerError> {
        self.queue.pump_delayed(self.config.pump_limit)?;

        let Some(job_id) = self.queue.dequeue(self.config.dequeue_block)? else {
            self.heartbeat.beat(None)?;
            return Ok(Processed::Idle);
        };
        self.heartbeat.beat(Some(&job_id))?;

        let job = match self.store.get(&job_id) {
            Ok(Some(job)) => job,
            Ok(None) => {
                warn!(job_id = %job_id, "claimed job has no record; skipping");
                return Ok(Processed::Skipped(job_id));
            }
            Err(e @ JobStoreError::Corrupt { .. }) => {
                warn!(job_id = %job_id, error = %e, "claimed job record is corrupt; skipping");
                return Ok(Processed::Skipped(job_id));
            }
            Err(e) => return Err(e.into()),
        };

        if job.status != JobStatus::Queued {
            warn!(job_id = %job_id, status = %job.status, "claimed job is not queued; skipping");
            return Ok(Processed::Skipped(job_id));
        }

        if job.cancel_requested {
            self.store
                .update_status(&job_id, JobStatus::Cancelled, Stamp::Finished)?;
            self.store.set_error(
                &job_id,
                &JobError::new(error_codes::CANCELLED, "cancelled before execution"),
            )?;
            info!(job_id = %job_id, agent = %job.agent, "job cancelled");
            return Ok(Processed::Cancelled(job_id));
        }

        self.store
            .update_status(&job_id, JobStatus::Running, Stamp::Started)?;
        let attempt = self.store.increment_attempts(&job_id)?;
        info!(
            job_id = %job_id,
            agent = %job.agent,
            attempt,
            max_attempts = job.max_attempts,
            "job started"
        );

        let started = Instant::now();
        let outcome = thread::scope(|scope| {
            let (stop, stopped) = mpsc::channel::<()>();
            let heartbeat = &self.heartbeat;
            // Attempts can outlive the heartbeat TTL.
            scope.spawn(move || {
                while let Err(RecvTimeoutError::Timeout) =
                    stopped.recv_timeout(heartbeat.refresh_interval())
                {
                    if let Err(e) = heartbeat.beat(Some(&job_id)) {
                        warn!(job_id = %job_id, error = %e, "heartbeat refresh failed");
                    }
                }
            });
            let outcome = self
                .runner
                .run(&job.agent, &job.payload, self.config.job_timeout);
            drop(stop);
            outcome
        });
        debug!(job_id = %job_id, elapsed_ms = started.elapsed().as_millis() as u64, "attempt finished");

        self.record_outcome(&job, attempt, outcome)
    }

    fn record_outcome(
        &self,
        job: &JobRecord,
        attempt: u32,
        outcome: RunOutcome,
    ) -> Result<Processed, WorkerError> {
        let job_id = job.job_id;
        match outcome {
            RunOutcome::Succeeded(result) => {
                self.store.set_result(&job_id, &result)?;
                self.store
                    .update_status(&job_id, JobStatus::Succeeded, Stamp::Finished)?;
                info!(job_id = %job_id, attempt, "job succeeded");
                Ok(Processed::Succeeded(job_id))
            }
            RunOutcome::TimedOut => {
                let message = format!(
                    "job exceeded {}s and was terminated",
                    self.config.job_timeout.as_secs_f64()
                );
                self.fail(job_id, JobError::new(error_codes::TIMEOUT, message))
            }
            RunOutcome::NoResult { detail } => self.fail(
                job_id,
                JobError::new(
                    error_codes::WORKER_ERROR,
                    "worker finished without returning a result",
                )
                .with_details(json!({ "detail": detail })),
            ),
            RunOutcome::Failed(failure) => {
                if self.classifier.is_transient(&failure)
                    && RetryPolicy::should_retry(attempt, job.max_attempts)
                {
                    self.schedule_retry(job, attempt, failure)
                } else {
                    self.fail(
                        job_id,
                        JobError::new(error_codes::AGENT_FAILED, failure.message.clone())
                            .with_details(json!({
                                "err_type": failure.error_type,
                                "trace": failure.trace,
                                "attempt": attempt,
                            })),
                    )
                }
            }
        }
    }

    fn schedule_retry(
        &self,
        job: &JobRecord,
        attempt: u32,
        failure: HandlerFailure,
    ) -> Result<Processed, WorkerError> {
        let job_id = job.job_id;
        let delay = self.retry.delay_for_attempt(attempt);
        let error = JobError::new(
            error_codes::RETRY_SCHEDULED,
            format!(
                "transient error; retrying in {:.1}s (attempt {attempt}/{})",
                delay.as_secs_f64(),
                job.max_attempts
            ),
        )
        .with_details(json!({
            "err_type": failure.error_type,
            "message": failure.message,
            "attempt": attempt,
            "max_attempts": job.max_attempts,
            "delay_seconds": delay.as_secs_f64(),
        }));

        // Record first: once the id is in the delayed set another worker may
        // claim it, and it must find the job queued.
        self.store.set_error(&job_id, &error)?;
        self.store
            .update_status(&job_id, JobStatus::Queued, Stamp::None)?;
        self.queue.schedule_delayed(&job_id, delay)?;

        warn!(
            job_id = %job_id,
            attempt,
            max_attempts = job.max_attempts,
            delay_secs = delay.as_secs_f64(),
            err_type = %failure.error_type,
            "transient failure; retry scheduled"
        );
        Ok(Processed::RetryScheduled { job_id, delay })
    }

    fn fail(&self, job_id: JobId, error: JobError) -> Result<Processed, WorkerError> {
        let code = match error.code.as_str() {
            error_codes::TIMEOUT => error_codes::TIMEOUT,
            error_codes::WORKER_ERROR => error_codes::WORKER_ERROR,
            _ => error_codes::AGENT_FAILED,
        };
        self.store.set_error(&job_id, &error)?;
        self.store
            .update_status(&job_id, JobStatus::Failed, Stamp::Finished)?;
        warn!(job_id = %job_id, code, message = %error.message, "job failed");
        Ok(Processed::Failed { job_id, code })
    }

    /// Loop until `shutdown` is set. Store errors are logged and retried after
    /// `error_sleep`.
    pub fn run_until(&self, shutdown: &AtomicBool) {
        info!(
            worker_id = %self.heartbeat.worker_id(),
            queue = %self.queue.name(),
            "worker started"
        );
        let start_time = Instant::now();

        while !shutdown.load(Ordering::SeqCst) {
            match self.process_one() {
                Ok(Processed::Idle) => thread::sleep(self.config.idle_sleep),
                Ok(_) => {}
                Err(e) => {
                    error!(worker_id = %self.heartbeat.worker_id(), error = %e, "worker iteration failed");
                    thread::sleep(self.config.error_sleep);
                }
            }
            self.stats
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .uptime_secs = start_time.elapsed().as_secs();
        }

        info!(worker_id = %self.heartbeat.worker_id(), "worker stopped");
    }

    /// Run the loop on a background thread.
    pub fn spawn(self) -> Result<WorkerHandle, WorkerError> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let stats = self.stats.clone();
        let flag = shutdown.clone();

        let join = thread::Builder::new()
            .name(format!("worker-{}", self.heartbeat.worker_id()))
            .spawn(move || self.run_until(&flag))?;

        Ok(WorkerHandle {
            shutdown,
            join: Some(join),
            stats,
        })
    }
}
