//! Agent job system with isolation, retry and backoff.
//!
//! ## Design
//!
//! - Jobs live in a shared store; workers keep no job state in memory
//! - Ready list plus delayed set per queue; promotion is claim-once
//! - Each attempt runs in its own child process under a hard timeout
//! - Transient failures retry with capped exponential backoff
//!
//! ## Components
//!
//! - `JobStore`: job records and the idempotency index
//! - `JobQueue`: ready/delayed queue primitives
//! - `Worker`: the claim/execute/record loop
//! - `SubprocessRunner`: per-attempt process isolation
//! - `Heartbeat`: worker liveness records

pub mod classify;
pub mod executor;
pub mod heartbeat;
pub mod isolation;
pub mod queue;
pub mod store;
pub mod types;

pub use classify::{ErrorClassifier, HandlerFailure, MarkerClassifier};
pub use executor::{Processed, Worker, WorkerConfig, WorkerError, WorkerHandle, WorkerStats};
pub use heartbeat::{Heartbeat, HeartbeatRecord};
pub use isolation::{
    ChildMessage, ChildRequest, EXEC_AGENT_SUBCOMMAND, JobRunner, RunOutcome, SubprocessRunner,
    run_child,
};
pub use queue::{JobQueue, QueueError};
pub use store::{JobStore, JobStoreError, Stamp};
pub use types::{CreatedJob, JobError, JobRecord, NewJob, RetryPolicy, error_codes};
