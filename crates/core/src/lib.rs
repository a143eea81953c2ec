//! `agentq-core`: shared primitives for the agent job queue.
//!
//! This crate contains **pure** building blocks (no store or process concerns):
//! identifiers, the job status state machine, and the domain error model.

pub mod error;
pub mod id;
pub mod status;

pub use error::{DomainError, DomainResult};
pub use id::{JobId, WorkerId};
pub use status::JobStatus;
