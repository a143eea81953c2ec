//! Infrastructure layer: backing store, job queue, workers, configuration.

pub mod backend;
pub mod config;
pub mod jobs;
pub mod submission;

pub use backend::{Backend, BackendError, InMemoryBackend, Keyspace, SharedBackend};
pub use config::AgentqConfig;
pub use submission::{JobService, JobView, QueueHealth, SubmitError, SubmitRequest, SubmitResponse};

#[cfg(test)]
mod integration_tests;
