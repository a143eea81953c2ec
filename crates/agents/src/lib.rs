//! `agentq-agents`
//!
//! **Responsibility:** the handler boundary of the job queue.
//!
//! An agent is a named unit of work: `run(payload) -> result | error`. Agents are
//! resolved by name from an [`AgentRegistry`] and are only ever invoked inside the
//! disposable child process a worker spawns per attempt, so they may block, panic
//! or crash without affecting the worker.

pub mod agent;
pub mod echo;
pub mod error;
pub mod registry;

pub use agent::{Agent, AgentMetadata, SelfTestReport};
pub use echo::EchoAgent;
pub use error::AgentError;
pub use registry::AgentRegistry;
