use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};

use crate::error::AgentError;

/// Static description of an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentMetadata {
    pub name: String,
    pub version: String,
    pub description: String,
    /// External capabilities the agent needs (checked by `self_test`).
    #[serde(default)]
    pub requires: Vec<String>,
}

impl AgentMetadata {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: description.into(),
            requires: Vec::new(),
        }
    }

    pub fn with_requires(mut self, requires: Vec<String>) -> Self {
        self.requires = requires;
        self
    }
}

/// Outcome of an agent's self-check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelfTestReport {
    pub agent: String,
    pub ok: bool,
    pub checked_at: DateTime<Utc>,
    /// Free-form diagnostics.
    pub details: JsonValue,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl SelfTestReport {
    pub fn ok(agent: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            ok: true,
            checked_at: Utc::now(),
            details: JsonValue::Null,
            warnings: Vec::new(),
        }
    }

    pub fn failed(agent: impl Into<String>, details: JsonValue) -> Self {
        Self {
            agent: agent.into(),
            ok: false,
            checked_at: Utc::now(),
            details,
            warnings: Vec::new(),
        }
    }

    pub fn with_details(mut self, details: JsonValue) -> Self {
        self.details = details;
        self
    }
}

/// A named handler for one job type.
///
/// `run` receives the job's immutable payload and returns the JSON result stored
/// on success. Implementations should return [`AgentError::Transient`] for
/// failures worth retrying; everything else is treated as permanent unless its
/// message matches the worker's transient heuristic.
pub trait Agent: Send + Sync + 'static {
    fn metadata(&self) -> AgentMetadata;

    fn run(&self, payload: &JsonValue) -> Result<JsonValue, AgentError>;

    /// Cheap readiness probe. The default reports healthy when nothing is required.
    fn self_test(&self) -> SelfTestReport {
        let meta = self.metadata();
        if meta.requires.is_empty() {
            SelfTestReport::ok(meta.name)
        } else {
            SelfTestReport::ok(&meta.name).with_details(json!({ "requires": meta.requires }))
        }
    }
}
