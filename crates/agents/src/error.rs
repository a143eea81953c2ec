use serde_json::{Value as JsonValue, json};
use thiserror::Error;

/// Failure raised by an agent (or by agent lookup).
///
/// Variants double as structured tags: [`AgentError::type_name`] is what crosses
/// the process boundary, and `Transient` is the explicit "try again" signal.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("unknown agent: {name}")]
    UnknownAgent { name: String, known: Vec<String> },

    #[error("invalid job input: {0}")]
    InvalidInput(String),

    #[error("missing dependency: {0}")]
    MissingDependency(String),

    #[error("bad agent config: {0}")]
    Config(String),

    /// A dependency call failed in a way that is likely to succeed later
    /// (rate limit, connection reset, upstream 503, ...).
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("agent runtime error: {0}")]
    Runtime(String),
}

impl AgentError {
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn runtime(msg: impl Into<String>) -> Self {
        Self::Runtime(msg.into())
    }

    /// Stable tag reported as the error `type` across the process boundary.
    pub fn type_name(&self) -> &'static str {
        match self {
            AgentError::UnknownAgent { .. } => "UnknownAgent",
            AgentError::InvalidInput(_) => "InvalidInput",
            AgentError::MissingDependency(_) => "MissingDependency",
            AgentError::Config(_) => "ConfigError",
            AgentError::Transient(_) => "TransientError",
            AgentError::Runtime(_) => "RuntimeError",
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, AgentError::Transient(_))
    }

    /// Extra structured context, if any.
    pub fn details(&self) -> JsonValue {
        match self {
            AgentError::UnknownAgent { known, .. } => json!({ "known_agents": known }),
            _ => JsonValue::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_the_transient_variant_is_tagged_transient() {
        assert!(AgentError::transient("reset").is_transient());
        assert!(!AgentError::runtime("boom").is_transient());
        assert_eq!(AgentError::transient("x").type_name(), "TransientError");
    }

    #[test]
    fn unknown_agent_lists_known_agents() {
        let err = AgentError::UnknownAgent {
            name: "nope".into(),
            known: vec!["echo".into()],
        };
        assert_eq!(err.to_string(), "unknown agent: nope");
        assert_eq!(err.details(), json!({ "known_agents": ["echo"] }));
    }
}
