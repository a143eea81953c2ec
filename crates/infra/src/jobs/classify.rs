//! Transient vs permanent failure classification.

use serde::{Deserialize, Serialize};

use agentq_agents::AgentError;

/// Failure reported by an agent run: a type tag, a message and an optional trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerFailure {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
}

impl HandlerFailure {
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
            trace: None,
        }
    }

    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = Some(trace.into());
        self
    }
}

impl From<&AgentError> for HandlerFailure {
    fn from(err: &AgentError) -> Self {
        Self::new(err.type_name(), err.to_string())
    }
}

/// Decides whether a failed attempt may be retried.
pub trait ErrorClassifier: Send + Sync {
    fn is_transient(&self, failure: &HandlerFailure) -> bool;
}

/// Type tag agents use to flag a failure as transient.
pub const TRANSIENT_TYPE: &str = "TransientError";

/// Message fragments treated as transient.
pub const DEFAULT_TRANSIENT_MARKERS: &[&str] = &[
    "timeout",
    "timed out",
    "temporarily unavailable",
    "connection reset",
    "connection refused",
    "503",
    "429",
];

/// Transient if the type tag is in `types`, or `"{type}: {message}"` contains
/// any marker (case-insensitive).
#[derive(Debug, Clone)]
pub struct MarkerClassifier {
    types: Vec<String>,
    markers: Vec<String>,
}

impl MarkerClassifier {
    pub fn new<T, M>(types: T, markers: M) -> Self
    where
        T: IntoIterator,
        T::Item: Into<String>,
        M: IntoIterator,
        M::Item: AsRef<str>,
    {
        Self {
            types: types.into_iter().map(Into::into).collect(),
            markers: markers
                .into_iter()
                .map(|m| m.as_ref().to_lowercase())
                .collect(),
        }
    }
}

impl Default for MarkerClassifier {
    fn default() -> Self {
        Self::new([TRANSIENT_TYPE], DEFAULT_TRANSIENT_MARKERS.iter().copied())
    }
}

impl ErrorClassifier for MarkerClassifier {
    fn is_transient(&self, failure: &HandlerFailure) -> bool {
        if self.types.iter().any(|t| *t == failure.error_type) {
            return true;
        }
        let text = format!("{}: {}", failure.error_type, failure.message).to_lowercase();
        self.markers.iter().any(|m| text.contains(m.as_str()))
    }
}

impl<F> ErrorClassifier for F
where
    F: Fn(&HandlerFailure) -> bool + Send + Sync,
{
    fn is_transient(&self, failure: &HandlerFailure) -> bool {
        self(failure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(error_type: &str, message: &str) -> HandlerFailure {
        HandlerFailure::new(error_type, message)
    }

    #[test]
    fn transient_type_tag_wins() {
        let c = MarkerClassifier::default();
        assert!(c.is_transient(&failure("TransientError", "anything")));
    }

    #[test]
    fn markers_match_case_insensitively() {
        let c = MarkerClassifier::default();
        assert!(c.is_transient(&failure("RuntimeError", "Connection Reset by peer")));
        assert!(c.is_transient(&failure("HTTPError", "upstream returned 503")));
        assert!(c.is_transient(&failure("HTTPError", "429 Too Many Requests")));
        assert!(c.is_transient(&failure("OSError", "Request TIMED OUT")));
        assert!(c.is_transient(&failure("ReadTimeout", "read failed")));
    }

    #[test]
    fn everything_else_is_permanent() {
        let c = MarkerClassifier::default();
        assert!(!c.is_transient(&failure("ValueError", "bad")));
        assert!(!c.is_transient(&failure("InvalidInput", "missing field 'shots'")));
    }

    #[test]
    fn agent_errors_carry_their_type_tag() {
        let f = HandlerFailure::from(&AgentError::transient("backend busy"));
        assert_eq!(f.error_type, "TransientError");
        assert!(MarkerClassifier::default().is_transient(&f));
    }

    #[test]
    fn closures_are_classifiers() {
        let only_io = |f: &HandlerFailure| f.error_type == "IoError";
        assert!(only_io.is_transient(&failure("IoError", "x")));
        assert!(!only_io.is_transient(&failure("TransientError", "x")));
    }

    #[test]
    fn failure_serializes_type_field() {
        let json = serde_json::to_value(failure("ValueError", "bad").with_trace("at line 1")).unwrap();
        assert_eq!(json["type"], "ValueError");
        assert_eq!(json["trace"], "at line 1");
    }
}
