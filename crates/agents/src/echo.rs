use serde_json::{Value as JsonValue, json};

use crate::agent::{Agent, AgentMetadata, SelfTestReport};
use crate::error::AgentError;

pub const ECHO_AGENT: &str = "echo";

/// Returns whatever it is sent. Used for smoke tests and demos.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoAgent;

impl Agent for EchoAgent {
    fn metadata(&self) -> AgentMetadata {
        AgentMetadata::new(
            ECHO_AGENT,
            "1.0.0",
            "Returns whatever you send it. Useful for smoke tests and demos.",
        )
    }

    fn run(&self, payload: &JsonValue) -> Result<JsonValue, AgentError> {
        Ok(json!({ "agent": ECHO_AGENT, "echo": payload }))
    }

    fn self_test(&self) -> SelfTestReport {
        SelfTestReport::ok(ECHO_AGENT).with_details(json!({ "echo": "ok" }))
    }
}
