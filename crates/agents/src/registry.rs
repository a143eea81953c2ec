use std::collections::BTreeMap;
use std::sync::Arc;

use crate::agent::{Agent, AgentMetadata, SelfTestReport};
use crate::echo::EchoAgent;
use crate::error::AgentError;

/// Name → agent lookup table.
///
/// Built once at process start; the same registry must be constructed in the
/// worker (for heartbeats and submission checks) and in the child process (for
/// execution).
#[derive(Clone, Default)]
pub struct AgentRegistry {
    agents: BTreeMap<String, Arc<dyn Agent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the agents shipped in this crate.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(EchoAgent);
        registry
    }

    /// Register an agent under its metadata name, replacing any previous one.
    pub fn register<A: Agent>(&mut self, agent: A) -> &mut Self {
        let name = agent.metadata().name;
        self.agents.insert(name, Arc::new(agent));
        self
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Agent>, AgentError> {
        self.agents
            .get(name)
            .cloned()
            .ok_or_else(|| AgentError::UnknownAgent {
                name: name.to_string(),
                known: self.names(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.agents.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.agents.keys().cloned().collect()
    }

    pub fn list(&self) -> Vec<AgentMetadata> {
        self.agents.values().map(|a| a.metadata()).collect()
    }

    /// Run every agent's self-test.
    pub fn health(&self) -> Vec<SelfTestReport> {
        self.agents.values().map(|a| a.self_test()).collect()
    }
}

impl core::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("agents", &self.names())
            .finish()
    }
}
