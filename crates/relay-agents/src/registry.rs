//! Explicit agent registry, populated from a static list at program start.
//! Graph compilation happens once, at registration.

use std::collections::HashMap;

use crate::graph::AgentGraph;
use crate::runtime::AgentConfig;

pub struct AgentDefinition {
    pub agent_type: &'static str,
    pub description: &'static str,
    pub max_steps: Option<i64>,
    build: fn() -> anyhow::Result<AgentGraph>,
}

impl AgentDefinition {
    pub fn new(
        agent_type: &'static str,
        description: &'static str,
        build: fn() -> anyhow::Result<AgentGraph>,
        max_steps: Option<i64>,
    ) -> Self {
        Self {
            agent_type,
            description,
            max_steps,
            build,
        }
    }
}

pub struct RegisteredAgent {
    pub agent_type: &'static str,
    pub description: &'static str,
    max_steps: Option<i64>,
    graph: AgentGraph,
}

impl RegisteredAgent {
    pub fn graph(&self) -> &AgentGraph {
        &self.graph
    }

    pub fn effective_config(&self, base: AgentConfig) -> AgentConfig {
        AgentConfig {
            max_steps: self.max_steps.unwrap_or(base.max_steps),
            ..base
        }
    }
}

#[derive(Default)]
pub struct AgentRegistry {
    agents: HashMap<String, RegisteredAgent>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The static production list.
    pub fn with_builtin_agents() -> anyhow::Result<Self> {
        let mut registry = Self::new();
        registry.register(crate::procure_to_pay::definition())?;
        registry.register(crate::collection::definition())?;
        registry.register(crate::month_end_close::definition())?;
        Ok(registry)
    }

    pub fn register(&mut self, definition: AgentDefinition) -> anyhow::Result<()> {
        if self.agents.contains_key(definition.agent_type) {
            anyhow::bail!("agent type `{}` already registered", definition.agent_type);
        }
        let graph = (definition.build)()?;
        self.agents.insert(
            definition.agent_type.to_string(),
            RegisteredAgent {
                agent_type: definition.agent_type,
                description: definition.description,
                max_steps: definition.max_steps,
                graph,
            },
        );
        Ok(())
    }

    pub fn get(&self, agent_type: &str) -> Option<&RegisteredAgent> {
        self.agents.get(agent_type)
    }

    pub fn list(&self) -> Vec<(&'static str, &'static str)> {
        let mut agents: Vec<_> = self
            .agents
            .values()
            .map(|a| (a.agent_type, a.description))
            .collect();
        agents.sort();
        agents
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_agents_compile() {
        let registry = AgentRegistry::with_builtin_agents().unwrap();
        assert!(registry.get("procure_to_pay").is_some());
        assert!(registry.get("collection").is_some());
        assert!(registry.get("month_end_close").is_some());
        assert!(registry.get("imaginary").is_none());
        assert_eq!(registry.list().len(), 3);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = AgentRegistry::with_builtin_agents().unwrap();
        let err = registry
            .register(crate::collection::definition())
            .unwrap_err();
        assert!(err.to_string().contains("already registered"));
    }
}
