//! Named directed graphs with direct and conditional edges. A graph is
//! built once per process and executed by the runtime, one node at a time.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Map;

use crate::services::AgentServices;
use crate::state::AgentState;

pub const START: &str = "__start__";
pub const END: &str = "__end__";

/// A node body: takes the shared services and the current state, returns a
/// partial-state patch.
pub type NodeFn = Arc<
    dyn Fn(Arc<AgentServices>, AgentState) -> BoxFuture<'static, anyhow::Result<Map<String, serde_json::Value>>>
        + Send
        + Sync,
>;

/// A router inspects the state and names the case to follow.
pub type RouterFn = Arc<dyn Fn(&AgentState) -> String + Send + Sync>;

#[derive(Clone)]
pub enum Edge {
    Direct(String),
    Conditional {
        router: RouterFn,
        cases: HashMap<String, String>,
    },
}

pub struct AgentGraph {
    nodes: HashMap<String, NodeFn>,
    edges: HashMap<String, Edge>,
}

impl std::fmt::Debug for AgentGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentGraph")
            .field("nodes", &self.nodes.keys().collect::<Vec<_>>())
            .field("edges", &self.edges.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl AgentGraph {
    pub fn node(&self, name: &str) -> Option<&NodeFn> {
        self.nodes.get(name)
    }

    pub fn edge(&self, from: &str) -> Option<&Edge> {
        self.edges.get(from)
    }

    /// Resolve the node following `from` for the given state.
    pub fn next_after(&self, from: &str, state: &AgentState) -> anyhow::Result<String> {
        match self.edges.get(from) {
            Some(Edge::Direct(to)) => Ok(to.clone()),
            Some(Edge::Conditional { router, cases }) => {
                let case = router(state);
                cases.get(&case).cloned().ok_or_else(|| {
                    anyhow::anyhow!("router at `{from}` returned unmapped case `{case}`")
                })
            }
            None => anyhow::bail!("node `{from}` has no outgoing edge"),
        }
    }

    pub fn node_names(&self) -> Vec<&str> {
        self.nodes.keys().map(String::as_str).collect()
    }
}

/// Builder with target validation: every edge must point at a registered
/// node (or END), and START must have an outgoing edge.
pub struct GraphBuilder {
    nodes: HashMap<String, NodeFn>,
    edges: HashMap<String, Edge>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
            edges: HashMap::new(),
        }
    }

    pub fn add_node<F, Fut>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(Arc<AgentServices>, AgentState) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<Map<String, serde_json::Value>>>
            + Send
            + 'static,
    {
        self.nodes
            .insert(name.to_string(), Arc::new(move |services, state| {
                Box::pin(f(services, state))
            }));
        self
    }

    pub fn add_edge(mut self, from: &str, to: &str) -> Self {
        self.edges
            .insert(from.to_string(), Edge::Direct(to.to_string()));
        self
    }

    pub fn add_conditional<R>(mut self, from: &str, router: R, cases: &[(&str, &str)]) -> Self
    where
        R: Fn(&AgentState) -> String + Send + Sync + 'static,
    {
        self.edges.insert(
            from.to_string(),
            Edge::Conditional {
                router: Arc::new(router),
                cases: cases
                    .iter()
                    .map(|(case, target)| (case.to_string(), target.to_string()))
                    .collect(),
            },
        );
        self
    }

    pub fn build(self) -> anyhow::Result<AgentGraph> {
        if !self.edges.contains_key(START) {
            anyhow::bail!("graph has no START edge");
        }

        let check_target = |from: &str, target: &str| -> anyhow::Result<()> {
            if target != END && !self.nodes.contains_key(target) {
                anyhow::bail!("edge from `{from}` targets unknown node `{target}`");
            }
            Ok(())
        };

        for (from, edge) in &self.edges {
            if from != START && !self.nodes.contains_key(from) {
                anyhow::bail!("edge leaves unknown node `{from}`");
            }
            match edge {
                Edge::Direct(to) => check_target(from, to)?,
                Edge::Conditional { cases, .. } => {
                    for target in cases.values() {
                        check_target(from, target)?;
                    }
                }
            }
        }

        Ok(AgentGraph {
            nodes: self.nodes,
            edges: self.edges,
        })
    }
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn noop_graph() -> GraphBuilder {
        GraphBuilder::new()
            .add_node("a", |_, _| async { Ok(Map::new()) })
            .add_node("b", |_, _| async { Ok(Map::new()) })
    }

    #[test]
    fn build_requires_start_edge() {
        let err = noop_graph().build().unwrap_err();
        assert!(err.to_string().contains("START"));
    }

    #[test]
    fn build_rejects_unknown_targets() {
        let err = noop_graph()
            .add_edge(START, "a")
            .add_edge("a", "missing")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn conditional_edges_route_by_state() {
        let graph = noop_graph()
            .add_edge(START, "a")
            .add_conditional(
                "a",
                |state: &AgentState| {
                    state
                        .get("go")
                        .and_then(serde_json::Value::as_str)
                        .unwrap_or("stop")
                        .to_string()
                },
                &[("left", "b"), ("stop", END)],
            )
            .add_edge("b", END)
            .build()
            .unwrap();

        let mut state = AgentState::new();
        state.insert("go".to_string(), json!("left"));
        assert_eq!(graph.next_after("a", &state).unwrap(), "b");

        state.insert("go".to_string(), json!("stop"));
        assert_eq!(graph.next_after("a", &state).unwrap(), END);

        state.insert("go".to_string(), json!("sideways"));
        assert!(graph.next_after("a", &state).is_err());
    }
}
