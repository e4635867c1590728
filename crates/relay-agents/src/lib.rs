mod graph;
mod registry;
mod runtime;
mod services;
mod state;

pub mod collection;
pub mod month_end_close;
pub mod procure_to_pay;

pub use graph::{AgentGraph, Edge, GraphBuilder, NodeFn, RouterFn, END, START};
pub use registry::{AgentDefinition, AgentRegistry};
pub use runtime::{AgentConfig, AgentRuntime, GuardrailKind, RunOutcome, RunReport};
pub use services::AgentServices;
pub use state::{keys, merge_patch, AgentState};

#[cfg(test)]
pub(crate) mod testing;
