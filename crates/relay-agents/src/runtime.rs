//! Agent execution: streams a graph node by node, persists every step and
//! decision, enforces guardrails as terminal outcomes, and handles
//! suspend/resume.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{Duration, Utc};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use relay_store::{NewStep, Store};
use relay_types::{AgentRunStatus, AgentStepStatus};

use crate::graph::{AgentGraph, END, START};
use crate::registry::AgentRegistry;
use crate::services::AgentServices;
use crate::state::{self, keys, AgentState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardrailKind {
    StepLimit,
    TokenBudget,
    LoopDetected,
}

/// Terminal outcome of one execution pass. Guardrails are a first-class
/// variant rather than an error type used for control flow.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    Completed,
    Suspended { resume_condition: String },
    GuardrailViolation { kind: GuardrailKind, detail: String },
    Failed { error: String },
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct RunReport {
    pub run_id: i64,
    pub status: AgentRunStatus,
    pub total_steps: i64,
    pub token_usage: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub final_state: Value,
}

#[derive(Debug, Clone, Copy)]
pub struct AgentConfig {
    pub max_steps: i64,
    pub max_tokens: i64,
    pub loop_threshold: i64,
    pub suspension_timeout_hours: i64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: 25,
            max_tokens: 50_000,
            loop_threshold: 3,
            suspension_timeout_hours: 24,
        }
    }
}

pub struct AgentRuntime {
    store: Arc<Store>,
    registry: Arc<AgentRegistry>,
    services_factory: Box<dyn Fn() -> Arc<AgentServices> + Send + Sync>,
    config: AgentConfig,
}

impl AgentRuntime {
    pub fn new(
        store: Arc<Store>,
        registry: Arc<AgentRegistry>,
        services_factory: Box<dyn Fn() -> Arc<AgentServices> + Send + Sync>,
        config: AgentConfig,
    ) -> Self {
        Self {
            store,
            registry,
            services_factory,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// Create the run row without executing; pairs with `run_created` so
    /// callers can hand the run id back before execution finishes.
    pub async fn create_run(
        &self,
        agent_type: &str,
        trigger_type: &str,
        trigger_id: Option<&str>,
        initial_state: Map<String, Value>,
    ) -> anyhow::Result<i64> {
        if self.registry.get(agent_type).is_none() {
            anyhow::bail!("unknown agent type `{agent_type}`");
        }
        Ok(self
            .store
            .create_run(
                agent_type,
                trigger_type,
                trigger_id,
                &Value::Object(initial_state),
            )
            .await?)
    }

    /// Execute a run row created by `create_run`.
    pub async fn run_created(
        &self,
        run_id: i64,
        cancel: CancellationToken,
    ) -> anyhow::Result<RunReport> {
        let run = self.store.get_run(run_id).await?;
        let definition = self
            .registry
            .get(&run.agent_type)
            .ok_or_else(|| anyhow::anyhow!("unknown agent type `{}`", run.agent_type))?;
        let initial = run.initial_state.as_object().cloned().unwrap_or_default();
        let state = state::base_state(initial, run_id);
        let config = definition.effective_config(self.config);
        self.execute(definition.graph(), run_id, state, START.to_string(), config, cancel)
            .await
    }

    /// Execute an agent end to end (or up to its first suspension).
    pub async fn run(
        &self,
        agent_type: &str,
        trigger_type: &str,
        trigger_id: Option<&str>,
        initial_state: Map<String, Value>,
        cancel: CancellationToken,
    ) -> anyhow::Result<RunReport> {
        let run_id = self
            .create_run(agent_type, trigger_type, trigger_id, initial_state)
            .await?;
        self.run_created(run_id, cancel).await
    }

    /// Resume a suspended run with external event data, continuing from the
    /// recorded suspension point's outgoing edge.
    pub async fn resume(
        &self,
        run_id: i64,
        event_data: Map<String, Value>,
        cancel: CancellationToken,
    ) -> anyhow::Result<RunReport> {
        let run = self.store.get_run(run_id).await?;
        if run.status != AgentRunStatus::Suspended {
            anyhow::bail!("run {run_id} is {} — only suspended runs resume", run.status.as_str());
        }
        let suspension = self
            .store
            .open_suspension_for(run_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("run {run_id} has no open suspension"))?;

        let definition = self
            .registry
            .get(&run.agent_type)
            .ok_or_else(|| anyhow::anyhow!("unknown agent type `{}`", run.agent_type))?;

        let mut state: AgentState = run
            .final_state
            .clone()
            .or(Some(run.initial_state.clone()))
            .and_then(|v| v.as_object().cloned())
            .unwrap_or_default();
        state::merge_patch(&mut state, event_data.clone());
        state.insert(keys::NEEDS_SUSPENSION.to_string(), Value::from(false));
        state.insert(keys::SUSPENSION_REASON.to_string(), Value::Null);

        self.store
            .resume_run(run_id, &Value::Object(event_data))
            .await?;

        let config = definition.effective_config(self.config);
        let start = suspension.suspended_at_step.clone();
        self.execute(definition.graph(), run_id, state, start, config, cancel)
            .await
    }

    async fn execute(
        &self,
        graph: &AgentGraph,
        run_id: i64,
        mut state: AgentState,
        from: String,
        config: AgentConfig,
        cancel: CancellationToken,
    ) -> anyhow::Result<RunReport> {
        let services = (self.services_factory)();
        let mut visit_counts: HashMap<String, i64> = HashMap::new();

        let mut cursor = match graph.next_after(&from, &state) {
            Ok(next) => next,
            Err(err) => {
                return self
                    .finish(run_id, &state, RunOutcome::Failed { error: err.to_string() })
                    .await;
            }
        };

        let outcome = loop {
            if cursor == END {
                break RunOutcome::Completed;
            }
            if cancel.is_cancelled() {
                break RunOutcome::Failed {
                    error: "run cancelled".to_string(),
                };
            }

            let Some(node) = graph.node(&cursor) else {
                break RunOutcome::Failed {
                    error: format!("unknown node `{cursor}`"),
                };
            };

            let input_snapshot = serde_json::json!({ "current_step": cursor });
            let started = Instant::now();
            let node_result = node(Arc::clone(&services), state.clone()).await;
            let duration_ms = started.elapsed().as_millis() as i64;
            let (decisions, tokens) = services.drain().await;

            let step_index = state::get_i64(&state, keys::STEP_COUNT);
            let step_name = cursor.clone();

            match node_result {
                Ok(patch) => {
                    state::merge_patch(&mut state, patch);
                    state.insert(
                        keys::STEP_COUNT.to_string(),
                        Value::from(step_index + 1),
                    );
                    state.insert(
                        keys::TOKEN_COUNT.to_string(),
                        Value::from(state::get_i64(&state, keys::TOKEN_COUNT) + tokens),
                    );
                    state.insert(keys::CURRENT_STEP.to_string(), Value::from(cursor.clone()));

                    let step_id = self
                        .store
                        .append_step(
                            run_id,
                            NewStep {
                                step_name: step_name.clone(),
                                step_index,
                                input_data: input_snapshot,
                                output_data: output_snapshot(&state),
                                status: AgentStepStatus::Completed,
                                tokens_used: tokens,
                                duration_ms: Some(duration_ms),
                            },
                        )
                        .await?;
                    for decision in decisions {
                        self.store.append_decision(step_id, decision).await?;
                    }

                    if let Some(violation) = self.check_guardrails(&state, &step_name, &mut visit_counts, config) {
                        break violation;
                    }

                    if state::get_bool(&state, keys::NEEDS_SUSPENSION) {
                        let reason = state
                            .get(keys::SUSPENSION_REASON)
                            .and_then(Value::as_str)
                            .unwrap_or("awaiting_approval")
                            .to_string();
                        break RunOutcome::Suspended {
                            resume_condition: reason,
                        };
                    }

                    cursor = match graph.next_after(&cursor, &state) {
                        Ok(next) => next,
                        Err(err) => {
                            break RunOutcome::Failed {
                                error: err.to_string(),
                            }
                        }
                    };
                }
                Err(err) => {
                    // The failed step is recorded; the run aborts with the
                    // last merged state intact.
                    let step_id = self
                        .store
                        .append_step(
                            run_id,
                            NewStep {
                                step_name: step_name.clone(),
                                step_index,
                                input_data: input_snapshot,
                                output_data: serde_json::json!({ "error": err.to_string() }),
                                status: AgentStepStatus::Failed,
                                tokens_used: tokens,
                                duration_ms: Some(duration_ms),
                            },
                        )
                        .await?;
                    for decision in decisions {
                        self.store.append_decision(step_id, decision).await?;
                    }
                    state.insert(
                        keys::STEP_COUNT.to_string(),
                        Value::from(step_index + 1),
                    );
                    state.insert(keys::ERROR.to_string(), Value::from(err.to_string()));
                    break RunOutcome::Failed {
                        error: err.to_string(),
                    };
                }
            }
        };

        self.finish(run_id, &state, outcome).await
    }

    fn check_guardrails(
        &self,
        state: &AgentState,
        step_name: &str,
        visit_counts: &mut HashMap<String, i64>,
        config: AgentConfig,
    ) -> Option<RunOutcome> {
        let step_count = state::get_i64(state, keys::STEP_COUNT);
        if step_count > config.max_steps {
            return Some(RunOutcome::GuardrailViolation {
                kind: GuardrailKind::StepLimit,
                detail: format!("Step limit exceeded: {step_count} > {}", config.max_steps),
            });
        }

        let token_count = state::get_i64(state, keys::TOKEN_COUNT);
        if token_count > config.max_tokens {
            return Some(RunOutcome::GuardrailViolation {
                kind: GuardrailKind::TokenBudget,
                detail: format!("Token budget exceeded: {token_count} > {}", config.max_tokens),
            });
        }

        let visits = visit_counts.entry(step_name.to_string()).or_insert(0);
        *visits += 1;
        if *visits > config.loop_threshold {
            return Some(RunOutcome::GuardrailViolation {
                kind: GuardrailKind::LoopDetected,
                detail: format!(
                    "Loop detected: node `{step_name}` visited {visits} times (threshold {})",
                    config.loop_threshold
                ),
            });
        }
        None
    }

    async fn finish(
        &self,
        run_id: i64,
        state: &AgentState,
        outcome: RunOutcome,
    ) -> anyhow::Result<RunReport> {
        let total_steps = state::get_i64(state, keys::STEP_COUNT);
        let token_usage = state::get_i64(state, keys::TOKEN_COUNT);
        let final_state = Value::Object(state.clone());

        // A node-recorded error makes even a graph that reached END a
        // failed run; the partial state is preserved either way.
        let state_error = state
            .get(keys::ERROR)
            .and_then(Value::as_str)
            .filter(|e| !e.is_empty())
            .map(|e| e.to_string());
        let outcome = match (outcome, state_error) {
            (RunOutcome::Completed, Some(error)) => RunOutcome::Failed { error },
            (outcome, _) => outcome,
        };

        let (status, error) = match &outcome {
            RunOutcome::Completed => (AgentRunStatus::Completed, None),
            RunOutcome::Suspended { resume_condition } => {
                let timeout = Utc::now() + Duration::hours(self.config.suspension_timeout_hours);
                self.store
                    .suspend_run(
                        run_id,
                        resume_condition,
                        state::get_str(state, keys::CURRENT_STEP),
                        Some(timeout),
                        &final_state,
                        total_steps,
                        token_usage,
                    )
                    .await?;
                info!(run_id, resume_condition, "agent run suspended");
                return Ok(RunReport {
                    run_id,
                    status: AgentRunStatus::Suspended,
                    total_steps,
                    token_usage,
                    error: None,
                    final_state,
                });
            }
            RunOutcome::GuardrailViolation { detail, kind } => {
                warn!(run_id, kind = ?kind, detail, "agent guardrail violation");
                (AgentRunStatus::Failed, Some(detail.clone()))
            }
            RunOutcome::Failed { error } => {
                warn!(run_id, error, "agent run failed");
                (AgentRunStatus::Failed, Some(error.clone()))
            }
        };

        self.store
            .complete_run(
                run_id,
                status,
                total_steps,
                token_usage,
                &final_state,
                error.as_deref(),
            )
            .await?;

        Ok(RunReport {
            run_id,
            status,
            total_steps,
            token_usage,
            error,
            final_state,
        })
    }

    /// Scheduler sweep: expired suspensions fail their runs with a distinct
    /// reason; the suspension row's resumed_at stays null.
    pub async fn sweep_expired_suspensions(&self) -> anyhow::Result<Vec<i64>> {
        let expired = self.store.expired_suspensions(Utc::now()).await?;
        let mut failed = Vec::new();
        for suspension in expired {
            let run = self.store.get_run(suspension.agent_run_id).await?;
            if run.status != AgentRunStatus::Suspended {
                continue;
            }
            self.store
                .complete_run(
                    run.id,
                    AgentRunStatus::Failed,
                    run.total_steps,
                    run.token_usage,
                    run.final_state.as_ref().unwrap_or(&Value::Null),
                    Some("suspension_timeout"),
                )
                .await?;
            failed.push(run.id);
        }
        Ok(failed)
    }
}

/// Output snapshots omit the run id and keep everything else.
fn output_snapshot(state: &AgentState) -> Value {
    let mut snapshot = state.clone();
    snapshot.remove(keys::RUN_ID);
    Value::Object(snapshot)
}
