use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRunStatus {
    Pending,
    Running,
    Suspended,
    Completed,
    Failed,
    Cancelled,
}

impl AgentRunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentRunStatus::Pending => "pending",
            AgentRunStatus::Running => "running",
            AgentRunStatus::Suspended => "suspended",
            AgentRunStatus::Completed => "completed",
            AgentRunStatus::Failed => "failed",
            AgentRunStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(AgentRunStatus::Pending),
            "running" => Some(AgentRunStatus::Running),
            "suspended" => Some(AgentRunStatus::Suspended),
            "completed" => Some(AgentRunStatus::Completed),
            "failed" => Some(AgentRunStatus::Failed),
            "cancelled" => Some(AgentRunStatus::Cancelled),
            _ => None,
        }
    }

    /// Terminal statuses imply a non-null completed_at on the run row.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AgentRunStatus::Completed | AgentRunStatus::Failed | AgentRunStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl AgentStepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentStepStatus::Pending => "pending",
            AgentStepStatus::Running => "running",
            AgentStepStatus::Completed => "completed",
            AgentStepStatus::Failed => "failed",
            AgentStepStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(AgentStepStatus::Pending),
            "running" => Some(AgentStepStatus::Running),
            "completed" => Some(AgentStepStatus::Completed),
            "failed" => Some(AgentStepStatus::Failed),
            "skipped" => Some(AgentStepStatus::Skipped),
            _ => None,
        }
    }
}

/// One run of a multi-step agent graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRun {
    pub id: i64,
    pub agent_type: String,
    pub trigger_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_id: Option<String>,
    pub status: AgentRunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub total_steps: i64,
    pub token_usage: i64,
    #[serde(default)]
    pub initial_state: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_state: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One node execution inside a run. step_index is 0-based and gap-free.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStep {
    pub id: i64,
    pub agent_run_id: i64,
    pub step_name: String,
    pub step_index: i64,
    #[serde(default)]
    pub input_data: Value,
    #[serde(default)]
    pub output_data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    pub status: AgentStepStatus,
    pub tokens_used: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// One LLM call made inside a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDecision {
    pub id: i64,
    pub agent_step_id: i64,
    pub prompt_hash: String,
    #[serde(default)]
    pub response: Value,
    pub confidence: f64,
    #[serde(default)]
    pub tools_used: Vec<String>,
    pub tokens_input: i64,
    pub tokens_output: i64,
    pub created_at: DateTime<Utc>,
}

/// A wait point inside a run. At most one open (resumed_at null) suspension
/// exists per run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSuspension {
    pub id: i64,
    pub agent_run_id: i64,
    pub resume_condition: String,
    #[serde(default)]
    pub resume_data: Value,
    pub suspended_at_step: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_at: Option<DateTime<Utc>>,
    pub suspended_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resumed_at: Option<DateTime<Utc>>,
}
