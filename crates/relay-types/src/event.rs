use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle events broadcast to the dashboard / notification channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    AutomationStarted {
        automation_type: String,
        action: String,
        model: String,
        record_id: Option<i64>,
    },
    AutomationCompleted {
        automation_type: String,
        action: String,
        audit_log_id: i64,
        status: String,
        confidence: f64,
    },
    AutomationFailed {
        automation_type: String,
        action: String,
        error: String,
    },
    AgentRunStarted {
        run_id: i64,
        agent_type: String,
        trigger_type: String,
    },
    AgentRunCompleted {
        run_id: i64,
        agent_type: String,
        total_steps: i64,
    },
    AgentRunSuspended {
        run_id: i64,
        agent_type: String,
        resume_condition: String,
    },
    AgentRunFailed {
        run_id: i64,
        agent_type: String,
        error: String,
    },
    ApprovalDecided {
        audit_log_id: i64,
        approved: bool,
        approved_by: String,
    },
    ScanCompleted {
        automation_type: String,
        scan_name: String,
        detail: Value,
    },
    SuspensionExpired {
        run_id: i64,
        resume_condition: String,
    },
}

impl LifecycleEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            LifecycleEvent::AutomationStarted { .. } => "automation_started",
            LifecycleEvent::AutomationCompleted { .. } => "automation_completed",
            LifecycleEvent::AutomationFailed { .. } => "automation_failed",
            LifecycleEvent::AgentRunStarted { .. } => "agent_run_started",
            LifecycleEvent::AgentRunCompleted { .. } => "agent_run_completed",
            LifecycleEvent::AgentRunSuspended { .. } => "agent_run_suspended",
            LifecycleEvent::AgentRunFailed { .. } => "agent_run_failed",
            LifecycleEvent::ApprovalDecided { .. } => "approval_decided",
            LifecycleEvent::ScanCompleted { .. } => "scan_completed",
            LifecycleEvent::SuspensionExpired { .. } => "suspension_expired",
        }
    }
}
