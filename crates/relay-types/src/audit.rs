use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle of a single AI decision in the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    Approved,
    Executed,
    Rejected,
    Failed,
}

impl ActionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionStatus::Pending => "pending",
            ActionStatus::Approved => "approved",
            ActionStatus::Executed => "executed",
            ActionStatus::Rejected => "rejected",
            ActionStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ActionStatus::Pending),
            "approved" => Some(ActionStatus::Approved),
            "executed" => Some(ActionStatus::Executed),
            "rejected" => Some(ActionStatus::Rejected),
            "failed" => Some(ActionStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutomationType {
    Accounting,
    Crm,
    Sales,
    Purchase,
    Hr,
    Project,
    MonthEnd,
    Deduplication,
    CreditManagement,
    Forecasting,
    Reporting,
    DocumentProcessing,
    SupplyChain,
    AgentWorkflow,
}

impl AutomationType {
    pub fn as_str(self) -> &'static str {
        match self {
            AutomationType::Accounting => "accounting",
            AutomationType::Crm => "crm",
            AutomationType::Sales => "sales",
            AutomationType::Purchase => "purchase",
            AutomationType::Hr => "hr",
            AutomationType::Project => "project",
            AutomationType::MonthEnd => "month_end",
            AutomationType::Deduplication => "deduplication",
            AutomationType::CreditManagement => "credit_management",
            AutomationType::Forecasting => "forecasting",
            AutomationType::Reporting => "reporting",
            AutomationType::DocumentProcessing => "document_processing",
            AutomationType::SupplyChain => "supply_chain",
            AutomationType::AgentWorkflow => "agent_workflow",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "accounting" => Some(AutomationType::Accounting),
            "crm" => Some(AutomationType::Crm),
            "sales" => Some(AutomationType::Sales),
            "purchase" => Some(AutomationType::Purchase),
            "hr" => Some(AutomationType::Hr),
            "project" => Some(AutomationType::Project),
            "month_end" => Some(AutomationType::MonthEnd),
            "deduplication" => Some(AutomationType::Deduplication),
            "credit_management" => Some(AutomationType::CreditManagement),
            "forecasting" => Some(AutomationType::Forecasting),
            "reporting" => Some(AutomationType::Reporting),
            "document_processing" => Some(AutomationType::DocumentProcessing),
            "supply_chain" => Some(AutomationType::SupplyChain),
            "agent_workflow" => Some(AutomationType::AgentWorkflow),
            _ => None,
        }
    }
}

impl std::fmt::Display for AutomationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// ERP change event kinds relayed over the webhook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Create,
    Write,
    Unlink,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Create => "create",
            EventType::Write => "write",
            EventType::Unlink => "unlink",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(EventType::Create),
            "write" => Some(EventType::Write),
            "unlink" => Some(EventType::Unlink),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One record per attempted AI decision.
///
/// A row with status `executed` always carries `executed_at`; a row with a
/// status other than `failed` always carries an output snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLog {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub automation_type: AutomationType,
    pub action_name: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<i64>,
    pub status: ActionStatus,
    pub confidence: f64,
    pub reasoning: String,
    #[serde(default)]
    pub input_data: Value,
    #[serde(default)]
    pub output_data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,
    pub tokens_used: i64,
}

/// Per-automation configuration row. Compared by (automation_type, action_name).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationRule {
    pub id: i64,
    pub name: String,
    pub automation_type: AutomationType,
    pub action_name: String,
    pub enabled: bool,
    pub confidence_threshold: f64,
    pub auto_approve: bool,
    pub auto_approve_threshold: f64,
    #[serde(default)]
    pub config: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AutomationRule {
    pub fn defaults(automation_type: AutomationType, action_name: &str) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            name: format!("{}:{}", automation_type.as_str(), action_name),
            automation_type,
            action_name: action_name.to_string(),
            enabled: true,
            confidence_threshold: 0.85,
            auto_approve: false,
            auto_approve_threshold: 0.95,
            config: Value::Object(Default::default()),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Raw inbound webhook event, kept for replay and deduplication. The
/// correlation id is minted at intake and reappears on every log line the
/// event's processing produces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEventRecord {
    pub id: i64,
    pub received_at: DateTime<Utc>,
    pub event_type: EventType,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<i64>,
    #[serde(default)]
    pub payload: Value,
    pub payload_hash: String,
    pub correlation_id: crate::CorrelationId,
    pub processed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
