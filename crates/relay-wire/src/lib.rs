//! Request/response models shared between the HTTP surface and the
//! orchestrator. Kept separate from the domain records so the wire shape
//! can evolve without touching storage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use relay_types::EventType;

/// Inbound ERP webhook body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub event_type: EventType,
    pub model: String,
    pub record_id: i64,
    #[serde(default)]
    pub values: Map<String, Value>,
    #[serde(default)]
    pub old_values: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookAccepted {
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audit_log_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<i64>,
}

/// Uniform error envelope. `error` is the taxonomy kind, `message` the text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Approvals
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub audit_log_id: i64,
    pub approved: bool,
    #[serde(default = "default_approver")]
    pub approved_by: String,
}

fn default_approver() -> String {
    "admin".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalOutcome {
    pub audit_log_id: i64,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Month-end closing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosingStartRequest {
    pub period: String,
    #[serde(default = "default_approver")]
    pub started_by: String,
}

// ---------------------------------------------------------------------------
// Reconciliation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationStartRequest {
    pub journal_id: i64,
    #[serde(default = "default_approver")]
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationMatchRequest {
    pub bank_line_id: i64,
    pub entry_id: i64,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct PageQuery {
    pub page: Option<usize>,
    pub limit: Option<usize>,
}

// ---------------------------------------------------------------------------
// Deduplication
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupScanRequest {
    pub scan_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupMergeRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_record_id: Option<i64>,
    #[serde(default = "default_approver")]
    pub merged_by: String,
}

// ---------------------------------------------------------------------------
// Credit
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditCheckRequest {
    pub customer_id: i64,
    pub order_amount: f64,
}

// ---------------------------------------------------------------------------
// Forecasting
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ForecastQuery {
    pub horizon: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub adjustments: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub horizon: Option<u32>,
}

// ---------------------------------------------------------------------------
// Documents
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentCorrectionRequest {
    pub field_name: String,
    pub corrected_value: String,
    #[serde(default = "default_approver")]
    pub corrected_by: String,
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportGenerateRequest {
    pub query: String,
    #[serde(default = "default_approver")]
    pub requested_by: String,
}

// ---------------------------------------------------------------------------
// Agents
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRunRequest {
    pub agent_type: String,
    #[serde(default)]
    pub initial_state: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResumeRequest {
    #[serde(default)]
    pub event_data: Map<String, Value>,
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleUpsertRequest {
    pub name: String,
    pub automation_type: String,
    pub action_name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    #[serde(default)]
    pub auto_approve: bool,
    #[serde(default = "default_auto_approve_threshold")]
    pub auto_approve_threshold: f64,
    #[serde(default)]
    pub config: Map<String, Value>,
}

fn default_true() -> bool {
    true
}

fn default_confidence_threshold() -> f64 {
    0.85
}

fn default_auto_approve_threshold() -> f64 {
    0.95
}
