use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Bank reconciliation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconciliationStatus {
    Active,
    Completed,
    Cancelled,
}

impl ReconciliationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ReconciliationStatus::Active => "active",
            ReconciliationStatus::Completed => "completed",
            ReconciliationStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(ReconciliationStatus::Active),
            "completed" => Some(ReconciliationStatus::Completed),
            "cancelled" => Some(ReconciliationStatus::Cancelled),
            _ => None,
        }
    }
}

/// Stateful reconciliation batch. `remaining` is derived:
/// total_lines − auto_matched − manually_matched − skipped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationSession {
    pub id: i64,
    pub user_id: String,
    pub journal_id: i64,
    pub status: ReconciliationStatus,
    pub total_lines: i64,
    pub auto_matched: i64,
    pub manually_matched: i64,
    pub skipped: i64,
    pub remaining: i64,
    #[serde(default)]
    pub learned_rules: Value,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ReconciliationSession {
    pub fn derived_remaining(&self) -> i64 {
        (self.total_lines - self.auto_matched - self.manually_matched - self.skipped).max(0)
    }
}

// ---------------------------------------------------------------------------
// Deduplication
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupResolution {
    Pending,
    Merged,
    Dismissed,
}

impl GroupResolution {
    pub fn as_str(self) -> &'static str {
        match self {
            GroupResolution::Pending => "pending",
            GroupResolution::Merged => "merged",
            GroupResolution::Dismissed => "dismissed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(GroupResolution::Pending),
            "merged" => Some(GroupResolution::Merged),
            "dismissed" => Some(GroupResolution::Dismissed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeduplicationScan {
    pub id: i64,
    pub scan_type: String,
    pub status: String,
    pub total_records: i64,
    pub duplicates_found: i64,
    pub auto_merged: i64,
    pub pending_review: i64,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub id: i64,
    pub scan_id: i64,
    pub model: String,
    pub record_ids: Vec<i64>,
    pub master_record_id: i64,
    pub similarity_score: f64,
    pub match_fields: Vec<String>,
    pub status: GroupResolution,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
}

// ---------------------------------------------------------------------------
// Credit management
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditScoreRecord {
    pub id: i64,
    pub customer_id: i64,
    pub customer_name: String,
    pub credit_score: f64,
    pub credit_limit: f64,
    pub current_exposure: f64,
    pub overdue_amount: f64,
    pub payment_history_score: f64,
    pub order_volume_score: f64,
    pub risk_level: String,
    pub hold_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hold_reason: Option<String>,
    pub last_calculated: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Cash flow forecasting
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CashForecast {
    pub id: i64,
    pub forecast_date: NaiveDate,
    pub target_date: NaiveDate,
    pub predicted_balance: f64,
    pub confidence_low: f64,
    pub confidence_high: f64,
    pub ar_expected: f64,
    pub ap_expected: f64,
    pub pipeline_expected: f64,
    pub recurring_expected: f64,
    pub model_version: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForecastScenario {
    pub id: i64,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub adjustments: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_forecast_id: Option<i64>,
    #[serde(default)]
    pub result_data: Value,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForecastAccuracyEntry {
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forecast_id: Option<i64>,
    pub target_date: NaiveDate,
    pub predicted_balance: f64,
    pub actual_balance: f64,
    pub error_pct: f64,
    pub logged_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Month-end closing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonthEndClosing {
    pub id: i64,
    pub period: String,
    pub status: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub started_by: String,
    #[serde(default)]
    pub issues_found: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosingStep {
    pub id: i64,
    pub closing_id: i64,
    pub step_name: String,
    pub step_order: i64,
    pub status: String,
    #[serde(default)]
    pub check_result: Value,
    pub items_found: i64,
    pub items_resolved: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Document processing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentJob {
    pub id: i64,
    pub file_name: String,
    pub file_type: String,
    pub document_type: String,
    pub status: String,
    pub source: String,
    pub uploaded_by: String,
    #[serde(default)]
    pub extraction_result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_po_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_vendor_id: Option<i64>,
    pub overall_confidence: f64,
    #[serde(default)]
    pub field_confidences: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub erp_record_created: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub erp_model_created: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_time_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionCorrection {
    pub id: i64,
    pub job_id: i64,
    pub field_name: String,
    pub original_value: String,
    pub corrected_value: String,
    pub corrected_by: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Daily digest / report jobs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyDigestRecord {
    pub id: i64,
    pub user_role: String,
    pub digest_date: NaiveDate,
    #[serde(default)]
    pub content: Value,
    #[serde(default)]
    pub channels_sent: Vec<String>,
    pub delivered: bool,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportJobRecord {
    pub id: i64,
    pub request_text: String,
    #[serde(default)]
    pub parsed_query: Value,
    #[serde(default)]
    pub result_data: Value,
    pub format: String,
    pub requested_by: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Supply chain intelligence
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskClassification {
    Low,
    Watch,
    Elevated,
    Critical,
}

impl RiskClassification {
    pub fn as_str(self) -> &'static str {
        match self {
            RiskClassification::Low => "low",
            RiskClassification::Watch => "watch",
            RiskClassification::Elevated => "elevated",
            RiskClassification::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(RiskClassification::Low),
            "watch" => Some(RiskClassification::Watch),
            "elevated" => Some(RiskClassification::Elevated),
            "critical" => Some(RiskClassification::Critical),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertSeverity::Low => "low",
            AlertSeverity::Medium => "medium",
            AlertSeverity::High => "high",
            AlertSeverity::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(AlertSeverity::Low),
            "medium" => Some(AlertSeverity::Medium),
            "high" => Some(AlertSeverity::High),
            "critical" => Some(AlertSeverity::Critical),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupplierRiskScore {
    pub id: i64,
    pub vendor_id: i64,
    pub vendor_name: String,
    pub score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_score: Option<f64>,
    pub classification: RiskClassification,
    pub summary: String,
    pub scored_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupplierRiskFactor {
    pub id: i64,
    pub risk_score_id: i64,
    pub factor_name: String,
    pub weight: f64,
    pub raw_value: f64,
    pub weighted_score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisruptionPrediction {
    pub id: i64,
    pub vendor_id: i64,
    pub vendor_name: String,
    pub prediction_type: String,
    pub probability: f64,
    #[serde(default)]
    pub estimated_impact: Value,
    #[serde(default)]
    pub recommended_actions: Vec<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupplyChainAlert {
    pub id: i64,
    pub vendor_id: i64,
    pub vendor_name: String,
    pub alert_type: String,
    pub severity: AlertSeverity,
    pub title: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledged_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}
