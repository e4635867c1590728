//! Month-end closing automation: a fixed checklist of period scans with
//! persisted closing + step records and an AI close summary.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::warn;

use relay_providers::{Domain, ErpClient, LlmClient, ToolSpec};
use relay_store::Store;
use relay_types::{AutomationType, EventType, Period};

use crate::automation::Automation;
use crate::handler::{handler, EventCtx, HandlerTable};
use crate::result::AutomationResult;

/// Checklist in execution order.
pub const CLOSING_STEPS: [&str; 10] = [
    "unreconciled_bank",
    "stale_drafts",
    "unbilled_deliveries",
    "missing_vendor_bills",
    "uninvoiced_revenue",
    "depreciation",
    "tax_validation",
    "inter_company",
    "adjustments",
    "final_review",
];

const SUMMARY_PROMPT: &str = "You are a financial controller assistant. Generate a concise \
month-end close status report with risk assessment, priority actions, and estimated hours \
to complete.";

fn summary_tools() -> Vec<ToolSpec> {
    vec![ToolSpec {
        name: "generate_close_report".to_string(),
        description: "Generate month-end close status report".to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "risk_level": {"type": "string", "enum": ["low", "medium", "high", "critical"]},
                "summary": {"type": "string"},
                "priority_actions": {"type": "array", "items": {"type": "string"}},
                "estimated_hours": {"type": "number"}
            },
            "required": ["risk_level", "summary"]
        }),
    }]
}

pub struct MonthEndAutomation {
    erp: Arc<dyn ErpClient>,
    llm: Arc<dyn LlmClient>,
    store: Arc<Store>,
}

impl MonthEndAutomation {
    pub fn new(erp: Arc<dyn ErpClient>, llm: Arc<dyn LlmClient>, store: Arc<Store>) -> Arc<Self> {
        Arc::new(Self { erp, llm, store })
    }

    /// Start (or resume) a closing for a period and run the full checklist.
    pub async fn start_closing(&self, period: Period, started_by: &str) -> anyhow::Result<i64> {
        let (closing_id, fresh) = self
            .store
            .create_closing(&period.to_string(), started_by)
            .await?;
        if !fresh {
            return Ok(closing_id);
        }

        let scan = self.run_full_scan(period).await?;
        let mut issues = Vec::new();
        for (order, step_name) in CLOSING_STEPS.iter().enumerate() {
            let result = scan.get(*step_name).cloned().unwrap_or(json!({}));
            let items_found = result.get("items_found").and_then(Value::as_i64).unwrap_or(0);
            if items_found > 0 {
                issues.push(json!({"step": step_name, "items": items_found}));
            }
            self.store
                .add_closing_step(
                    closing_id,
                    step_name,
                    order as i64,
                    if items_found == 0 { "completed" } else { "pending" },
                    &result,
                    items_found,
                )
                .await?;
        }

        let summary = self.generate_summary(period, &scan).await;
        self.store
            .update_closing(
                closing_id,
                "in_progress",
                &Value::Array(issues),
                summary.as_deref(),
            )
            .await?;
        Ok(closing_id)
    }

    /// Run every checklist scan for the period and key results by step name.
    pub async fn run_full_scan(&self, period: Period) -> anyhow::Result<Map<String, Value>> {
        let from = period.first_day().to_string();
        let to = period.last_day().to_string();

        let mut results = Map::new();
        for step in CLOSING_STEPS {
            let result = match self.run_step_scan(step, &from, &to).await {
                Ok(result) => result,
                Err(err) => {
                    warn!(step, error = %err, "closing scan failed");
                    json!({"items_found": 0, "error": err.to_string()})
                }
            };
            results.insert(step.to_string(), result);
        }
        Ok(results)
    }

    async fn run_step_scan(&self, step: &str, from: &str, to: &str) -> anyhow::Result<Value> {
        let count = match step {
            "unreconciled_bank" => {
                self.count(
                    "account.bank.statement.line",
                    Domain::filter("is_reconciled", "=", false)
                        .and_filter("date", ">=", from)
                        .and_filter("date", "<=", to),
                )
                .await?
            }
            "stale_drafts" => {
                self.count(
                    "account.move",
                    Domain::filter("state", "=", "draft")
                        .and_filter("date", ">=", from)
                        .and_filter("date", "<=", to),
                )
                .await?
            }
            "unbilled_deliveries" => {
                self.count(
                    "stock.picking",
                    Domain::filter("state", "=", "done")
                        .and_filter("date_done", ">=", from)
                        .and_filter("date_done", "<=", to),
                )
                .await?
            }
            "missing_vendor_bills" => {
                self.count(
                    "purchase.order",
                    Domain::filter("invoice_status", "=", "to invoice")
                        .and_filter("date_approve", ">=", from)
                        .and_filter("date_approve", "<=", to),
                )
                .await?
            }
            "uninvoiced_revenue" => {
                self.count(
                    "sale.order",
                    Domain::filter("invoice_status", "=", "to invoice")
                        .and_filter("date_order", ">=", from)
                        .and_filter("date_order", "<=", to),
                )
                .await?
            }
            "depreciation" => {
                self.count(
                    "account.move",
                    Domain::filter("move_type", "=", "entry")
                        .and_filter("ref", "ilike", "depreciation")
                        .and_filter("state", "=", "draft")
                        .and_filter("date", ">=", from)
                        .and_filter("date", "<=", to),
                )
                .await?
            }
            "tax_validation" => {
                self.count(
                    "account.move",
                    Domain::filter("state", "=", "posted")
                        .and_filter("amount_tax", "<", 0)
                        .and_filter("date", ">=", from)
                        .and_filter("date", "<=", to),
                )
                .await?
            }
            // Manual review items: surfaced as zero-count checklist entries.
            "inter_company" | "adjustments" | "final_review" => 0,
            other => anyhow::bail!("unknown closing step `{other}`"),
        };
        Ok(json!({"items_found": count}))
    }

    async fn count(&self, model: &str, domain: Domain) -> anyhow::Result<i64> {
        Ok(self.erp.search_count(model, &domain).await?)
    }

    async fn generate_summary(&self, period: Period, scan: &Map<String, Value>) -> Option<String> {
        let total: i64 = scan
            .values()
            .filter_map(|v| v.get("items_found").and_then(Value::as_i64))
            .sum();
        let analysis = self
            .llm
            .analyze(
                SUMMARY_PROMPT,
                &format!(
                    "Period: {period}\nTotal issues: {total}\nBreakdown: {}",
                    Value::Object(scan.clone())
                ),
                &summary_tools(),
                None,
            )
            .await;

        match analysis {
            Ok(a) => a
                .tool_input()
                .and_then(|i| i.get("summary"))
                .and_then(Value::as_str)
                .map(|s| s.to_string()),
            Err(err) => {
                warn!(error = %err, "close summary generation failed, using fallback");
                Some(format!("Period {period}: {total} open items across the checklist"))
            }
        }
    }

    /// Completing a posted-entry write inside a locked period is suspicious.
    async fn on_write_move(self: Arc<Self>, ctx: EventCtx) -> anyhow::Result<AutomationResult> {
        let date = ctx.values.get("date").and_then(Value::as_str).unwrap_or("");
        let Some(period) = date.get(0..7).and_then(Period::parse) else {
            return Ok(AutomationResult::ok("no_action", &ctx.model, ctx.record_id)
                .with_reasoning("Entry has no parseable period date"));
        };

        let closing = self.store.closing_for_period(&period.to_string()).await?;
        match closing {
            Some(closing) if closing.status == "completed" => Ok(AutomationResult::ok(
                "flag_post_close_change",
                &ctx.model,
                ctx.record_id,
            )
            .with_confidence(0.9)
            .with_reasoning(format!(
                "Entry modified in already-closed period {period}"
            ))
            .with_change("period", json!(period.to_string()))
            .requiring_approval()),
            _ => Ok(AutomationResult::ok("no_action", &ctx.model, ctx.record_id)
                .with_reasoning("Period not closed")),
        }
    }
}

#[async_trait]
impl Automation for MonthEndAutomation {
    fn automation_type(&self) -> AutomationType {
        AutomationType::MonthEnd
    }

    fn watched_models(&self) -> Vec<String> {
        vec!["account.move".to_string()]
    }

    fn handlers(self: Arc<Self>) -> HandlerTable {
        HandlerTable::new().on(
            EventType::Write,
            "account.move",
            handler(&self, |a, ctx| a.on_write_move(ctx)),
        )
    }

    fn scan_names(&self) -> Vec<&'static str> {
        vec!["current_period"]
    }

    async fn run_scan(&self, name: &str) -> Option<anyhow::Result<Value>> {
        if name != "current_period" {
            return None;
        }
        let period = Period::of(chrono::Utc::now().date_naive());
        Some(
            self.run_full_scan(period)
                .await
                .map(Value::Object),
        )
    }

    async fn execute_approved(
        &self,
        action: &str,
        model: &str,
        record_id: i64,
        changes: &Value,
    ) -> anyhow::Result<AutomationResult> {
        match action {
            "flag_post_close_change" => {
                let period = changes
                    .get("period")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                let mut values = Map::new();
                values.insert(
                    "narration".to_string(),
                    json!(format!("Post-close change flagged for period {period}")),
                );
                self.erp.write(model, &[record_id], values).await?;
                Ok(AutomationResult::ok(action, model, record_id)
                    .with_change("flagged", json!(true))
                    .with_reasoning("Post-close change note written"))
            }
            other => Ok(AutomationResult::failure(
                other,
                model,
                record_id,
                format!("unknown action `{other}`"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockErp, ScriptedLlm};

    #[tokio::test]
    async fn closing_creates_checklist_steps_once() {
        let erp = MockErp::new();
        erp.seed(
            "account.move",
            vec![json!({"id": 1, "state": "draft", "date": "2026-02-10",
                        "move_type": "entry", "amount_tax": 0.0})],
        )
        .await;
        let store = Arc::new(Store::in_memory().await.unwrap());
        let automation = MonthEndAutomation::new(erp, ScriptedLlm::empty(), store.clone());

        let period = Period::parse("2026-02").unwrap();
        let id = automation.start_closing(period, "controller").await.unwrap();
        let again = automation.start_closing(period, "controller").await.unwrap();
        assert_eq!(id, again);

        let steps = store.steps_for_closing(id).await.unwrap();
        assert_eq!(steps.len(), CLOSING_STEPS.len());
        let stale = steps.iter().find(|s| s.step_name == "stale_drafts").unwrap();
        assert_eq!(stale.items_found, 1);
        assert_eq!(stale.status, "pending");

        let closing = store
            .closing_for_period("2026-02")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(closing.issues_found.as_array().unwrap().len(), 1);
        assert!(closing.summary.is_some());
    }

    #[tokio::test]
    async fn write_in_closed_period_is_flagged() {
        let erp = MockErp::new();
        let store = Arc::new(Store::in_memory().await.unwrap());
        let (closing_id, _) = store.create_closing("2026-01", "controller").await.unwrap();
        store
            .update_closing(closing_id, "completed", &json!([]), Some("done"))
            .await
            .unwrap();
        let automation = MonthEndAutomation::new(erp, ScriptedLlm::empty(), store);

        let mut values = Map::new();
        values.insert("date".into(), json!("2026-01-15"));
        let ctx = EventCtx::new(EventType::Write, "account.move", 9).with_values(values);
        let result = Arc::clone(&automation).on_write_move(ctx).await.unwrap();
        assert_eq!(result.action, "flag_post_close_change");
        assert!(result.needs_approval);
    }

    #[tokio::test]
    async fn write_in_open_period_is_no_action() {
        let automation =
            MonthEndAutomation::new(MockErp::new(), ScriptedLlm::empty(), Arc::new(Store::in_memory().await.unwrap()));
        let mut values = Map::new();
        values.insert("date".into(), json!("2026-03-15"));
        let ctx = EventCtx::new(EventType::Write, "account.move", 9).with_values(values);
        let result = Arc::clone(&automation).on_write_move(ctx).await.unwrap();
        assert_eq!(result.action, "no_action");
    }
}
