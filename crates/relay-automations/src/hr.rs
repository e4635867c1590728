//! HR automation: leave and expense triage.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use relay_providers::{Domain, ErpClient};
use relay_types::{AutomationType, EventType};

use crate::automation::Automation;
use crate::handler::{handler, EventCtx, HandlerTable};
use crate::result::AutomationResult;

/// Short leaves auto-approve; anything longer is routed to a manager.
const AUTO_APPROVE_LEAVE_DAYS: f64 = 2.0;
/// Expenses below this amount with a receipt reference auto-approve.
const AUTO_APPROVE_EXPENSE_LIMIT: f64 = 200.0;

pub struct HrAutomation {
    erp: Arc<dyn ErpClient>,
}

impl HrAutomation {
    pub fn new(erp: Arc<dyn ErpClient>) -> Arc<Self> {
        Arc::new(Self { erp })
    }

    async fn on_create_leave(self: Arc<Self>, ctx: EventCtx) -> anyhow::Result<AutomationResult> {
        let days = ctx
            .values
            .get("number_of_days")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        let Some(employee_id) = ctx.values.get("employee_id").and_then(relay_providers::id_of)
        else {
            return Ok(AutomationResult::ok("leave_review", &ctx.model, ctx.record_id)
                .with_reasoning("Leave has no employee"));
        };

        // Overlapping approved leave in the team forces review.
        let overlapping = self
            .erp
            .search_count(
                "hr.leave",
                &Domain::filter("employee_id", "=", employee_id)
                    .and_filter("state", "=", "validate")
                    .and_filter("id", "!=", ctx.record_id),
            )
            .await?;

        if days > 0.0 && days <= AUTO_APPROVE_LEAVE_DAYS && overlapping == 0 {
            Ok(AutomationResult::ok("approve_leave", &ctx.model, ctx.record_id)
                .with_confidence(0.96)
                .with_reasoning(format!("{days:.1}-day leave within auto-approve policy"))
                .with_change("approve", json!(true)))
        } else {
            Ok(AutomationResult::ok("leave_review", &ctx.model, ctx.record_id)
                .with_confidence(0.4)
                .with_reasoning(format!(
                    "{days:.1}-day leave routed to manager ({overlapping} overlapping approvals)"
                )))
        }
    }

    async fn on_create_expense(self: Arc<Self>, ctx: EventCtx) -> anyhow::Result<AutomationResult> {
        let amount = ctx
            .values
            .get("total_amount")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        let has_reference = ctx
            .values
            .get("reference")
            .and_then(Value::as_str)
            .map(|r| !r.is_empty())
            .unwrap_or(false);

        if amount > 0.0 && amount <= AUTO_APPROVE_EXPENSE_LIMIT && has_reference {
            Ok(AutomationResult::ok("approve_expense", &ctx.model, ctx.record_id)
                .with_confidence(0.95)
                .with_reasoning(format!("Receipted expense of {amount:.2} within policy"))
                .with_change("approve", json!(true)))
        } else {
            Ok(AutomationResult::ok("expense_review", &ctx.model, ctx.record_id)
                .with_confidence(0.45)
                .with_reasoning(if has_reference {
                    format!("Expense of {amount:.2} exceeds auto-approve limit")
                } else {
                    "Expense is missing a receipt reference".to_string()
                }))
        }
    }
}

#[async_trait]
impl Automation for HrAutomation {
    fn automation_type(&self) -> AutomationType {
        AutomationType::Hr
    }

    fn watched_models(&self) -> Vec<String> {
        vec!["hr.leave".to_string(), "hr.expense".to_string()]
    }

    fn handlers(self: Arc<Self>) -> HandlerTable {
        HandlerTable::new()
            .on(
                EventType::Create,
                "hr.leave",
                handler(&self, |a, ctx| a.on_create_leave(ctx)),
            )
            .on(
                EventType::Create,
                "hr.expense",
                handler(&self, |a, ctx| a.on_create_expense(ctx)),
            )
    }

    async fn execute_approved(
        &self,
        action: &str,
        model: &str,
        record_id: i64,
        _changes: &Value,
    ) -> anyhow::Result<AutomationResult> {
        match action {
            "approve_leave" => {
                self.erp
                    .execute_method(model, "action_validate", &[record_id], Vec::new())
                    .await?;
                Ok(AutomationResult::ok(action, model, record_id)
                    .with_change("validated", json!(true))
                    .with_reasoning("Leave validated"))
            }
            "approve_expense" => {
                self.erp
                    .execute_method(model, "action_approve", &[record_id], Vec::new())
                    .await?;
                Ok(AutomationResult::ok(action, model, record_id)
                    .with_change("approved", json!(true))
                    .with_reasoning("Expense approved"))
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
    use crate::testing::MockErp;
    use serde_json::Map;

    #[tokio::test]
    async fn short_leave_auto_approves() {
        let automation = HrAutomation::new(MockErp::new());
        let mut values = Map::new();
        values.insert("employee_id".into(), json!([5, "Sam Lee"]));
        values.insert("number_of_days".into(), json!(1.0));
        let ctx = EventCtx::new(EventType::Create, "hr.leave", 3).with_values(values);
        let result = Arc::clone(&automation).on_create_leave(ctx).await.unwrap();
        assert_eq!(result.action, "approve_leave");
        assert!(result.confidence >= 0.95);
    }

    #[tokio::test]
    async fn long_leave_routes_to_review() {
        let automation = HrAutomation::new(MockErp::new());
        let mut values = Map::new();
        values.insert("employee_id".into(), json!([5, "Sam Lee"]));
        values.insert("number_of_days".into(), json!(10.0));
        let ctx = EventCtx::new(EventType::Create, "hr.leave", 3).with_values(values);
        let result = Arc::clone(&automation).on_create_leave(ctx).await.unwrap();
        assert_eq!(result.action, "leave_review");
    }

    #[tokio::test]
    async fn unreceipted_expense_goes_to_review() {
        let automation = HrAutomation::new(MockErp::new());
        let mut values = Map::new();
        values.insert("total_amount".into(), json!(50.0));
        let ctx = EventCtx::new(EventType::Create, "hr.expense", 8).with_values(values);
        let result = Arc::clone(&automation).on_create_expense(ctx).await.unwrap();
        assert_eq!(result.action, "expense_review");
        assert!(result.reasoning.contains("receipt"));
    }
}
