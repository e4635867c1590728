//! Project automation: overdue-task risk flagging.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Map, Value};

use relay_providers::{Domain, ErpClient};
use relay_types::{AutomationType, EventType};

use crate::automation::Automation;
use crate::handler::{handler, EventCtx, HandlerTable};
use crate::result::AutomationResult;

pub struct ProjectAutomation {
    erp: Arc<dyn ErpClient>,
}

impl ProjectAutomation {
    pub fn new(erp: Arc<dyn ErpClient>) -> Arc<Self> {
        Arc::new(Self { erp })
    }

    async fn on_write_task(self: Arc<Self>, ctx: EventCtx) -> anyhow::Result<AutomationResult> {
        let deadline = ctx
            .values
            .get("date_deadline")
            .and_then(Value::as_str)
            .unwrap_or("");
        let stage_done = ctx
            .values
            .get("stage_id")
            .and_then(relay_providers::display_name_of)
            .map(|s| s.eq_ignore_ascii_case("done"))
            .unwrap_or(false);

        let today = Utc::now().date_naive().to_string();
        if !deadline.is_empty() && deadline < today.as_str() && !stage_done {
            Ok(AutomationResult::ok("flag_overdue_task", &ctx.model, ctx.record_id)
                .with_confidence(0.9)
                .with_reasoning(format!("Task deadline {deadline} passed without completion"))
                .with_change("deadline", json!(deadline))
                .requiring_approval())
        } else {
            Ok(AutomationResult::ok("no_action", &ctx.model, ctx.record_id)
                .with_reasoning("Task on track"))
        }
    }

    /// Projects with a growing overdue backlog.
    pub async fn scan_overdue_tasks(&self) -> anyhow::Result<Value> {
        let today = Utc::now().date_naive().to_string();
        let overdue = self
            .erp
            .search_count(
                "project.task",
                &Domain::filter("date_deadline", "<", today.as_str())
                    .and_filter("stage_id.fold", "=", false),
            )
            .await?;
        Ok(json!({ "overdue_tasks": overdue }))
    }
}

#[async_trait]
impl Automation for ProjectAutomation {
    fn automation_type(&self) -> AutomationType {
        AutomationType::Project
    }

    fn watched_models(&self) -> Vec<String> {
        vec!["project.task".to_string()]
    }

    fn handlers(self: Arc<Self>) -> HandlerTable {
        HandlerTable::new().on(
            EventType::Write,
            "project.task",
            handler(&self, |a, ctx| a.on_write_task(ctx)),
        )
    }

    fn scan_names(&self) -> Vec<&'static str> {
        vec!["overdue_tasks"]
    }

    async fn run_scan(&self, name: &str) -> Option<anyhow::Result<Value>> {
        match name {
            "overdue_tasks" => Some(self.scan_overdue_tasks().await),
            _ => None,
        }
    }

    async fn execute_approved(
        &self,
        action: &str,
        model: &str,
        record_id: i64,
        changes: &Value,
    ) -> anyhow::Result<AutomationResult> {
        match action {
            "flag_overdue_task" => {
                let deadline = changes.get("deadline").and_then(Value::as_str).unwrap_or("");
                let mut values = Map::new();
                values.insert("priority".to_string(), json!("1"));
                values.insert(
                    "description".to_string(),
                    json!(format!("Flagged overdue (deadline {deadline})")),
                );
                self.erp.write(model, &[record_id], values).await?;
                Ok(AutomationResult::ok(action, model, record_id)
                    .with_change("escalated", json!(true))
                    .with_reasoning("Task escalated"))
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

    #[tokio::test]
    async fn overdue_task_is_flagged() {
        let automation = ProjectAutomation::new(MockErp::new());
        let mut values = Map::new();
        values.insert("date_deadline".into(), json!("2020-01-01"));
        values.insert("stage_id".into(), json!([3, "In Progress"]));
        let ctx = EventCtx::new(EventType::Write, "project.task", 2).with_values(values);
        let result = Arc::clone(&automation).on_write_task(ctx).await.unwrap();
        assert_eq!(result.action, "flag_overdue_task");
        assert!(result.needs_approval);
    }

    #[tokio::test]
    async fn done_task_is_ignored() {
        let automation = ProjectAutomation::new(MockErp::new());
        let mut values = Map::new();
        values.insert("date_deadline".into(), json!("2020-01-01"));
        values.insert("stage_id".into(), json!([9, "Done"]));
        let ctx = EventCtx::new(EventType::Write, "project.task", 2).with_values(values);
        let result = Arc::clone(&automation).on_write_task(ctx).await.unwrap();
        assert_eq!(result.action, "no_action");
    }
}
