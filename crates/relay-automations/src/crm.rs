//! CRM automation: lead scoring on create.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use relay_providers::{ErpClient, LlmClient, ToolSpec};
use relay_types::{AutomationType, EventType};

use crate::automation::Automation;
use crate::handler::{handler, EventCtx, HandlerTable};
use crate::result::AutomationResult;

const LEAD_PROMPT: &str = "You are a sales operations assistant. Score incoming leads for \
conversion likelihood using contact completeness, company signals, and the stated interest. \
Return a priority and expected revenue estimate with confidence.";

fn lead_tools() -> Vec<ToolSpec> {
    vec![ToolSpec {
        name: "score_lead".to_string(),
        description: "Score a new lead".to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "priority": {"type": "string", "enum": ["0", "1", "2", "3"]},
                "expected_revenue": {"type": "number"},
                "confidence": {"type": "number"},
                "reasoning": {"type": "string"}
            },
            "required": ["priority", "confidence", "reasoning"]
        }),
    }]
}

pub struct CrmAutomation {
    erp: Arc<dyn ErpClient>,
    llm: Arc<dyn LlmClient>,
}

impl CrmAutomation {
    pub fn new(erp: Arc<dyn ErpClient>, llm: Arc<dyn LlmClient>) -> Arc<Self> {
        Arc::new(Self { erp, llm })
    }

    async fn on_create_lead(self: Arc<Self>, ctx: EventCtx) -> anyhow::Result<AutomationResult> {
        let analysis = self
            .llm
            .analyze(
                LEAD_PROMPT,
                &format!("New lead:\n{}", Value::Object(ctx.values.clone())),
                &lead_tools(),
                None,
            )
            .await?;

        let Some(input) = analysis.tool_input().cloned() else {
            return Ok(AutomationResult::failure(
                "score_lead",
                &ctx.model,
                ctx.record_id,
                "Lead scoring produced no structured result",
            ));
        };

        let confidence = input.get("confidence").and_then(Value::as_f64).unwrap_or(0.0);
        Ok(AutomationResult::ok("score_lead", &ctx.model, ctx.record_id)
            .with_confidence(confidence)
            .with_reasoning(
                input
                    .get("reasoning")
                    .and_then(Value::as_str)
                    .unwrap_or_default(),
            )
            .with_change("scoring", input)
            .with_tokens(analysis.tokens_used))
    }
}

#[async_trait]
impl Automation for CrmAutomation {
    fn automation_type(&self) -> AutomationType {
        AutomationType::Crm
    }

    fn watched_models(&self) -> Vec<String> {
        vec!["crm.lead".to_string()]
    }

    fn handlers(self: Arc<Self>) -> HandlerTable {
        HandlerTable::new().on(
            EventType::Create,
            "crm.lead",
            handler(&self, |a, ctx| a.on_create_lead(ctx)),
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
            "score_lead" => {
                let scoring = changes.get("scoring").cloned().unwrap_or(Value::Null);
                let mut values = Map::new();
                if let Some(priority) = scoring.get("priority").and_then(Value::as_str) {
                    values.insert("priority".to_string(), json!(priority));
                }
                if let Some(revenue) = scoring.get("expected_revenue").and_then(Value::as_f64) {
                    values.insert("expected_revenue".to_string(), json!(revenue));
                }
                if !values.is_empty() {
                    self.erp.write(model, &[record_id], values).await?;
                }
                Ok(AutomationResult::ok(action, model, record_id)
                    .with_change("scoring", scoring)
                    .with_reasoning("Lead priority applied"))
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
    async fn lead_scoring_carries_structured_changes() {
        let llm = ScriptedLlm::new(vec![ScriptedLlm::tool_reply(
            "score_lead",
            json!({"priority": "2", "expected_revenue": 12_000.0,
                   "confidence": 0.88, "reasoning": "complete contact, named budget"}),
            95,
        )]);
        let automation = CrmAutomation::new(MockErp::new(), llm);

        let mut values = Map::new();
        values.insert("contact_name".into(), json!("Pat Doe"));
        values.insert("email_from".into(), json!("pat@acme.com"));
        let ctx = EventCtx::new(EventType::Create, "crm.lead", 31).with_values(values);

        let result = automation.on_create_lead(ctx).await.unwrap();
        assert_eq!(result.action, "score_lead");
        assert_eq!(result.confidence, 0.88);
        assert!(result.changes_made.contains_key("scoring"));
    }

    #[tokio::test]
    async fn approved_scoring_writes_priority() {
        let erp = MockErp::new();
        erp.seed("crm.lead", vec![json!({"id": 31, "name": "Lead"})]).await;
        let automation = CrmAutomation::new(erp.clone(), ScriptedLlm::empty());

        automation
            .execute_approved(
                "score_lead",
                "crm.lead",
                31,
                &json!({"scoring": {"priority": "3", "expected_revenue": 9000.0}}),
            )
            .await
            .unwrap();
        let written = erp.written.lock().await;
        assert_eq!(written[0].2.get("priority"), Some(&json!("3")));
    }
}
