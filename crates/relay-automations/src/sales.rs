//! Sales automation: quotation sanity check on create.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use relay_providers::{Domain, ErpClient, LlmClient, ToolSpec};
use relay_types::{AutomationType, EventType};

use crate::automation::Automation;
use crate::handler::{handler, EventCtx, HandlerTable};
use crate::result::AutomationResult;

const QUOTE_PROMPT: &str = "You are a sales controller. Review new quotations for pricing \
sanity: unusual discounts, totals far from the customer's history, and missing payment \
terms. Be conservative: only flag clear outliers.";

fn quote_tools() -> Vec<ToolSpec> {
    vec![ToolSpec {
        name: "review_quotation".to_string(),
        description: "Review a quotation for pricing anomalies".to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "ok": {"type": "boolean"},
                "issues": {"type": "array", "items": {"type": "string"}},
                "confidence": {"type": "number"},
                "reasoning": {"type": "string"}
            },
            "required": ["ok", "confidence", "reasoning"]
        }),
    }]
}

pub struct SalesAutomation {
    erp: Arc<dyn ErpClient>,
    llm: Arc<dyn LlmClient>,
}

impl SalesAutomation {
    pub fn new(erp: Arc<dyn ErpClient>, llm: Arc<dyn LlmClient>) -> Arc<Self> {
        Arc::new(Self { erp, llm })
    }

    async fn on_create_order(self: Arc<Self>, ctx: EventCtx) -> anyhow::Result<AutomationResult> {
        let partner_history = match ctx.values.get("partner_id").and_then(relay_providers::id_of) {
            Some(partner_id) => {
                self.erp
                    .search_read(
                        "sale.order",
                        &Domain::filter("partner_id", "=", partner_id)
                            .and_filter("state", "in", json!(["sale", "done"])),
                        &["amount_total", "date_order"],
                        Some(20),
                        None,
                    )
                    .await?
            }
            None => Vec::new(),
        };

        let analysis = self
            .llm
            .analyze(
                QUOTE_PROMPT,
                &format!(
                    "Quotation:\n{}\n\nCustomer order history:\n{}",
                    Value::Object(ctx.values.clone()),
                    serde_json::to_string(&partner_history)?,
                ),
                &quote_tools(),
                None,
            )
            .await?;

        let Some(input) = analysis.tool_input().cloned() else {
            return Ok(AutomationResult::ok("review_quotation", &ctx.model, ctx.record_id)
                .with_reasoning("Review produced no structured result"));
        };

        let ok = input.get("ok").and_then(Value::as_bool).unwrap_or(true);
        let confidence = input.get("confidence").and_then(Value::as_f64).unwrap_or(0.0);
        let reasoning = input
            .get("reasoning")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        if ok {
            Ok(AutomationResult::ok("review_quotation", &ctx.model, ctx.record_id)
                .with_confidence(confidence.min(0.5))
                .with_reasoning(reasoning)
                .with_tokens(analysis.tokens_used))
        } else {
            Ok(AutomationResult::ok("flag_quotation", &ctx.model, ctx.record_id)
                .with_confidence(confidence)
                .with_reasoning(reasoning)
                .with_change("issues", input.get("issues").cloned().unwrap_or(json!([])))
                .with_tokens(analysis.tokens_used)
                .requiring_approval())
        }
    }
}

#[async_trait]
impl Automation for SalesAutomation {
    fn automation_type(&self) -> AutomationType {
        AutomationType::Sales
    }

    fn watched_models(&self) -> Vec<String> {
        vec!["sale.order".to_string()]
    }

    fn handlers(self: Arc<Self>) -> HandlerTable {
        HandlerTable::new().on(
            EventType::Create,
            "sale.order",
            handler(&self, |a, ctx| a.on_create_order(ctx)),
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
            "flag_quotation" => {
                let issues = changes.get("issues").cloned().unwrap_or(json!([]));
                let mut values = Map::new();
                values.insert(
                    "note".to_string(),
                    json!(format!("Pricing review flagged issues: {issues}")),
                );
                self.erp.write(model, &[record_id], values).await?;
                Ok(AutomationResult::ok(action, model, record_id)
                    .with_change("note_set", json!(true))
                    .with_reasoning("Review note written to quotation"))
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
    async fn clean_quote_is_a_note() {
        let llm = ScriptedLlm::new(vec![ScriptedLlm::tool_reply(
            "review_quotation",
            json!({"ok": true, "confidence": 0.9, "reasoning": "in line with history"}),
            70,
        )]);
        let automation = SalesAutomation::new(MockErp::new(), llm);
        let ctx = EventCtx::new(EventType::Create, "sale.order", 4);
        let result = automation.on_create_order(ctx).await.unwrap();
        assert_eq!(result.action, "review_quotation");
        assert!(!result.needs_approval);
        assert!(result.confidence <= 0.5);
    }

    #[tokio::test]
    async fn outlier_quote_needs_approval() {
        let llm = ScriptedLlm::new(vec![ScriptedLlm::tool_reply(
            "review_quotation",
            json!({"ok": false, "issues": ["74% discount"], "confidence": 0.91,
                   "reasoning": "discount far above policy"}),
            70,
        )]);
        let automation = SalesAutomation::new(MockErp::new(), llm);
        let ctx = EventCtx::new(EventType::Create, "sale.order", 4);
        let result = automation.on_create_order(ctx).await.unwrap();
        assert_eq!(result.action, "flag_quotation");
        assert!(result.needs_approval);
    }
}
