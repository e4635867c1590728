//! Accounting automation: anomaly flagging on new journal entries,
//! transaction categorization assist, and a stale-draft scan.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::{json, Map, Value};

use relay_providers::{id_of, Domain, ErpClient, LlmClient, ToolSpec};
use relay_types::{AutomationType, EventType};

use crate::automation::Automation;
use crate::handler::{handler, EventCtx, HandlerTable};
use crate::result::AutomationResult;

const SYSTEM_PROMPT: &str = "You are an expert accounting assistant integrated with an ERP. \
You analyze financial transactions and make precise decisions. Always provide confidence \
scores and clear reasoning. When matching transactions, consider amount, date proximity, \
partner name, and payment reference patterns.";

fn anomaly_tools() -> Vec<ToolSpec> {
    vec![ToolSpec {
        name: "flag_anomaly".to_string(),
        description: "Flag a journal entry that deviates from the partner's history".to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "is_anomaly": {"type": "boolean"},
                "anomaly_type": {"type": "string"},
                "severity": {"type": "string", "enum": ["low", "medium", "high"]},
                "confidence": {"type": "number"},
                "reasoning": {"type": "string"}
            },
            "required": ["is_anomaly", "confidence", "reasoning"]
        }),
    }]
}

fn categorize_tools() -> Vec<ToolSpec> {
    vec![ToolSpec {
        name: "categorize_transaction".to_string(),
        description: "Categorize a transaction and identify its partner".to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "category": {"type": "string"},
                "partner_id": {"type": "integer"},
                "confidence": {"type": "number"},
                "reasoning": {"type": "string"}
            },
            "required": ["category", "confidence", "reasoning"]
        }),
    }]
}

pub struct AccountingAutomation {
    erp: Arc<dyn ErpClient>,
    llm: Arc<dyn LlmClient>,
}

impl AccountingAutomation {
    pub fn new(erp: Arc<dyn ErpClient>, llm: Arc<dyn LlmClient>) -> Arc<Self> {
        Arc::new(Self { erp, llm })
    }

    async fn on_create_move(self: Arc<Self>, ctx: EventCtx) -> anyhow::Result<AutomationResult> {
        let partner_id = ctx.values.get("partner_id").and_then(id_of);

        let historical = match partner_id {
            Some(partner_id) => {
                self.erp
                    .search_read(
                        "account.move",
                        &Domain::filter("partner_id", "=", partner_id)
                            .and_filter("state", "=", "posted")
                            .and_filter("id", "!=", ctx.record_id),
                        &["amount_total", "invoice_date", "move_type"],
                        Some(20),
                        None,
                    )
                    .await?
            }
            None => Vec::new(),
        };

        let user_msg = format!(
            "Analyze this journal entry for anomalies.\n\nCurrent entry:\n{}\n\n\
             Historical entries with this partner:\n{}\n\n\
             Check for unusual amounts, unusual timing, potential duplicates, \
             and missing references.",
            Value::Object(ctx.values.clone()),
            serde_json::to_string(&historical)?,
        );

        let analysis = self
            .llm
            .analyze(SYSTEM_PROMPT, &user_msg, &anomaly_tools(), None)
            .await?;

        let Some(input) = analysis.tool_input().cloned() else {
            return Ok(AutomationResult::failure(
                "flag_anomaly",
                &ctx.model,
                ctx.record_id,
                "Anomaly detection produced no structured result",
            ));
        };

        let is_anomaly = input.get("is_anomaly").and_then(Value::as_bool).unwrap_or(false);
        let confidence = input.get("confidence").and_then(Value::as_f64).unwrap_or(0.0);
        let reasoning = input
            .get("reasoning")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let mut result = AutomationResult::ok("flag_anomaly", &ctx.model, ctx.record_id)
            .with_reasoning(reasoning)
            .with_tokens(analysis.tokens_used);

        if is_anomaly {
            result = result
                .with_confidence(confidence)
                .with_change("anomaly", input.clone())
                .requiring_approval();
        } else {
            // Clean entries are a low-confidence note; nothing to execute.
            result = result.with_confidence(confidence.min(0.5));
        }
        Ok(result)
    }

    async fn on_write_move(self: Arc<Self>, ctx: EventCtx) -> anyhow::Result<AutomationResult> {
        // Only state flips to posted are interesting on write.
        let newly_posted = ctx.values.get("state").and_then(Value::as_str) == Some("posted")
            && ctx.old_values.get("state").and_then(Value::as_str) != Some("posted");
        if !newly_posted {
            return Ok(AutomationResult::ok("no_action", &ctx.model, ctx.record_id)
                .with_reasoning("Write did not post the entry"));
        }

        let analysis = self
            .llm
            .analyze(
                SYSTEM_PROMPT,
                &format!(
                    "Categorize this posted transaction:\n{}",
                    Value::Object(ctx.values.clone())
                ),
                &categorize_tools(),
                None,
            )
            .await?;

        let Some(input) = analysis.tool_input().cloned() else {
            return Ok(AutomationResult::ok("no_action", &ctx.model, ctx.record_id)
                .with_reasoning("Categorization produced no structured result"));
        };

        let confidence = input.get("confidence").and_then(Value::as_f64).unwrap_or(0.0);
        Ok(
            AutomationResult::ok("categorize_transaction", &ctx.model, ctx.record_id)
                .with_confidence(confidence)
                .with_reasoning(
                    input
                        .get("reasoning")
                        .and_then(Value::as_str)
                        .unwrap_or_default(),
                )
                .with_change("categorization", input)
                .with_tokens(analysis.tokens_used),
        )
    }

    /// Draft entries untouched for more than a week.
    pub async fn scan_stale_drafts(&self) -> anyhow::Result<Value> {
        let cutoff = (Utc::now() - Duration::days(7))
            .date_naive()
            .to_string();
        let drafts = self
            .erp
            .search_read(
                "account.move",
                &Domain::filter("state", "=", "draft").and_filter("create_date", "<", cutoff),
                &["name", "partner_id", "amount_total", "create_date"],
                Some(100),
                None,
            )
            .await?;
        Ok(json!({
            "stale_drafts": drafts.len(),
            "ids": drafts
                .iter()
                .filter_map(|d| d.get("id").and_then(Value::as_i64))
                .collect::<Vec<_>>(),
        }))
    }
}

#[async_trait]
impl Automation for AccountingAutomation {
    fn automation_type(&self) -> AutomationType {
        AutomationType::Accounting
    }

    fn watched_models(&self) -> Vec<String> {
        vec!["account.move".to_string()]
    }

    fn handlers(self: Arc<Self>) -> HandlerTable {
        HandlerTable::new()
            .on(
                EventType::Create,
                "account.move",
                handler(&self, |a, ctx| a.on_create_move(ctx)),
            )
            .on(
                EventType::Write,
                "account.move",
                handler(&self, |a, ctx| a.on_write_move(ctx)),
            )
    }

    fn scan_names(&self) -> Vec<&'static str> {
        vec!["stale_drafts"]
    }

    async fn run_scan(&self, name: &str) -> Option<anyhow::Result<Value>> {
        match name {
            "stale_drafts" => Some(self.scan_stale_drafts().await),
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
            "flag_anomaly" => {
                let anomaly = changes.get("anomaly").cloned().unwrap_or(Value::Null);
                let severity = anomaly
                    .get("severity")
                    .and_then(Value::as_str)
                    .unwrap_or("medium")
                    .to_uppercase();
                let note = format!(
                    "AI ANOMALY [{severity}]: {} — {}",
                    anomaly
                        .get("anomaly_type")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown"),
                    anomaly.get("reasoning").and_then(Value::as_str).unwrap_or(""),
                );
                let mut values = Map::new();
                values.insert("narration".to_string(), json!(note));
                self.erp.write(model, &[record_id], values).await?;
                Ok(AutomationResult::ok(action, model, record_id)
                    .with_change("narration_set", json!(true))
                    .with_reasoning("Anomaly note written to the entry"))
            }
            "categorize_transaction" => {
                let categorization = changes.get("categorization").cloned().unwrap_or(Value::Null);
                let mut values = Map::new();
                if let Some(partner_id) =
                    categorization.get("partner_id").and_then(Value::as_i64).filter(|p| *p > 0)
                {
                    values.insert("partner_id".to_string(), json!(partner_id));
                }
                if !values.is_empty() {
                    self.erp.write(model, &[record_id], values).await?;
                }
                Ok(AutomationResult::ok(action, model, record_id)
                    .with_change("categorization", categorization)
                    .with_reasoning("Categorization applied"))
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
    async fn anomaly_result_requires_approval_in_band() {
        let erp = MockErp::new();
        let llm = ScriptedLlm::new(vec![ScriptedLlm::tool_reply(
            "flag_anomaly",
            json!({"is_anomaly": true, "anomaly_type": "amount_spike",
                   "severity": "high", "confidence": 0.9,
                   "reasoning": "Amount is 8x the partner average"}),
            120,
        )]);
        let automation = AccountingAutomation::new(erp, llm);

        let mut values = Map::new();
        values.insert("partner_id".into(), json!([42, "Acme"]));
        values.insert("amount_total".into(), json!(80_000.0));
        let ctx = EventCtx::new(EventType::Create, "account.move", 7).with_values(values);

        let result = automation.on_create_move(ctx).await.unwrap();
        assert!(result.success);
        assert!(result.needs_approval);
        assert_eq!(result.confidence, 0.9);
        assert_eq!(result.tokens_used, 120);
    }

    #[tokio::test]
    async fn clean_entry_is_note_only() {
        let erp = MockErp::new();
        let llm = ScriptedLlm::new(vec![ScriptedLlm::tool_reply(
            "flag_anomaly",
            json!({"is_anomaly": false, "confidence": 0.95, "reasoning": "Matches history"}),
            80,
        )]);
        let automation = AccountingAutomation::new(erp, llm);

        let ctx = EventCtx::new(EventType::Create, "account.move", 7);
        let result = automation.on_create_move(ctx).await.unwrap();
        assert!(!result.needs_approval);
        assert!(result.confidence <= 0.5);
    }

    #[tokio::test]
    async fn write_without_posting_is_no_action() {
        let automation = AccountingAutomation::new(MockErp::new(), ScriptedLlm::empty());
        let mut values = Map::new();
        values.insert("ref".into(), json!("changed"));
        let ctx = EventCtx::new(EventType::Write, "account.move", 7).with_values(values);
        let result = automation.on_write_move(ctx).await.unwrap();
        assert_eq!(result.action, "no_action");
    }

    #[tokio::test]
    async fn approved_anomaly_writes_narration() {
        let erp = MockErp::new();
        erp.seed("account.move", vec![json!({"id": 7, "name": "INV/7"})]).await;
        let automation = AccountingAutomation::new(erp.clone(), ScriptedLlm::empty());

        let changes = json!({"anomaly": {"anomaly_type": "duplicate", "severity": "high",
                                          "reasoning": "same amount twice"}});
        let result = automation
            .execute_approved("flag_anomaly", "account.move", 7, &changes)
            .await
            .unwrap();
        assert!(result.success);

        let written = erp.written.lock().await;
        assert_eq!(written.len(), 1);
        assert!(written[0].2.get("narration").unwrap().as_str().unwrap().contains("HIGH"));
    }
}
