//! Daily digest automation: per-role aggregation, AI narrative with a
//! deterministic fallback, and channel delivery with per-channel outcomes.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::warn;

use relay_providers::{Domain, ErpClient, LlmClient, Notifier, NotifyOutcome, ToolSpec};
use relay_store::Store;
use relay_types::AutomationType;

use crate::automation::Automation;
use crate::handler::HandlerTable;
use crate::result::AutomationResult;

pub const DIGEST_ROLES: [&str; 3] = ["cfo", "sales", "warehouse"];

const NARRATIVE_PROMPT: &str = "You are an executive briefing assistant. Summarize the day's \
business metrics into a short narrative with the two or three items that most deserve \
attention. Be specific with numbers.";

fn narrative_tools() -> Vec<ToolSpec> {
    vec![ToolSpec {
        name: "digest_narrative".to_string(),
        description: "Produce the digest narrative and attention items".to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "narrative": {"type": "string"},
                "attention_items": {"type": "array", "items": {"type": "string"}}
            },
            "required": ["narrative"]
        }),
    }]
}

pub struct DigestAutomation {
    erp: Arc<dyn ErpClient>,
    llm: Arc<dyn LlmClient>,
    store: Arc<Store>,
    notifiers: Vec<Arc<dyn Notifier>>,
}

impl DigestAutomation {
    pub fn new(
        erp: Arc<dyn ErpClient>,
        llm: Arc<dyn LlmClient>,
        store: Arc<Store>,
        notifiers: Vec<Arc<dyn Notifier>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            erp,
            llm,
            store,
            notifiers,
        })
    }

    /// Build, persist, and deliver one role's digest for today.
    pub async fn generate_digest(&self, role: &str) -> anyhow::Result<i64> {
        let today = Utc::now().date_naive();
        let data = self.aggregate_role_data(role).await?;
        let narrative = self.narrative_for(role, &data).await;

        let content = json!({
            "role": role,
            "date": today.to_string(),
            "metrics": data,
            "narrative": &narrative,
        });
        let digest_id = self.store.insert_digest(role, today, &content).await?;

        let mut channels_sent: Vec<String> = Vec::new();
        let mut failures: Vec<String> = Vec::new();
        for notifier in &self.notifiers {
            match notifier
                .send(&format!("Daily digest — {role}"), &narrative)
                .await
            {
                NotifyOutcome::Sent => channels_sent.push(notifier.channel_name().to_string()),
                // Disabled channels simply do not appear in channels_sent.
                NotifyOutcome::ChannelDisabled => {}
                NotifyOutcome::Failed { reason } => {
                    warn!(channel = notifier.channel_name(), reason, "digest delivery failed");
                    failures.push(format!("{}: {reason}", notifier.channel_name()));
                }
            }
        }
        if !channels_sent.is_empty() {
            self.store
                .mark_digest_delivered(digest_id, &channels_sent)
                .await?;
        }
        Ok(digest_id)
    }

    pub async fn generate_all(&self) -> anyhow::Result<Vec<i64>> {
        let mut ids = Vec::new();
        for role in DIGEST_ROLES {
            ids.push(self.generate_digest(role).await?);
        }
        Ok(ids)
    }

    async fn aggregate_role_data(&self, role: &str) -> anyhow::Result<Value> {
        match role {
            "cfo" => {
                let open_ar = self
                    .erp
                    .search_count(
                        "account.move",
                        &Domain::filter("move_type", "=", "out_invoice")
                            .and_filter("payment_state", "in", json!(["not_paid", "partial"]))
                            .and_filter("state", "=", "posted"),
                    )
                    .await?;
                let open_ap = self
                    .erp
                    .search_count(
                        "account.move",
                        &Domain::filter("move_type", "=", "in_invoice")
                            .and_filter("payment_state", "in", json!(["not_paid", "partial"]))
                            .and_filter("state", "=", "posted"),
                    )
                    .await?;
                let stats = self.store.audit_stats_today().await?;
                Ok(json!({
                    "open_ar_invoices": open_ar,
                    "open_ap_bills": open_ap,
                    "pending_approvals": stats.pending_approvals,
                    "automations_today": stats.today,
                    "tokens_today": stats.tokens_today,
                }))
            }
            "sales" => {
                let open_opportunities = self
                    .erp
                    .search_count(
                        "crm.lead",
                        &Domain::filter("type", "=", "opportunity").and_filter("active", "=", true),
                    )
                    .await?;
                let quotations = self
                    .erp
                    .search_count("sale.order", &Domain::filter("state", "=", "draft"))
                    .await?;
                Ok(json!({
                    "open_opportunities": open_opportunities,
                    "draft_quotations": quotations,
                }))
            }
            "warehouse" => {
                let pending_pickings = self
                    .erp
                    .search_count(
                        "stock.picking",
                        &Domain::filter("state", "in", json!(["confirmed", "assigned"])),
                    )
                    .await?;
                Ok(json!({ "pending_pickings": pending_pickings }))
            }
            other => anyhow::bail!("unknown digest role `{other}`"),
        }
    }

    async fn narrative_for(&self, role: &str, data: &Value) -> String {
        match self
            .llm
            .analyze(
                NARRATIVE_PROMPT,
                &format!("Role: {role}\nMetrics: {data}"),
                &narrative_tools(),
                None,
            )
            .await
        {
            Ok(analysis) => analysis
                .tool_input()
                .and_then(|i| i.get("narrative"))
                .and_then(Value::as_str)
                .map(|s| s.to_string())
                .unwrap_or_else(|| fallback_narrative(role, data)),
            Err(err) => {
                warn!(error = %err, "digest narrative failed, using fallback");
                fallback_narrative(role, data)
            }
        }
    }
}

fn fallback_narrative(role: &str, data: &Value) -> String {
    let metrics = data
        .as_object()
        .map(|m| {
            m.iter()
                .map(|(k, v)| format!("{}: {v}", k.replace('_', " ")))
                .collect::<Vec<_>>()
                .join(" | ")
        })
        .unwrap_or_default();
    format!("Daily digest for {role} — {metrics}")
}

#[async_trait]
impl Automation for DigestAutomation {
    fn automation_type(&self) -> AutomationType {
        AutomationType::Reporting
    }

    fn watched_models(&self) -> Vec<String> {
        Vec::new()
    }

    fn handlers(self: Arc<Self>) -> HandlerTable {
        HandlerTable::new()
    }

    fn scan_names(&self) -> Vec<&'static str> {
        vec!["daily_digests"]
    }

    async fn run_scan(&self, name: &str) -> Option<anyhow::Result<Value>> {
        if name != "daily_digests" {
            return None;
        }
        Some(self.generate_all().await.map(|ids| json!({ "digests": ids })))
    }

    async fn execute_approved(
        &self,
        action: &str,
        model: &str,
        record_id: i64,
        _changes: &Value,
    ) -> anyhow::Result<AutomationResult> {
        Ok(AutomationResult::ok(action, model, record_id)
            .with_reasoning("Digest generation carries no ERP side effects"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockErp, ScriptedLlm};
    use relay_providers::NoopNotifier;
    use tokio::sync::Mutex;

    struct RecordingNotifier {
        name: String,
        outcome: NotifyOutcome,
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        fn channel_name(&self) -> &str {
            &self.name
        }

        async fn send(&self, subject: &str, _body: &str) -> NotifyOutcome {
            self.sent.lock().await.push(subject.to_string());
            self.outcome.clone()
        }
    }

    #[tokio::test]
    async fn digest_records_only_delivered_channels() {
        let erp = MockErp::new();
        let store = Arc::new(Store::in_memory().await.unwrap());
        let good = Arc::new(RecordingNotifier {
            name: "slack".to_string(),
            outcome: NotifyOutcome::Sent,
            sent: Mutex::new(Vec::new()),
        });
        let broken = Arc::new(RecordingNotifier {
            name: "teams".to_string(),
            outcome: NotifyOutcome::Failed {
                reason: "410".to_string(),
            },
            sent: Mutex::new(Vec::new()),
        });
        let automation = DigestAutomation::new(
            erp,
            ScriptedLlm::empty(),
            store.clone(),
            vec![good.clone(), broken, Arc::new(NoopNotifier)],
        );

        let digest_id = automation.generate_digest("cfo").await.unwrap();
        let digest = store
            .digest_for("cfo", Utc::now().date_naive())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(digest.id, digest_id);
        assert!(digest.delivered);
        // failed and disabled channels both stay out of channels_sent
        assert_eq!(digest.channels_sent, vec!["slack".to_string()]);
        assert_eq!(good.sent.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn fallback_narrative_mentions_metrics() {
        let erp = MockErp::new();
        let store = Arc::new(Store::in_memory().await.unwrap());
        let automation =
            DigestAutomation::new(erp, ScriptedLlm::empty(), store.clone(), Vec::new());
        automation.generate_digest("sales").await.unwrap();
        let digest = store
            .digest_for("sales", Utc::now().date_naive())
            .await
            .unwrap()
            .unwrap();
        let narrative = digest.content.get("narrative").unwrap().as_str().unwrap();
        assert!(narrative.contains("sales"));
        assert!(narrative.contains("open opportunities"));
        assert!(!digest.delivered);
    }

    #[tokio::test]
    async fn unknown_role_is_rejected() {
        let automation = DigestAutomation::new(
            MockErp::new(),
            ScriptedLlm::empty(),
            Arc::new(Store::in_memory().await.unwrap()),
            Vec::new(),
        );
        assert!(automation.generate_digest("janitor").await.is_err());
    }
}
