//! Bank reconciliation automation: session lifecycle around the fuzzy
//! matching engine, learned-rule capture on manual matches, and real-time
//! suggestions for freshly imported statement lines.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::info;

use relay_match::recon::{
    generate_suggestions, learned_rule_from_match, BankLine, CandidateEntry, LearnedRule,
    MatchSuggestion,
};
use relay_providers::{display_name_of, Domain, ErpClient};
use relay_store::Store;
use relay_types::{AutomationType, EventType, ReconciliationSession, ReconciliationStatus};

use crate::automation::Automation;
use crate::handler::{handler, EventCtx, HandlerTable};
use crate::result::AutomationResult;

pub const HIGH_CONFIDENCE_THRESHOLD: f64 = 0.90;

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: i64,
    pub total_lines: i64,
    pub auto_matchable: i64,
    pub needs_review: i64,
}

pub struct ReconciliationAutomation {
    erp: Arc<dyn ErpClient>,
    store: Arc<Store>,
}

impl ReconciliationAutomation {
    pub fn new(erp: Arc<dyn ErpClient>, store: Arc<Store>) -> Arc<Self> {
        Arc::new(Self { erp, store })
    }

    /// Load bank lines and candidates, run matching, open a session.
    pub async fn start_session(&self, journal_id: i64, user_id: &str) -> anyhow::Result<SessionSummary> {
        let bank_lines = self.fetch_unreconciled_lines(journal_id).await?;
        let candidates = self.fetch_candidate_entries().await?;
        let rules = self.load_learned_rules(journal_id).await?;

        let suggestions = generate_suggestions(&bank_lines, &candidates, &rules);
        let auto_matchable = suggestions
            .iter()
            .filter(|s| s.confidence >= HIGH_CONFIDENCE_THRESHOLD)
            .count() as i64;

        let session_id = self
            .store
            .create_recon_session(
                user_id,
                journal_id,
                bank_lines.len() as i64,
                &serde_json::to_value(&rules)?,
            )
            .await?;

        info!(session_id, journal_id, lines = bank_lines.len(), "reconciliation session started");

        Ok(SessionSummary {
            session_id,
            total_lines: bank_lines.len() as i64,
            auto_matchable,
            needs_review: bank_lines.len() as i64 - auto_matchable,
        })
    }

    /// Regenerate suggestions for an open session, paged.
    pub async fn suggestions(
        &self,
        session_id: i64,
        page: usize,
        limit: usize,
    ) -> anyhow::Result<(Vec<MatchSuggestion>, usize)> {
        let session = self.store.get_recon_session(session_id).await?;
        let bank_lines = self.fetch_unreconciled_lines(session.journal_id).await?;
        let candidates = self.fetch_candidate_entries().await?;
        let rules: Vec<LearnedRule> =
            serde_json::from_value(session.learned_rules.clone()).unwrap_or_default();

        let mut suggestions = generate_suggestions(&bank_lines, &candidates, &rules);
        suggestions.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let total = suggestions.len();
        let page = page.max(1);
        let limit = if limit == 0 { 20 } else { limit };
        let start = (page - 1) * limit;
        let page_items = suggestions.into_iter().skip(start).take(limit).collect();
        Ok((page_items, total))
    }

    /// Operator confirms a match: reconcile in the ERP, learn a rule from
    /// the pair, bump the manual counter.
    pub async fn manual_match(
        &self,
        session_id: i64,
        bank_line_id: i64,
        entry_id: i64,
    ) -> anyhow::Result<ReconciliationSession> {
        let line = self
            .erp
            .read(
                "account.bank.statement.line",
                bank_line_id,
                &["payment_ref", "partner_id", "amount"],
            )
            .await?;
        let entry = self
            .erp
            .read("account.move", entry_id, &["name", "ref", "partner_id"])
            .await?;

        self.apply_match(bank_line_id, entry_id).await?;

        let rule = learned_rule_from_match(
            line.get("payment_ref").and_then(Value::as_str).unwrap_or(""),
            partner_name(&line),
            entry
                .get("ref")
                .and_then(Value::as_str)
                .or_else(|| entry.get("name").and_then(Value::as_str))
                .unwrap_or(""),
            partner_name(&entry),
        );
        self.store
            .append_learned_rule(session_id, &serde_json::to_value(&rule)?)
            .await?;

        let session = self.store.bump_recon_counters(session_id, 0, 1, 0).await?;
        Ok(session)
    }

    pub async fn skip_line(&self, session_id: i64) -> anyhow::Result<ReconciliationSession> {
        Ok(self.store.bump_recon_counters(session_id, 0, 0, 1).await?)
    }

    pub async fn complete_session(&self, session_id: i64) -> anyhow::Result<()> {
        self.store
            .complete_recon_session(session_id, ReconciliationStatus::Completed)
            .await?;
        Ok(())
    }

    async fn apply_match(&self, bank_line_id: i64, entry_id: i64) -> anyhow::Result<()> {
        self.erp
            .execute_method(
                "account.bank.statement.line",
                "reconcile_with_entry",
                &[bank_line_id],
                vec![json!(entry_id)],
            )
            .await?;
        Ok(())
    }

    async fn load_learned_rules(&self, journal_id: i64) -> anyhow::Result<Vec<LearnedRule>> {
        let raw = self.store.latest_learned_rules(journal_id).await?;
        Ok(serde_json::from_value(raw).unwrap_or_default())
    }

    async fn fetch_unreconciled_lines(&self, journal_id: i64) -> anyhow::Result<Vec<BankLine>> {
        let records = self
            .erp
            .search_read(
                "account.bank.statement.line",
                &Domain::filter("journal_id", "=", journal_id).and_filter("is_reconciled", "=", false),
                &["date", "payment_ref", "partner_id", "amount", "journal_id"],
                Some(200),
                None,
            )
            .await?;
        Ok(records.iter().map(bank_line_of).collect())
    }

    async fn fetch_candidate_entries(&self) -> anyhow::Result<Vec<CandidateEntry>> {
        let records = self
            .erp
            .search_read(
                "account.move",
                &Domain::filter("state", "=", "posted")
                    .and_filter("payment_state", "in", json!(["not_paid", "partial"]))
                    .and_filter("amount_residual", ">", 0),
                &["name", "ref", "partner_id", "amount_total", "amount_residual"],
                Some(200),
                None,
            )
            .await?;
        Ok(records.iter().map(candidate_of).collect())
    }

    /// Webhook path: score a freshly imported statement line and surface the
    /// best match through the gating pipeline.
    async fn on_create_bank_line(
        self: Arc<Self>,
        ctx: EventCtx,
    ) -> anyhow::Result<AutomationResult> {
        let journal_id = ctx
            .values
            .get("journal_id")
            .and_then(relay_providers::id_of)
            .unwrap_or(0);

        let line = BankLine {
            id: ctx.record_id,
            payment_ref: ctx
                .values
                .get("payment_ref")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
            amount: ctx.values.get("amount").and_then(Value::as_f64).unwrap_or(0.0),
            partner: ctx
                .values
                .get("partner_id")
                .and_then(display_name_of)
                .unwrap_or("")
                .to_string(),
            date: None,
        };

        let candidates = self.fetch_candidate_entries().await?;
        let rules = self.load_learned_rules(journal_id).await?;
        let suggestions = generate_suggestions(&[line], &candidates, &rules);
        let best = &suggestions[0];

        match best.matched_entry_id {
            Some(entry_id) => Ok(AutomationResult::ok(
                "suggest_reconciliation",
                &ctx.model,
                ctx.record_id,
            )
            .with_confidence(best.confidence)
            .with_reasoning(best.reasoning.clone())
            .with_change("matched_entry_id", json!(entry_id))
            .with_change("match_type", json!(best.match_type.as_str()))),
            None => Ok(AutomationResult::ok("no_match_found", &ctx.model, ctx.record_id)
                .with_confidence(0.0)
                .with_reasoning(best.reasoning.clone())),
        }
    }
}

fn partner_name(record: &Map<String, Value>) -> &str {
    record
        .get("partner_id")
        .and_then(display_name_of)
        .unwrap_or("")
}

fn bank_line_of(record: &Map<String, Value>) -> BankLine {
    BankLine {
        id: record.get("id").and_then(Value::as_i64).unwrap_or(0),
        payment_ref: record
            .get("payment_ref")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string(),
        amount: record.get("amount").and_then(Value::as_f64).unwrap_or(0.0),
        partner: partner_name(record).to_string(),
        date: record
            .get("date")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok()),
    }
}

fn candidate_of(record: &Map<String, Value>) -> CandidateEntry {
    let residual = record
        .get("amount_residual")
        .and_then(Value::as_f64)
        .filter(|v| *v > 0.0)
        .or_else(|| record.get("amount_total").and_then(Value::as_f64))
        .unwrap_or(0.0);
    CandidateEntry {
        id: record.get("id").and_then(Value::as_i64).unwrap_or(0),
        reference: record
            .get("ref")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .or_else(|| record.get("name").and_then(Value::as_str))
            .unwrap_or("")
            .to_string(),
        amount_residual: residual,
        partner: partner_name(record).to_string(),
    }
}

#[async_trait]
impl Automation for ReconciliationAutomation {
    fn automation_type(&self) -> AutomationType {
        AutomationType::Accounting
    }

    fn watched_models(&self) -> Vec<String> {
        vec!["account.bank.statement.line".to_string()]
    }

    fn handlers(self: Arc<Self>) -> HandlerTable {
        HandlerTable::new().on(
            EventType::Create,
            "account.bank.statement.line",
            handler(&self, |a, ctx| a.on_create_bank_line(ctx)),
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
            "suggest_reconciliation" => {
                let entry_id = changes
                    .get("matched_entry_id")
                    .and_then(Value::as_i64)
                    .ok_or_else(|| anyhow::anyhow!("missing matched_entry_id in changes"))?;
                self.apply_match(record_id, entry_id).await?;
                Ok(AutomationResult::ok(action, model, record_id)
                    .with_change("matched_entry_id", json!(entry_id))
                    .with_reasoning("Reconciled bank line against matched entry"))
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

    async fn setup() -> (Arc<MockErp>, Arc<Store>, Arc<ReconciliationAutomation>) {
        let erp = MockErp::new();
        erp.seed(
            "account.bank.statement.line",
            vec![
                json!({"id": 1, "payment_ref": "INV/2026/0042", "amount": 1500.0,
                       "partner_id": [42, "Acme Corp"], "journal_id": [7, "Bank"],
                       "is_reconciled": false, "date": "2026-03-01"}),
                json!({"id": 2, "payment_ref": "UNKNOWN WIRE", "amount": 77.25,
                       "partner_id": false, "journal_id": [7, "Bank"],
                       "is_reconciled": false, "date": "2026-03-01"}),
            ],
        )
        .await;
        erp.seed(
            "account.move",
            vec![
                json!({"id": 42, "name": "INV/2026/0042", "ref": "INV/2026/0042",
                       "amount_total": 1500.0, "amount_residual": 1500.0,
                       "partner_id": [42, "Acme Corp"], "state": "posted",
                       "payment_state": "not_paid"}),
                json!({"id": 43, "name": "INV/2026/0099", "ref": "INV/2026/0099",
                       "amount_total": 9000.0, "amount_residual": 9000.0,
                       "partner_id": [9, "Globex"], "state": "posted",
                       "payment_state": "not_paid"}),
            ],
        )
        .await;
        let store = Arc::new(Store::in_memory().await.unwrap());
        let automation = ReconciliationAutomation::new(erp.clone(), store.clone());
        (erp, store, automation)
    }

    #[tokio::test]
    async fn session_counts_auto_matchable_lines() {
        let (_, _, automation) = setup().await;
        let summary = automation.start_session(7, "admin").await.unwrap();
        assert_eq!(summary.total_lines, 2);
        assert_eq!(summary.auto_matchable, 1);
        assert_eq!(summary.needs_review, 1);
    }

    #[tokio::test]
    async fn manual_match_learns_rule_and_decrements_remaining() {
        let (erp, store, automation) = setup().await;
        let summary = automation.start_session(7, "admin").await.unwrap();

        let session = automation
            .manual_match(summary.session_id, 1, 42)
            .await
            .unwrap();
        assert_eq!(session.manually_matched, 1);
        assert_eq!(session.remaining, 1);
        assert_eq!(session.total_lines, 2);

        let stored = store.get_recon_session(summary.session_id).await.unwrap();
        assert_eq!(stored.learned_rules.as_array().unwrap().len(), 1);

        let calls = erp.method_calls.lock().await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, "reconcile_with_entry");
    }

    #[tokio::test]
    async fn remaining_decreases_monotonically_and_stays_non_negative() {
        let (_, _, automation) = setup().await;
        let summary = automation.start_session(7, "admin").await.unwrap();
        let s1 = automation.skip_line(summary.session_id).await.unwrap();
        assert_eq!(s1.remaining, 1);
        let s2 = automation.skip_line(summary.session_id).await.unwrap();
        assert_eq!(s2.remaining, 0);
        let s3 = automation.skip_line(summary.session_id).await.unwrap();
        assert_eq!(s3.remaining, 0);
    }

    #[tokio::test]
    async fn webhook_suggestion_for_exact_line() {
        let (_, _, automation) = setup().await;
        let mut values = Map::new();
        values.insert("payment_ref".into(), json!("INV/2026/0042"));
        values.insert("amount".into(), json!(1500.0));
        values.insert("partner_id".into(), json!([42, "Acme Corp"]));
        values.insert("journal_id".into(), json!([7, "Bank"]));

        let ctx = EventCtx::new(EventType::Create, "account.bank.statement.line", 5)
            .with_values(values);
        let result = Arc::clone(&automation).on_create_bank_line(ctx).await.unwrap();
        assert_eq!(result.action, "suggest_reconciliation");
        assert_eq!(result.confidence, 1.0);
        assert_eq!(result.changes_made.get("matched_entry_id"), Some(&json!(42)));
        assert_eq!(result.changes_made.get("match_type"), Some(&json!("exact")));
    }
}
