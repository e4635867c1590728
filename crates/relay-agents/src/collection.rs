//! Collections agent: pick a dunning strategy from overdue age and amount,
//! deliver the notice, and record the credit-score impact.

use serde_json::{json, Map, Value};

use relay_providers::Domain;

use crate::graph::{AgentGraph, GraphBuilder, END, START};
use crate::registry::AgentDefinition;
use crate::state::{self, AgentState};

pub const ESCALATION_AMOUNT: f64 = 50_000.0;

/// Strategy is a pure function of (overdue_days, amount_due).
pub fn determine_strategy(overdue_days: i64, amount_due: f64) -> &'static str {
    if overdue_days <= 7 {
        "gentle_reminder"
    } else if overdue_days <= 30 {
        if amount_due >= ESCALATION_AMOUNT {
            "escalate"
        } else {
            "firm_notice"
        }
    } else {
        "escalate"
    }
}

/// Stepwise credit impact by overdue age.
pub fn credit_impact(overdue_days: i64) -> f64 {
    if overdue_days <= 7 {
        -1.0
    } else if overdue_days <= 30 {
        -3.0
    } else if overdue_days <= 60 {
        -8.0
    } else {
        -15.0
    }
}

pub fn definition() -> AgentDefinition {
    AgentDefinition::new(
        "collection",
        "Collections: overdue triage → notice → credit impact",
        build_graph,
        None,
    )
}

fn build_graph() -> anyhow::Result<AgentGraph> {
    GraphBuilder::new()
        .add_node("fetch_invoice", |services, state| async move {
            let invoice_id = state::get_i64(&state, "invoice_id");
            let mut patch = Map::new();

            if invoice_id > 0 {
                let invoice = services
                    .erp
                    .read(
                        "account.move",
                        invoice_id,
                        &["name", "partner_id", "amount_residual", "invoice_date_due"],
                    )
                    .await?;
                let due = invoice
                    .get("invoice_date_due")
                    .and_then(Value::as_str)
                    .and_then(|s| s.parse::<chrono::NaiveDate>().ok());
                let overdue_days = due
                    .map(|d| (chrono::Utc::now().date_naive() - d).num_days().max(0))
                    .unwrap_or(0);
                patch.insert(
                    "amount_due".to_string(),
                    invoice.get("amount_residual").cloned().unwrap_or(json!(0.0)),
                );
                patch.insert("overdue_days".to_string(), json!(overdue_days));
                patch.insert(
                    "invoice_ref".to_string(),
                    invoice.get("name").cloned().unwrap_or(json!("")),
                );
                patch.insert(
                    "partner".to_string(),
                    invoice.get("partner_id").cloned().unwrap_or(Value::Null),
                );
            }
            Ok(patch)
        })
        .add_node("determine_strategy", |_, state| async move {
            let overdue_days = state::get_i64(&state, "overdue_days");
            let amount_due = state::get_f64(&state, "amount_due");
            let mut patch = Map::new();
            patch.insert(
                "collection_strategy".to_string(),
                json!(determine_strategy(overdue_days, amount_due)),
            );
            Ok(patch)
        })
        .add_node("send_reminder", |services, state| async move {
            let invoice_ref = state::get_str(&state, "invoice_ref").to_string();
            let amount = state::get_f64(&state, "amount_due");
            let outcome = services
                .notify(
                    "Payment reminder",
                    &format!("Friendly reminder: invoice {invoice_ref} ({amount:.2}) is past due."),
                )
                .await;
            let mut patch = Map::new();
            patch.insert("notice_sent".to_string(), json!(outcome.delivered()));
            patch.insert("notice_kind".to_string(), json!("gentle_reminder"));
            Ok(patch)
        })
        .add_node("send_firm_notice", |services, state| async move {
            let invoice_ref = state::get_str(&state, "invoice_ref").to_string();
            let days = state::get_i64(&state, "overdue_days");
            let outcome = services
                .notify(
                    "Overdue notice",
                    &format!("Invoice {invoice_ref} is {days} days overdue. Please arrange payment."),
                )
                .await;
            let mut patch = Map::new();
            patch.insert("notice_sent".to_string(), json!(outcome.delivered()));
            patch.insert("notice_kind".to_string(), json!("firm_notice"));
            Ok(patch)
        })
        .add_node("escalate_account", |services, state| async move {
            let invoice_ref = state::get_str(&state, "invoice_ref").to_string();
            let amount = state::get_f64(&state, "amount_due");
            let days = state::get_i64(&state, "overdue_days");
            let outcome = services
                .notify(
                    "Collections escalation",
                    &format!(
                        "Invoice {invoice_ref}: {amount:.2} outstanding, {days} days overdue. \
                         Escalating to the collections team."
                    ),
                )
                .await;
            let mut patch = Map::new();
            patch.insert("notice_sent".to_string(), json!(outcome.delivered()));
            patch.insert("notice_kind".to_string(), json!("escalation"));
            patch.insert("escalated".to_string(), json!(true));
            Ok(patch)
        })
        .add_node("update_credit_score", |services, state| async move {
            let overdue_days = state::get_i64(&state, "overdue_days");
            let impact = credit_impact(overdue_days);
            let mut patch = Map::new();
            patch.insert("credit_score_impact".to_string(), json!(impact));

            // Count of open invoices feeds the partner's collections history.
            if let Some(partner_id) = state.get("partner").and_then(relay_providers::id_of) {
                let open = services
                    .erp
                    .search_count(
                        "account.move",
                        &Domain::filter("partner_id", "=", partner_id)
                            .and_filter("payment_state", "in", json!(["not_paid", "partial"]))
                            .and_filter("state", "=", "posted"),
                    )
                    .await
                    .unwrap_or(0);
                patch.insert("open_invoices".to_string(), json!(open));
            }
            Ok(patch)
        })
        .add_edge(START, "fetch_invoice")
        .add_edge("fetch_invoice", "determine_strategy")
        .add_conditional(
            "determine_strategy",
            |state: &AgentState| state::get_str(state, "collection_strategy").to_string(),
            &[
                ("gentle_reminder", "send_reminder"),
                ("firm_notice", "send_firm_notice"),
                ("escalate", "escalate_account"),
            ],
        )
        .add_edge("send_reminder", "update_credit_score")
        .add_edge("send_firm_notice", "update_credit_score")
        .add_edge("escalate_account", "update_credit_score")
        .add_edge("update_credit_score", END)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::AgentRegistry;
    use crate::runtime::{AgentConfig, AgentRuntime};
    use crate::testing::{services_factory_with, MockErp, ScriptedLlm};
    use relay_store::Store;
    use relay_types::AgentRunStatus;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn strategy_table() {
        assert_eq!(determine_strategy(3, 500.0), "gentle_reminder");
        assert_eq!(determine_strategy(7, 500.0), "gentle_reminder");
        assert_eq!(determine_strategy(20, 500.0), "firm_notice");
        assert_eq!(determine_strategy(30, 500.0), "firm_notice");
        assert_eq!(determine_strategy(20, 75_000.0), "escalate");
        assert_eq!(determine_strategy(20, 50_000.0), "escalate");
        assert_eq!(determine_strategy(31, 500.0), "escalate");
        assert_eq!(determine_strategy(90, 500.0), "escalate");
    }

    #[test]
    fn credit_impact_steps() {
        assert_eq!(credit_impact(5), -1.0);
        assert_eq!(credit_impact(7), -1.0);
        assert_eq!(credit_impact(20), -3.0);
        assert_eq!(credit_impact(45), -8.0);
        assert_eq!(credit_impact(60), -8.0);
        assert_eq!(credit_impact(90), -15.0);
    }

    #[tokio::test]
    async fn escalation_path_runs_end_to_end() {
        let erp = MockErp::new();
        let overdue = (chrono::Utc::now().date_naive() - chrono::Duration::days(45)).to_string();
        erp.seed(
            "account.move",
            vec![json!({"id": 90, "name": "INV/90", "partner_id": [42, "Acme"],
                        "amount_residual": 7_500.0, "invoice_date_due": overdue,
                        "payment_state": "not_paid", "state": "posted"})],
        )
        .await;
        let store = Arc::new(Store::in_memory().await.unwrap());
        let mut registry = AgentRegistry::new();
        registry.register(definition()).unwrap();
        let rt = AgentRuntime::new(
            store.clone(),
            Arc::new(registry),
            services_factory_with(erp, ScriptedLlm::empty(), store.clone()),
            AgentConfig::default(),
        );

        let mut initial = Map::new();
        initial.insert("invoice_id".to_string(), json!(90));
        let report = rt
            .run("collection", "scan", Some("INV/90"), initial, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.status, AgentRunStatus::Completed);
        assert_eq!(
            report.final_state.get("collection_strategy"),
            Some(&json!("escalate"))
        );
        assert_eq!(report.final_state.get("credit_score_impact"), Some(&json!(-8.0)));
        assert_eq!(report.final_state.get("open_invoices"), Some(&json!(1)));
        assert_eq!(report.total_steps, 4);
    }
}
