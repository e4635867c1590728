//! Continuous-close agent: scan issues → anomaly detection → severity
//! classification → auto-resolve the low band → readiness score → close
//! report → controller notification.

use serde_json::{json, Map, Value};

use relay_automations::month_end::MonthEndAutomation;
use relay_providers::{Domain, ToolSpec};
use relay_types::Period;

use crate::graph::{AgentGraph, GraphBuilder, END, START};
use crate::registry::AgentDefinition;
use crate::state::{self, keys, AgentState};

const ANOMALY_Z_THRESHOLD: f64 = 3.0;

const REPORT_PROMPT: &str = "You are a financial controller assistant. Generate a concise \
month-end close status report with risk assessment, priority actions, and estimated hours \
to complete.";

fn report_tools() -> Vec<ToolSpec> {
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

/// Per-checklist-step severity used by classification.
fn severity_of(step_name: &str) -> &'static str {
    match step_name {
        "missing_vendor_bills" | "uninvoiced_revenue" => "critical",
        "unreconciled_bank" | "unbilled_deliveries" | "tax_validation" => "high",
        "stale_drafts" | "depreciation" | "inter_company" => "medium",
        "adjustments" | "final_review" => "low",
        _ => "medium",
    }
}

/// Readiness formula: base 100, −20 per critical, −10 per high, −5 per
/// anomaly, −20 × pending/total; clamped to [0, 100].
pub fn readiness_score(
    total_issues: i64,
    pending_review: i64,
    anomalies: usize,
    critical: usize,
    high: usize,
) -> f64 {
    if total_issues == 0 && anomalies == 0 {
        return 100.0;
    }
    let mut score = 100.0;
    score -= critical as f64 * 20.0;
    score -= high as f64 * 10.0;
    score -= anomalies as f64 * 5.0;
    if total_issues > 0 {
        score -= (pending_review as f64 / total_issues as f64) * 20.0;
    }
    (score.clamp(0.0, 100.0) * 10.0).round() / 10.0
}

pub fn definition() -> AgentDefinition {
    AgentDefinition::new(
        "month_end_close",
        "Continuous close: scan → classify → auto-resolve → report → notify",
        build_graph,
        Some(15),
    )
}

fn build_graph() -> anyhow::Result<AgentGraph> {
    GraphBuilder::new()
        .add_node("scan_issues", |services, state| async move {
            let mut patch = Map::new();
            let Some(period) = Period::parse(state::get_str(&state, "period")) else {
                patch.insert(keys::ERROR.to_string(), json!("No period specified"));
                patch.insert("scan_results".to_string(), json!({}));
                patch.insert("total_issues".to_string(), json!(0));
                return Ok(patch);
            };

            let automation = MonthEndAutomation::new(
                services.erp.clone(),
                services.llm.clone(),
                services.store.clone(),
            );
            let scan = automation.run_full_scan(period).await?;
            let total: i64 = scan
                .values()
                .filter_map(|v| v.get("items_found").and_then(Value::as_i64))
                .sum();

            patch.insert("scan_results".to_string(), Value::Object(scan));
            patch.insert("total_issues".to_string(), json!(total));
            Ok(patch)
        })
        .add_node("run_anomaly_detection", |services, state| async move {
            let mut patch = Map::new();
            let Some(period) = Period::parse(state::get_str(&state, "period")) else {
                patch.insert("anomalies_detected".to_string(), json!([]));
                return Ok(patch);
            };

            let moves = services
                .erp
                .search_read(
                    "account.move",
                    &Domain::filter("state", "=", "posted")
                        .and_filter("date", ">=", period.first_day().to_string())
                        .and_filter("date", "<=", period.last_day().to_string()),
                    &["name", "amount_total", "partner_id"],
                    Some(500),
                    None,
                )
                .await?;

            patch.insert(
                "anomalies_detected".to_string(),
                json!(zscore_anomalies(&moves)),
            );
            Ok(patch)
        })
        .add_node("classify_severity", |_, state| async move {
            let scan = state
                .get("scan_results")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            let anomalies = state
                .get("anomalies_detected")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();

            let mut classified: Map<String, Value> = Map::new();
            for band in ["critical", "high", "medium", "low"] {
                classified.insert(band.to_string(), json!([]));
            }

            for (step_name, result) in &scan {
                let items = result.get("items_found").and_then(Value::as_i64).unwrap_or(0);
                if items == 0 {
                    continue;
                }
                let band = severity_of(step_name);
                if let Some(list) = classified.get_mut(band).and_then(Value::as_array_mut) {
                    list.push(json!({"step": step_name, "items": items}));
                }
            }

            for anomaly in &anomalies {
                let band = if anomaly.get("score").and_then(Value::as_f64).unwrap_or(0.0) > 3.0 {
                    "critical"
                } else {
                    "high"
                };
                if let Some(list) = classified.get_mut(band).and_then(Value::as_array_mut) {
                    list.push(json!({"step": "anomaly_detection", "detail": anomaly}));
                }
            }

            let mut patch = Map::new();
            patch.insert("severity_classification".to_string(), Value::Object(classified));
            Ok(patch)
        })
        .add_node("auto_resolve", |_, state| async move {
            let classified = state
                .get("severity_classification")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();

            let items_in = |band: &str| -> i64 {
                classified
                    .get(band)
                    .and_then(Value::as_array)
                    .map(|items| {
                        items
                            .iter()
                            .map(|i| i.get("items").and_then(Value::as_i64).unwrap_or(0))
                            .sum()
                    })
                    .unwrap_or(0)
            };

            let auto_resolved = items_in("low");
            let pending_review = items_in("critical") + items_in("high") + items_in("medium");

            let mut patch = Map::new();
            patch.insert("auto_resolved".to_string(), json!(auto_resolved));
            patch.insert("pending_review".to_string(), json!(pending_review));
            Ok(patch)
        })
        .add_node("calculate_readiness", |_, state| async move {
            let classified = state
                .get("severity_classification")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            let band_len = |band: &str| {
                classified
                    .get(band)
                    .and_then(Value::as_array)
                    .map(Vec::len)
                    .unwrap_or(0)
            };
            let anomalies = state
                .get("anomalies_detected")
                .and_then(Value::as_array)
                .map(Vec::len)
                .unwrap_or(0);

            let score = readiness_score(
                state::get_i64(&state, "total_issues"),
                state::get_i64(&state, "pending_review"),
                anomalies,
                band_len("critical"),
                band_len("high"),
            );

            let mut patch = Map::new();
            patch.insert("close_readiness_score".to_string(), json!(score));
            Ok(patch)
        })
        .add_node("generate_report", |services, state| async move {
            let period = state::get_str(&state, "period").to_string();
            let score = state::get_f64(&state, "close_readiness_score");

            let analysis = services
                .analyze_with_tools(
                    REPORT_PROMPT,
                    &format!(
                        "Period: {period}\nTotal issues: {}\nAuto-resolved: {}\n\
                         Pending review: {}\nAnomalies: {}\nReadiness score: {score}/100\n\
                         Severity breakdown: {}",
                        state::get_i64(&state, "total_issues"),
                        state::get_i64(&state, "auto_resolved"),
                        state::get_i64(&state, "pending_review"),
                        state
                            .get("anomalies_detected")
                            .and_then(Value::as_array)
                            .map(Vec::len)
                            .unwrap_or(0),
                        state.get("severity_classification").cloned().unwrap_or(json!({})),
                    ),
                    &report_tools(),
                )
                .await;

            let summary = match analysis {
                Ok(analysis) => analysis
                    .tool_input()
                    .cloned()
                    .unwrap_or_else(|| fallback_report(&period, score, &state)),
                Err(_) => fallback_report(&period, score, &state),
            };

            let mut patch = Map::new();
            patch.insert("ai_summary".to_string(), summary);
            patch.insert("report_generated".to_string(), json!(true));
            Ok(patch)
        })
        .add_node("notify_controller", |services, state| async move {
            let period = state::get_str(&state, "period").to_string();
            let score = state::get_f64(&state, "close_readiness_score");
            let summary = state.get("ai_summary").cloned().unwrap_or(json!({}));
            let risk = summary
                .get("risk_level")
                .and_then(Value::as_str)
                .unwrap_or("medium");

            let body = format!(
                "Month-end close {period}\nReadiness: {score}/100 | Risk: {risk}\n{}\n\
                 Issues: {} | Auto-resolved: {} | Pending: {}",
                summary.get("summary").and_then(Value::as_str).unwrap_or(""),
                state::get_i64(&state, "total_issues"),
                state::get_i64(&state, "auto_resolved"),
                state::get_i64(&state, "pending_review"),
            );
            let outcome = services
                .notify(&format!("Month-end close status: {period}"), &body)
                .await;

            let mut patch = Map::new();
            patch.insert(
                "notifications_sent".to_string(),
                if outcome.delivered() {
                    json!(["controller"])
                } else {
                    json!([])
                },
            );
            Ok(patch)
        })
        .add_edge(START, "scan_issues")
        .add_edge("scan_issues", "run_anomaly_detection")
        .add_edge("run_anomaly_detection", "classify_severity")
        .add_edge("classify_severity", "auto_resolve")
        .add_edge("auto_resolve", "calculate_readiness")
        .add_edge("calculate_readiness", "generate_report")
        .add_edge("generate_report", "notify_controller")
        .add_edge("notify_controller", END)
        .build()
}

fn fallback_report(period: &str, score: f64, state: &AgentState) -> Value {
    let risk = if score >= 90.0 {
        "low"
    } else if score >= 70.0 {
        "medium"
    } else if score >= 50.0 {
        "high"
    } else {
        "critical"
    };
    json!({
        "risk_level": risk,
        "summary": format!(
            "Period {period}: {} issues found, {} auto-resolved, {} pending review. Readiness: {score}/100.",
            state::get_i64(state, "total_issues"),
            state::get_i64(state, "auto_resolved"),
            state::get_i64(state, "pending_review"),
        ),
    })
}

/// Z-score outliers over posted entry amounts for the period.
fn zscore_anomalies(moves: &[Map<String, Value>]) -> Vec<Value> {
    let amounts: Vec<f64> = moves
        .iter()
        .filter_map(|m| m.get("amount_total").and_then(Value::as_f64))
        .collect();
    if amounts.len() < 3 {
        return Vec::new();
    }
    let mean = amounts.iter().sum::<f64>() / amounts.len() as f64;
    let variance = amounts.iter().map(|a| (a - mean).powi(2)).sum::<f64>() / amounts.len() as f64;
    let std_dev = variance.sqrt();
    if std_dev <= f64::EPSILON {
        return Vec::new();
    }

    moves
        .iter()
        .filter_map(|m| {
            let amount = m.get("amount_total").and_then(Value::as_f64)?;
            let z = (amount - mean).abs() / std_dev;
            if z > ANOMALY_Z_THRESHOLD {
                Some(json!({
                    "type": "amount_outlier",
                    "reference": m.get("name").cloned().unwrap_or(json!("")),
                    "amount": amount,
                    "score": (z * 100.0).round() / 100.0,
                }))
            } else {
                None
            }
        })
        .collect()
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
    fn readiness_formula_matches_reference_scenario() {
        // 10 issues, 8 pending, 1 anomaly, 1 critical, 2 high:
        // 100 − 20 − 20 − 5 − (8/10)·20 = 39.0
        assert_eq!(readiness_score(10, 8, 1, 1, 2), 39.0);
    }

    #[test]
    fn readiness_is_clamped_and_perfect_when_clean() {
        assert_eq!(readiness_score(0, 0, 0, 0, 0), 100.0);
        assert_eq!(readiness_score(10, 10, 10, 5, 5), 0.0);
    }

    #[test]
    fn zscore_flags_extreme_outliers_only() {
        let moves: Vec<Map<String, Value>> = [100.0, 105.0, 95.0, 102.0, 98.0, 5_000.0]
            .iter()
            .enumerate()
            .map(|(i, amount)| {
                serde_json::from_value(json!({"name": format!("M{i}"), "amount_total": amount}))
                    .unwrap()
            })
            .collect();
        let anomalies = zscore_anomalies(&moves);
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0]["reference"], json!("M5"));
    }

    #[test]
    fn severity_map_bands() {
        assert_eq!(severity_of("missing_vendor_bills"), "critical");
        assert_eq!(severity_of("unreconciled_bank"), "high");
        assert_eq!(severity_of("stale_drafts"), "medium");
        assert_eq!(severity_of("final_review"), "low");
        assert_eq!(severity_of("anything_else"), "medium");
    }

    #[tokio::test]
    async fn close_run_produces_report_and_notification() {
        let erp = MockErp::new();
        erp.seed(
            "account.move",
            vec![
                json!({"id": 1, "state": "draft", "date": "2026-02-05",
                       "move_type": "entry", "amount_tax": 0.0}),
                json!({"id": 2, "state": "posted", "date": "2026-02-10",
                       "amount_total": 100.0, "name": "A"}),
                json!({"id": 3, "state": "posted", "date": "2026-02-11",
                       "amount_total": 110.0, "name": "B"}),
                json!({"id": 4, "state": "posted", "date": "2026-02-12",
                       "amount_total": 90.0, "name": "C"}),
            ],
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
        initial.insert("period".to_string(), json!("2026-02"));
        let report = rt
            .run("month_end_close", "schedule", Some("2026-02"), initial, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.status, AgentRunStatus::Completed);
        assert_eq!(report.total_steps, 7);
        assert_eq!(report.final_state.get("report_generated"), Some(&json!(true)));
        let score = report.final_state["close_readiness_score"].as_f64().unwrap();
        assert!(score < 100.0); // the stale draft costs a medium band entry
        let summary = &report.final_state["ai_summary"];
        assert!(summary.get("risk_level").is_some());
    }
}
