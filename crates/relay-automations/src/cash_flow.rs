//! Cash flow forecasting: daily-step projection over AR aging, AP
//! commitments, probability-weighted pipeline, and detected recurring
//! expenses, with what-if scenarios and accuracy tracking.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use relay_providers::{id_of, Domain, ErpClient};
use relay_store::Store;
use relay_types::{AutomationType, CashForecast, EventType, ForecastAccuracyEntry, ForecastScenario};

use crate::automation::Automation;
use crate::handler::{handler, EventCtx, HandlerTable};
use crate::result::AutomationResult;

pub const MODEL_VERSION: &str = "heuristic-v2";
const CONFIDENCE_BAND_WIDTH: f64 = 0.15;
const DEFAULT_HORIZON_DAYS: u32 = 90;

/// One dated cash movement feeding the projection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowItem {
    pub amount: f64,
    pub due_date: NaiveDate,
    pub partner_id: Option<i64>,
    pub reference: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ForecastPoint {
    pub date: NaiveDate,
    pub balance: f64,
    pub low: f64,
    pub high: f64,
    pub ar_expected: f64,
    pub ap_expected: f64,
    pub pipeline_expected: f64,
    pub recurring_expected: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ForecastReport {
    pub horizon_days: u32,
    pub current_balance: f64,
    pub forecasts: Vec<ForecastPoint>,
    pub cash_gap_dates: Vec<NaiveDate>,
    pub total_ar: f64,
    pub total_ap: f64,
    pub total_pipeline: f64,
    pub total_recurring: f64,
    pub model_version: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioImpact {
    pub end_balance_change: f64,
    pub worst_balance: f64,
    pub worst_date: Option<NaiveDate>,
    pub has_cash_gap: bool,
    pub cash_gap_dates: Vec<NaiveDate>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub name: String,
    pub description: String,
    pub forecasts: Vec<ForecastPoint>,
    pub impact: ScenarioImpact,
}

struct ForecastInputs {
    current_balance: f64,
    ar: Vec<FlowItem>,
    ap: Vec<FlowItem>,
    pipeline: Vec<FlowItem>,
    recurring: Vec<FlowItem>,
}

pub struct CashFlowAutomation {
    erp: Arc<dyn ErpClient>,
    store: Arc<Store>,
}

impl CashFlowAutomation {
    pub fn new(erp: Arc<dyn ErpClient>, store: Arc<Store>) -> Arc<Self> {
        Arc::new(Self { erp, store })
    }

    pub async fn generate_forecast(&self, horizon_days: Option<u32>) -> anyhow::Result<ForecastReport> {
        let horizon = horizon_days.unwrap_or(DEFAULT_HORIZON_DAYS).clamp(1, 365);
        let inputs = self.collect_inputs().await?;
        let report = project(&inputs, horizon);
        self.persist_forecast(&report).await?;
        Ok(report)
    }

    pub async fn run_scenario(
        &self,
        name: &str,
        description: &str,
        adjustments: &Map<String, Value>,
        horizon_days: Option<u32>,
    ) -> anyhow::Result<ScenarioReport> {
        let horizon = horizon_days.unwrap_or(DEFAULT_HORIZON_DAYS).clamp(1, 365);
        let mut inputs = self.collect_inputs().await?;
        let base = project(&inputs, horizon);

        inputs.ar = apply_ar_adjustments(&inputs.ar, adjustments);
        inputs.pipeline = apply_pipeline_adjustments(&inputs.pipeline, adjustments);
        inputs.ap = apply_ap_adjustments(&inputs.ap, adjustments);
        inputs.recurring = apply_recurring_adjustments(&inputs.recurring, adjustments);

        let scenario = project(&inputs, horizon);

        let base_end = base.forecasts.last().map(|f| f.balance).unwrap_or(base.current_balance);
        let scenario_end = scenario
            .forecasts
            .last()
            .map(|f| f.balance)
            .unwrap_or(scenario.current_balance);
        let worst = scenario
            .forecasts
            .iter()
            .min_by(|a, b| a.balance.partial_cmp(&b.balance).unwrap_or(std::cmp::Ordering::Equal));

        let impact = ScenarioImpact {
            end_balance_change: round2(scenario_end - base_end),
            worst_balance: worst.map(|f| f.balance).unwrap_or(0.0),
            worst_date: worst.map(|f| f.date),
            has_cash_gap: !scenario.cash_gap_dates.is_empty(),
            cash_gap_dates: scenario.cash_gap_dates.clone(),
        };

        let report = ScenarioReport {
            name: name.to_string(),
            description: description.to_string(),
            forecasts: scenario.forecasts,
            impact,
        };

        self.store
            .insert_scenario(&ForecastScenario {
                id: 0,
                name: name.to_string(),
                description: description.to_string(),
                adjustments: Value::Object(adjustments.clone()),
                base_forecast_id: None,
                result_data: json!({ "impact": &report.impact }),
                created_by: "api".to_string(),
                created_at: Utc::now(),
            })
            .await?;

        Ok(report)
    }

    /// Log today's actual balance against every forecast targeting today.
    pub async fn record_actual_balance(&self) -> anyhow::Result<usize> {
        let today = Utc::now().date_naive();
        let actual = self.current_balance().await?;
        let forecasts = self.store.forecasts_for_target(today).await?;
        let mut logged = 0;
        for forecast in &forecasts {
            let error_pct = if actual.abs() > f64::EPSILON {
                ((forecast.predicted_balance - actual) / actual * 100.0).abs()
            } else {
                0.0
            };
            self.store
                .log_forecast_accuracy(&ForecastAccuracyEntry {
                    id: 0,
                    forecast_id: Some(forecast.id),
                    target_date: today,
                    predicted_balance: forecast.predicted_balance,
                    actual_balance: actual,
                    error_pct: round2(error_pct),
                    logged_at: Utc::now(),
                })
                .await?;
            logged += 1;
        }
        Ok(logged)
    }

    /// MAE / MAPE over trailing 30/60/90-day windows.
    pub async fn check_accuracy(&self) -> anyhow::Result<Value> {
        let today = Utc::now().date_naive();
        let entries = self
            .store
            .accuracy_entries_since(today - Duration::days(90))
            .await?;

        let window = |days: i64| -> Value {
            let cutoff = today - Duration::days(days);
            let in_window: Vec<_> = entries.iter().filter(|e| e.target_date >= cutoff).collect();
            if in_window.is_empty() {
                return json!({"mae": 0.0, "mape": 0.0, "samples": 0});
            }
            let mae = in_window
                .iter()
                .map(|e| (e.predicted_balance - e.actual_balance).abs())
                .sum::<f64>()
                / in_window.len() as f64;
            let mape =
                in_window.iter().map(|e| e.error_pct).sum::<f64>() / in_window.len() as f64;
            json!({"mae": round2(mae), "mape": round2(mape), "samples": in_window.len()})
        };

        Ok(json!({
            "last_30_days": window(30),
            "last_60_days": window(60),
            "last_90_days": window(90),
        }))
    }

    async fn persist_forecast(&self, report: &ForecastReport) -> anyhow::Result<()> {
        let today = Utc::now().date_naive();
        // Persist weekly snapshots plus the horizon end, not every day.
        for point in report
            .forecasts
            .iter()
            .enumerate()
            .filter(|(i, _)| (i + 1) % 7 == 0 || *i + 1 == report.forecasts.len())
            .map(|(_, p)| p)
        {
            self.store
                .insert_forecast(&CashForecast {
                    id: 0,
                    forecast_date: today,
                    target_date: point.date,
                    predicted_balance: point.balance,
                    confidence_low: point.low,
                    confidence_high: point.high,
                    ar_expected: point.ar_expected,
                    ap_expected: point.ap_expected,
                    pipeline_expected: point.pipeline_expected,
                    recurring_expected: point.recurring_expected,
                    model_version: MODEL_VERSION.to_string(),
                    created_at: Utc::now(),
                })
                .await?;
        }
        Ok(())
    }

    async fn collect_inputs(&self) -> anyhow::Result<ForecastInputs> {
        Ok(ForecastInputs {
            current_balance: self.current_balance().await?,
            ar: self.collect_open_moves("out_invoice").await?,
            ap: self.collect_open_moves("in_invoice").await?,
            pipeline: self.collect_pipeline().await?,
            recurring: self.collect_recurring().await?,
        })
    }

    async fn current_balance(&self) -> anyhow::Result<f64> {
        let journals = self
            .erp
            .search_read(
                "account.journal",
                &Domain::filter("type", "=", "bank"),
                &["name", "default_account_id"],
                Some(20),
                None,
            )
            .await?;

        let mut total = 0.0;
        for journal in &journals {
            let Some(account_id) = journal.get("default_account_id").and_then(id_of) else {
                continue;
            };
            let lines = self
                .erp
                .search_read(
                    "account.move.line",
                    &Domain::filter("account_id", "=", account_id)
                        .and_filter("parent_state", "=", "posted"),
                    &["balance"],
                    Some(5000),
                    None,
                )
                .await?;
            total += lines
                .iter()
                .filter_map(|l| l.get("balance").and_then(Value::as_f64))
                .sum::<f64>();
        }
        Ok(round2(total))
    }

    async fn collect_open_moves(&self, move_type: &str) -> anyhow::Result<Vec<FlowItem>> {
        let records = self
            .erp
            .search_read(
                "account.move",
                &Domain::filter("move_type", "=", move_type)
                    .and_filter("state", "=", "posted")
                    .and_filter("payment_state", "in", json!(["not_paid", "partial"])),
                &["partner_id", "amount_residual", "invoice_date_due", "name"],
                Some(500),
                None,
            )
            .await?;

        let fallback = Utc::now().date_naive() + Duration::days(30);
        Ok(records
            .iter()
            .map(|r| FlowItem {
                amount: r.get("amount_residual").and_then(Value::as_f64).unwrap_or(0.0),
                due_date: r
                    .get("invoice_date_due")
                    .and_then(Value::as_str)
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(fallback),
                partner_id: r.get("partner_id").and_then(id_of),
                reference: r
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string(),
            })
            .collect())
    }

    async fn collect_pipeline(&self) -> anyhow::Result<Vec<FlowItem>> {
        let deals = self
            .erp
            .search_read(
                "crm.lead",
                &Domain::filter("type", "=", "opportunity")
                    .and_filter("active", "=", true)
                    .and_filter("probability", ">", 0),
                &["name", "expected_revenue", "probability", "date_deadline", "partner_id"],
                Some(200),
                None,
            )
            .await?;

        let fallback = Utc::now().date_naive() + Duration::days(60);
        Ok(deals
            .iter()
            .filter_map(|deal| {
                let revenue = deal.get("expected_revenue").and_then(Value::as_f64).unwrap_or(0.0);
                let probability =
                    deal.get("probability").and_then(Value::as_f64).unwrap_or(0.0) / 100.0;
                let weighted = revenue * probability;
                if weighted <= 0.0 {
                    return None;
                }
                Some(FlowItem {
                    amount: round2(weighted),
                    due_date: deal
                        .get("date_deadline")
                        .and_then(Value::as_str)
                        .and_then(|s| s.parse().ok())
                        .unwrap_or(fallback),
                    partner_id: deal.get("partner_id").and_then(id_of),
                    reference: deal.get("name").and_then(Value::as_str).unwrap_or("").to_string(),
                })
            })
            .collect())
    }

    /// Vendors with ≥ 2 bills in the trailing quarter and low amount
    /// variance are treated as monthly recurring spend.
    async fn collect_recurring(&self) -> anyhow::Result<Vec<FlowItem>> {
        let three_months_ago = (Utc::now().date_naive() - Duration::days(90)).to_string();
        let bills = self
            .erp
            .search_read(
                "account.move",
                &Domain::filter("move_type", "=", "in_invoice")
                    .and_filter("state", "=", "posted")
                    .and_filter("invoice_date", ">=", three_months_ago),
                &["partner_id", "amount_total", "invoice_date", "name"],
                Some(500),
                None,
            )
            .await?;

        let mut by_vendor: HashMap<i64, Vec<f64>> = HashMap::new();
        for bill in &bills {
            let Some(vendor_id) = bill.get("partner_id").and_then(id_of) else {
                continue;
            };
            by_vendor
                .entry(vendor_id)
                .or_default()
                .push(bill.get("amount_total").and_then(Value::as_f64).unwrap_or(0.0));
        }

        let mut result: Vec<FlowItem> = Vec::new();
        let mut vendors: Vec<i64> = by_vendor.keys().copied().collect();
        vendors.sort();
        for vendor_id in vendors {
            let amounts = &by_vendor[&vendor_id];
            if amounts.len() < 2 {
                continue;
            }
            let avg = amounts.iter().sum::<f64>() / amounts.len() as f64;
            if avg <= 0.0 {
                continue;
            }
            let variance =
                amounts.iter().map(|a| (a - avg).powi(2)).sum::<f64>() / amounts.len() as f64;
            let cv = variance.sqrt() / avg;
            if cv < 0.3 {
                result.push(FlowItem {
                    amount: round2(avg),
                    due_date: NaiveDate::MIN, // spread monthly, not date-bound
                    partner_id: Some(vendor_id),
                    reference: format!("recurring_vendor_{vendor_id}"),
                });
            }
        }
        Ok(result)
    }

    async fn on_create_move(self: Arc<Self>, ctx: EventCtx) -> anyhow::Result<AutomationResult> {
        let move_type = ctx
            .values
            .get("move_type")
            .and_then(Value::as_str)
            .unwrap_or("");
        let amount = ctx
            .values
            .get("amount_total")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);

        if matches!(move_type, "out_invoice" | "in_invoice") {
            Ok(AutomationResult::ok("forecast_data_updated", &ctx.model, ctx.record_id)
                .with_confidence(0.8)
                .with_reasoning(format!(
                    "New {move_type} for {amount:.2}; forecast refreshes on next generation"
                )))
        } else {
            Ok(AutomationResult::ok("forecast_no_action", &ctx.model, ctx.record_id)
                .with_reasoning("Move type not relevant to forecast"))
        }
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn project(inputs: &ForecastInputs, horizon_days: u32) -> ForecastReport {
    let today = Utc::now().date_naive();
    let mut running = inputs.current_balance;
    let mut forecasts = Vec::with_capacity(horizon_days as usize);
    let mut cash_gap_dates = Vec::new();

    let sum_on = |items: &[FlowItem], date: NaiveDate| -> f64 {
        items
            .iter()
            .filter(|i| i.due_date == date)
            .map(|i| i.amount)
            .sum()
    };

    for offset in 1..=horizon_days {
        let target = today + Duration::days(offset as i64);

        let ar_day = sum_on(&inputs.ar, target);
        let ap_day = sum_on(&inputs.ap, target);
        let pipeline_day = sum_on(&inputs.pipeline, target);
        // Monthly recurring spend lands on the first of each month.
        let recurring_day: f64 = if chrono::Datelike::day(&target) == 1 {
            inputs.recurring.iter().map(|i| i.amount).sum()
        } else {
            0.0
        };

        running += ar_day + pipeline_day - ap_day - recurring_day;

        let uncertainty =
            CONFIDENCE_BAND_WIDTH * running.abs() * (offset as f64 / horizon_days as f64);

        if running < 0.0 {
            cash_gap_dates.push(target);
        }

        forecasts.push(ForecastPoint {
            date: target,
            balance: round2(running),
            low: round2(running - uncertainty),
            high: round2(running + uncertainty),
            ar_expected: round2(ar_day),
            ap_expected: round2(ap_day),
            pipeline_expected: round2(pipeline_day),
            recurring_expected: round2(recurring_day),
        });
    }

    ForecastReport {
        horizon_days,
        current_balance: round2(inputs.current_balance),
        forecasts,
        cash_gap_dates,
        total_ar: round2(inputs.ar.iter().map(|i| i.amount).sum()),
        total_ap: round2(inputs.ap.iter().map(|i| i.amount).sum()),
        total_pipeline: round2(inputs.pipeline.iter().map(|i| i.amount).sum()),
        total_recurring: round2(inputs.recurring.iter().map(|i| i.amount).sum()),
        model_version: MODEL_VERSION.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Scenario adjustments
// ---------------------------------------------------------------------------

fn apply_ar_adjustments(ar: &[FlowItem], adjustments: &Map<String, Value>) -> Vec<FlowItem> {
    let reduce_pct = adjustments
        .get("reduce_ar_by")
        .and_then(Value::as_f64)
        .unwrap_or(0.0)
        / 100.0;

    ar.iter()
        .map(|item| {
            let mut out = item.clone();
            if reduce_pct > 0.0 {
                out.amount = round2(item.amount * (1.0 - reduce_pct));
            }
            if let Some(partner_id) = item.partner_id {
                if let Some(delay) = adjustments
                    .get(&format!("delay_customer_{partner_id}"))
                    .and_then(Value::as_i64)
                {
                    out.due_date = item.due_date + Duration::days(delay);
                }
            }
            out
        })
        .collect()
}

fn apply_pipeline_adjustments(
    pipeline: &[FlowItem],
    adjustments: &Map<String, Value>,
) -> Vec<FlowItem> {
    let remove_refs: Vec<&str> = adjustments
        .keys()
        .filter_map(|k| k.strip_prefix("remove_deal_"))
        .collect();

    pipeline
        .iter()
        .filter(|item| {
            !remove_refs.iter().any(|r| {
                item.reference.contains(r)
                    || item.partner_id.map(|p| p.to_string()) == Some(r.to_string())
            })
        })
        .cloned()
        .collect()
}

fn apply_ap_adjustments(ap: &[FlowItem], adjustments: &Map<String, Value>) -> Vec<FlowItem> {
    let increase_pct = adjustments
        .get("increase_ap_by")
        .and_then(Value::as_f64)
        .unwrap_or(0.0)
        / 100.0;
    if increase_pct <= 0.0 {
        return ap.to_vec();
    }
    ap.iter()
        .map(|item| {
            let mut out = item.clone();
            out.amount = round2(item.amount * (1.0 + increase_pct));
            out
        })
        .collect()
}

fn apply_recurring_adjustments(
    recurring: &[FlowItem],
    adjustments: &Map<String, Value>,
) -> Vec<FlowItem> {
    let multipliers: Vec<f64> = adjustments
        .iter()
        .filter(|(k, _)| k.starts_with("adjust_expense_"))
        .filter_map(|(_, v)| v.as_f64())
        .collect();
    if multipliers.is_empty() {
        return recurring.to_vec();
    }
    recurring
        .iter()
        .map(|item| {
            let mut out = item.clone();
            for m in &multipliers {
                out.amount = round2(out.amount * m);
            }
            out
        })
        .collect()
}

#[async_trait]
impl Automation for CashFlowAutomation {
    fn automation_type(&self) -> AutomationType {
        AutomationType::Forecasting
    }

    fn watched_models(&self) -> Vec<String> {
        vec!["account.move".to_string(), "account.payment".to_string()]
    }

    fn handlers(self: Arc<Self>) -> HandlerTable {
        HandlerTable::new().on(
            EventType::Create,
            "account.move",
            handler(&self, |a, ctx| a.on_create_move(ctx)),
        )
    }

    fn scan_names(&self) -> Vec<&'static str> {
        vec!["daily_forecast", "record_actuals"]
    }

    async fn run_scan(&self, name: &str) -> Option<anyhow::Result<Value>> {
        match name {
            "daily_forecast" => Some(
                self.generate_forecast(None)
                    .await
                    .map(|r| json!({"horizon_days": r.horizon_days, "points": r.forecasts.len()})),
            ),
            "record_actuals" => Some(
                self.record_actual_balance()
                    .await
                    .map(|n| json!({ "logged": n })),
            ),
            _ => None,
        }
    }

    async fn execute_approved(
        &self,
        action: &str,
        model: &str,
        record_id: i64,
        _changes: &Value,
    ) -> anyhow::Result<AutomationResult> {
        // Forecast results are informational; nothing to apply.
        Ok(AutomationResult::ok(action, model, record_id)
            .with_reasoning("Forecast actions carry no ERP side effects"))
    }
}
