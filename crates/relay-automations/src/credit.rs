//! Customer credit management: component-scored credit rating, limit
//! enforcement on order creation, and automatic hold/release.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::info;

use relay_providers::{display_name_of, Domain, ErpClient};
use relay_store::Store;
use relay_types::{AutomationType, CreditScoreRecord, EventType};

use crate::automation::Automation;
use crate::handler::{handler, EventCtx, HandlerTable};
use crate::result::AutomationResult;

pub const WEIGHT_PAYMENT_HISTORY: f64 = 0.40;
pub const WEIGHT_ORDER_VOLUME: f64 = 0.20;
pub const WEIGHT_OVERDUE_RATIO: f64 = 0.25;
pub const WEIGHT_AGE_FACTOR: f64 = 0.15;

pub const DEFAULT_CREDIT_LIMIT: f64 = 50_000.0;

/// Risk band lower bounds, best first.
const RISK_BANDS: [(f64, &str); 4] = [
    (80.0, "low"),
    (60.0, "normal"),
    (40.0, "elevated"),
    (20.0, "high"),
];

fn classify_risk(score: f64) -> &'static str {
    for (floor, label) in RISK_BANDS {
        if score >= floor {
            return label;
        }
    }
    "critical"
}

#[derive(Debug, Clone, Serialize)]
pub struct CreditCheck {
    pub allowed: bool,
    pub reason: String,
    pub credit_limit: f64,
    pub current_exposure: f64,
    pub new_exposure: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub over_limit_by: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_credit: Option<f64>,
}

pub struct CreditAutomation {
    erp: Arc<dyn ErpClient>,
    store: Arc<Store>,
}

impl CreditAutomation {
    pub fn new(erp: Arc<dyn ErpClient>, store: Arc<Store>) -> Arc<Self> {
        Arc::new(Self { erp, store })
    }

    /// Recalculate and persist one customer's credit score.
    pub async fn calculate_credit_score(&self, customer_id: i64) -> anyhow::Result<CreditScoreRecord> {
        let partner = self
            .erp
            .read(
                "res.partner",
                customer_id,
                &["name", "credit_limit", "create_date", "customer_rank"],
            )
            .await?;

        let invoices = self.fetch_customer_invoices(customer_id).await?;
        let open_orders = self.fetch_open_orders(customer_id).await?;

        let payment_history = score_payment_history(&invoices);
        let order_volume = score_order_volume(invoices.len() + open_orders.len());
        let overdue_ratio = score_overdue_ratio(&invoices);
        let age_factor = score_relationship_age(partner.get("create_date"));

        let score = payment_history * WEIGHT_PAYMENT_HISTORY
            + order_volume * WEIGHT_ORDER_VOLUME
            + overdue_ratio * WEIGHT_OVERDUE_RATIO
            + age_factor * WEIGHT_AGE_FACTOR;

        let exposure = calculate_exposure(&invoices, &open_orders);
        let overdue = calculate_overdue(&invoices);
        let credit_limit = partner
            .get("credit_limit")
            .and_then(Value::as_f64)
            .filter(|v| *v > 0.0)
            .unwrap_or(DEFAULT_CREDIT_LIMIT);
        let risk_level = classify_risk(score);
        let hold_active = matches!(risk_level, "high" | "critical") || exposure > credit_limit;

        let record = CreditScoreRecord {
            id: 0,
            customer_id,
            customer_name: partner
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
            credit_score: (score * 100.0).round() / 100.0,
            credit_limit,
            current_exposure: exposure,
            overdue_amount: overdue,
            payment_history_score: payment_history,
            order_volume_score: order_volume,
            risk_level: risk_level.to_string(),
            hold_active,
            hold_reason: hold_active.then(|| build_hold_reason(risk_level, exposure, credit_limit, overdue)),
            last_calculated: Utc::now(),
            created_at: Utc::now(),
        };
        self.store.upsert_credit_score(&record).await?;
        Ok(record)
    }

    /// Gate a new order against the customer's limit and hold state.
    pub async fn check_credit_on_order(
        &self,
        customer_id: i64,
        order_amount: f64,
    ) -> anyhow::Result<CreditCheck> {
        let score = match self.store.get_credit_score(customer_id).await? {
            Some(score) => score,
            None => self.calculate_credit_score(customer_id).await?,
        };

        let new_exposure = score.current_exposure + order_amount;

        if score.hold_active {
            return Ok(CreditCheck {
                allowed: false,
                reason: format!(
                    "Customer is on credit hold: {}",
                    score.hold_reason.as_deref().unwrap_or("hold active")
                ),
                credit_limit: score.credit_limit,
                current_exposure: score.current_exposure,
                new_exposure,
                over_limit_by: None,
                remaining_credit: None,
            });
        }

        if new_exposure > score.credit_limit {
            return Ok(CreditCheck {
                allowed: false,
                reason: format!(
                    "Order would exceed credit limit: exposure {:.2} > limit {:.2}",
                    new_exposure, score.credit_limit
                ),
                credit_limit: score.credit_limit,
                current_exposure: score.current_exposure,
                new_exposure,
                over_limit_by: Some(((new_exposure - score.credit_limit) * 100.0).round() / 100.0),
                remaining_credit: None,
            });
        }

        Ok(CreditCheck {
            allowed: true,
            reason: "Within credit limit".to_string(),
            credit_limit: score.credit_limit,
            current_exposure: score.current_exposure,
            new_exposure,
            over_limit_by: None,
            remaining_credit: Some(((score.credit_limit - new_exposure) * 100.0).round() / 100.0),
        })
    }

    /// Release holds whose overdue balance has cleared.
    pub async fn check_payment_releases(&self) -> anyhow::Result<Vec<i64>> {
        let holds = self.store.active_holds().await?;
        let mut released = Vec::new();
        for hold in holds {
            let refreshed = self.calculate_credit_score(hold.customer_id).await?;
            if !refreshed.hold_active {
                released.push(hold.customer_id);
                info!(customer_id = hold.customer_id, "credit hold released");
            }
        }
        Ok(released)
    }

    /// Batch recalculation over every ranked customer.
    pub async fn recalculate_all(&self) -> anyhow::Result<Value> {
        let customers = self
            .erp
            .search_read(
                "res.partner",
                &Domain::filter("customer_rank", ">", 0),
                &["name"],
                Some(500),
                None,
            )
            .await?;

        let mut updated = 0;
        let mut errors = 0;
        for customer in &customers {
            let Some(id) = customer.get("id").and_then(Value::as_i64) else {
                continue;
            };
            match self.calculate_credit_score(id).await {
                Ok(_) => updated += 1,
                Err(_) => errors += 1,
            }
        }
        Ok(json!({
            "total_customers": customers.len(),
            "updated": updated,
            "errors": errors,
        }))
    }

    async fn fetch_customer_invoices(
        &self,
        customer_id: i64,
    ) -> anyhow::Result<Vec<Map<String, Value>>> {
        Ok(self
            .erp
            .search_read(
                "account.move",
                &Domain::filter("partner_id", "=", customer_id)
                    .and_filter("move_type", "in", json!(["out_invoice", "out_refund"]))
                    .and_filter("state", "=", "posted"),
                &[
                    "name",
                    "amount_total",
                    "amount_residual",
                    "payment_state",
                    "invoice_date",
                    "invoice_date_due",
                ],
                Some(200),
                None,
            )
            .await?)
    }

    async fn fetch_open_orders(&self, customer_id: i64) -> anyhow::Result<Vec<Map<String, Value>>> {
        Ok(self
            .erp
            .search_read(
                "sale.order",
                &Domain::filter("partner_id", "=", customer_id)
                    .and_filter("state", "in", json!(["sale", "done"]))
                    .and_filter("invoice_status", "!=", "invoiced"),
                &["name", "amount_total", "state", "invoice_status"],
                Some(100),
                None,
            )
            .await?)
    }

    async fn on_create_sale_order(self: Arc<Self>, ctx: EventCtx) -> anyhow::Result<AutomationResult> {
        let Some(customer_id) = ctx.values.get("partner_id").and_then(relay_providers::id_of) else {
            return Ok(AutomationResult::ok("credit_check_skipped", &ctx.model, ctx.record_id)
                .with_reasoning("Order has no partner"));
        };
        let amount = ctx
            .values
            .get("amount_total")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);

        let check = self.check_credit_on_order(customer_id, amount).await?;
        let partner_label = ctx
            .values
            .get("partner_id")
            .and_then(display_name_of)
            .unwrap_or("customer");

        if check.allowed {
            Ok(AutomationResult::ok("credit_check_passed", &ctx.model, ctx.record_id)
                .with_confidence(0.6)
                .with_reasoning(format!(
                    "{partner_label}: order {amount:.2} within limit ({:.2} remaining)",
                    check.remaining_credit.unwrap_or(0.0)
                )))
        } else {
            // Blocking an order is a side effect worth human eyes.
            Ok(AutomationResult::ok("credit_hold_order", &ctx.model, ctx.record_id)
                .with_confidence(0.92)
                .with_reasoning(format!("{partner_label}: {}", check.reason))
                .with_change("hold", json!(true))
                .with_change("check", serde_json::to_value(&check)?)
                .requiring_approval())
        }
    }

    async fn on_create_payment(self: Arc<Self>, ctx: EventCtx) -> anyhow::Result<AutomationResult> {
        let Some(customer_id) = ctx.values.get("partner_id").and_then(relay_providers::id_of) else {
            return Ok(AutomationResult::ok("release_check_skipped", &ctx.model, ctx.record_id)
                .with_reasoning("Payment has no partner"));
        };

        let held = self
            .store
            .get_credit_score(customer_id)
            .await?
            .map(|s| s.hold_active)
            .unwrap_or(false);
        if !held {
            return Ok(AutomationResult::ok("no_hold_to_release", &ctx.model, ctx.record_id)
                .with_confidence(0.3)
                .with_reasoning("Customer has no active credit hold"));
        }

        let refreshed = self.calculate_credit_score(customer_id).await?;
        if refreshed.hold_active {
            Ok(AutomationResult::ok("hold_kept", &ctx.model, ctx.record_id)
                .with_confidence(0.5)
                .with_reasoning(
                    refreshed
                        .hold_reason
                        .unwrap_or_else(|| "hold criteria still met".to_string()),
                ))
        } else {
            Ok(AutomationResult::ok("hold_released", &ctx.model, ctx.record_id)
                .with_confidence(0.97)
                .with_reasoning("Payment cleared overdue balance, hold released")
                .with_change("customer_id", json!(customer_id)))
        }
    }
}

// ---------------------------------------------------------------------------
// Scoring components (0-100 each)
// ---------------------------------------------------------------------------

fn score_payment_history(invoices: &[Map<String, Value>]) -> f64 {
    if invoices.is_empty() {
        return 50.0;
    }
    let paid: Vec<&Map<String, Value>> = invoices
        .iter()
        .filter(|inv| inv.get("payment_state").and_then(Value::as_str) == Some("paid"))
        .collect();
    if paid.is_empty() {
        return 30.0;
    }

    let mut on_time = 0.0;
    for inv in &paid {
        match (
            inv.get("invoice_date").and_then(Value::as_str),
            inv.get("invoice_date_due").and_then(Value::as_str),
        ) {
            (Some(paid_date), Some(due)) => {
                if paid_date <= due {
                    on_time += 1.0;
                }
            }
            _ => on_time += 0.5,
        }
    }
    ((on_time / paid.len() as f64) * 100.0).min(100.0)
}

fn score_order_volume(total_orders: usize) -> f64 {
    match total_orders {
        0 => 30.0,
        n if n >= 50 => 95.0,
        n if n >= 20 => 80.0,
        n if n >= 10 => 65.0,
        n if n >= 5 => 50.0,
        _ => 35.0,
    }
}

fn score_overdue_ratio(invoices: &[Map<String, Value>]) -> f64 {
    let open: Vec<&Map<String, Value>> = invoices
        .iter()
        .filter(|inv| {
            matches!(
                inv.get("payment_state").and_then(Value::as_str),
                Some("not_paid") | Some("partial")
            )
        })
        .collect();
    if open.is_empty() {
        return 100.0;
    }
    let total_open: f64 = open
        .iter()
        .filter_map(|inv| inv.get("amount_residual").and_then(Value::as_f64))
        .sum();
    if total_open <= 0.0 {
        return 100.0;
    }
    let today = Utc::now().date_naive().to_string();
    let overdue: f64 = open
        .iter()
        .filter(|inv| {
            inv.get("invoice_date_due")
                .and_then(Value::as_str)
                .map(|due| due < today.as_str())
                .unwrap_or(false)
        })
        .filter_map(|inv| inv.get("amount_residual").and_then(Value::as_f64))
        .sum();
    (100.0 * (1.0 - overdue / total_open)).max(0.0)
}

fn score_relationship_age(create_date: Option<&Value>) -> f64 {
    // The ERP serializes datetimes as "YYYY-MM-DD HH:MM:SS" without offset.
    let Some(created) = create_date.and_then(Value::as_str).and_then(|s| {
        chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
            .map(|dt| DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc))
            .or_else(|_| DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc)))
            .ok()
    }) else {
        return 50.0;
    };
    let age_days = (Utc::now() - created).num_days();
    match age_days {
        d if d >= 730 => 95.0,
        d if d >= 365 => 80.0,
        d if d >= 180 => 65.0,
        d if d >= 90 => 50.0,
        _ => 30.0,
    }
}

fn calculate_exposure(invoices: &[Map<String, Value>], orders: &[Map<String, Value>]) -> f64 {
    let unpaid: f64 = invoices
        .iter()
        .filter(|inv| {
            matches!(
                inv.get("payment_state").and_then(Value::as_str),
                Some("not_paid") | Some("partial")
            )
        })
        .filter_map(|inv| inv.get("amount_residual").and_then(Value::as_f64))
        .sum();
    let pending: f64 = orders
        .iter()
        .filter_map(|o| o.get("amount_total").and_then(Value::as_f64))
        .sum();
    ((unpaid + pending) * 100.0).round() / 100.0
}

fn calculate_overdue(invoices: &[Map<String, Value>]) -> f64 {
    let today = Utc::now().date_naive().to_string();
    let overdue: f64 = invoices
        .iter()
        .filter(|inv| {
            matches!(
                inv.get("payment_state").and_then(Value::as_str),
                Some("not_paid") | Some("partial")
            ) && inv
                .get("invoice_date_due")
                .and_then(Value::as_str)
                .map(|due| due < today.as_str())
                .unwrap_or(false)
        })
        .filter_map(|inv| inv.get("amount_residual").and_then(Value::as_f64))
        .sum();
    (overdue * 100.0).round() / 100.0
}

fn build_hold_reason(risk_level: &str, exposure: f64, limit: f64, overdue: f64) -> String {
    let mut reasons = Vec::new();
    if matches!(risk_level, "high" | "critical") {
        reasons.push(format!("Risk level: {risk_level}"));
    }
    if exposure > limit {
        reasons.push(format!("Exposure ({exposure:.2}) exceeds limit ({limit:.2})"));
    }
    if overdue > 0.0 {
        reasons.push(format!("Overdue amount: {overdue:.2}"));
    }
    if reasons.is_empty() {
        "Credit hold applied".to_string()
    } else {
        reasons.join("; ")
    }
}

#[async_trait]
impl Automation for CreditAutomation {
    fn automation_type(&self) -> AutomationType {
        AutomationType::CreditManagement
    }

    fn watched_models(&self) -> Vec<String> {
        vec!["sale.order".to_string(), "account.payment".to_string()]
    }

    fn handlers(self: Arc<Self>) -> HandlerTable {
        HandlerTable::new()
            .on(
                EventType::Create,
                "sale.order",
                handler(&self, |a, ctx| a.on_create_sale_order(ctx)),
            )
            .on(
                EventType::Create,
                "account.payment",
                handler(&self, |a, ctx| a.on_create_payment(ctx)),
            )
    }

    fn scan_names(&self) -> Vec<&'static str> {
        vec!["payment_releases", "recalculate_all"]
    }

    async fn run_scan(&self, name: &str) -> Option<anyhow::Result<Value>> {
        match name {
            "payment_releases" => Some(
                self.check_payment_releases()
                    .await
                    .map(|released| json!({ "released": released })),
            ),
            "recalculate_all" => Some(self.recalculate_all().await),
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
            "credit_hold_order" => {
                // Approved: actually block the order in the ERP.
                let mut values = Map::new();
                values.insert("state".to_string(), json!("draft"));
                self.erp.write(model, &[record_id], values).await?;
                Ok(AutomationResult::ok(action, model, record_id)
                    .with_change("order_blocked", json!(true))
                    .with_change("check", changes.get("check").cloned().unwrap_or(Value::Null))
                    .with_reasoning("Order held pending credit review"))
            }
            "hold_released" => {
                let customer_id = changes.get("customer_id").and_then(Value::as_i64).unwrap_or(0);
                Ok(AutomationResult::ok(action, model, record_id)
                    .with_change("customer_id", json!(customer_id))
                    .with_reasoning("Hold release recorded"))
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
