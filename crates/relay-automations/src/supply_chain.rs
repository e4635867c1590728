//! Supply-chain intelligence: weighted vendor risk scoring, delivery
//! degradation detection, single-source exposure, and disruption alerts.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::{json, Map, Value};
use tracing::info;

use relay_providers::{id_of, Domain, ErpClient};
use relay_store::{NewRiskScore, Store};
use relay_types::{
    AlertSeverity, AutomationType, DisruptionPrediction, EventType, RiskClassification,
    SupplierRiskFactor, SupplyChainAlert,
};

use crate::automation::Automation;
use crate::handler::{handler, EventCtx, HandlerTable};
use crate::result::AutomationResult;

/// Factor weights; sum to 1.0.
const FACTORS: [(&str, f64); 5] = [
    ("delivery_performance", 0.30),
    ("quality_acceptance", 0.20),
    ("price_stability", 0.20),
    ("dependency_concentration", 0.15),
    ("communication", 0.15),
];

const DEGRADATION_WINDOW_DAYS: i64 = 30;
const DEGRADATION_DELTA: f64 = 15.0;

fn classify(score: f64) -> RiskClassification {
    if score >= 75.0 {
        RiskClassification::Low
    } else if score >= 55.0 {
        RiskClassification::Watch
    } else if score >= 35.0 {
        RiskClassification::Elevated
    } else {
        RiskClassification::Critical
    }
}

pub struct SupplyChainAutomation {
    erp: Arc<dyn ErpClient>,
    store: Arc<Store>,
}

impl SupplyChainAutomation {
    pub fn new(erp: Arc<dyn ErpClient>, store: Arc<Store>) -> Arc<Self> {
        Arc::new(Self { erp, store })
    }

    /// Score every active vendor, persisting scores + factors and raising
    /// alerts on degradation.
    pub async fn score_all_vendors(&self) -> anyhow::Result<Value> {
        let vendors = self.active_vendors().await?;
        let mut scored = 0;
        let mut degraded = Vec::new();

        for vendor in &vendors {
            let Some(vendor_id) = vendor.get("id").and_then(Value::as_i64) else {
                continue;
            };
            let vendor_name = vendor.get("name").and_then(Value::as_str).unwrap_or("");
            let previous = self.store.latest_risk_score(vendor_id).await?;

            let score = self.score_vendor(vendor_id, vendor_name).await?;
            scored += 1;

            if let Some(prev) = &previous {
                if prev.score - score.score >= DEGRADATION_DELTA {
                    degraded.push(vendor_id);
                    self.raise_degradation_alert(vendor_id, vendor_name, prev.score, score.score)
                        .await?;
                }
            }
        }

        Ok(json!({"vendors": vendors.len(), "scored": scored, "degraded": degraded}))
    }

    /// Compute and persist one vendor's weighted risk score.
    pub async fn score_vendor(&self, vendor_id: i64, vendor_name: &str) -> anyhow::Result<ScoredVendor> {
        let delivery = self.score_delivery_performance(vendor_id).await?;
        let quality = self.score_quality_acceptance(vendor_id).await?;
        let price = self.score_price_stability(vendor_id).await?;
        let dependency = self.score_dependency_concentration(vendor_id).await?;
        let communication = 70.0; // no signal source yet; neutral baseline

        let raw = [delivery, quality, price, dependency, communication];
        let mut factors = Vec::new();
        let mut total = 0.0;
        for ((name, weight), value) in FACTORS.iter().zip(raw.iter()) {
            let weighted = weight * value;
            total += weighted;
            factors.push(SupplierRiskFactor {
                id: 0,
                risk_score_id: 0,
                factor_name: name.to_string(),
                weight: *weight,
                raw_value: *value,
                weighted_score: (weighted * 100.0).round() / 100.0,
            });
        }
        let total = (total * 100.0).round() / 100.0;

        let previous = self.store.latest_risk_score(vendor_id).await?;
        let classification = classify(total);
        self.store
            .insert_risk_score(NewRiskScore {
                vendor_id,
                vendor_name,
                score: total,
                previous_score: previous.as_ref().map(|p| p.score),
                classification,
                summary: &format!(
                    "delivery {delivery:.0}, quality {quality:.0}, price {price:.0}, \
                     dependency {dependency:.0}, communication {communication:.0}"
                ),
                factors,
            })
            .await?;

        info!(vendor_id, score = total, "vendor risk scored");
        Ok(ScoredVendor {
            vendor_id,
            score: total,
            classification,
        })
    }

    /// Products with exactly one approved supplier.
    pub async fn detect_single_source(&self) -> anyhow::Result<Value> {
        let supplier_infos = self
            .erp
            .search_read(
                "product.supplierinfo",
                &Domain::new(),
                &["product_tmpl_id", "partner_id"],
                Some(1000),
                None,
            )
            .await?;

        let mut by_product: std::collections::HashMap<i64, Vec<i64>> = Default::default();
        for info in &supplier_infos {
            let (Some(product), Some(vendor)) = (
                info.get("product_tmpl_id").and_then(id_of),
                info.get("partner_id").and_then(id_of),
            ) else {
                continue;
            };
            let vendors = by_product.entry(product).or_default();
            if !vendors.contains(&vendor) {
                vendors.push(vendor);
            }
        }

        let mut single_source: Vec<i64> = by_product
            .iter()
            .filter(|(_, vendors)| vendors.len() == 1)
            .map(|(product, _)| *product)
            .collect();
        single_source.sort();

        for product in &single_source {
            let vendor = by_product[product][0];
            self.store
                .insert_prediction(&DisruptionPrediction {
                    id: 0,
                    vendor_id: vendor,
                    vendor_name: String::new(),
                    prediction_type: "single_source_exposure".to_string(),
                    probability: 0.3,
                    estimated_impact: json!({"product_tmpl_id": product}),
                    recommended_actions: vec!["qualify an alternative supplier".to_string()],
                    is_active: true,
                    created_at: Utc::now(),
                    expires_at: Some(Utc::now() + Duration::days(90)),
                    resolved_at: None,
                })
                .await?;
        }

        Ok(json!({"single_source_products": single_source}))
    }

    async fn raise_degradation_alert(
        &self,
        vendor_id: i64,
        vendor_name: &str,
        previous: f64,
        current: f64,
    ) -> anyhow::Result<()> {
        let severity = if current < 35.0 {
            AlertSeverity::Critical
        } else if current < 55.0 {
            AlertSeverity::High
        } else {
            AlertSeverity::Medium
        };
        self.store
            .insert_alert(&SupplyChainAlert {
                id: 0,
                vendor_id,
                vendor_name: vendor_name.to_string(),
                alert_type: "risk_degradation".to_string(),
                severity,
                title: format!("Vendor risk degraded: {vendor_name}"),
                message: format!(
                    "Risk score fell from {previous:.1} to {current:.1} within {DEGRADATION_WINDOW_DAYS} days"
                ),
                acknowledged_by: None,
                acknowledged_at: None,
                resolved_at: None,
                created_at: Utc::now(),
            })
            .await?;
        Ok(())
    }

    async fn active_vendors(&self) -> anyhow::Result<Vec<Map<String, Value>>> {
        Ok(self
            .erp
            .search_read(
                "res.partner",
                &Domain::filter("supplier_rank", ">", 0).and_filter("active", "=", true),
                &["name", "supplier_rank"],
                Some(500),
                None,
            )
            .await?)
    }

    /// On-time completion ratio over recent incoming pickings.
    async fn score_delivery_performance(&self, vendor_id: i64) -> anyhow::Result<f64> {
        let cutoff = (Utc::now() - Duration::days(90)).date_naive().to_string();
        let pickings = self
            .erp
            .search_read(
                "stock.picking",
                &Domain::filter("partner_id", "=", vendor_id)
                    .and_filter("picking_type_code", "=", "incoming")
                    .and_filter("scheduled_date", ">=", cutoff),
                &["state", "scheduled_date", "date_done"],
                Some(100),
                None,
            )
            .await?;
        if pickings.is_empty() {
            return Ok(60.0);
        }

        let done = pickings
            .iter()
            .filter(|p| p.get("state").and_then(Value::as_str) == Some("done"));
        let mut total = 0usize;
        let mut on_time = 0usize;
        for picking in done {
            total += 1;
            let scheduled = picking.get("scheduled_date").and_then(Value::as_str).unwrap_or("");
            let finished = picking.get("date_done").and_then(Value::as_str).unwrap_or("");
            if !finished.is_empty() && finished <= scheduled {
                on_time += 1;
            }
        }
        if total == 0 {
            return Ok(50.0);
        }
        Ok((on_time as f64 / total as f64) * 100.0)
    }

    /// Share of receipts without a linked return.
    async fn score_quality_acceptance(&self, vendor_id: i64) -> anyhow::Result<f64> {
        let receipts = self
            .erp
            .search_count(
                "stock.picking",
                &Domain::filter("partner_id", "=", vendor_id)
                    .and_filter("picking_type_code", "=", "incoming")
                    .and_filter("state", "=", "done"),
            )
            .await?;
        if receipts == 0 {
            return Ok(70.0);
        }
        let returns = self
            .erp
            .search_count(
                "stock.picking",
                &Domain::filter("partner_id", "=", vendor_id)
                    .and_filter("picking_type_code", "=", "outgoing")
                    .and_filter("origin", "ilike", "return"),
            )
            .await?;
        Ok(((1.0 - returns as f64 / receipts as f64) * 100.0).max(0.0))
    }

    /// Coefficient of variation of recent order line prices, inverted.
    async fn score_price_stability(&self, vendor_id: i64) -> anyhow::Result<f64> {
        let lines = self
            .erp
            .search_read(
                "purchase.order.line",
                &Domain::filter("partner_id", "=", vendor_id),
                &["price_unit", "product_id"],
                Some(200),
                None,
            )
            .await?;
        let prices: Vec<f64> = lines
            .iter()
            .filter_map(|l| l.get("price_unit").and_then(Value::as_f64))
            .filter(|p| *p > 0.0)
            .collect();
        if prices.len() < 2 {
            return Ok(70.0);
        }
        let avg = prices.iter().sum::<f64>() / prices.len() as f64;
        let variance = prices.iter().map(|p| (p - avg).powi(2)).sum::<f64>() / prices.len() as f64;
        let cv = variance.sqrt() / avg;
        Ok(((1.0 - cv.min(1.0)) * 100.0).max(0.0))
    }

    /// Spend share of this vendor across all open purchase orders; heavy
    /// concentration scores low.
    async fn score_dependency_concentration(&self, vendor_id: i64) -> anyhow::Result<f64> {
        let all_pos = self
            .erp
            .search_read(
                "purchase.order",
                &Domain::filter("state", "in", json!(["purchase", "done"])),
                &["partner_id", "amount_total"],
                Some(500),
                None,
            )
            .await?;
        let total: f64 = all_pos
            .iter()
            .filter_map(|po| po.get("amount_total").and_then(Value::as_f64))
            .sum();
        if total <= 0.0 {
            return Ok(70.0);
        }
        let vendor_total: f64 = all_pos
            .iter()
            .filter(|po| po.get("partner_id").and_then(id_of) == Some(vendor_id))
            .filter_map(|po| po.get("amount_total").and_then(Value::as_f64))
            .sum();
        let share = vendor_total / total;
        Ok(((1.0 - share) * 100.0).max(0.0))
    }

    async fn on_write_picking(self: Arc<Self>, ctx: EventCtx) -> anyhow::Result<AutomationResult> {
        let became_done = ctx.values.get("state").and_then(Value::as_str) == Some("done");
        let Some(vendor_id) = ctx.values.get("partner_id").and_then(id_of) else {
            return Ok(AutomationResult::ok("no_action", &ctx.model, ctx.record_id)
                .with_reasoning("Picking has no partner"));
        };
        if !became_done {
            return Ok(AutomationResult::ok("no_action", &ctx.model, ctx.record_id)
                .with_reasoning("Picking not completed"));
        }

        Ok(
            AutomationResult::ok("vendor_score_refresh", &ctx.model, ctx.record_id)
                .with_confidence(0.97)
                .with_reasoning("Receipt completed; vendor risk score refresh queued")
                .with_change("vendor_id", json!(vendor_id)),
        )
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ScoredVendor {
    pub vendor_id: i64,
    pub score: f64,
    pub classification: RiskClassification,
}

#[async_trait]
impl Automation for SupplyChainAutomation {
    fn automation_type(&self) -> AutomationType {
        AutomationType::SupplyChain
    }

    fn watched_models(&self) -> Vec<String> {
        vec!["stock.picking".to_string(), "purchase.order".to_string()]
    }

    fn handlers(self: Arc<Self>) -> HandlerTable {
        HandlerTable::new().on(
            EventType::Write,
            "stock.picking",
            handler(&self, |a, ctx| a.on_write_picking(ctx)),
        )
    }

    fn scan_names(&self) -> Vec<&'static str> {
        vec!["vendor_risk", "single_source"]
    }

    async fn run_scan(&self, name: &str) -> Option<anyhow::Result<Value>> {
        match name {
            "vendor_risk" => Some(self.score_all_vendors().await),
            "single_source" => Some(self.detect_single_source().await),
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
            "vendor_score_refresh" => {
                let vendor_id = changes.get("vendor_id").and_then(Value::as_i64).unwrap_or(0);
                let vendor = self.erp.read("res.partner", vendor_id, &["name"]).await?;
                let name = vendor.get("name").and_then(Value::as_str).unwrap_or("");
                let scored = self.score_vendor(vendor_id, name).await?;
                Ok(AutomationResult::ok(action, model, record_id)
                    .with_change("score", json!(scored.score))
                    .with_change("classification", json!(scored.classification.as_str()))
                    .with_reasoning("Vendor risk score refreshed"))
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
