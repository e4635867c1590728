//! Purchase automation: confirmation assist for small, in-policy orders.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use relay_providers::ErpClient;
use relay_types::{AutomationType, EventType};

use crate::automation::Automation;
use crate::handler::{handler, EventCtx, HandlerTable};
use crate::result::AutomationResult;

/// Orders below this total from known vendors are candidates for
/// auto-confirmation.
const AUTO_CONFIRM_LIMIT: f64 = 1_000.0;

pub struct PurchaseAutomation {
    erp: Arc<dyn ErpClient>,
}

impl PurchaseAutomation {
    pub fn new(erp: Arc<dyn ErpClient>) -> Arc<Self> {
        Arc::new(Self { erp })
    }

    async fn on_create_po(self: Arc<Self>, ctx: EventCtx) -> anyhow::Result<AutomationResult> {
        let amount = ctx
            .values
            .get("amount_total")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        let Some(vendor_id) = ctx.values.get("partner_id").and_then(relay_providers::id_of) else {
            return Ok(AutomationResult::ok("po_review", &ctx.model, ctx.record_id)
                .with_reasoning("Order has no vendor"));
        };

        let vendor = self
            .erp
            .read("res.partner", vendor_id, &["name", "supplier_rank"])
            .await?;
        let known_vendor = vendor
            .get("supplier_rank")
            .and_then(Value::as_i64)
            .unwrap_or(0)
            > 0;

        if amount > 0.0 && amount <= AUTO_CONFIRM_LIMIT && known_vendor {
            Ok(AutomationResult::ok("confirm_purchase_order", &ctx.model, ctx.record_id)
                .with_confidence(0.96)
                .with_reasoning(format!(
                    "Order of {amount:.2} from established vendor is within auto-confirm policy"
                ))
                .with_change("confirm", json!(true)))
        } else {
            Ok(AutomationResult::ok("po_review", &ctx.model, ctx.record_id)
                .with_confidence(0.4)
                .with_reasoning(if known_vendor {
                    format!("Order of {amount:.2} exceeds auto-confirm limit")
                } else {
                    "New vendor requires manual review".to_string()
                }))
        }
    }
}

#[async_trait]
impl Automation for PurchaseAutomation {
    fn automation_type(&self) -> AutomationType {
        AutomationType::Purchase
    }

    fn watched_models(&self) -> Vec<String> {
        vec!["purchase.order".to_string()]
    }

    fn handlers(self: Arc<Self>) -> HandlerTable {
        HandlerTable::new().on(
            EventType::Create,
            "purchase.order",
            handler(&self, |a, ctx| a.on_create_po(ctx)),
        )
    }

    async fn execute_approved(
        &self,
        action: &str,
        model: &str,
        record_id: i64,
        _changes: &Value,
    ) -> anyhow::Result<AutomationResult> {
        match action {
            "confirm_purchase_order" => {
                self.erp
                    .execute_method(model, "button_confirm", &[record_id], Vec::new())
                    .await?;
                Ok(AutomationResult::ok(action, model, record_id)
                    .with_change("confirmed", json!(true))
                    .with_reasoning("Purchase order confirmed"))
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
    use serde_json::Map;

    async fn erp_with_vendor(rank: i64) -> Arc<MockErp> {
        let erp = MockErp::new();
        erp.seed(
            "res.partner",
            vec![json!({"id": 9, "name": "Initech", "supplier_rank": rank})],
        )
        .await;
        erp
    }

    fn po_ctx(amount: f64) -> EventCtx {
        let mut values = Map::new();
        values.insert("partner_id".into(), json!([9, "Initech"]));
        values.insert("amount_total".into(), json!(amount));
        EventCtx::new(EventType::Create, "purchase.order", 12).with_values(values)
    }

    #[tokio::test]
    async fn small_order_from_known_vendor_auto_confirms() {
        let automation = PurchaseAutomation::new(erp_with_vendor(2).await);
        let result = automation.on_create_po(po_ctx(400.0)).await.unwrap();
        assert_eq!(result.action, "confirm_purchase_order");
        assert!(result.confidence >= 0.95);
    }

    #[tokio::test]
    async fn large_order_goes_to_review() {
        let automation = PurchaseAutomation::new(erp_with_vendor(2).await);
        let result = automation.on_create_po(po_ctx(25_000.0)).await.unwrap();
        assert_eq!(result.action, "po_review");
        assert!(result.confidence < 0.85);
    }

    #[tokio::test]
    async fn unknown_vendor_goes_to_review() {
        let automation = PurchaseAutomation::new(erp_with_vendor(0).await);
        let result = automation.on_create_po(po_ctx(100.0)).await.unwrap();
        assert_eq!(result.action, "po_review");
    }

    #[tokio::test]
    async fn approval_confirms_in_erp() {
        let erp = erp_with_vendor(2).await;
        let automation = PurchaseAutomation::new(erp.clone());
        automation
            .execute_approved("confirm_purchase_order", "purchase.order", 12, &json!({}))
            .await
            .unwrap();
        let calls = erp.method_calls.lock().await;
        assert_eq!(calls[0].1, "button_confirm");
    }
}
