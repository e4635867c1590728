//! Procure-to-pay agent: vendor invoice → PO match → validation → goods
//! receipt → draft bill → approval routing → posting → vendor score →
//! notification. The needs-approval branch suspends the run until a human
//! decision arrives.

use serde_json::{json, Map, Value};

use relay_providers::{id_of, Domain, ToolSpec};

use crate::graph::{AgentGraph, GraphBuilder, END, START};
use crate::registry::AgentDefinition;
use crate::state::{self, keys, AgentState};

pub const AUTO_APPROVE_THRESHOLD: f64 = 0.95;
pub const NEEDS_APPROVAL_THRESHOLD: f64 = 0.85;

const EXTRACT_PROMPT: &str = "You are an invoice data extraction assistant. Extract vendor \
name, invoice number, date, line items, totals, and PO reference from the provided document \
data.";

fn extract_tools() -> Vec<ToolSpec> {
    vec![ToolSpec {
        name: "extract_invoice_fields".to_string(),
        description: "Extract structured fields from an invoice".to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "vendor_name": {"type": "string"},
                "invoice_number": {"type": "string"},
                "invoice_date": {"type": "string"},
                "po_reference": {"type": "string"},
                "total_amount": {"type": "number"},
                "currency": {"type": "string"},
                "confidence": {"type": "number"}
            },
            "required": ["vendor_name", "total_amount"]
        }),
    }]
}

pub fn definition() -> AgentDefinition {
    AgentDefinition::new(
        "procure_to_pay",
        "Full procure-to-pay: invoice → PO match → bill → approve → post",
        build_graph,
        None,
    )
}

fn build_graph() -> anyhow::Result<AgentGraph> {
    GraphBuilder::new()
        .add_node("extract_document", |services, state| async move {
            let mut patch = Map::new();
            if state.get("extracted_data").map(|v| !v.is_null()).unwrap_or(false) {
                return Ok(patch);
            }
            let document_id = state::get_i64(&state, "document_id");
            let analysis = services
                .analyze_with_tools(
                    EXTRACT_PROMPT,
                    &format!("Extract structured data from document ID {document_id}"),
                    &extract_tools(),
                )
                .await;
            match analysis {
                Ok(analysis) => {
                    let extracted = analysis.tool_input().cloned().unwrap_or(json!({}));
                    patch.insert("extracted_data".to_string(), extracted);
                }
                Err(err) => {
                    patch.insert(
                        keys::ERROR.to_string(),
                        json!(format!("Document extraction failed: {err}")),
                    );
                    patch.insert("extracted_data".to_string(), json!({}));
                }
            }
            Ok(patch)
        })
        .add_node("match_purchase_order", |services, state| async move {
            let extracted = state.get("extracted_data").cloned().unwrap_or(json!({}));
            let po_ref = extracted.get("po_reference").and_then(Value::as_str).unwrap_or("");
            let vendor_name = extracted.get("vendor_name").and_then(Value::as_str).unwrap_or("");
            let total = extracted.get("total_amount").and_then(Value::as_f64).unwrap_or(0.0);

            let mut matched_po: Option<Map<String, Value>> = None;
            let mut confidence = 0.0;

            if !po_ref.is_empty() {
                let pos = services
                    .erp
                    .search_read(
                        "purchase.order",
                        &Domain::filter("name", "=", po_ref)
                            .and_filter("state", "in", json!(["purchase", "done"])),
                        &["name", "partner_id", "amount_total", "state"],
                        Some(1),
                        None,
                    )
                    .await?;
                if let Some(po) = pos.into_iter().next() {
                    matched_po = Some(po);
                    confidence = 0.95;
                }
            }

            if matched_po.is_none() && !vendor_name.is_empty() && total > 0.0 {
                let vendors = services
                    .erp
                    .search_read(
                        "res.partner",
                        &Domain::filter("name", "ilike", vendor_name)
                            .and_filter("supplier_rank", ">", 0),
                        &["name"],
                        Some(5),
                        None,
                    )
                    .await?;
                let vendor_ids: Vec<i64> = vendors
                    .iter()
                    .filter_map(|v| v.get("id").and_then(Value::as_i64))
                    .collect();
                if !vendor_ids.is_empty() {
                    let pos = services
                        .erp
                        .search_read(
                            "purchase.order",
                            &Domain::filter("partner_id", "in", json!(vendor_ids))
                                .and_filter("state", "in", json!(["purchase", "done"]))
                                .and_filter("amount_total", ">=", total * 0.98)
                                .and_filter("amount_total", "<=", total * 1.02),
                            &["name", "partner_id", "amount_total", "state"],
                            Some(5),
                            None,
                        )
                        .await?;
                    if let Some(po) = pos.into_iter().next() {
                        matched_po = Some(po);
                        confidence = 0.75;
                    }
                }
            }

            let vendor_id = matched_po
                .as_ref()
                .and_then(|po| po.get("partner_id"))
                .and_then(id_of);

            let mut patch = Map::new();
            patch.insert(
                "matched_po".to_string(),
                matched_po.map(Value::Object).unwrap_or(Value::Null),
            );
            patch.insert("po_match_confidence".to_string(), json!(confidence));
            patch.insert("vendor_id".to_string(), json!(vendor_id));
            Ok(patch)
        })
        .add_node("validate_amounts", |_, state| async move {
            let extracted = state.get("extracted_data").cloned().unwrap_or(json!({}));
            let po = state.get("matched_po").cloned().unwrap_or(Value::Null);
            let mut discrepancies = Vec::new();

            if po.is_null() {
                discrepancies.push(json!({"field": "po", "reason": "No PO to validate against"}));
            } else {
                let inv_total = extracted.get("total_amount").and_then(Value::as_f64).unwrap_or(0.0);
                let po_total = po.get("amount_total").and_then(Value::as_f64).unwrap_or(0.0);
                if po_total > 0.0 && ((inv_total - po_total).abs() / po_total) > 0.02 {
                    discrepancies.push(json!({
                        "field": "total_amount",
                        "invoice_value": inv_total,
                        "po_value": po_total,
                        "difference_pct":
                            ((inv_total - po_total).abs() / po_total * 10_000.0).round() / 100.0,
                    }));
                }
            }

            let mut patch = Map::new();
            patch.insert("discrepancies".to_string(), json!(discrepancies));
            Ok(patch)
        })
        .add_node("check_goods_receipt", |services, state| async move {
            let po_name = state
                .get("matched_po")
                .and_then(|po| po.get("name"))
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();

            let received = if po_name.is_empty() {
                false
            } else {
                !services
                    .erp
                    .search(
                        "stock.picking",
                        &Domain::filter("origin", "=", po_name.as_str())
                            .and_filter("state", "=", "done"),
                        Some(1),
                    )
                    .await?
                    .is_empty()
            };

            let mut patch = Map::new();
            patch.insert("goods_received".to_string(), json!(received));
            Ok(patch)
        })
        .add_node("create_draft_bill", |services, state| async move {
            let mut patch = Map::new();
            let Some(vendor_id) = state.get("vendor_id").and_then(Value::as_i64) else {
                patch.insert(
                    keys::ERROR.to_string(),
                    json!("Cannot create bill without vendor"),
                );
                patch.insert("bill_id".to_string(), Value::Null);
                return Ok(patch);
            };

            let extracted = state.get("extracted_data").cloned().unwrap_or(json!({}));
            let mut values = Map::new();
            values.insert("move_type".to_string(), json!("in_invoice"));
            values.insert("partner_id".to_string(), json!(vendor_id));
            values.insert(
                "ref".to_string(),
                extracted.get("invoice_number").cloned().unwrap_or(json!("")),
            );

            let bill_id = services.erp.create("account.move", values).await?;
            patch.insert("bill_id".to_string(), json!(bill_id));
            Ok(patch)
        })
        .add_node("route_for_approval", |_, state| async move {
            let mut confidence = state::get_f64(&state, "po_match_confidence");
            let has_discrepancies = state
                .get("discrepancies")
                .and_then(Value::as_array)
                .map(|d| !d.is_empty())
                .unwrap_or(false);
            if has_discrepancies {
                confidence *= 0.7;
            }

            // Per-run threshold overrides ride in the trigger state.
            let auto_threshold = state
                .get("auto_approve_threshold")
                .and_then(Value::as_f64)
                .unwrap_or(AUTO_APPROVE_THRESHOLD);
            let approval_threshold = state
                .get("approval_threshold")
                .and_then(Value::as_f64)
                .unwrap_or(NEEDS_APPROVAL_THRESHOLD);

            let decision = if confidence >= auto_threshold {
                "auto_approve"
            } else if confidence >= approval_threshold {
                "needs_approval"
            } else {
                "escalate"
            };

            let mut patch = Map::new();
            patch.insert("approval_decision".to_string(), json!(decision));
            patch.insert("overall_confidence".to_string(), json!(confidence));
            Ok(patch)
        })
        .add_node("suspend_for_approval", |_, _| async move {
            let mut patch = Map::new();
            patch.insert(keys::NEEDS_SUSPENSION.to_string(), json!(true));
            patch.insert(
                keys::SUSPENSION_REASON.to_string(),
                json!("awaiting_bill_approval"),
            );
            Ok(patch)
        })
        .add_node("post_bill", |services, state| async move {
            let mut patch = Map::new();
            let Some(bill_id) = state.get("bill_id").and_then(Value::as_i64) else {
                patch.insert(keys::ERROR.to_string(), json!("No bill to post"));
                return Ok(patch);
            };
            // Resumed runs skip posting when the human rejected the bill.
            if state.get("approved").map(|v| v == &json!(false)).unwrap_or(false) {
                patch.insert("bill_posted".to_string(), json!(false));
                return Ok(patch);
            }
            let mut values = Map::new();
            values.insert("state".to_string(), json!("posted"));
            services.erp.write("account.move", &[bill_id], values).await?;
            patch.insert("bill_posted".to_string(), json!(true));
            Ok(patch)
        })
        .add_node("update_vendor_score", |_, state| async move {
            let has_discrepancies = state
                .get("discrepancies")
                .and_then(Value::as_array)
                .map(|d| !d.is_empty())
                .unwrap_or(false);
            let delta = if has_discrepancies { -2.0 } else { 5.0 };
            let mut patch = Map::new();
            patch.insert("vendor_score_delta".to_string(), json!(delta));
            Ok(patch)
        })
        .add_node("notify_stakeholders", |services, state| async move {
            let mut notifications: Vec<&str> = Vec::new();
            let error = state::get_str(&state, keys::ERROR);
            let bill_id = state.get("bill_id").and_then(Value::as_i64);

            if !error.is_empty() {
                let outcome = services
                    .notify("P2P agent alert", &format!("Issue in procure-to-pay workflow: {error}"))
                    .await;
                if outcome.delivered() {
                    notifications.push("error_alert");
                }
            } else if let Some(bill_id) = bill_id {
                let confidence = state::get_f64(&state, "overall_confidence");
                let outcome = services
                    .notify(
                        "P2P agent complete",
                        &format!("Bill {bill_id} processed (confidence {:.0}%)", confidence * 100.0),
                    )
                    .await;
                if outcome.delivered() {
                    notifications.push("completion");
                }
            }

            let mut patch = Map::new();
            patch.insert("notifications_sent".to_string(), json!(notifications));
            Ok(patch)
        })
        .add_edge(START, "extract_document")
        .add_conditional(
            "extract_document",
            |state: &AgentState| {
                let empty = state
                    .get("extracted_data")
                    .and_then(Value::as_object)
                    .map(|o| o.is_empty())
                    .unwrap_or(true);
                if !state::get_str(state, keys::ERROR).is_empty() || empty {
                    "failure".to_string()
                } else {
                    "success".to_string()
                }
            },
            &[("success", "match_purchase_order"), ("failure", "notify_stakeholders")],
        )
        .add_conditional(
            "match_purchase_order",
            |state: &AgentState| {
                if state.get("matched_po").map(|po| !po.is_null()).unwrap_or(false) {
                    "found".to_string()
                } else {
                    "not_found".to_string()
                }
            },
            &[("found", "validate_amounts"), ("not_found", "notify_stakeholders")],
        )
        .add_conditional(
            "validate_amounts",
            |state: &AgentState| {
                let blocking = state
                    .get("discrepancies")
                    .and_then(Value::as_array)
                    .map(|d| !d.is_empty())
                    .unwrap_or(false);
                if blocking {
                    "discrepancy".to_string()
                } else {
                    "match".to_string()
                }
            },
            &[("match", "check_goods_receipt"), ("discrepancy", "notify_stakeholders")],
        )
        .add_conditional(
            "check_goods_receipt",
            |state: &AgentState| {
                if state::get_bool(state, "goods_received") {
                    "received".to_string()
                } else {
                    "not_received".to_string()
                }
            },
            &[("received", "create_draft_bill"), ("not_received", "notify_stakeholders")],
        )
        .add_edge("create_draft_bill", "route_for_approval")
        .add_conditional(
            "route_for_approval",
            |state: &AgentState| state::get_str(state, "approval_decision").to_string(),
            &[
                ("auto_approve", "post_bill"),
                ("needs_approval", "suspend_for_approval"),
                ("escalate", "notify_stakeholders"),
            ],
        )
        .add_edge("suspend_for_approval", "post_bill")
        .add_edge("post_bill", "update_vendor_score")
        .add_edge("update_vendor_score", "notify_stakeholders")
        .add_edge("notify_stakeholders", END)
        .build()
}
