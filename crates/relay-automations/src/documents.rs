//! Document processing automation: LLM field extraction with per-field
//! confidences, vendor and PO matching, learned corrections, and draft bill
//! creation for confident extractions. Raw documents are referenced by
//! name only; the orchestrator never stores file contents.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use relay_match::text;
use relay_providers::{Domain, ErpClient, LlmClient, ToolSpec};
use relay_store::{NewDocumentJob, Store};
use relay_types::{AutomationType, DocumentJob, EventType};

use crate::automation::Automation;
use crate::handler::{handler, EventCtx, HandlerTable};
use crate::result::AutomationResult;

const EXTRACTION_PROMPT: &str = "You are an invoice data extraction assistant. Extract vendor \
name, invoice number, date, line items, totals, and PO reference from the provided document \
text. Report a confidence per extracted field.";

const AUTO_CREATE_CONFIDENCE: f64 = 0.85;

fn extraction_tools() -> Vec<ToolSpec> {
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
                "line_items": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "description": {"type": "string"},
                            "quantity": {"type": "number"},
                            "unit_price": {"type": "number"},
                            "amount": {"type": "number"}
                        }
                    }
                },
                "field_confidences": {"type": "object"}
            },
            "required": ["vendor_name", "total_amount"]
        }),
    }]
}

pub struct DocumentAutomation {
    erp: Arc<dyn ErpClient>,
    llm: Arc<dyn LlmClient>,
    store: Arc<Store>,
}

impl DocumentAutomation {
    pub fn new(erp: Arc<dyn ErpClient>, llm: Arc<dyn LlmClient>, store: Arc<Store>) -> Arc<Self> {
        Arc::new(Self { erp, llm, store })
    }

    /// Full pipeline for one uploaded document.
    pub async fn process_document(
        &self,
        file_name: &str,
        file_type: &str,
        content: &str,
        uploaded_by: &str,
    ) -> anyhow::Result<DocumentJob> {
        let started = Instant::now();
        let job_id = self
            .store
            .create_document_job(NewDocumentJob {
                file_name,
                file_type,
                document_type: "vendor_invoice",
                source: "upload",
                uploaded_by,
            })
            .await?;

        match self.extract_and_match(content).await {
            Ok(extraction) => {
                self.store
                    .finish_document_job(
                        job_id,
                        "completed",
                        &extraction.fields,
                        extraction.overall_confidence,
                        &extraction.field_confidences,
                        extraction.matched_po_id,
                        extraction.matched_vendor_id,
                        extraction.erp_record_created,
                        extraction.erp_record_created.map(|_| "account.move"),
                        None,
                        started.elapsed().as_millis() as i64,
                    )
                    .await?;
            }
            Err(err) => {
                self.store
                    .finish_document_job(
                        job_id,
                        "failed",
                        &Value::Null,
                        0.0,
                        &Value::Null,
                        None,
                        None,
                        None,
                        None,
                        Some(&err.to_string()),
                        started.elapsed().as_millis() as i64,
                    )
                    .await?;
            }
        }

        Ok(self.store.get_document_job(job_id).await?)
    }

    /// Record an operator correction; future extractions prefer corrected
    /// values for the same (field, original) pair.
    pub async fn correct_field(
        &self,
        job_id: i64,
        field_name: &str,
        corrected_value: &str,
        corrected_by: &str,
    ) -> anyhow::Result<DocumentJob> {
        let job = self.store.get_document_job(job_id).await?;
        let original = job
            .extraction_result
            .get(field_name)
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .unwrap_or_default();
        self.store
            .add_correction(job_id, field_name, &original, corrected_value, corrected_by)
            .await?;
        Ok(self.store.get_document_job(job_id).await?)
    }

    async fn extract_and_match(&self, content: &str) -> anyhow::Result<Extraction> {
        let analysis = self
            .llm
            .analyze(
                EXTRACTION_PROMPT,
                &format!("Extract structured data from this document:\n\n{content}"),
                &extraction_tools(),
                None,
            )
            .await?;

        let mut fields = analysis
            .tool_input()
            .and_then(Value::as_object)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("extraction produced no structured fields"))?;

        let field_confidences = fields
            .remove("field_confidences")
            .unwrap_or_else(|| json!({}));
        self.apply_learned_corrections(&mut fields).await?;

        let overall = overall_confidence(&field_confidences);
        let vendor_name = fields
            .get("vendor_name")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();

        let matched_vendor_id = self.match_vendor(&vendor_name).await?;
        let matched_po_id = self
            .match_po(fields.get("po_reference").and_then(Value::as_str))
            .await?;

        // Draft bill only when the extraction is trustworthy and the vendor
        // resolved; anything weaker stays an operator task.
        let erp_record_created = if overall >= AUTO_CREATE_CONFIDENCE {
            match matched_vendor_id {
                Some(vendor_id) => Some(self.create_draft_bill(vendor_id, &fields).await?),
                None => None,
            }
        } else {
            None
        };

        Ok(Extraction {
            fields: Value::Object(fields),
            field_confidences,
            overall_confidence: overall,
            matched_vendor_id,
            matched_po_id,
            erp_record_created,
        })
    }

    async fn apply_learned_corrections(&self, fields: &mut Map<String, Value>) -> anyhow::Result<()> {
        let corrections = self.store.recent_corrections(100).await?;
        for correction in corrections {
            let Some(current) = fields.get(&correction.field_name).and_then(Value::as_str) else {
                continue;
            };
            if current == correction.original_value && !correction.corrected_value.is_empty() {
                fields.insert(
                    correction.field_name.clone(),
                    json!(correction.corrected_value),
                );
            }
        }
        Ok(())
    }

    async fn match_vendor(&self, vendor_name: &str) -> anyhow::Result<Option<i64>> {
        if vendor_name.is_empty() {
            return Ok(None);
        }
        let vendors = self
            .erp
            .search_read(
                "res.partner",
                &Domain::filter("supplier_rank", ">", 0),
                &["name"],
                Some(200),
                None,
            )
            .await?;

        let mut best: Option<(u32, i64)> = None;
        for vendor in &vendors {
            let name = vendor.get("name").and_then(Value::as_str).unwrap_or("");
            let score = text::token_sort_ratio(vendor_name, name);
            if score >= 80 && best.map(|(s, _)| score > s).unwrap_or(true) {
                if let Some(id) = vendor.get("id").and_then(Value::as_i64) {
                    best = Some((score, id));
                }
            }
        }
        Ok(best.map(|(_, id)| id))
    }

    async fn match_po(&self, po_reference: Option<&str>) -> anyhow::Result<Option<i64>> {
        let Some(po_ref) = po_reference.filter(|r| !r.is_empty()) else {
            return Ok(None);
        };
        let pos = self
            .erp
            .search(
                "purchase.order",
                &Domain::filter("name", "=", po_ref)
                    .and_filter("state", "in", json!(["purchase", "done"])),
                Some(1),
            )
            .await?;
        Ok(pos.first().copied())
    }

    async fn create_draft_bill(
        &self,
        vendor_id: i64,
        fields: &Map<String, Value>,
    ) -> anyhow::Result<i64> {
        let mut values = Map::new();
        values.insert("move_type".to_string(), json!("in_invoice"));
        values.insert("partner_id".to_string(), json!(vendor_id));
        values.insert(
            "ref".to_string(),
            fields.get("invoice_number").cloned().unwrap_or(json!("")),
        );
        Ok(self.erp.create("account.move", values).await?)
    }

    /// New ERP attachment on a vendor bill model kicks off processing.
    async fn on_create_attachment(self: Arc<Self>, ctx: EventCtx) -> anyhow::Result<AutomationResult> {
        let file_name = ctx
            .values
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or("attachment");
        Ok(
            AutomationResult::ok("document_queued", &ctx.model, ctx.record_id)
                .with_confidence(0.5)
                .with_reasoning(format!("Attachment `{file_name}` queued for extraction"))
                .with_change("file_name", json!(file_name)),
        )
    }
}

struct Extraction {
    fields: Value,
    field_confidences: Value,
    overall_confidence: f64,
    matched_vendor_id: Option<i64>,
    matched_po_id: Option<i64>,
    erp_record_created: Option<i64>,
}

/// Minimum of the field confidences, weighted toward the critical fields.
fn overall_confidence(field_confidences: &Value) -> f64 {
    let Some(map) = field_confidences.as_object() else {
        return 0.0;
    };
    if map.is_empty() {
        return 0.0;
    }
    let values: Vec<f64> = map.values().filter_map(Value::as_f64).collect();
    if values.is_empty() {
        return 0.0;
    }
    let avg = values.iter().sum::<f64>() / values.len() as f64;
    let critical_min = ["vendor_name", "total_amount"]
        .iter()
        .filter_map(|f| map.get(*f).and_then(Value::as_f64))
        .fold(1.0_f64, f64::min);
    ((avg.min(critical_min)) * 10_000.0).round() / 10_000.0
}

#[async_trait]
impl Automation for DocumentAutomation {
    fn automation_type(&self) -> AutomationType {
        AutomationType::DocumentProcessing
    }

    fn watched_models(&self) -> Vec<String> {
        vec!["ir.attachment".to_string()]
    }

    fn handlers(self: Arc<Self>) -> HandlerTable {
        HandlerTable::new().on(
            EventType::Create,
            "ir.attachment",
            handler(&self, |a, ctx| a.on_create_attachment(ctx)),
        )
    }

    async fn execute_approved(
        &self,
        action: &str,
        model: &str,
        record_id: i64,
        _changes: &Value,
    ) -> anyhow::Result<AutomationResult> {
        // Document jobs are driven through the API, not the approval replay.
        Ok(AutomationResult::ok(action, model, record_id)
            .with_reasoning("Document actions are processed via the documents API"))
    }
}
