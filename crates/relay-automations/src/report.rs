//! Natural-language report builder: LLM query parsing with a keyword
//! fallback, ERP query execution, and grouped aggregation.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Datelike, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::warn;

use relay_providers::{Domain, ErpClient, LlmClient, ToolSpec};
use relay_store::Store;
use relay_types::{AutomationType, ReportJobRecord};

use crate::automation::Automation;
use crate::handler::HandlerTable;
use crate::result::AutomationResult;

const PARSE_PROMPT: &str = "You translate natural-language report requests into structured ERP \
queries. Today is {today}. Choose the model, fields, domain filters, and optional group_by \
that answer the request. Prefer posted/confirmed records unless the request says otherwise.";

fn parse_tools() -> Vec<ToolSpec> {
    vec![ToolSpec {
        name: "parsed_report_query".to_string(),
        description: "Structured ERP query for a report request".to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "model": {"type": "string"},
                "fields": {"type": "array", "items": {"type": "string"}},
                "domain": {"type": "array"},
                "group_by": {"type": "array", "items": {"type": "string"}},
                "limit": {"type": "integer"},
                "title": {"type": "string"}
            },
            "required": ["model", "fields"]
        }),
    }]
}

/// A parsed report request. `fields ∪ group_by` is exactly the column set
/// of the executed result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedQuery {
    pub model: String,
    pub fields: Vec<String>,
    #[serde(default)]
    pub domain: Value,
    #[serde(default)]
    pub group_by: Vec<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub title: String,
}

fn default_limit() -> usize {
    100
}

pub struct ReportAutomation {
    erp: Arc<dyn ErpClient>,
    llm: Arc<dyn LlmClient>,
    store: Arc<Store>,
}

impl ReportAutomation {
    pub fn new(erp: Arc<dyn ErpClient>, llm: Arc<dyn LlmClient>, store: Arc<Store>) -> Arc<Self> {
        Arc::new(Self { erp, llm, store })
    }

    /// Full pipeline: parse → execute → persist as a report job.
    pub async fn generate_report(
        &self,
        query_text: &str,
        requested_by: &str,
    ) -> anyhow::Result<ReportJobRecord> {
        let job_id = self.store.create_report_job(query_text, requested_by).await?;
        let parsed = self.parse_query(query_text).await;
        let parsed_value = serde_json::to_value(&parsed)?;

        match self.execute_query(&parsed).await {
            Ok(result) => {
                self.store
                    .complete_report_job(job_id, &parsed_value, &result, None)
                    .await?;
            }
            Err(err) => {
                self.store
                    .complete_report_job(job_id, &parsed_value, &json!({}), Some(&err.to_string()))
                    .await?;
            }
        }
        Ok(self.store.get_report_job(job_id).await?)
    }

    pub async fn parse_query(&self, query_text: &str) -> ParsedQuery {
        let prompt = PARSE_PROMPT.replace("{today}", &Utc::now().date_naive().to_string());
        match self
            .llm
            .analyze(&prompt, &format!("Parse this report request: {query_text}"), &parse_tools(), None)
            .await
        {
            Ok(analysis) => match analysis
                .tool_input()
                .and_then(|input| serde_json::from_value::<ParsedQuery>(input.clone()).ok())
            {
                Some(mut parsed) if !parsed.model.is_empty() => {
                    if parsed.title.is_empty() {
                        parsed.title = query_text.to_string();
                    }
                    parsed
                }
                _ => fallback_parse(query_text),
            },
            Err(err) => {
                warn!(error = %err, "report parse failed, using keyword fallback");
                fallback_parse(query_text)
            }
        }
    }

    /// Execute against the ERP. Plain queries return one row per record;
    /// grouped queries aggregate numeric fields per group key.
    pub async fn execute_query(&self, parsed: &ParsedQuery) -> anyhow::Result<Value> {
        let domain = Domain::from_json(&parsed.domain).unwrap_or_default();
        let fields: Vec<&str> = parsed.fields.iter().map(String::as_str).collect();
        let records = self
            .erp
            .search_read(&parsed.model, &domain, &fields, Some(parsed.limit), None)
            .await?;

        let data = if parsed.group_by.is_empty() {
            format_records(&records, &parsed.fields)
        } else {
            group_records(&records, &parsed.group_by, &parsed.fields)
        };

        let mut result = data;
        if let Some(obj) = result.as_object_mut() {
            obj.insert("title".to_string(), json!(parsed.title));
            obj.insert("record_count".to_string(), json!(records.len()));
        }
        Ok(result)
    }
}

fn column_list(names: &[String]) -> Value {
    json!(names
        .iter()
        .map(|f| json!({"name": f, "label": label_of(f)}))
        .collect::<Vec<_>>())
}

fn label_of(field: &str) -> String {
    field
        .split('_')
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn cell_of(record: &Map<String, Value>, field: &str) -> Value {
    match record.get(field) {
        Some(Value::Array(pair)) if pair.len() >= 2 => pair[1].clone(),
        Some(Value::Bool(false)) => Value::Null,
        Some(v) => v.clone(),
        None => Value::Null,
    }
}

fn format_records(records: &[Map<String, Value>], fields: &[String]) -> Value {
    let rows: Vec<Value> = records
        .iter()
        .map(|record| {
            let mut row = Map::new();
            for field in fields {
                row.insert(field.clone(), cell_of(record, field));
            }
            Value::Object(row)
        })
        .collect();
    json!({"columns": column_list(fields), "rows": rows})
}

fn group_records(records: &[Map<String, Value>], group_by: &[String], fields: &[String]) -> Value {
    let group_field = &group_by[0];
    let numeric_fields: Vec<&String> = fields
        .iter()
        .filter(|f| {
            f.as_str() != group_field.as_str()
                && records.iter().any(|r| r.get(f.as_str()).map(Value::is_number).unwrap_or(false))
        })
        .collect();

    let mut groups: BTreeMap<String, (i64, Map<String, Value>)> = BTreeMap::new();
    for record in records {
        let key = match cell_of(record, group_field) {
            Value::Null => "(none)".to_string(),
            Value::String(s) => s,
            other => other.to_string(),
        };
        let entry = groups.entry(key).or_insert_with(|| (0, Map::new()));
        entry.0 += 1;
        for field in &numeric_fields {
            let current = entry
                .1
                .get(field.as_str())
                .and_then(Value::as_f64)
                .unwrap_or(0.0);
            let add = record.get(field.as_str()).and_then(Value::as_f64).unwrap_or(0.0);
            entry.1.insert((*field).clone(), json!(current + add));
        }
    }

    // Column set stays fields ∪ group_by: the group key plus the aggregated
    // numeric fields plus untouched non-numeric fields (reported as null).
    let mut columns: Vec<String> = vec![group_field.clone()];
    for f in fields {
        if f != group_field && !columns.contains(f) {
            columns.push(f.clone());
        }
    }

    // Row keys are exactly fields ∪ group_by; group sizes ride alongside.
    let mut group_counts = Map::new();
    let rows: Vec<Value> = groups
        .into_iter()
        .map(|(key, (count, sums))| {
            let mut row = Map::new();
            row.insert(group_field.clone(), json!(key.clone()));
            for f in fields {
                if f == group_field {
                    continue;
                }
                row.insert(f.clone(), sums.get(f.as_str()).cloned().unwrap_or(Value::Null));
            }
            group_counts.insert(key, json!(count));
            Value::Object(row)
        })
        .collect();

    json!({
        "columns": column_list(&columns),
        "rows": rows,
        "grouped_by": group_field,
        "group_counts": group_counts,
    })
}

/// Keyword fallback used when the model is unavailable or returns nothing
/// usable.
pub fn fallback_parse(query_text: &str) -> ParsedQuery {
    let lower = query_text.to_lowercase();

    let (model, fields): (&str, Vec<&str>) = if lower.contains("sale") {
        ("sale.order", vec!["name", "partner_id", "amount_total", "state", "date_order"])
    } else if lower.contains("invoice") || lower.contains("billing") {
        ("account.move", vec!["name", "partner_id", "amount_total", "state", "invoice_date"])
    } else if lower.contains("lead") || lower.contains("pipeline") || lower.contains("opportunit") {
        ("crm.lead", vec!["name", "partner_id", "expected_revenue", "probability", "stage_id"])
    } else if lower.contains("product") {
        ("product.template", vec!["name", "list_price", "categ_id", "type"])
    } else if lower.contains("purchase") {
        ("purchase.order", vec!["name", "partner_id", "amount_total", "state", "date_order"])
    } else if lower.contains("expense") {
        ("hr.expense", vec!["name", "employee_id", "total_amount", "state", "date"])
    } else if lower.contains("customer") || lower.contains("contact") || lower.contains("partner") {
        ("res.partner", vec!["name", "email", "phone", "customer_rank"])
    } else if lower.contains("stock") || lower.contains("inventory") {
        ("product.product", vec!["name", "qty_available", "virtual_available", "categ_id"])
    } else {
        ("sale.order", vec!["name", "partner_id", "amount_total", "state", "date_order"])
    };

    let date_field = if model == "sale.order" {
        "date_order"
    } else if model == "account.move" {
        "invoice_date"
    } else {
        "create_date"
    };

    let today = Utc::now().date_naive();
    let domain = if lower.contains("this month") {
        let start = today.with_day(1).unwrap_or(today);
        json!([[date_field, ">=", start.to_string()]])
    } else if lower.contains("last month") {
        let first_this = today.with_day(1).unwrap_or(today);
        let last_month_end = first_this - Duration::days(1);
        let last_month_start = last_month_end.with_day(1).unwrap_or(last_month_end);
        json!([
            [date_field, ">=", last_month_start.to_string()],
            [date_field, "<=", last_month_end.to_string()]
        ])
    } else if lower.contains("ytd") || lower.contains("year to date") {
        let start = today.with_day(1).and_then(|d| d.with_month(1)).unwrap_or(today);
        json!([[date_field, ">=", start.to_string()]])
    } else {
        json!([])
    };

    let group_by = if lower.contains("by customer") || lower.contains("by partner") {
        vec!["partner_id".to_string()]
    } else if lower.contains("by state") || lower.contains("by status") {
        vec!["state".to_string()]
    } else if lower.contains("by category") {
        vec!["categ_id".to_string()]
    } else {
        Vec::new()
    };

    ParsedQuery {
        model: model.to_string(),
        fields: fields.into_iter().map(|s| s.to_string()).collect(),
        domain,
        group_by,
        limit: 100,
        title: query_text.to_string(),
    }
}

#[async_trait]
impl Automation for ReportAutomation {
    fn automation_type(&self) -> AutomationType {
        AutomationType::Reporting
    }

    fn watched_models(&self) -> Vec<String> {
        Vec::new()
    }

    fn handlers(self: Arc<Self>) -> HandlerTable {
        HandlerTable::new()
    }

    async fn execute_approved(
        &self,
        action: &str,
        model: &str,
        record_id: i64,
        _changes: &Value,
    ) -> anyhow::Result<AutomationResult> {
        Ok(AutomationResult::ok(action, model, record_id)
            .with_reasoning("Reports are read-only"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockErp, ScriptedLlm};

    fn sale(id: i64, partner: &str, amount: f64, state: &str) -> Value {
        json!({"id": id, "name": format!("SO{id:03}"), "partner_id": [id, partner],
               "amount_total": amount, "state": state, "date_order": "2026-03-01"})
    }

    #[tokio::test]
    async fn plain_query_columns_equal_fields() {
        let erp = MockErp::new();
        erp.seed("sale.order", vec![sale(1, "Acme", 100.0, "sale")]).await;
        let automation =
            ReportAutomation::new(erp, ScriptedLlm::empty(), Arc::new(Store::in_memory().await.unwrap()));

        let parsed = fallback_parse("show me sales orders");
        let result = automation.execute_query(&parsed).await.unwrap();

        let columns: Vec<String> = result["columns"]
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["name"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(columns, parsed.fields);
        assert_eq!(result["record_count"], json!(1));
        // many-to-one pairs collapse to display names
        assert_eq!(result["rows"][0]["partner_id"], json!("Acme"));
    }

    #[tokio::test]
    async fn grouped_query_columns_equal_fields_union_group_by() {
        let erp = MockErp::new();
        erp.seed(
            "sale.order",
            vec![
                sale(1, "Acme", 100.0, "sale"),
                sale(2, "Acme", 250.0, "sale"),
                sale(3, "Globex", 40.0, "draft"),
            ],
        )
        .await;
        let automation =
            ReportAutomation::new(erp, ScriptedLlm::empty(), Arc::new(Store::in_memory().await.unwrap()));

        let parsed = fallback_parse("sales by customer");
        assert_eq!(parsed.group_by, vec!["partner_id".to_string()]);
        let result = automation.execute_query(&parsed).await.unwrap();

        let mut expected: Vec<String> = parsed.fields.clone();
        for g in &parsed.group_by {
            if !expected.contains(g) {
                expected.insert(0, g.clone());
            }
        }
        expected.dedup();
        let columns: Vec<String> = result["columns"]
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["name"].as_str().unwrap().to_string())
            .collect();
        for c in &columns {
            assert!(expected.contains(c), "unexpected column {c}");
        }
        for f in &parsed.fields {
            assert!(columns.contains(f), "missing field column {f}");
        }

        let rows = result["rows"].as_array().unwrap();
        assert_eq!(rows.len(), 2);
        let acme = rows.iter().find(|r| r["partner_id"] == json!("Acme")).unwrap();
        assert_eq!(acme["amount_total"], json!(350.0));
        // row keys stay within fields ∪ group_by
        for key in acme.as_object().unwrap().keys() {
            assert!(parsed.fields.contains(key) || parsed.group_by.contains(key));
        }
        assert_eq!(result["group_counts"]["Acme"], json!(2));
    }

    #[tokio::test]
    async fn llm_parse_is_used_when_valid() {
        let erp = MockErp::new();
        erp.seed("crm.lead", vec![json!({"id": 1, "name": "Deal", "expected_revenue": 5000.0})])
            .await;
        let llm = ScriptedLlm::new(vec![ScriptedLlm::tool_reply(
            "parsed_report_query",
            json!({"model": "crm.lead", "fields": ["name", "expected_revenue"],
                   "domain": [], "title": "Pipeline"}),
            60,
        )]);
        let automation =
            ReportAutomation::new(erp, llm, Arc::new(Store::in_memory().await.unwrap()));
        let job = automation.generate_report("pipeline report", "cfo").await.unwrap();
        assert_eq!(job.status, "completed");
        assert_eq!(job.parsed_query["model"], json!("crm.lead"));
        assert_eq!(job.result_data["record_count"], json!(1));
    }

    #[test]
    fn fallback_picks_model_and_period() {
        let parsed = fallback_parse("invoices last month by customer");
        assert_eq!(parsed.model, "account.move");
        assert_eq!(parsed.group_by, vec!["partner_id".to_string()]);
        assert_eq!(parsed.domain.as_array().unwrap().len(), 2);
    }
}
