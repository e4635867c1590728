//! Cross-entity deduplication automation: scheduled scans, real-time
//! duplicate checks on create, and merge execution with an AI-assisted
//! master recommendation.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use relay_match::dedup::{
    builtin_configs, compute_similarity, config_for, find_duplicate_groups, heuristic_master,
    EntityConfig, OVERALL_DUPLICATE_THRESHOLD,
};
use relay_providers::{Domain, ErpClient, LlmClient, ToolSpec};
use relay_store::Store;
use relay_types::{AutomationType, DuplicateGroup, EventType, GroupResolution};

use crate::automation::Automation;
use crate::handler::{handler, EventCtx, HandlerTable};
use crate::result::AutomationResult;

const SCAN_BATCH_SIZE: usize = 500;

const DEDUP_PROMPT: &str = "You are a data quality assistant for an ERP. Analyze a group of \
potential duplicate records and recommend the best master record to keep. Consider record \
completeness, creation date, and data freshness. Return your recommendation as structured output.";

fn dedup_tools() -> Vec<ToolSpec> {
    vec![ToolSpec {
        name: "dedup_recommendation".to_string(),
        description: "Recommend which record to keep as master in a duplicate group".to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "master_record_id": {"type": "integer"},
                "confidence": {"type": "number"},
                "reasoning": {"type": "string"},
                "merge_strategy": {
                    "type": "string",
                    "enum": ["keep_master", "merge_fields", "manual_review"]
                }
            },
            "required": ["master_record_id", "confidence", "reasoning", "merge_strategy"]
        }),
    }]
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    pub scan_id: i64,
    pub scan_type: String,
    pub total_records: i64,
    pub groups: i64,
    pub duplicates_found: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MasterRecommendation {
    pub master_record_id: i64,
    pub confidence: f64,
    pub reasoning: String,
    pub merge_strategy: String,
}

pub struct DeduplicationAutomation {
    erp: Arc<dyn ErpClient>,
    llm: Arc<dyn LlmClient>,
    store: Arc<Store>,
}

impl DeduplicationAutomation {
    pub fn new(erp: Arc<dyn ErpClient>, llm: Arc<dyn LlmClient>, store: Arc<Store>) -> Arc<Self> {
        Arc::new(Self { erp, llm, store })
    }

    /// Full scan for one entity type: cluster, persist scan + groups.
    pub async fn run_scan_type(&self, scan_type: &str) -> anyhow::Result<ScanReport> {
        let config = config_for(scan_type)
            .ok_or_else(|| anyhow::anyhow!("unknown scan type `{scan_type}`"))?;

        let scan_id = self.store.create_dedup_scan(&config.label).await?;
        let records = self.fetch_records(&config).await?;
        let clusters = find_duplicate_groups(&records, &config);

        let duplicates_found: i64 = clusters.iter().map(|g| g.record_ids.len() as i64).sum();
        for cluster in &clusters {
            self.store
                .insert_duplicate_group(
                    scan_id,
                    &cluster.model,
                    &cluster.record_ids,
                    cluster.master_record_id,
                    cluster.similarity_score,
                    &cluster.match_fields,
                )
                .await?;
        }
        self.store
            .complete_dedup_scan(
                scan_id,
                records.len() as i64,
                duplicates_found,
                clusters.len() as i64,
            )
            .await?;

        info!(scan_id, scan_type, groups = clusters.len(), "dedup scan complete");

        Ok(ScanReport {
            scan_id,
            scan_type: config.label.clone(),
            total_records: records.len() as i64,
            groups: clusters.len() as i64,
            duplicates_found,
        })
    }

    /// Compare incoming values against existing records of the same model.
    pub async fn check_duplicate_on_create(
        &self,
        model: &str,
        values: &Map<String, Value>,
    ) -> anyhow::Result<Vec<Value>> {
        let Some(config) = config_for(model) else {
            return Ok(Vec::new());
        };
        let existing = self.fetch_records(&config).await?;

        let mut candidate = values.clone();
        candidate.insert("id".to_string(), json!(0));

        let mut matches: Vec<(f64, Value)> = Vec::new();
        for record in &existing {
            let (score, fields) = compute_similarity(&candidate, record, &config);
            if score >= OVERALL_DUPLICATE_THRESHOLD {
                matches.push((
                    score,
                    json!({
                        "record_id": record.get("id"),
                        "similarity_score": (score * 10_000.0).round() / 10_000.0,
                        "matched_fields": fields,
                    }),
                ));
            }
        }
        matches.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        Ok(matches.into_iter().take(10).map(|(_, m)| m).collect())
    }

    /// AI master recommendation with a heuristic fallback.
    pub async fn recommend_master(
        &self,
        records: &[Map<String, Value>],
    ) -> MasterRecommendation {
        let descriptions: Vec<String> = records
            .iter()
            .map(|r| {
                let id = r.get("id").and_then(Value::as_i64).unwrap_or(0);
                let fields: Vec<String> = r
                    .iter()
                    .filter(|(k, v)| k.as_str() != "id" && !v.is_null())
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect();
                format!("Record #{id}: {}", fields.join(", "))
            })
            .collect();

        match self
            .llm
            .analyze(
                DEDUP_PROMPT,
                &format!("Potential duplicates:\n{}", descriptions.join("\n")),
                &dedup_tools(),
                None,
            )
            .await
        {
            Ok(analysis) => {
                if let Some(input) = analysis.tool_input() {
                    return MasterRecommendation {
                        master_record_id: input
                            .get("master_record_id")
                            .and_then(Value::as_i64)
                            .unwrap_or(0),
                        confidence: input
                            .get("confidence")
                            .and_then(Value::as_f64)
                            .unwrap_or(0.0),
                        reasoning: input
                            .get("reasoning")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        merge_strategy: input
                            .get("merge_strategy")
                            .and_then(Value::as_str)
                            .unwrap_or("manual_review")
                            .to_string(),
                    };
                }
                self.fallback_master(records)
            }
            Err(err) => {
                warn!(error = %err, "dedup master recommendation failed, using heuristic");
                self.fallback_master(records)
            }
        }
    }

    fn fallback_master(&self, records: &[Map<String, Value>]) -> MasterRecommendation {
        let refs: Vec<&Map<String, Value>> = records.iter().collect();
        MasterRecommendation {
            master_record_id: heuristic_master(&refs),
            confidence: 0.7,
            reasoning: "Selected record with most complete data".to_string(),
            merge_strategy: "keep_master".to_string(),
        }
    }

    /// Merge a pending group: non-master records fold into the master via
    /// the ERP's merge method, and the group is resolved.
    pub async fn merge_group(
        &self,
        group_id: i64,
        master_override: Option<i64>,
        merged_by: &str,
    ) -> anyhow::Result<DuplicateGroup> {
        let group = self.store.get_duplicate_group(group_id).await?;
        if group.status != GroupResolution::Pending {
            anyhow::bail!(relay_store::StoreError::Invariant(format!(
                "duplicate group {group_id} is not pending"
            )));
        }
        let master = master_override.unwrap_or(group.master_record_id);
        if !group.record_ids.contains(&master) {
            anyhow::bail!("master record {master} is not part of group {group_id}");
        }

        let duplicates: Vec<i64> = group
            .record_ids
            .iter()
            .copied()
            .filter(|id| *id != master)
            .collect();
        self.erp
            .execute_method(&group.model, "merge_records", &duplicates, vec![json!(master)])
            .await?;

        let resolved = self
            .store
            .resolve_group(group_id, GroupResolution::Merged, merged_by, Some(master))
            .await?;
        Ok(resolved)
    }

    async fn fetch_records(&self, config: &EntityConfig) -> anyhow::Result<Vec<Map<String, Value>>> {
        let fields: Vec<&str> = config.fetch_fields.iter().map(String::as_str).collect();
        Ok(self
            .erp
            .search_read(
                &config.model,
                &Domain::filter("active", "=", true),
                &fields,
                Some(SCAN_BATCH_SIZE),
                None,
            )
            .await?)
    }

    async fn on_create_watched(self: Arc<Self>, ctx: EventCtx) -> anyhow::Result<AutomationResult> {
        let matches = self.check_duplicate_on_create(&ctx.model, &ctx.values).await?;
        if matches.is_empty() {
            return Ok(AutomationResult::ok("no_duplicates", &ctx.model, ctx.record_id)
                .with_confidence(1.0)
                .with_reasoning("No duplicates found"));
        }

        let top_score = matches[0]
            .get("similarity_score")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        let ids: Vec<String> = matches
            .iter()
            .take(3)
            .filter_map(|m| m.get("record_id").and_then(Value::as_i64))
            .map(|id| id.to_string())
            .collect();

        Ok(
            AutomationResult::ok("duplicate_detected", &ctx.model, ctx.record_id)
                .with_confidence(top_score)
                .with_reasoning(format!(
                    "Found {} potential duplicate(s): {}",
                    matches.len(),
                    ids.join(", ")
                ))
                .with_change("duplicates", Value::Array(matches))
                .requiring_approval(),
        )
    }
}

#[async_trait]
impl Automation for DeduplicationAutomation {
    fn automation_type(&self) -> AutomationType {
        AutomationType::Deduplication
    }

    fn watched_models(&self) -> Vec<String> {
        builtin_configs().into_iter().map(|c| c.model).collect()
    }

    fn handlers(self: Arc<Self>) -> HandlerTable {
        HandlerTable::new().on_any(
            EventType::Create,
            handler(&self, |a, ctx| a.on_create_watched(ctx)),
        )
    }

    fn scan_names(&self) -> Vec<&'static str> {
        vec!["all_entities"]
    }

    async fn run_scan(&self, name: &str) -> Option<anyhow::Result<Value>> {
        if name != "all_entities" {
            return None;
        }
        let mut results = Map::new();
        for config in builtin_configs() {
            match self.run_scan_type(&config.model).await {
                Ok(report) => {
                    results.insert(
                        config.label,
                        serde_json::to_value(report).unwrap_or(Value::Null),
                    );
                }
                Err(err) => return Some(Err(err)),
            }
        }
        Some(Ok(Value::Object(results)))
    }

    async fn execute_approved(
        &self,
        action: &str,
        model: &str,
        record_id: i64,
        changes: &Value,
    ) -> anyhow::Result<AutomationResult> {
        match action {
            // Approving a duplicate-detected result archives the new record
            // so the existing one stays canonical.
            "duplicate_detected" => {
                let mut values = Map::new();
                values.insert("active".to_string(), json!(false));
                self.erp.write(model, &[record_id], values).await?;
                Ok(AutomationResult::ok(action, model, record_id)
                    .with_change("archived", json!(true))
                    .with_change("duplicates", changes.get("duplicates").cloned().unwrap_or(Value::Null))
                    .with_reasoning("Archived newly created duplicate record"))
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
    use crate::testing::{MockErp, ScriptedLlm};

    async fn seeded_erp() -> Arc<MockErp> {
        let erp = MockErp::new();
        erp.seed(
            "res.partner",
            vec![
                json!({"id": 1, "name": "Acme Corp", "email": "info@acme.com",
                       "phone": "+1 555 0100", "active": true}),
                json!({"id": 2, "name": "ACME Corporation Ltd", "email": "info@acme.com",
                       "active": true}),
                json!({"id": 3, "name": "Globex", "email": "ceo@globex.com", "active": true}),
            ],
        )
        .await;
        erp
    }

    #[tokio::test]
    async fn scan_persists_strong_signal_group() {
        let erp = seeded_erp().await;
        let store = Arc::new(Store::in_memory().await.unwrap());
        let automation = DeduplicationAutomation::new(erp, ScriptedLlm::empty(), store.clone());

        let report = automation.run_scan_type("res.partner").await.unwrap();
        assert_eq!(report.total_records, 3);
        assert_eq!(report.groups, 1);
        assert_eq!(report.duplicates_found, 2);

        let groups = store.groups_for_scan(report.scan_id).await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].record_ids, vec![1, 2]);
        assert_eq!(groups[0].similarity_score, 1.0);
        assert!(groups[0].match_fields.contains(&"email".to_string()));
    }

    #[tokio::test]
    async fn scan_twice_produces_identical_groups() {
        let erp = seeded_erp().await;
        let store = Arc::new(Store::in_memory().await.unwrap());
        let automation = DeduplicationAutomation::new(erp, ScriptedLlm::empty(), store.clone());

        let first = automation.run_scan_type("res.partner").await.unwrap();
        let second = automation.run_scan_type("res.partner").await.unwrap();

        let g1 = store.groups_for_scan(first.scan_id).await.unwrap();
        let g2 = store.groups_for_scan(second.scan_id).await.unwrap();
        assert_eq!(g1.len(), g2.len());
        for (a, b) in g1.iter().zip(g2.iter()) {
            assert_eq!(a.record_ids, b.record_ids);
            assert_eq!(a.master_record_id, b.master_record_id);
            assert_eq!(a.similarity_score, b.similarity_score);
        }
    }

    #[tokio::test]
    async fn create_handler_flags_duplicates_for_approval() {
        let erp = seeded_erp().await;
        let store = Arc::new(Store::in_memory().await.unwrap());
        let automation = DeduplicationAutomation::new(erp, ScriptedLlm::empty(), store);

        let mut values = Map::new();
        values.insert("name".into(), json!("Acme Inc"));
        values.insert("email".into(), json!("info@acme.com"));

        let ctx = EventCtx::new(EventType::Create, "res.partner", 99).with_values(values);
        let result = automation.on_create_watched(ctx).await.unwrap();
        assert_eq!(result.action, "duplicate_detected");
        assert!(result.needs_approval);
        assert_eq!(result.confidence, 1.0);
    }

    #[tokio::test]
    async fn merge_respects_master_override_and_is_single_shot() {
        let erp = seeded_erp().await;
        let store = Arc::new(Store::in_memory().await.unwrap());
        let automation =
            DeduplicationAutomation::new(erp.clone(), ScriptedLlm::empty(), store.clone());

        let report = automation.run_scan_type("res.partner").await.unwrap();
        let group = store.groups_for_scan(report.scan_id).await.unwrap()[0].clone();

        let merged = automation.merge_group(group.id, Some(2), "admin").await.unwrap();
        assert_eq!(merged.status, GroupResolution::Merged);
        assert_eq!(merged.master_record_id, 2);

        let calls = erp.method_calls.lock().await;
        assert_eq!(calls[0].1, "merge_records");
        assert_eq!(calls[0].2, vec![1]);
        drop(calls);

        assert!(automation.merge_group(group.id, None, "admin").await.is_err());
    }

    #[tokio::test]
    async fn master_recommendation_falls_back_to_heuristic() {
        let erp = seeded_erp().await;
        let store = Arc::new(Store::in_memory().await.unwrap());
        let automation = DeduplicationAutomation::new(erp, ScriptedLlm::empty(), store);

        let records = vec![
            serde_json::from_value::<Map<String, Value>>(
                json!({"id": 5, "name": "Acme", "email": "info@acme.com", "phone": "+1 555 0100"}),
            )
            .unwrap(),
            serde_json::from_value::<Map<String, Value>>(json!({"id": 6, "name": "Acme"})).unwrap(),
        ];
        let rec = automation.recommend_master(&records).await;
        assert_eq!(rec.master_record_id, 5);
        assert_eq!(rec.merge_strategy, "keep_master");
    }

    #[tokio::test]
    async fn master_recommendation_uses_llm_when_available() {
        let erp = seeded_erp().await;
        let store = Arc::new(Store::in_memory().await.unwrap());
        let llm = ScriptedLlm::new(vec![ScriptedLlm::tool_reply(
            "dedup_recommendation",
            json!({"master_record_id": 6, "confidence": 0.9,
                   "reasoning": "fresher", "merge_strategy": "keep_master"}),
            40,
        )]);
        let automation = DeduplicationAutomation::new(erp, llm, store);

        let records = vec![
            serde_json::from_value::<Map<String, Value>>(json!({"id": 5, "name": "Acme"})).unwrap(),
            serde_json::from_value::<Map<String, Value>>(json!({"id": 6, "name": "Acme"})).unwrap(),
        ];
        let rec = automation.recommend_master(&records).await;
        assert_eq!(rec.master_record_id, 6);
        assert_eq!(rec.confidence, 0.9);
    }
}
