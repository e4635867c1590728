// In-crate test doubles for the runtime and agent tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;

use relay_providers::{
    Domain, DomainItem, ErpClient, ErpError, ErpResult, LlmAnalysis, LlmClient, LlmError,
    LlmMessage, LlmResult, NoopNotifier, ToolCall, ToolSpec,
};
use relay_store::Store;

use crate::services::AgentServices;

#[derive(Default)]
pub struct MockErp {
    pub records: Mutex<HashMap<String, Vec<Map<String, Value>>>>,
    pub created: Mutex<Vec<(String, Map<String, Value>)>>,
    pub written: Mutex<Vec<(String, Vec<i64>, Map<String, Value>)>>,
    pub next_id: Mutex<i64>,
}

impl MockErp {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: Mutex::new(5000),
            ..Default::default()
        })
    }

    pub async fn seed(&self, model: &str, records: Vec<Value>) {
        let mut all = self.records.lock().await;
        let entry = all.entry(model.to_string()).or_default();
        for record in records {
            if let Value::Object(map) = record {
                entry.push(map);
            }
        }
    }

    fn matches(record: &Map<String, Value>, domain: &Domain) -> bool {
        domain.items().iter().all(|item| match item {
            DomainItem::Triple(field, op, value) => {
                // many-to-one fields compare by id, as the ERP does
                let actual = match record.get(field) {
                    Some(Value::Array(pair)) if !pair.is_empty() => pair[0].clone(),
                    Some(v) => v.clone(),
                    None => Value::Null,
                };
                match op.as_str() {
                    "=" => &actual == value,
                    "!=" => &actual != value,
                    "in" => value
                        .as_array()
                        .map(|options| options.contains(&actual))
                        .unwrap_or(false),
                    "ilike" => match (actual.as_str(), value.as_str()) {
                        (Some(a), Some(v)) => a.to_lowercase().contains(&v.to_lowercase()),
                        _ => false,
                    },
                    ">" | ">=" | "<" | "<=" => match (actual.as_f64(), value.as_f64()) {
                        (Some(a), Some(v)) => match op.as_str() {
                            ">" => a > v,
                            ">=" => a >= v,
                            "<" => a < v,
                            _ => a <= v,
                        },
                        _ => match (actual.as_str(), value.as_str()) {
                            (Some(a), Some(v)) => match op.as_str() {
                                ">" => a > v,
                                ">=" => a >= v,
                                "<" => a < v,
                                _ => a <= v,
                            },
                            _ => false,
                        },
                    },
                    _ => true,
                }
            }
            _ => true,
        })
    }
}

#[async_trait]
impl ErpClient for MockErp {
    async fn search(&self, model: &str, domain: &Domain, limit: Option<usize>) -> ErpResult<Vec<i64>> {
        let rows = self.search_read(model, domain, &[], limit, None).await?;
        Ok(rows
            .iter()
            .filter_map(|r| r.get("id").and_then(Value::as_i64))
            .collect())
    }

    async fn read(&self, model: &str, id: i64, _fields: &[&str]) -> ErpResult<Map<String, Value>> {
        let all = self.records.lock().await;
        all.get(model)
            .and_then(|records| {
                records
                    .iter()
                    .find(|r| r.get("id").and_then(Value::as_i64) == Some(id))
            })
            .cloned()
            .ok_or_else(|| ErpError::Remote(format!("{model} record {id} not found")))
    }

    async fn search_read(
        &self,
        model: &str,
        domain: &Domain,
        _fields: &[&str],
        limit: Option<usize>,
        _order: Option<&str>,
    ) -> ErpResult<Vec<Map<String, Value>>> {
        let all = self.records.lock().await;
        let mut rows: Vec<Map<String, Value>> = all
            .get(model)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| Self::matches(r, domain))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        if let Some(n) = limit {
            rows.truncate(n);
        }
        Ok(rows)
    }

    async fn search_count(&self, model: &str, domain: &Domain) -> ErpResult<i64> {
        Ok(self.search(model, domain, None).await?.len() as i64)
    }

    async fn create(&self, model: &str, values: Map<String, Value>) -> ErpResult<i64> {
        let id = {
            let mut next = self.next_id.lock().await;
            *next += 1;
            *next
        };
        let mut stored = values.clone();
        stored.insert("id".to_string(), json!(id));
        self.records
            .lock()
            .await
            .entry(model.to_string())
            .or_default()
            .push(stored);
        self.created.lock().await.push((model.to_string(), values));
        Ok(id)
    }

    async fn write(&self, model: &str, ids: &[i64], values: Map<String, Value>) -> ErpResult<bool> {
        self.written
            .lock()
            .await
            .push((model.to_string(), ids.to_vec(), values));
        Ok(true)
    }

    async fn execute_method(
        &self,
        _model: &str,
        _method: &str,
        _ids: &[i64],
        _args: Vec<Value>,
    ) -> ErpResult<Value> {
        Ok(json!(true))
    }
}

pub struct ScriptedLlm {
    responses: Mutex<Vec<LlmAnalysis>>,
}

impl ScriptedLlm {
    pub fn new(responses: Vec<LlmAnalysis>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses),
        })
    }

    pub fn empty() -> Arc<Self> {
        Self::new(Vec::new())
    }

    pub fn tool_reply(name: &str, input: Value, tokens: i64) -> LlmAnalysis {
        LlmAnalysis {
            text: String::new(),
            tool_calls: vec![ToolCall {
                id: "tc_1".to_string(),
                name: name.to_string(),
                input,
            }],
            tokens_used: tokens,
            tokens_input: tokens / 2,
            tokens_output: tokens - tokens / 2,
        }
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn analyze(
        &self,
        _system_prompt: &str,
        _user_message: &str,
        _tools: &[ToolSpec],
        _max_tokens: Option<u32>,
    ) -> LlmResult<LlmAnalysis> {
        let mut responses = self.responses.lock().await;
        if responses.is_empty() {
            return Err(LlmError::Remote("script exhausted".to_string()));
        }
        Ok(responses.remove(0))
    }

    async fn analyze_with_history(
        &self,
        system_prompt: &str,
        _messages: &[LlmMessage],
        tools: &[ToolSpec],
    ) -> LlmResult<LlmAnalysis> {
        self.analyze(system_prompt, "", tools, None).await
    }
}

/// A services factory over fresh empty doubles, for runtime-level tests
/// whose nodes do not touch providers.
pub fn services_factory() -> Box<dyn Fn() -> Arc<AgentServices> + Send + Sync> {
    Box::new(|| {
        let store = futures::executor::block_on(Store::in_memory()).expect("in-memory store");
        AgentServices::new(
            MockErp::new(),
            ScriptedLlm::empty(),
            Arc::new(store),
            Arc::new(NoopNotifier),
        )
    })
}

/// Factory over caller-provided doubles.
pub fn services_factory_with(
    erp: Arc<MockErp>,
    llm: Arc<ScriptedLlm>,
    store: Arc<Store>,
) -> Box<dyn Fn() -> Arc<AgentServices> + Send + Sync> {
    Box::new(move || {
        AgentServices::new(
            erp.clone(),
            llm.clone(),
            store.clone(),
            Arc::new(NoopNotifier),
        )
    })
}
