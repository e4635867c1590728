// Shared in-crate test doubles: a scriptable ERP and LLM.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;

use relay_providers::{
    Domain, DomainItem, ErpClient, ErpError, ErpResult, LlmAnalysis, LlmClient, LlmError,
    LlmMessage, LlmResult, ToolCall, ToolSpec,
};

#[derive(Default)]
pub struct MockErp {
    pub records: Mutex<HashMap<String, Vec<Map<String, Value>>>>,
    pub created: Mutex<Vec<(String, Map<String, Value>)>>,
    pub written: Mutex<Vec<(String, Vec<i64>, Map<String, Value>)>>,
    pub method_calls: Mutex<Vec<(String, String, Vec<i64>)>>,
    pub next_id: Mutex<i64>,
}

impl MockErp {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: Mutex::new(1000),
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
        // Triples only; the logical-operator prefixes are exercised through
        // the real client, not the double.
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
                    ">" => cmp(&actual, value).map(|o| o.is_gt()).unwrap_or(false),
                    ">=" => cmp(&actual, value).map(|o| o.is_ge()).unwrap_or(false),
                    "<" => cmp(&actual, value).map(|o| o.is_lt()).unwrap_or(false),
                    "<=" => cmp(&actual, value).map(|o| o.is_le()).unwrap_or(false),
                    "in" => value
                        .as_array()
                        .map(|options| options.contains(&actual))
                        .unwrap_or(false),
                    "ilike" => match (actual.as_str(), value.as_str()) {
                        (Some(a), Some(v)) => a.to_lowercase().contains(&v.to_lowercase()),
                        _ => false,
                    },
                    _ => true,
                }
            }
            _ => true,
        })
    }
}

fn cmp(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    if let (Some(a), Some(b)) = (a.as_str(), b.as_str()) {
        return Some(a.cmp(b));
    }
    let a = a.as_f64()?;
    let b = b.as_f64()?;
    a.partial_cmp(&b)
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
        {
            let mut all = self.records.lock().await;
            if let Some(records) = all.get_mut(model) {
                for record in records.iter_mut() {
                    if record
                        .get("id")
                        .and_then(Value::as_i64)
                        .map(|id| ids.contains(&id))
                        .unwrap_or(false)
                    {
                        for (k, v) in &values {
                            record.insert(k.clone(), v.clone());
                        }
                    }
                }
            }
        }
        self.written
            .lock()
            .await
            .push((model.to_string(), ids.to_vec(), values));
        Ok(true)
    }

    async fn execute_method(
        &self,
        model: &str,
        method: &str,
        ids: &[i64],
        _args: Vec<Value>,
    ) -> ErpResult<Value> {
        self.method_calls
            .lock()
            .await
            .push((model.to_string(), method.to_string(), ids.to_vec()));
        Ok(json!(true))
    }
}

/// Replays a scripted sequence of analyses; errors once the script runs dry.
pub struct ScriptedLlm {
    responses: Mutex<Vec<LlmAnalysis>>,
}

impl ScriptedLlm {
    pub fn new(responses: Vec<LlmAnalysis>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses),
        })
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

    pub fn empty() -> Arc<Self> {
        Self::new(Vec::new())
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
