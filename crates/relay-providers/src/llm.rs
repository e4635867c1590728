use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LlmError {
    #[error("llm transport error: {0}")]
    Transport(String),

    #[error("llm rate limited: {0}")]
    RateLimited(String),

    #[error("llm deadline exceeded after {0:?}")]
    Deadline(Duration),

    /// A tool call came back whose input does not satisfy the declared schema.
    #[error("llm schema violation: {0}")]
    SchemaViolation(String),

    #[error("llm remote fault: {0}")]
    Remote(String),

    #[error("llm malformed response: {0}")]
    Malformed(String),
}

impl LlmError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LlmError::Transport(_) | LlmError::RateLimited(_) | LlmError::Deadline(_)
        )
    }
}

pub type LlmResult<T> = Result<T, LlmError>;

/// Tool descriptor handed to the model: the `input_schema` is a JSON Schema
/// object the returned `input` must satisfy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LlmAnalysis {
    pub text: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    pub tokens_used: i64,
    #[serde(default)]
    pub tokens_input: i64,
    #[serde(default)]
    pub tokens_output: i64,
}

impl LlmAnalysis {
    /// First tool-call input, which is how most single-tool analyses are read.
    pub fn tool_input(&self) -> Option<&Value> {
        self.tool_calls.first().map(|c| &c.input)
    }
}

/// Single-shot and multi-turn analysis with structured tool output.
/// Implementations must populate token usage on every call.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn analyze(
        &self,
        system_prompt: &str,
        user_message: &str,
        tools: &[ToolSpec],
        max_tokens: Option<u32>,
    ) -> LlmResult<LlmAnalysis>;

    async fn analyze_with_history(
        &self,
        system_prompt: &str,
        messages: &[LlmMessage],
        tools: &[ToolSpec],
    ) -> LlmResult<LlmAnalysis>;
}

/// Boundary validation of a tool-call input against its declared schema.
/// Covers the subset the automations rely on: object type, required
/// properties, primitive property types, and enum membership.
pub fn validate_tool_input(schema: &Value, input: &Value) -> Result<(), String> {
    if schema.get("type").and_then(Value::as_str) == Some("object") {
        let Some(obj) = input.as_object() else {
            return Err("tool input is not an object".to_string());
        };

        if let Some(required) = schema.get("required").and_then(Value::as_array) {
            for name in required.iter().filter_map(Value::as_str) {
                if !obj.contains_key(name) {
                    return Err(format!("missing required property `{name}`"));
                }
            }
        }

        if let Some(props) = schema.get("properties").and_then(Value::as_object) {
            for (name, prop_schema) in props {
                let Some(value) = obj.get(name) else { continue };
                check_property(name, prop_schema, value)?;
            }
        }
    }
    Ok(())
}

fn check_property(name: &str, schema: &Value, value: &Value) -> Result<(), String> {
    if value.is_null() {
        return Ok(());
    }
    if let Some(expected) = schema.get("type").and_then(Value::as_str) {
        let ok = match expected {
            "string" => value.is_string(),
            "number" => value.is_number(),
            "integer" => value.is_i64() || value.is_u64(),
            "boolean" => value.is_boolean(),
            "array" => value.is_array(),
            "object" => value.is_object(),
            _ => true,
        };
        if !ok {
            return Err(format!("property `{name}` is not a {expected}"));
        }
    }
    if let Some(allowed) = schema.get("enum").and_then(Value::as_array) {
        if !allowed.contains(value) {
            return Err(format!("property `{name}` is not one of the allowed values"));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub url: String,
    pub api_key: String,
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_deadline_secs")]
    pub deadline_secs: u64,
}

fn default_max_tokens() -> u32 {
    2048
}

fn default_deadline_secs() -> u64 {
    60
}

/// Messages-API client. Tool-call inputs are validated against the declared
/// schema before being handed back to callers.
pub struct HttpLlmClient {
    http: Client,
    config: LlmConfig,
}

impl HttpLlmClient {
    pub fn new(config: LlmConfig) -> Self {
        Self {
            http: Client::new(),
            config,
        }
    }

    async fn request(&self, body: Value, tools: &[ToolSpec]) -> LlmResult<LlmAnalysis> {
        let deadline = Duration::from_secs(self.config.deadline_secs);
        let send = self
            .http
            .post(format!(
                "{}/v1/messages",
                self.config.url.trim_end_matches('/')
            ))
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send();

        let response = tokio::time::timeout(deadline, send)
            .await
            .map_err(|_| LlmError::Deadline(deadline))?
            .map_err(|e| LlmError::Transport(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(LlmError::RateLimited(status.to_string()));
        }
        if status.is_server_error() {
            return Err(LlmError::Transport(format!("server error: {status}")));
        }
        if status.is_client_error() {
            let detail = response.text().await.unwrap_or_default();
            return Err(LlmError::Remote(format!("{status}: {detail}")));
        }

        let envelope: Value = response
            .json()
            .await
            .map_err(|e| LlmError::Malformed(e.to_string()))?;

        parse_analysis(&envelope, tools)
    }

    fn tools_json(tools: &[ToolSpec]) -> Value {
        json!(tools
            .iter()
            .map(|t| json!({
                "name": t.name,
                "description": t.description,
                "input_schema": t.input_schema,
            }))
            .collect::<Vec<_>>())
    }
}

fn parse_analysis(envelope: &Value, tools: &[ToolSpec]) -> LlmResult<LlmAnalysis> {
    let content = envelope
        .get("content")
        .and_then(Value::as_array)
        .ok_or_else(|| LlmError::Malformed("missing content blocks".to_string()))?;

    let mut text = String::new();
    let mut tool_calls = Vec::new();

    for block in content {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(t) = block.get("text").and_then(Value::as_str) {
                    if !text.is_empty() {
                        text.push('\n');
                    }
                    text.push_str(t);
                }
            }
            Some("tool_use") => {
                let name = block
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let input = block.get("input").cloned().unwrap_or(Value::Null);

                if let Some(spec) = tools.iter().find(|t| t.name == name) {
                    validate_tool_input(&spec.input_schema, &input)
                        .map_err(|e| LlmError::SchemaViolation(format!("{name}: {e}")))?;
                }

                tool_calls.push(ToolCall {
                    id: block
                        .get("id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    name,
                    input,
                });
            }
            _ => {}
        }
    }

    let usage = envelope.get("usage");
    let (tokens_input, tokens_output) = usage
        .and_then(|u| {
            let input = u.get("input_tokens").and_then(Value::as_i64)?;
            let output = u.get("output_tokens").and_then(Value::as_i64)?;
            Some((input, output))
        })
        .ok_or_else(|| LlmError::Malformed("missing token usage".to_string()))?;

    Ok(LlmAnalysis {
        text,
        tool_calls,
        tokens_used: tokens_input + tokens_output,
        tokens_input,
        tokens_output,
    })
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn analyze(
        &self,
        system_prompt: &str,
        user_message: &str,
        tools: &[ToolSpec],
        max_tokens: Option<u32>,
    ) -> LlmResult<LlmAnalysis> {
        let body = json!({
            "model": self.config.model,
            "max_tokens": max_tokens.unwrap_or(self.config.max_tokens),
            "system": system_prompt,
            "messages": [{"role": "user", "content": user_message}],
            "tools": Self::tools_json(tools),
        });
        self.request(body, tools).await
    }

    async fn analyze_with_history(
        &self,
        system_prompt: &str,
        messages: &[LlmMessage],
        tools: &[ToolSpec],
    ) -> LlmResult<LlmAnalysis> {
        let body = json!({
            "model": self.config.model,
            "max_tokens": self.config.max_tokens,
            "system": system_prompt,
            "messages": messages
                .iter()
                .map(|m| json!({"role": m.role, "content": m.content}))
                .collect::<Vec<_>>(),
            "tools": Self::tools_json(tools),
        });
        self.request(body, tools).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "confidence": {"type": "number"},
                "match_type": {"type": "string", "enum": ["exact", "fuzzy", "none"]},
                "entry_id": {"type": "integer"},
            },
            "required": ["confidence", "match_type"]
        })
    }

    #[test]
    fn accepts_valid_tool_input() {
        let input = json!({"confidence": 0.9, "match_type": "exact", "entry_id": 4});
        assert!(validate_tool_input(&schema(), &input).is_ok());
    }

    #[test]
    fn rejects_missing_required() {
        let input = json!({"confidence": 0.9});
        let err = validate_tool_input(&schema(), &input).unwrap_err();
        assert!(err.contains("match_type"));
    }

    #[test]
    fn rejects_wrong_type_and_bad_enum() {
        let input = json!({"confidence": "high", "match_type": "exact"});
        assert!(validate_tool_input(&schema(), &input).is_err());

        let input = json!({"confidence": 0.9, "match_type": "psychic"});
        assert!(validate_tool_input(&schema(), &input).is_err());
    }

    #[test]
    fn parse_collects_text_and_tool_calls() {
        let envelope = json!({
            "content": [
                {"type": "text", "text": "analysis"},
                {"type": "tool_use", "id": "tc_1", "name": "match_suggestion",
                 "input": {"confidence": 1.0, "match_type": "exact"}}
            ],
            "usage": {"input_tokens": 120, "output_tokens": 30}
        });
        let tools = vec![ToolSpec {
            name: "match_suggestion".to_string(),
            description: String::new(),
            input_schema: schema(),
        }];
        let analysis = parse_analysis(&envelope, &tools).unwrap();
        assert_eq!(analysis.text, "analysis");
        assert_eq!(analysis.tool_calls.len(), 1);
        assert_eq!(analysis.tokens_used, 150);
    }

    #[test]
    fn parse_rejects_schema_violation() {
        let envelope = json!({
            "content": [
                {"type": "tool_use", "id": "tc_1", "name": "match_suggestion",
                 "input": {"confidence": 1.0}}
            ],
            "usage": {"input_tokens": 10, "output_tokens": 5}
        });
        let tools = vec![ToolSpec {
            name: "match_suggestion".to_string(),
            description: String::new(),
            input_schema: schema(),
        }];
        assert!(matches!(
            parse_analysis(&envelope, &tools),
            Err(LlmError::SchemaViolation(_))
        ));
    }
}
