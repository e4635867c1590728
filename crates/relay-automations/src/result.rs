use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// What every handler returns. The dispatcher turns this into an audit row
/// and decides execution from `confidence` and `needs_approval`; handlers
/// themselves never touch the audit store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationResult {
    pub success: bool,
    pub action: String,
    pub model: String,
    pub record_id: i64,
    pub confidence: f64,
    pub reasoning: String,
    #[serde(default)]
    pub changes_made: Map<String, Value>,
    pub needs_approval: bool,
    /// Tokens spent on LLM calls while producing this result.
    #[serde(default)]
    pub tokens_used: i64,
}

impl AutomationResult {
    pub fn ok(action: &str, model: &str, record_id: i64) -> Self {
        Self {
            success: true,
            action: action.to_string(),
            model: model.to_string(),
            record_id,
            confidence: 0.0,
            reasoning: String::new(),
            changes_made: Map::new(),
            needs_approval: false,
            tokens_used: 0,
        }
    }

    pub fn failure(action: &str, model: &str, record_id: i64, reasoning: impl Into<String>) -> Self {
        Self {
            success: false,
            action: action.to_string(),
            model: model.to_string(),
            record_id,
            confidence: 0.0,
            reasoning: reasoning.into(),
            changes_made: Map::new(),
            needs_approval: false,
            tokens_used: 0,
        }
    }

    pub fn no_handler(model: &str, record_id: i64) -> Self {
        Self::failure("no_handler", model, record_id, "No handler for event")
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = reasoning.into();
        self
    }

    pub fn with_change(mut self, key: &str, value: Value) -> Self {
        self.changes_made.insert(key.to_string(), value);
        self
    }

    pub fn with_changes(mut self, changes: Map<String, Value>) -> Self {
        self.changes_made = changes;
        self
    }

    pub fn requiring_approval(mut self) -> Self {
        self.needs_approval = true;
        self
    }

    pub fn with_tokens(mut self, tokens: i64) -> Self {
        self.tokens_used = tokens;
        self
    }
}
