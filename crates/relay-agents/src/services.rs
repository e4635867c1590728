//! Shared services handed to node functions: provider access plus decision
//! capture. Decisions accumulate during a node's execution and are drained
//! by the runtime onto the step row it appends afterwards.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::Mutex;

use relay_providers::{ErpClient, LlmAnalysis, LlmClient, Notifier, NotifyOutcome, ToolSpec};
use relay_store::{NewDecision, Store};

pub struct AgentServices {
    pub erp: Arc<dyn ErpClient>,
    pub llm: Arc<dyn LlmClient>,
    pub store: Arc<Store>,
    pub notifier: Arc<dyn Notifier>,
    pending_decisions: Mutex<Vec<NewDecision>>,
    pending_tokens: Mutex<i64>,
}

impl AgentServices {
    pub fn new(
        erp: Arc<dyn ErpClient>,
        llm: Arc<dyn LlmClient>,
        store: Arc<Store>,
        notifier: Arc<dyn Notifier>,
    ) -> Arc<Self> {
        Arc::new(Self {
            erp,
            llm,
            store,
            notifier,
            pending_decisions: Mutex::new(Vec::new()),
            pending_tokens: Mutex::new(0),
        })
    }

    /// LLM tool-use call with automatic decision capture and token
    /// accounting. The runtime attributes the tokens to the current step.
    pub async fn analyze_with_tools(
        &self,
        system_prompt: &str,
        user_message: &str,
        tools: &[ToolSpec],
    ) -> anyhow::Result<LlmAnalysis> {
        let analysis = self
            .llm
            .analyze(system_prompt, user_message, tools, None)
            .await?;

        let confidence = analysis
            .tool_input()
            .and_then(|input| input.get("confidence"))
            .and_then(Value::as_f64)
            .unwrap_or(0.0);

        let response = analysis
            .tool_input()
            .cloned()
            .unwrap_or_else(|| json!({ "text": analysis.text }));

        self.pending_decisions.lock().await.push(NewDecision {
            prompt_hash: prompt_fingerprint(system_prompt, user_message),
            response,
            confidence,
            tools_used: analysis.tool_calls.iter().map(|c| c.name.clone()).collect(),
            tokens_input: analysis.tokens_input,
            tokens_output: analysis.tokens_output,
        });
        *self.pending_tokens.lock().await += analysis.tokens_used;

        Ok(analysis)
    }

    pub async fn notify(&self, subject: &str, body: &str) -> NotifyOutcome {
        self.notifier.send(subject, body).await
    }

    /// Drain decisions and token usage captured since the last drain.
    pub(crate) async fn drain(&self) -> (Vec<NewDecision>, i64) {
        let decisions = std::mem::take(&mut *self.pending_decisions.lock().await);
        let tokens = std::mem::replace(&mut *self.pending_tokens.lock().await, 0);
        (decisions, tokens)
    }
}

/// Stable fingerprint of a prompt pair, good enough to correlate decisions
/// with prompt revisions without storing the prompt text.
pub fn prompt_fingerprint(system: &str, user: &str) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    system.hash(&mut hasher);
    user.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}
