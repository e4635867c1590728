mod domain;
mod erp;
mod llm;
mod notify;
mod retry;

pub use domain::{display_name_of, id_of, Domain, DomainItem};
pub use erp::{ErpClient, ErpConfig, ErpError, ErpResult, JsonRpcErp};
pub use llm::{
    validate_tool_input, HttpLlmClient, LlmAnalysis, LlmClient, LlmConfig, LlmError, LlmMessage,
    LlmResult, ToolCall, ToolSpec,
};
pub use notify::{NoopNotifier, Notifier, NotifyOutcome, WebhookNotifier};
pub use retry::{with_retry, RetryPolicy};
