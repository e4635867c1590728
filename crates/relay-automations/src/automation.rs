use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use relay_types::AutomationType;

use crate::handler::HandlerTable;
use crate::result::AutomationResult;

/// One domain automation: a bundle of event handlers plus optional scheduled
/// scans. Handlers are analysis-only; side effects happen exclusively in
/// `execute_approved`, which the dispatcher invokes after gating (or the
/// approval service after a human decision).
#[async_trait]
pub trait Automation: Send + Sync {
    fn automation_type(&self) -> AutomationType;

    fn watched_models(&self) -> Vec<String>;

    /// Build the handler registration table. Called once at startup.
    fn handlers(self: Arc<Self>) -> HandlerTable;

    /// Names accepted by `run_scan`, for the scheduler's configuration.
    fn scan_names(&self) -> Vec<&'static str> {
        Vec::new()
    }

    /// Run a named scheduled scan. `None` means the name is unknown to this
    /// automation; the scheduler treats that as a no-op.
    async fn run_scan(&self, _name: &str) -> Option<anyhow::Result<Value>> {
        None
    }

    /// Apply the side effects of a previously analyzed action, carrying the
    /// stored `changes_made` map.
    async fn execute_approved(
        &self,
        action: &str,
        model: &str,
        record_id: i64,
        changes: &Value,
    ) -> anyhow::Result<AutomationResult>;
}
