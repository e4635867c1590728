//! Human approval flow: validate the pending audit row, record the
//! decision, and on approval replay the stored action through the owning
//! automation.

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tracing::info;

use relay_automations::AutomationRegistry;
use relay_store::Store;
use relay_types::{ActionStatus, LifecycleEvent};
use relay_wire::ApprovalOutcome;

use crate::bus::EventBus;

#[derive(Error, Debug)]
pub enum ApprovalError {
    #[error("audit log {0} not found")]
    NotFound(i64),

    /// Only PENDING rows accept a decision.
    #[error("audit log {0} is {1}, not pending")]
    NotPending(i64, &'static str),

    #[error("no automation registered for type `{0}`")]
    NoAutomation(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub struct ApprovalService {
    store: Arc<Store>,
    registry: Arc<AutomationRegistry>,
    bus: EventBus,
}

impl ApprovalService {
    pub fn new(store: Arc<Store>, registry: Arc<AutomationRegistry>, bus: EventBus) -> Self {
        Self {
            store,
            registry,
            bus,
        }
    }

    pub async fn decide(
        &self,
        audit_log_id: i64,
        approved: bool,
        approved_by: &str,
    ) -> Result<ApprovalOutcome, ApprovalError> {
        let log = self
            .store
            .get_audit(audit_log_id)
            .await
            .map_err(|_| ApprovalError::NotFound(audit_log_id))?;

        if log.status != ActionStatus::Pending {
            return Err(ApprovalError::NotPending(audit_log_id, log.status.as_str()));
        }

        self.bus.publish(LifecycleEvent::ApprovalDecided {
            audit_log_id,
            approved,
            approved_by: approved_by.to_string(),
        });

        if !approved {
            self.store
                .update_audit_status(audit_log_id, ActionStatus::Rejected, Some(approved_by))
                .await
                .map_err(anyhow::Error::from)?;
            return Ok(ApprovalOutcome {
                audit_log_id,
                status: ActionStatus::Rejected.as_str().to_string(),
                error: None,
            });
        }

        self.store
            .update_audit_status(audit_log_id, ActionStatus::Approved, Some(approved_by))
            .await
            .map_err(anyhow::Error::from)?;

        let registered = self
            .registry
            .by_type(log.automation_type)
            .ok_or_else(|| ApprovalError::NoAutomation(log.automation_type.as_str().to_string()))?;

        let changes = log
            .output_data
            .get("changes_made")
            .cloned()
            .unwrap_or(Value::Object(Default::default()));

        let record_id = log.record_id.unwrap_or(0);
        match registered
            .automation
            .execute_approved(&log.action_name, &log.model, record_id, &changes)
            .await
        {
            Ok(result) if result.success => {
                self.store
                    .mark_audit_executed(
                        audit_log_id,
                        &serde_json::json!({
                            "action": result.action,
                            "changes_made": result.changes_made,
                            "reasoning": result.reasoning,
                        }),
                    )
                    .await
                    .map_err(anyhow::Error::from)?;
                info!(audit_log_id, approved_by, "approved action executed");
                Ok(ApprovalOutcome {
                    audit_log_id,
                    status: ActionStatus::Executed.as_str().to_string(),
                    error: None,
                })
            }
            Ok(result) => {
                // Apply failures mark the row FAILED; it never re-opens.
                self.store
                    .mark_audit_failed(audit_log_id, &result.reasoning)
                    .await
                    .map_err(anyhow::Error::from)?;
                Ok(ApprovalOutcome {
                    audit_log_id,
                    status: ActionStatus::Failed.as_str().to_string(),
                    error: Some(result.reasoning),
                })
            }
            Err(err) => {
                self.store
                    .mark_audit_failed(audit_log_id, &err.to_string())
                    .await
                    .map_err(anyhow::Error::from)?;
                Ok(ApprovalOutcome {
                    audit_log_id,
                    status: ActionStatus::Failed.as_str().to_string(),
                    error: Some(err.to_string()),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use relay_automations::{Automation, AutomationResult, HandlerTable};
    use relay_store::NewAuditLog;
    use relay_types::AutomationType;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ReplayProbe {
        executions: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl Automation for ReplayProbe {
        fn automation_type(&self) -> AutomationType {
            AutomationType::Accounting
        }
        fn watched_models(&self) -> Vec<String> {
            vec!["account.move".to_string()]
        }
        fn handlers(self: Arc<Self>) -> HandlerTable {
            HandlerTable::new()
        }
        async fn execute_approved(
            &self,
            action: &str,
            model: &str,
            record_id: i64,
            changes: &Value,
        ) -> anyhow::Result<AutomationResult> {
            self.executions.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Ok(AutomationResult::failure(action, model, record_id, "erp said no"));
            }
            Ok(AutomationResult::ok(action, model, record_id)
                .with_changes(changes.as_object().cloned().unwrap_or_default()))
        }
    }

    async fn service(fail: bool) -> (Arc<Store>, Arc<ReplayProbe>, ApprovalService, i64) {
        let store = Arc::new(Store::in_memory().await.unwrap());
        let probe = Arc::new(ReplayProbe {
            executions: AtomicUsize::new(0),
            fail,
        });
        let mut registry = AutomationRegistry::new();
        registry.register(probe.clone() as Arc<dyn Automation>);

        let audit_log_id = store
            .insert_audit(NewAuditLog {
                automation_type: AutomationType::Accounting,
                action_name: "adjust_record".to_string(),
                model: "account.move".to_string(),
                record_id: Some(12),
                status: ActionStatus::Pending,
                confidence: 0.9,
                reasoning: "needs a human".to_string(),
                input_data: json!({}),
                output_data: json!({"changes_made": {"state": "posted"}}),
                tokens_used: 0,
            })
            .await
            .unwrap();

        let service = ApprovalService::new(store.clone(), Arc::new(registry), EventBus::new());
        (store, probe, service, audit_log_id)
    }

    #[tokio::test]
    async fn approval_replays_the_stored_changes() {
        let (store, probe, service, id) = service(false).await;
        let outcome = service.decide(id, true, "controller").await.unwrap();
        assert_eq!(outcome.status, "executed");
        assert_eq!(probe.executions.load(Ordering::SeqCst), 1);

        let log = store.get_audit(id).await.unwrap();
        assert_eq!(log.status, ActionStatus::Executed);
        assert_eq!(log.approved_by.as_deref(), Some("controller"));
        assert!(log.executed_at.is_some());
    }

    #[tokio::test]
    async fn rejection_skips_execution() {
        let (store, probe, service, id) = service(false).await;
        let outcome = service.decide(id, false, "controller").await.unwrap();
        assert_eq!(outcome.status, "rejected");
        assert_eq!(probe.executions.load(Ordering::SeqCst), 0);
        assert_eq!(store.get_audit(id).await.unwrap().status, ActionStatus::Rejected);
    }

    #[tokio::test]
    async fn non_pending_rows_reject_decisions() {
        let (_, _, service, id) = service(false).await;
        service.decide(id, true, "controller").await.unwrap();
        let again = service.decide(id, true, "controller").await;
        assert!(matches!(again, Err(ApprovalError::NotPending(_, _))));
    }

    #[tokio::test]
    async fn failed_apply_marks_failed_not_pending() {
        let (store, _, service, id) = service(true).await;
        let outcome = service.decide(id, true, "controller").await.unwrap();
        assert_eq!(outcome.status, "failed");
        let log = store.get_audit(id).await.unwrap();
        assert_eq!(log.status, ActionStatus::Failed);
        assert_eq!(log.error_message.as_deref(), Some("erp said no"));
    }

    #[tokio::test]
    async fn unknown_audit_row_is_not_found() {
        let (_, _, service, _) = service(false).await;
        assert!(matches!(
            service.decide(999, true, "x").await,
            Err(ApprovalError::NotFound(999))
        ));
    }
}
