use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{info, warn};

use relay_store::{NewAuditLog, Store};
use relay_types::ActionStatus;

use crate::handler::EventCtx;
use crate::registry::RegisteredAutomation;
use crate::result::AutomationResult;

/// Fallback thresholds when no AutomationRule row exists for an action.
#[derive(Debug, Clone, Copy)]
pub struct GatingDefaults {
    pub confidence_threshold: f64,
    pub auto_approve_threshold: f64,
}

impl Default for GatingDefaults {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.85,
            auto_approve_threshold: 0.95,
        }
    }
}

/// What happened to one handler invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// confidence ≥ τ_a: side effects applied in the same invocation.
    AutoExecuted,
    /// τ_d ≤ confidence < τ_a (or the handler demanded approval): held.
    Pending,
    /// confidence < τ_d: recorded as a note, no side effect.
    Noted,
    Failed,
    NoHandler,
    /// Rule disabled: the analysis is discarded, nothing audited, no side
    /// effect.
    Disabled,
}

impl Disposition {
    pub fn as_str(self) -> &'static str {
        match self {
            Disposition::AutoExecuted => "auto_executed",
            Disposition::Pending => "pending",
            Disposition::Noted => "noted",
            Disposition::Failed => "failed",
            Disposition::NoHandler => "no_handler",
            Disposition::Disabled => "disabled",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub audit_log_id: Option<i64>,
    pub disposition: Disposition,
    pub result: AutomationResult,
}

/// The automation base: resolves a handler for an event, persists the audit
/// row before any side effect, and applies confidence gating.
pub struct Dispatcher {
    store: Arc<Store>,
    defaults: GatingDefaults,
}

impl Dispatcher {
    pub fn new(store: Arc<Store>, defaults: GatingDefaults) -> Self {
        Self { store, defaults }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Route one event through one automation.
    pub async fn dispatch(
        &self,
        registered: &RegisteredAutomation,
        ctx: EventCtx,
    ) -> anyhow::Result<DispatchOutcome> {
        let automation_type = registered.automation.automation_type();

        let Some(handler) = registered.handlers.resolve(ctx.event_type, &ctx.model) else {
            return Ok(DispatchOutcome {
                audit_log_id: None,
                disposition: Disposition::NoHandler,
                result: AutomationResult::no_handler(&ctx.model, ctx.record_id),
            });
        };

        let input_snapshot = json!({
            "event_type": ctx.event_type.as_str(),
            "model": ctx.model,
            "record_id": ctx.record_id,
            "values": ctx.values,
            "old_values": ctx.old_values,
        });

        // Handler exceptions convert to a failed result; the audit layer
        // never raises past this point.
        let result = match handler(ctx.clone()).await {
            Ok(result) => result,
            Err(err) => {
                warn!(
                    automation_type = automation_type.as_str(),
                    model = %ctx.model,
                    record_id = ctx.record_id,
                    error = %err,
                    "handler failed"
                );
                AutomationResult::failure("handler_error", &ctx.model, ctx.record_id, err.to_string())
            }
        };

        let rule = self
            .store
            .rule_for(automation_type, &result.action)
            .await
            .unwrap_or(None);

        if let Some(rule) = &rule {
            if !rule.enabled {
                return Ok(DispatchOutcome {
                    audit_log_id: None,
                    disposition: Disposition::Disabled,
                    result,
                });
            }
        }

        let tau_d = rule
            .as_ref()
            .map(|r| r.confidence_threshold)
            .unwrap_or(self.defaults.confidence_threshold);
        let tau_a = rule
            .as_ref()
            .map(|r| r.auto_approve_threshold)
            .unwrap_or(self.defaults.auto_approve_threshold)
            .max(tau_d);

        let confidence = result.confidence;
        let (initial_status, disposition) = if !result.success {
            (ActionStatus::Failed, Disposition::Failed)
        } else if confidence < tau_d {
            // Below the approval band: a note, no side effect, no approval.
            (ActionStatus::Executed, Disposition::Noted)
        } else if confidence >= tau_a && !result.needs_approval {
            (ActionStatus::Pending, Disposition::AutoExecuted)
        } else {
            (ActionStatus::Pending, Disposition::Pending)
        };

        let output_snapshot = json!({
            "action": result.action,
            "confidence": result.confidence,
            "reasoning": result.reasoning,
            "changes_made": if disposition == Disposition::Noted {
                Value::Object(Default::default())
            } else {
                Value::Object(result.changes_made.clone())
            },
            "needs_approval": disposition == Disposition::Pending,
        });

        // Exactly one audit row per invocation, written before any ERP write.
        let audit_log_id = self
            .store
            .insert_audit(NewAuditLog {
                automation_type,
                action_name: result.action.clone(),
                model: result.model.clone(),
                record_id: Some(result.record_id),
                status: initial_status,
                confidence,
                reasoning: result.reasoning.clone(),
                input_data: input_snapshot,
                output_data: output_snapshot,
                tokens_used: result.tokens_used,
            })
            .await?;

        if !result.success {
            self.store
                .mark_audit_failed(audit_log_id, &result.reasoning)
                .await?;
            return Ok(DispatchOutcome {
                audit_log_id: Some(audit_log_id),
                disposition: Disposition::Failed,
                result,
            });
        }

        if disposition == Disposition::AutoExecuted {
            let changes = Value::Object(result.changes_made.clone());
            match registered
                .automation
                .execute_approved(&result.action, &result.model, result.record_id, &changes)
                .await
            {
                Ok(exec_result) if exec_result.success => {
                    self.store
                        .mark_audit_executed(
                            audit_log_id,
                            &json!({
                                "action": exec_result.action,
                                "changes_made": exec_result.changes_made,
                                "reasoning": exec_result.reasoning,
                            }),
                        )
                        .await?;
                    info!(
                        automation_type = automation_type.as_str(),
                        action = %result.action,
                        audit_log_id,
                        confidence,
                        "auto-executed"
                    );
                }
                Ok(exec_result) => {
                    self.store
                        .mark_audit_failed(audit_log_id, &exec_result.reasoning)
                        .await?;
                    return Ok(DispatchOutcome {
                        audit_log_id: Some(audit_log_id),
                        disposition: Disposition::Failed,
                        result: exec_result,
                    });
                }
                Err(err) => {
                    self.store
                        .mark_audit_failed(audit_log_id, &err.to_string())
                        .await?;
                    return Ok(DispatchOutcome {
                        audit_log_id: Some(audit_log_id),
                        disposition: Disposition::Failed,
                        result,
                    });
                }
            }
        }

        Ok(DispatchOutcome {
            audit_log_id: Some(audit_log_id),
            disposition,
            result,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::Automation;
    use crate::handler::{handler, HandlerTable};
    use crate::registry::AutomationRegistry;
    use async_trait::async_trait;
    use relay_types::{AutomationRule, AutomationType, EventType};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Emits a fixed confidence and counts execute_approved invocations.
    struct GateProbe {
        confidence: f64,
        needs_approval: bool,
        executions: AtomicUsize,
    }

    impl GateProbe {
        fn new(confidence: f64) -> Arc<Self> {
            Arc::new(Self {
                confidence,
                needs_approval: false,
                executions: AtomicUsize::new(0),
            })
        }

        async fn on_write(self: Arc<Self>, ctx: EventCtx) -> anyhow::Result<AutomationResult> {
            let mut result = AutomationResult::ok("adjust_record", &ctx.model, ctx.record_id)
                .with_confidence(self.confidence)
                .with_reasoning("probe")
                .with_change("state", json!("done"))
                .with_tokens(5);
            result.needs_approval = self.needs_approval;
            Ok(result)
        }
    }

    #[async_trait]
    impl Automation for GateProbe {
        fn automation_type(&self) -> AutomationType {
            AutomationType::Accounting
        }

        fn watched_models(&self) -> Vec<String> {
            vec!["test.model".to_string()]
        }

        fn handlers(self: Arc<Self>) -> HandlerTable {
            HandlerTable::new().on_any(EventType::Write, handler(&self, |a, ctx| a.on_write(ctx)))
        }

        async fn execute_approved(
            &self,
            action: &str,
            model: &str,
            record_id: i64,
            changes: &Value,
        ) -> anyhow::Result<AutomationResult> {
            self.executions.fetch_add(1, Ordering::SeqCst);
            Ok(AutomationResult::ok(action, model, record_id)
                .with_changes(changes.as_object().cloned().unwrap_or_default()))
        }
    }

    async fn run_once(
        confidence: f64,
    ) -> (Arc<Store>, Arc<GateProbe>, DispatchOutcome) {
        let store = Arc::new(Store::in_memory().await.unwrap());
        let probe = GateProbe::new(confidence);
        let mut registry = AutomationRegistry::new();
        registry.register(probe.clone() as Arc<dyn Automation>);
        let dispatcher = Dispatcher::new(store.clone(), GatingDefaults::default());
        let outcome = dispatcher
            .dispatch(
                &registry.all()[0],
                EventCtx::new(EventType::Write, "test.model", 11),
            )
            .await
            .unwrap();
        (store, probe, outcome)
    }

    #[tokio::test]
    async fn at_auto_approve_threshold_executes() {
        let (store, probe, outcome) = run_once(0.95).await;
        assert_eq!(outcome.disposition, Disposition::AutoExecuted);
        assert_eq!(probe.executions.load(Ordering::SeqCst), 1);
        let log = store.get_audit(outcome.audit_log_id.unwrap()).await.unwrap();
        assert_eq!(log.status, ActionStatus::Executed);
        assert!(log.executed_at.is_some());
    }

    #[tokio::test]
    async fn at_default_threshold_holds_pending() {
        let (store, probe, outcome) = run_once(0.85).await;
        assert_eq!(outcome.disposition, Disposition::Pending);
        assert_eq!(probe.executions.load(Ordering::SeqCst), 0);
        let log = store.get_audit(outcome.audit_log_id.unwrap()).await.unwrap();
        assert_eq!(log.status, ActionStatus::Pending);
    }

    #[tokio::test]
    async fn below_threshold_is_a_note_without_side_effect() {
        let (store, probe, outcome) = run_once(0.5).await;
        assert_eq!(outcome.disposition, Disposition::Noted);
        assert_eq!(probe.executions.load(Ordering::SeqCst), 0);
        let log = store.get_audit(outcome.audit_log_id.unwrap()).await.unwrap();
        assert_eq!(log.status, ActionStatus::Executed);
        assert_eq!(
            log.output_data.get("changes_made"),
            Some(&json!({}))
        );
    }

    #[tokio::test]
    async fn just_below_auto_threshold_is_pending() {
        let (_, probe, outcome) = run_once(0.9499).await;
        assert_eq!(outcome.disposition, Disposition::Pending);
        assert_eq!(probe.executions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn disabled_rule_skips_handler_audit() {
        let store = Arc::new(Store::in_memory().await.unwrap());
        let mut rule = AutomationRule::defaults(AutomationType::Accounting, "adjust_record");
        rule.enabled = false;
        store.upsert_rule(&rule).await.unwrap();

        let probe = GateProbe::new(0.99);
        let mut registry = AutomationRegistry::new();
        registry.register(probe.clone() as Arc<dyn Automation>);
        let dispatcher = Dispatcher::new(store.clone(), GatingDefaults::default());
        let outcome = dispatcher
            .dispatch(
                &registry.all()[0],
                EventCtx::new(EventType::Write, "test.model", 11),
            )
            .await
            .unwrap();
        assert_eq!(outcome.disposition, Disposition::Disabled);
        assert!(outcome.audit_log_id.is_none());
        assert_eq!(probe.executions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unhandled_event_reports_no_handler() {
        let store = Arc::new(Store::in_memory().await.unwrap());
        let probe = GateProbe::new(0.99);
        let mut registry = AutomationRegistry::new();
        registry.register(probe as Arc<dyn Automation>);
        let dispatcher = Dispatcher::new(store, GatingDefaults::default());
        let outcome = dispatcher
            .dispatch(
                &registry.all()[0],
                EventCtx::new(EventType::Unlink, "test.model", 11),
            )
            .await
            .unwrap();
        assert_eq!(outcome.disposition, Disposition::NoHandler);
        assert_eq!(outcome.result.action, "no_handler");
    }
}
