//! Webhook intake: dedup, persistence, per-record serialization, and the
//! hand-off to either automation dispatch or an agent run.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use relay_agents::AgentRuntime;
use relay_automations::{AutomationRegistry, Dispatcher, Disposition, EventCtx};
use relay_store::Store;
use relay_types::{CorrelationId, LifecycleEvent};
use relay_wire::WebhookPayload;

use crate::bus::EventBus;
use crate::pool::WorkerPool;

#[derive(Error, Debug)]
pub enum IngestError {
    /// Same (model, record_id, payload hash) seen within the dedup window.
    #[error("duplicate event")]
    Duplicate,

    #[error("invalid payload: {0}")]
    Invalid(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct IngestOutcome {
    pub event_id: i64,
    pub correlation_id: CorrelationId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audit_log_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<i64>,
}

pub struct Orchestrator {
    store: Arc<Store>,
    registry: Arc<AutomationRegistry>,
    dispatcher: Arc<Dispatcher>,
    runtime: Arc<AgentRuntime>,
    pool: Arc<WorkerPool>,
    bus: EventBus,
    dedup_window: chrono::Duration,
    /// model → agent_type: these models go to the agent runtime instead of
    /// the automation dispatch.
    agent_routes: HashMap<String, String>,
    /// Per-(model, record_id) mutexes serializing handler invocations.
    record_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        registry: Arc<AutomationRegistry>,
        dispatcher: Arc<Dispatcher>,
        runtime: Arc<AgentRuntime>,
        pool: Arc<WorkerPool>,
        bus: EventBus,
        dedup_window_secs: u64,
        agent_routes: HashMap<String, String>,
    ) -> Self {
        Self {
            store,
            registry,
            dispatcher,
            runtime,
            pool,
            bus,
            dedup_window: chrono::Duration::seconds(dedup_window_secs as i64),
            agent_routes,
            record_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub async fn ingest(&self, payload: WebhookPayload) -> Result<IngestOutcome, IngestError> {
        if payload.model.trim().is_empty() {
            return Err(IngestError::Invalid("model must not be empty".to_string()));
        }
        if payload.record_id <= 0 {
            return Err(IngestError::Invalid("record_id must be positive".to_string()));
        }

        let payload_json = serde_json::to_value(&payload)
            .map_err(|e| IngestError::Invalid(e.to_string()))?;
        let payload_hash = hash_payload(&payload_json);

        if self
            .store
            .is_duplicate_event(&payload.model, Some(payload.record_id), &payload_hash, self.dedup_window)
            .await
            .map_err(anyhow::Error::from)?
        {
            return Err(IngestError::Duplicate);
        }

        let correlation_id = CorrelationId::new();
        let event_id = self
            .store
            .insert_webhook_event(
                payload.event_type,
                &payload.model,
                Some(payload.record_id),
                &payload_json,
                &payload_hash,
                &correlation_id,
            )
            .await
            .map_err(anyhow::Error::from)?;
        self.store
            .mark_event_processing(event_id)
            .await
            .map_err(anyhow::Error::from)?;

        info!(
            correlation_id = %correlation_id,
            event_id,
            model = %payload.model,
            record_id = payload.record_id,
            event_type = payload.event_type.as_str(),
            "webhook event accepted"
        );

        // Events on the same record execute one at a time; unrelated
        // records proceed in parallel.
        let lock = self
            .record_lock(&format!("{}:{}", payload.model, payload.record_id))
            .await;
        let _guard = lock.lock().await;

        let outcome = if let Some(agent_type) = self.agent_routes.get(&payload.model).cloned() {
            self.start_agent(event_id, &correlation_id, &agent_type, &payload)
                .await
        } else {
            self.dispatch_automations(event_id, &correlation_id, &payload)
                .await
        };

        match &outcome {
            Ok(_) => self
                .store
                .mark_event_processed(event_id, None)
                .await
                .map_err(anyhow::Error::from)?,
            Err(err) => self
                .store
                .mark_event_processed(event_id, Some(&err.to_string()))
                .await
                .map_err(anyhow::Error::from)?,
        }

        outcome.map_err(IngestError::Internal)
    }

    async fn dispatch_automations(
        &self,
        event_id: i64,
        correlation_id: &CorrelationId,
        payload: &WebhookPayload,
    ) -> anyhow::Result<IngestOutcome> {
        let watchers = self.registry.watching(&payload.model);
        if watchers.is_empty() {
            info!(
                correlation_id = %correlation_id,
                model = %payload.model,
                "no automation watches this model"
            );
            return Ok(IngestOutcome {
                event_id,
                correlation_id: correlation_id.clone(),
                audit_log_id: None,
                run_id: None,
            });
        }

        let mut first_audit_id = None;
        for registered in watchers {
            let automation_type = registered.automation.automation_type();
            self.bus.publish(LifecycleEvent::AutomationStarted {
                automation_type: automation_type.as_str().to_string(),
                action: payload.event_type.as_str().to_string(),
                model: payload.model.clone(),
                record_id: Some(payload.record_id),
            });

            let ctx = EventCtx {
                event_type: payload.event_type,
                model: payload.model.clone(),
                record_id: payload.record_id,
                values: payload.values.clone(),
                old_values: payload.old_values.clone(),
            };

            match self.dispatcher.dispatch(registered, ctx).await {
                Ok(outcome) => {
                    if first_audit_id.is_none() {
                        first_audit_id = outcome.audit_log_id;
                    }
                    match outcome.disposition {
                        Disposition::NoHandler | Disposition::Disabled => {}
                        Disposition::Failed => {
                            self.bus.publish(LifecycleEvent::AutomationFailed {
                                automation_type: automation_type.as_str().to_string(),
                                action: outcome.result.action.clone(),
                                error: outcome.result.reasoning.clone(),
                            });
                        }
                        _ => {
                            self.bus.publish(LifecycleEvent::AutomationCompleted {
                                automation_type: automation_type.as_str().to_string(),
                                action: outcome.result.action.clone(),
                                audit_log_id: outcome.audit_log_id.unwrap_or(0),
                                status: outcome.disposition.as_str().to_string(),
                                confidence: outcome.result.confidence,
                            });
                        }
                    }
                }
                Err(err) => {
                    warn!(
                        correlation_id = %correlation_id,
                        error = %err,
                        model = %payload.model,
                        "dispatch failed"
                    );
                    self.bus.publish(LifecycleEvent::AutomationFailed {
                        automation_type: automation_type.as_str().to_string(),
                        action: payload.event_type.as_str().to_string(),
                        error: err.to_string(),
                    });
                }
            }
        }

        Ok(IngestOutcome {
            event_id,
            correlation_id: correlation_id.clone(),
            audit_log_id: first_audit_id,
            run_id: None,
        })
    }

    async fn start_agent(
        &self,
        event_id: i64,
        correlation_id: &CorrelationId,
        agent_type: &str,
        payload: &WebhookPayload,
    ) -> anyhow::Result<IngestOutcome> {
        let mut initial = payload.values.clone();
        initial.insert("source_model".to_string(), Value::from(payload.model.clone()));
        initial.insert("source_record_id".to_string(), Value::from(payload.record_id));

        let trigger_id = format!("{}:{}", payload.model, payload.record_id);
        let run_id = self
            .runtime
            .create_run(agent_type, "webhook", Some(&trigger_id), initial)
            .await?;

        info!(correlation_id = %correlation_id, run_id, agent_type, "agent run enqueued");
        self.bus.publish(LifecycleEvent::AgentRunStarted {
            run_id,
            agent_type: agent_type.to_string(),
            trigger_type: "webhook".to_string(),
        });

        let runtime = Arc::clone(&self.runtime);
        let bus = self.bus.clone();
        let agent_type_owned = agent_type.to_string();
        self.pool
            .submit(&format!("agent:{agent_type}:{run_id}"), async move {
                match runtime.run_created(run_id, CancellationToken::new()).await {
                    Ok(report) => match report.status {
                        relay_types::AgentRunStatus::Suspended => {
                            bus.publish(LifecycleEvent::AgentRunSuspended {
                                run_id,
                                agent_type: agent_type_owned,
                                resume_condition: report
                                    .final_state
                                    .get("suspension_reason")
                                    .and_then(Value::as_str)
                                    .unwrap_or("awaiting_approval")
                                    .to_string(),
                            });
                        }
                        relay_types::AgentRunStatus::Failed => {
                            bus.publish(LifecycleEvent::AgentRunFailed {
                                run_id,
                                agent_type: agent_type_owned,
                                error: report.error.unwrap_or_default(),
                            });
                        }
                        _ => {
                            bus.publish(LifecycleEvent::AgentRunCompleted {
                                run_id,
                                agent_type: agent_type_owned,
                                total_steps: report.total_steps,
                            });
                        }
                    },
                    Err(err) => {
                        bus.publish(LifecycleEvent::AgentRunFailed {
                            run_id,
                            agent_type: agent_type_owned,
                            error: err.to_string(),
                        });
                    }
                }
            })
            .await?;

        Ok(IngestOutcome {
            event_id,
            correlation_id: correlation_id.clone(),
            audit_log_id: None,
            run_id: Some(run_id),
        })
    }

    async fn record_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.record_locks.lock().await;
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// SHA-256 over the canonical JSON body.
pub fn hash_payload(payload: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{NullErp, NullLlm};
    use async_trait::async_trait;
    use relay_agents::{AgentConfig, AgentRegistry, AgentServices};
    use relay_automations::{handler, Automation, AutomationResult, GatingDefaults, HandlerTable};
    use relay_providers::NoopNotifier;
    use relay_types::{ActionStatus, AutomationType, EventType};
    use serde_json::{json, Map};

    struct EchoAutomation;

    impl EchoAutomation {
        async fn on_create(self: Arc<Self>, ctx: EventCtx) -> anyhow::Result<AutomationResult> {
            Ok(AutomationResult::ok("echo", &ctx.model, ctx.record_id)
                .with_confidence(0.5)
                .with_reasoning("observed"))
        }
    }

    #[async_trait]
    impl Automation for EchoAutomation {
        fn automation_type(&self) -> AutomationType {
            AutomationType::Crm
        }
        fn watched_models(&self) -> Vec<String> {
            vec!["crm.lead".to_string()]
        }
        fn handlers(self: Arc<Self>) -> HandlerTable {
            HandlerTable::new().on_any(EventType::Create, handler(&self, |a, ctx| a.on_create(ctx)))
        }
        async fn execute_approved(
            &self,
            action: &str,
            model: &str,
            record_id: i64,
            _changes: &Value,
        ) -> anyhow::Result<AutomationResult> {
            Ok(AutomationResult::ok(action, model, record_id))
        }
    }

    async fn orchestrator() -> (Arc<Store>, Orchestrator) {
        let store = Arc::new(Store::in_memory().await.unwrap());
        let mut registry = AutomationRegistry::new();
        registry.register(Arc::new(EchoAutomation));
        let registry = Arc::new(registry);
        let dispatcher = Arc::new(Dispatcher::new(store.clone(), GatingDefaults::default()));

        let mut agent_registry = AgentRegistry::new();
        agent_registry
            .register(relay_agents::collection::definition())
            .unwrap();
        let store_for_services = store.clone();
        let runtime = Arc::new(AgentRuntime::new(
            store.clone(),
            Arc::new(agent_registry),
            Box::new(move || {
                AgentServices::new(
                    Arc::new(NullErp),
                    Arc::new(NullLlm),
                    store_for_services.clone(),
                    Arc::new(NoopNotifier),
                )
            }),
            AgentConfig::default(),
        ));

        let orchestrator = Orchestrator::new(
            store.clone(),
            registry,
            dispatcher,
            runtime,
            Arc::new(WorkerPool::new(2, 16)),
            EventBus::new(),
            300,
            HashMap::from([("account.move".to_string(), "collection".to_string())]),
        );
        (store, orchestrator)
    }

    fn lead_payload(record_id: i64) -> WebhookPayload {
        WebhookPayload {
            event_type: EventType::Create,
            model: "crm.lead".to_string(),
            record_id,
            values: Map::new(),
            old_values: Map::new(),
            timestamp: None,
            user_id: Some(2),
        }
    }

    #[tokio::test]
    async fn event_dispatches_and_audits() {
        let (store, orchestrator) = orchestrator().await;
        let outcome = orchestrator.ingest(lead_payload(5)).await.unwrap();
        assert!(outcome.audit_log_id.is_some());
        let log = store.get_audit(outcome.audit_log_id.unwrap()).await.unwrap();
        assert_eq!(log.action_name, "echo");
        // 0.5 < τ_d → noted
        assert_eq!(log.status, ActionStatus::Executed);

        let event = store.get_webhook_event(outcome.event_id).await.unwrap();
        assert!(event.processed);
        assert!(event.error.is_none());
        assert_eq!(event.correlation_id, outcome.correlation_id);
        assert!(!outcome.correlation_id.as_str().is_empty());
    }

    #[tokio::test]
    async fn duplicate_events_within_window_are_rejected() {
        let (_, orchestrator) = orchestrator().await;
        orchestrator.ingest(lead_payload(5)).await.unwrap();
        let second = orchestrator.ingest(lead_payload(5)).await;
        assert!(matches!(second, Err(IngestError::Duplicate)));
        // a different record is not a duplicate
        assert!(orchestrator.ingest(lead_payload(6)).await.is_ok());
    }

    #[tokio::test]
    async fn malformed_payload_is_invalid() {
        let (_, orchestrator) = orchestrator().await;
        let mut payload = lead_payload(5);
        payload.record_id = 0;
        assert!(matches!(
            orchestrator.ingest(payload).await,
            Err(IngestError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn routed_model_starts_an_agent_run() {
        let (store, orchestrator) = orchestrator().await;
        let mut payload = lead_payload(7);
        payload.model = "account.move".to_string();
        let outcome = orchestrator.ingest(payload).await.unwrap();
        let run_id = outcome.run_id.unwrap();
        assert!(outcome.audit_log_id.is_none());

        // the run executes on the pool; wait for a terminal status
        for _ in 0..50 {
            let run = store.get_run(run_id).await.unwrap();
            if run.status.is_terminal() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("agent run never finished");
    }

    #[test]
    fn payload_hash_is_content_sensitive() {
        let a = hash_payload(&json!({"x": 1}));
        let b = hash_payload(&json!({"x": 2}));
        assert_ne!(a, b);
        assert_eq!(a, hash_payload(&json!({"x": 1})));
    }
}
