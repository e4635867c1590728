//! Periodic work: automation scans, batch recalculations, digests, and the
//! suspension-timeout sweep. Every tick writes an audit record and
//! publishes a lifecycle event; scans are idempotent per day via the
//! store's scan markers.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use relay_agents::AgentRuntime;
use relay_automations::AutomationRegistry;
use relay_store::{NewAuditLog, Store};
use relay_types::{ActionStatus, LifecycleEvent};

use crate::bus::EventBus;
use crate::config::ScheduleConfig;

pub struct Scheduler {
    store: Arc<Store>,
    registry: Arc<AutomationRegistry>,
    runtime: Arc<AgentRuntime>,
    bus: EventBus,
    config: ScheduleConfig,
}

impl Scheduler {
    pub fn new(
        store: Arc<Store>,
        registry: Arc<AutomationRegistry>,
        runtime: Arc<AgentRuntime>,
        bus: EventBus,
        config: ScheduleConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            registry,
            runtime,
            bus,
            config,
        })
    }

    /// Spawn the interval loops; they stop when the token cancels.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut scan_tick =
                tokio::time::interval(std::time::Duration::from_secs(self.config.scan_interval_secs));
            let mut sweep_tick =
                tokio::time::interval(std::time::Duration::from_secs(self.config.sweep_interval_secs));
            // the first immediate tick of each interval is consumed so the
            // service does not scan at startup
            scan_tick.tick().await;
            sweep_tick.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = scan_tick.tick() => {
                        if let Err(err) = self.run_scan_tick().await {
                            warn!(error = %err, "scan tick failed");
                        }
                    }
                    _ = sweep_tick.tick() => {
                        if let Err(err) = self.run_sweep_tick().await {
                            warn!(error = %err, "sweep tick failed");
                        }
                    }
                }
            }
            info!("scheduler stopped");
        })
    }

    /// Invoke every registered scan once for today. Scans already marked
    /// for (automation, scan, day) are skipped, so the tick cadence can be
    /// faster than daily without double-counting.
    pub async fn run_scan_tick(&self) -> anyhow::Result<Value> {
        let today = Utc::now().date_naive();
        let mut ran = Vec::new();
        let mut skipped = Vec::new();

        for registered in self.registry.all() {
            let automation = &registered.automation;
            let automation_type = automation.automation_type();
            for scan_name in automation.scan_names() {
                let fresh = self
                    .store
                    .mark_scan(automation_type, scan_name, "all", today)
                    .await?;
                if !fresh {
                    skipped.push(format!("{automation_type}:{scan_name}"));
                    continue;
                }

                let action = format!("scan_{scan_name}");
                let outcome = automation.run_scan(scan_name).await;
                let (status, detail, error): (ActionStatus, Value, Option<String>) = match outcome {
                    Some(Ok(detail)) => (ActionStatus::Executed, detail, None),
                    Some(Err(err)) => (ActionStatus::Failed, json!({}), Some(err.to_string())),
                    None => (
                        ActionStatus::Failed,
                        json!({}),
                        Some(format!("unknown scan `{scan_name}`")),
                    ),
                };

                let audit_log_id = self
                    .store
                    .insert_audit(NewAuditLog {
                        automation_type,
                        action_name: action.clone(),
                        model: "scheduler".to_string(),
                        record_id: None,
                        status,
                        confidence: 1.0,
                        reasoning: format!("scheduled scan `{scan_name}`"),
                        input_data: json!({"day": today.to_string()}),
                        output_data: detail.clone(),
                        tokens_used: 0,
                    })
                    .await?;
                if let Some(error) = &error {
                    self.store.mark_audit_failed(audit_log_id, error).await?;
                }

                self.bus.publish(LifecycleEvent::ScanCompleted {
                    automation_type: automation_type.as_str().to_string(),
                    scan_name: scan_name.to_string(),
                    detail,
                });
                ran.push(format!("{automation_type}:{scan_name}"));
            }
        }

        Ok(json!({"ran": ran, "skipped": skipped}))
    }

    /// Fail runs whose suspension timed out.
    pub async fn run_sweep_tick(&self) -> anyhow::Result<Value> {
        let expired = self.store.expired_suspensions(Utc::now()).await?;
        let failed = self.runtime.sweep_expired_suspensions().await?;
        for suspension in &expired {
            if failed.contains(&suspension.agent_run_id) {
                self.bus.publish(LifecycleEvent::SuspensionExpired {
                    run_id: suspension.agent_run_id,
                    resume_condition: suspension.resume_condition.clone(),
                });
            }
        }
        Ok(json!({ "expired_runs": failed }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use relay_agents::{AgentConfig, AgentRegistry, AgentServices};
    use relay_automations::{Automation, AutomationResult, HandlerTable};
    use relay_providers::NoopNotifier;
    use relay_store::AuditFilter;
    use relay_types::AutomationType;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingScans {
        runs: AtomicUsize,
    }

    #[async_trait]
    impl Automation for CountingScans {
        fn automation_type(&self) -> AutomationType {
            AutomationType::CreditManagement
        }
        fn watched_models(&self) -> Vec<String> {
            Vec::new()
        }
        fn handlers(self: Arc<Self>) -> HandlerTable {
            HandlerTable::new()
        }
        fn scan_names(&self) -> Vec<&'static str> {
            vec!["payment_releases"]
        }
        async fn run_scan(&self, name: &str) -> Option<anyhow::Result<Value>> {
            if name != "payment_releases" {
                return None;
            }
            self.runs.fetch_add(1, Ordering::SeqCst);
            Some(Ok(json!({"released": []})))
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

    async fn scheduler_with_probe() -> (Arc<Store>, Arc<CountingScans>, Arc<Scheduler>) {
        let store = Arc::new(Store::in_memory().await.unwrap());
        let probe = Arc::new(CountingScans {
            runs: AtomicUsize::new(0),
        });
        let mut registry = AutomationRegistry::new();
        registry.register(probe.clone() as Arc<dyn Automation>);

        let store_for_services = store.clone();
        let runtime = Arc::new(AgentRuntime::new(
            store.clone(),
            Arc::new(AgentRegistry::new()),
            Box::new(move || {
                AgentServices::new(
                    Arc::new(crate::testing::NullErp),
                    Arc::new(crate::testing::NullLlm),
                    store_for_services.clone(),
                    Arc::new(NoopNotifier),
                )
            }),
            AgentConfig::default(),
        ));

        let scheduler = Scheduler::new(
            store.clone(),
            Arc::new(registry),
            runtime,
            EventBus::new(),
            ScheduleConfig::default(),
        );
        (store, probe, scheduler)
    }

    #[tokio::test]
    async fn scan_tick_is_idempotent_per_day() {
        let (store, probe, scheduler) = scheduler_with_probe().await;

        let first = scheduler.run_scan_tick().await.unwrap();
        assert_eq!(first["ran"].as_array().unwrap().len(), 1);
        assert_eq!(probe.runs.load(Ordering::SeqCst), 1);

        let second = scheduler.run_scan_tick().await.unwrap();
        assert!(second["ran"].as_array().unwrap().is_empty());
        assert_eq!(second["skipped"].as_array().unwrap().len(), 1);
        assert_eq!(probe.runs.load(Ordering::SeqCst), 1);

        // exactly one audit row was written for the one executed scan
        let logs = store
            .list_audit(AuditFilter {
                automation_type: Some(AutomationType::CreditManagement),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].action_name, "scan_payment_releases");
    }
}
