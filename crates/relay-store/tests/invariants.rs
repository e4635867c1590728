//! Invariant tests against a real on-disk database: step indexing,
//! suspension uniqueness, reconciliation counters, and audit lifecycle.

use serde_json::json;
use tempfile::tempdir;

use relay_store::{NewAuditLog, NewStep, Store};
use relay_types::{ActionStatus, AgentRunStatus, AgentStepStatus, AutomationType};

async fn disk_store(dir: &tempfile::TempDir) -> Store {
    Store::open(&dir.path().join("relay.db")).await.unwrap()
}

#[tokio::test]
async fn schema_init_is_idempotent_across_reopens() {
    let dir = tempdir().unwrap();
    {
        let store = disk_store(&dir).await;
        store
            .insert_audit(NewAuditLog {
                automation_type: AutomationType::Crm,
                action_name: "score_lead".to_string(),
                model: "crm.lead".to_string(),
                record_id: Some(1),
                status: ActionStatus::Pending,
                confidence: 0.9,
                reasoning: "persisted".to_string(),
                input_data: json!({}),
                output_data: json!({}),
                tokens_used: 0,
            })
            .await
            .unwrap();
    }

    // Reopen: schema DDL re-runs, data survives.
    let store = disk_store(&dir).await;
    let logs = store.pending_approvals().await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].reasoning, "persisted");
}

#[tokio::test]
async fn total_steps_equals_step_rows_without_gaps() {
    let dir = tempdir().unwrap();
    let store = disk_store(&dir).await;

    let run_id = store
        .create_run("month_end_close", "schedule", Some("2026-02"), &json!({}))
        .await
        .unwrap();
    for i in 0..7 {
        store
            .append_step(
                run_id,
                NewStep {
                    step_name: format!("node_{i}"),
                    step_index: i,
                    input_data: json!({}),
                    output_data: json!({}),
                    status: AgentStepStatus::Completed,
                    tokens_used: 3,
                    duration_ms: Some(1),
                },
            )
            .await
            .unwrap();
    }
    store
        .complete_run(run_id, AgentRunStatus::Completed, 7, 21, &json!({}), None)
        .await
        .unwrap();

    let run = store.get_run(run_id).await.unwrap();
    let steps = store.steps_for_run(run_id).await.unwrap();
    assert_eq!(run.total_steps, steps.len() as i64);
    let indexes: Vec<i64> = steps.iter().map(|s| s.step_index).collect();
    assert_eq!(indexes, (0..7).collect::<Vec<i64>>());
}

#[tokio::test]
async fn suspended_run_has_exactly_one_open_suspension() {
    let dir = tempdir().unwrap();
    let store = disk_store(&dir).await;

    let run_id = store
        .create_run("procure_to_pay", "webhook", None, &json!({}))
        .await
        .unwrap();
    store
        .suspend_run(run_id, "awaiting_bill_approval", "route", None, &json!({}), 4, 90)
        .await
        .unwrap();

    assert_eq!(
        store.get_run(run_id).await.unwrap().status,
        AgentRunStatus::Suspended
    );
    let open = store.open_suspension_for(run_id).await.unwrap();
    assert!(open.is_some());

    store.resume_run(run_id, &json!({"approved": true})).await.unwrap();
    assert!(store.open_suspension_for(run_id).await.unwrap().is_none());

    // Suspending again after a resume opens exactly one new row.
    store
        .suspend_run(run_id, "awaiting_payment", "wait", None, &json!({}), 6, 120)
        .await
        .unwrap();
    let open = store.open_suspension_for(run_id).await.unwrap().unwrap();
    assert_eq!(open.resume_condition, "awaiting_payment");
}

#[tokio::test]
async fn reconciliation_remaining_never_negative() {
    let dir = tempdir().unwrap();
    let store = disk_store(&dir).await;

    let id = store
        .create_recon_session("controller", 3, 5, &json!([]))
        .await
        .unwrap();
    store.bump_recon_counters(id, 2, 0, 0).await.unwrap();
    store.bump_recon_counters(id, 0, 2, 0).await.unwrap();
    let session = store.bump_recon_counters(id, 0, 0, 1).await.unwrap();
    assert_eq!(session.remaining, 0);

    let session = store.bump_recon_counters(id, 0, 0, 1).await.unwrap();
    assert_eq!(session.remaining, 0);
    assert_eq!(session.derived_remaining(), 0);
}

#[tokio::test]
async fn audit_lifecycle_pending_to_executed() {
    let dir = tempdir().unwrap();
    let store = disk_store(&dir).await;

    let id = store
        .insert_audit(NewAuditLog {
            automation_type: AutomationType::Accounting,
            action_name: "adjust_record".to_string(),
            model: "account.move".to_string(),
            record_id: Some(3),
            status: ActionStatus::Pending,
            confidence: 0.9,
            reasoning: "mid band".to_string(),
            input_data: json!({"values": {}}),
            output_data: json!({"changes_made": {"state": "posted"}}),
            tokens_used: 10,
        })
        .await
        .unwrap();

    store
        .update_audit_status(id, ActionStatus::Approved, Some("controller"))
        .await
        .unwrap();
    store
        .mark_audit_executed(id, &json!({"applied": true}))
        .await
        .unwrap();

    let log = store.get_audit(id).await.unwrap();
    assert_eq!(log.status, ActionStatus::Executed);
    assert!(log.executed_at.is_some());
    assert_eq!(log.approved_by.as_deref(), Some("controller"));
    assert_eq!(log.output_data, json!({"applied": true}));
}
