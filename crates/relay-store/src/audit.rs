// Audit trail, automation rules, webhook events, and scan markers.

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde_json::Value;

use relay_types::{
    ActionStatus, AuditLog, AutomationRule, AutomationType, CorrelationId, EventType,
    WebhookEventRecord,
};

use crate::db::{json_or_default, parse_ts, parse_ts_opt, ts, Store};
use crate::error::{StoreError, StoreResult};

/// Everything the dispatcher knows at write time. The row id and timestamp
/// are assigned by the store.
#[derive(Debug, Clone)]
pub struct NewAuditLog {
    pub automation_type: AutomationType,
    pub action_name: String,
    pub model: String,
    pub record_id: Option<i64>,
    pub status: ActionStatus,
    pub confidence: f64,
    pub reasoning: String,
    pub input_data: Value,
    pub output_data: Value,
    pub tokens_used: i64,
}

#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub status: Option<ActionStatus>,
    pub automation_type: Option<AutomationType>,
    pub limit: usize,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct AuditStats {
    pub total: i64,
    pub today: i64,
    pub pending_approvals: i64,
    pub executed_today: i64,
    pub failed_today: i64,
    pub tokens_today: i64,
}

fn audit_from_row(row: &Row<'_>) -> rusqlite::Result<AuditLog> {
    let automation_type: String = row.get("automation_type")?;
    let status: String = row.get("status")?;
    Ok(AuditLog {
        id: row.get("id")?,
        timestamp: parse_ts(&row.get::<_, String>("timestamp")?),
        automation_type: AutomationType::parse(&automation_type)
            .unwrap_or(AutomationType::AgentWorkflow),
        action_name: row.get("action_name")?,
        model: row.get("model")?,
        record_id: row.get("record_id")?,
        status: ActionStatus::parse(&status).unwrap_or(ActionStatus::Failed),
        confidence: row.get("confidence")?,
        reasoning: row.get("reasoning")?,
        input_data: json_or_default(row.get("input_data")?),
        output_data: json_or_default(row.get("output_data")?),
        error_message: row.get("error_message")?,
        executed_at: parse_ts_opt(row.get("executed_at")?),
        approved_by: row.get("approved_by")?,
        tokens_used: row.get("tokens_used")?,
    })
}

fn rule_from_row(row: &Row<'_>) -> rusqlite::Result<AutomationRule> {
    let automation_type: String = row.get("automation_type")?;
    Ok(AutomationRule {
        id: row.get("id")?,
        name: row.get("name")?,
        automation_type: AutomationType::parse(&automation_type)
            .unwrap_or(AutomationType::AgentWorkflow),
        action_name: row.get("action_name")?,
        enabled: row.get::<_, i64>("enabled")? != 0,
        confidence_threshold: row.get("confidence_threshold")?,
        auto_approve: row.get::<_, i64>("auto_approve")? != 0,
        auto_approve_threshold: row.get("auto_approve_threshold")?,
        config: json_or_default(row.get("config")?),
        created_at: parse_ts(&row.get::<_, String>("created_at")?),
        updated_at: parse_ts(&row.get::<_, String>("updated_at")?),
    })
}

impl Store {
    /// Insert one audit row. Timestamps are clamped monotonic per
    /// (automation_type, action_name) chain.
    pub async fn insert_audit(&self, new: NewAuditLog) -> StoreResult<i64> {
        let key = (
            new.automation_type.as_str().to_string(),
            new.action_name.clone(),
        );
        let timestamp = {
            let mut clock = self.audit_clock.lock().await;
            let now = Utc::now();
            let last = clock.get(&key).copied();
            let next = match last {
                Some(last) if now <= last => last + chrono::Duration::microseconds(1),
                _ => now,
            };
            clock.insert(key, next);
            next
        };

        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO audit_logs (timestamp, automation_type, action_name, model, record_id,
                status, confidence, reasoning, input_data, output_data, tokens_used,
                executed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                ts(timestamp),
                new.automation_type.as_str(),
                new.action_name,
                new.model,
                new.record_id,
                new.status.as_str(),
                new.confidence,
                new.reasoning,
                new.input_data.to_string(),
                new.output_data.to_string(),
                new.tokens_used,
                if new.status == ActionStatus::Executed {
                    Some(ts(timestamp))
                } else {
                    None
                },
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn get_audit(&self, id: i64) -> StoreResult<AuditLog> {
        let conn = self.conn.lock().await;
        conn.query_row("SELECT * FROM audit_logs WHERE id = ?1", [id], audit_from_row)
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("audit log {id}")))
    }

    pub async fn update_audit_status(
        &self,
        id: i64,
        status: ActionStatus,
        approved_by: Option<&str>,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE audit_logs SET status = ?2, approved_by = COALESCE(?3, approved_by)
             WHERE id = ?1",
            params![id, status.as_str(), approved_by],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("audit log {id}")));
        }
        Ok(())
    }

    pub async fn mark_audit_executed(&self, id: i64, output: &Value) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE audit_logs SET status = 'executed', executed_at = ?2, output_data = ?3
             WHERE id = ?1",
            params![id, ts(Utc::now()), output.to_string()],
        )?;
        Ok(())
    }

    pub async fn mark_audit_failed(&self, id: i64, error: &str) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE audit_logs SET status = 'failed', error_message = ?2 WHERE id = ?1",
            params![id, error],
        )?;
        Ok(())
    }

    pub async fn list_audit(&self, filter: AuditFilter) -> StoreResult<Vec<AuditLog>> {
        let conn = self.conn.lock().await;
        let limit = if filter.limit == 0 { 100 } else { filter.limit };
        let mut sql = "SELECT * FROM audit_logs WHERE 1=1".to_string();
        let mut args: Vec<String> = Vec::new();
        if let Some(status) = filter.status {
            sql.push_str(" AND status = ?");
            args.push(status.as_str().to_string());
        }
        if let Some(at) = filter.automation_type {
            sql.push_str(" AND automation_type = ?");
            args.push(at.as_str().to_string());
        }
        sql.push_str(&format!(" ORDER BY id DESC LIMIT {limit}"));

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), audit_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub async fn pending_approvals(&self) -> StoreResult<Vec<AuditLog>> {
        self.list_audit(AuditFilter {
            status: Some(ActionStatus::Pending),
            automation_type: None,
            limit: 200,
        })
        .await
    }

    pub async fn audit_stats_today(&self) -> StoreResult<AuditStats> {
        let conn = self.conn.lock().await;
        let day_start = Utc::now()
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|dt| DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc))
            .map(ts)
            .unwrap_or_default();

        let total: i64 = conn.query_row("SELECT COUNT(*) FROM audit_logs", [], |r| r.get(0))?;
        let today: i64 = conn.query_row(
            "SELECT COUNT(*) FROM audit_logs WHERE timestamp >= ?1",
            [&day_start],
            |r| r.get(0),
        )?;
        let pending: i64 = conn.query_row(
            "SELECT COUNT(*) FROM audit_logs WHERE status = 'pending'",
            [],
            |r| r.get(0),
        )?;
        let executed_today: i64 = conn.query_row(
            "SELECT COUNT(*) FROM audit_logs WHERE status = 'executed' AND timestamp >= ?1",
            [&day_start],
            |r| r.get(0),
        )?;
        let failed_today: i64 = conn.query_row(
            "SELECT COUNT(*) FROM audit_logs WHERE status = 'failed' AND timestamp >= ?1",
            [&day_start],
            |r| r.get(0),
        )?;
        let tokens_today: i64 = conn.query_row(
            "SELECT COALESCE(SUM(tokens_used), 0) FROM audit_logs WHERE timestamp >= ?1",
            [&day_start],
            |r| r.get(0),
        )?;

        Ok(AuditStats {
            total,
            today,
            pending_approvals: pending,
            executed_today,
            failed_today,
            tokens_today,
        })
    }

    // -----------------------------------------------------------------
    // Automation rules
    // -----------------------------------------------------------------

    pub async fn upsert_rule(&self, rule: &AutomationRule) -> StoreResult<i64> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO automation_rules
                (name, automation_type, action_name, enabled, confidence_threshold,
                 auto_approve, auto_approve_threshold, config, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
             ON CONFLICT(automation_type, action_name) DO UPDATE SET
                name = excluded.name,
                enabled = excluded.enabled,
                confidence_threshold = excluded.confidence_threshold,
                auto_approve = excluded.auto_approve,
                auto_approve_threshold = excluded.auto_approve_threshold,
                config = excluded.config,
                updated_at = excluded.updated_at",
            params![
                rule.name,
                rule.automation_type.as_str(),
                rule.action_name,
                rule.enabled as i64,
                rule.confidence_threshold,
                rule.auto_approve as i64,
                rule.auto_approve_threshold,
                rule.config.to_string(),
                ts(Utc::now()),
            ],
        )?;
        let id: i64 = conn.query_row(
            "SELECT id FROM automation_rules WHERE automation_type = ?1 AND action_name = ?2",
            params![rule.automation_type.as_str(), rule.action_name],
            |r| r.get(0),
        )?;
        Ok(id)
    }

    /// Rule lookup by (automation_type, action_name); None means defaults apply.
    pub async fn rule_for(
        &self,
        automation_type: AutomationType,
        action_name: &str,
    ) -> StoreResult<Option<AutomationRule>> {
        let conn = self.conn.lock().await;
        Ok(conn
            .query_row(
                "SELECT * FROM automation_rules
                 WHERE automation_type = ?1 AND action_name = ?2",
                params![automation_type.as_str(), action_name],
                rule_from_row,
            )
            .optional()?)
    }

    pub async fn list_rules(&self) -> StoreResult<Vec<AutomationRule>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT * FROM automation_rules ORDER BY id")?;
        let rows = stmt.query_map([], rule_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // -----------------------------------------------------------------
    // Webhook events
    // -----------------------------------------------------------------

    pub async fn insert_webhook_event(
        &self,
        event_type: EventType,
        model: &str,
        record_id: Option<i64>,
        payload: &Value,
        payload_hash: &str,
        correlation_id: &CorrelationId,
    ) -> StoreResult<i64> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO webhook_events (received_at, event_type, model, record_id,
                payload, payload_hash, correlation_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                ts(Utc::now()),
                event_type.as_str(),
                model,
                record_id,
                payload.to_string(),
                payload_hash,
                correlation_id.as_str(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// True when the same (model, record_id, payload_hash) was seen within
    /// the dedup window.
    pub async fn is_duplicate_event(
        &self,
        model: &str,
        record_id: Option<i64>,
        payload_hash: &str,
        window: chrono::Duration,
    ) -> StoreResult<bool> {
        let conn = self.conn.lock().await;
        let cutoff = ts(Utc::now() - window);
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM webhook_events
             WHERE model = ?1 AND record_id IS ?2 AND payload_hash = ?3 AND received_at >= ?4",
            params![model, record_id, payload_hash, cutoff],
            |r| r.get(0),
        )?;
        Ok(count > 0)
    }

    pub async fn mark_event_processing(&self, id: i64) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE webhook_events SET processing_started_at = ?2 WHERE id = ?1",
            params![id, ts(Utc::now())],
        )?;
        Ok(())
    }

    pub async fn mark_event_processed(&self, id: i64, error: Option<&str>) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE webhook_events SET processed = 1, processing_completed_at = ?2, error = ?3
             WHERE id = ?1",
            params![id, ts(Utc::now()), error],
        )?;
        Ok(())
    }

    pub async fn get_webhook_event(&self, id: i64) -> StoreResult<WebhookEventRecord> {
        let conn = self.conn.lock().await;
        conn.query_row("SELECT * FROM webhook_events WHERE id = ?1", [id], |row| {
            let event_type: String = row.get("event_type")?;
            Ok(WebhookEventRecord {
                id: row.get("id")?,
                received_at: parse_ts(&row.get::<_, String>("received_at")?),
                event_type: EventType::parse(&event_type).unwrap_or(EventType::Write),
                model: row.get("model")?,
                record_id: row.get("record_id")?,
                payload: json_or_default(row.get("payload")?),
                payload_hash: row.get("payload_hash")?,
                correlation_id: CorrelationId::from(row.get::<_, String>("correlation_id")?),
                processed: row.get::<_, i64>("processed")? != 0,
                processing_started_at: parse_ts_opt(row.get("processing_started_at")?),
                processing_completed_at: parse_ts_opt(row.get("processing_completed_at")?),
                error: row.get("error")?,
            })
        })
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("webhook event {id}")))
    }

    // -----------------------------------------------------------------
    // Scan markers (scheduled-scan idempotence)
    // -----------------------------------------------------------------

    /// Record a scan execution for (automation_type, scan_name, target, day).
    /// Returns false when the marker already exists, i.e. the scan already
    /// ran today for that target and must not double-count.
    pub async fn mark_scan(
        &self,
        automation_type: AutomationType,
        scan_name: &str,
        target: &str,
        day: NaiveDate,
    ) -> StoreResult<bool> {
        let conn = self.conn.lock().await;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO scan_markers (automation_type, scan_name, target, day, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                automation_type.as_str(),
                scan_name,
                target,
                day.to_string(),
                ts(Utc::now()),
            ],
        )?;
        Ok(inserted > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn new_log(confidence: f64, status: ActionStatus) -> NewAuditLog {
        NewAuditLog {
            automation_type: AutomationType::Accounting,
            action_name: "validate_invoice".to_string(),
            model: "account.move".to_string(),
            record_id: Some(7),
            status,
            confidence,
            reasoning: "test".to_string(),
            input_data: json!({"amount": 100}),
            output_data: json!({}),
            tokens_used: 12,
        }
    }

    #[tokio::test]
    async fn executed_rows_get_executed_at() {
        let store = Store::in_memory().await.unwrap();
        let id = store
            .insert_audit(new_log(0.99, ActionStatus::Executed))
            .await
            .unwrap();
        let log = store.get_audit(id).await.unwrap();
        assert_eq!(log.status, ActionStatus::Executed);
        assert!(log.executed_at.is_some());
    }

    #[tokio::test]
    async fn pending_rows_have_no_executed_at() {
        let store = Store::in_memory().await.unwrap();
        let id = store
            .insert_audit(new_log(0.9, ActionStatus::Pending))
            .await
            .unwrap();
        let log = store.get_audit(id).await.unwrap();
        assert!(log.executed_at.is_none());
    }

    #[tokio::test]
    async fn audit_timestamps_are_monotonic_per_chain() {
        let store = Store::in_memory().await.unwrap();
        let mut last = None;
        for _ in 0..5 {
            let id = store
                .insert_audit(new_log(0.5, ActionStatus::Executed))
                .await
                .unwrap();
            let log = store.get_audit(id).await.unwrap();
            if let Some(prev) = last {
                assert!(log.timestamp > prev);
            }
            last = Some(log.timestamp);
        }
    }

    #[tokio::test]
    async fn rule_upsert_replaces_by_key() {
        let store = Store::in_memory().await.unwrap();
        let mut rule = AutomationRule::defaults(AutomationType::Crm, "score_lead");
        let id1 = store.upsert_rule(&rule).await.unwrap();
        rule.confidence_threshold = 0.7;
        let id2 = store.upsert_rule(&rule).await.unwrap();
        assert_eq!(id1, id2);
        let loaded = store
            .rule_for(AutomationType::Crm, "score_lead")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.confidence_threshold, 0.7);
    }

    #[tokio::test]
    async fn webhook_dedup_window() {
        let store = Store::in_memory().await.unwrap();
        let payload = json!({"values": {"state": "posted"}});
        let correlation_id = CorrelationId::new();
        let event_id = store
            .insert_webhook_event(
                EventType::Write,
                "account.move",
                Some(1),
                &payload,
                "abc",
                &correlation_id,
            )
            .await
            .unwrap();
        let event = store.get_webhook_event(event_id).await.unwrap();
        assert_eq!(event.correlation_id, correlation_id);
        assert!(store
            .is_duplicate_event("account.move", Some(1), "abc", chrono::Duration::seconds(300))
            .await
            .unwrap());
        assert!(!store
            .is_duplicate_event("account.move", Some(2), "abc", chrono::Duration::seconds(300))
            .await
            .unwrap());
        assert!(!store
            .is_duplicate_event("account.move", Some(1), "other", chrono::Duration::seconds(300))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn scan_marker_is_idempotent_per_day() {
        let store = Store::in_memory().await.unwrap();
        let day = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        assert!(store
            .mark_scan(AutomationType::CreditManagement, "payment_releases", "all", day)
            .await
            .unwrap());
        assert!(!store
            .mark_scan(AutomationType::CreditManagement, "payment_releases", "all", day)
            .await
            .unwrap());
        let next = NaiveDate::from_ymd_opt(2026, 3, 3).unwrap();
        assert!(store
            .mark_scan(AutomationType::CreditManagement, "payment_releases", "all", next)
            .await
            .unwrap());
    }
}
