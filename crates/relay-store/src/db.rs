// Database layer: SQLite with WAL, one connection behind an async mutex.
// Schema creation is idempotent; every index required by the API contract
// is created here.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tokio::sync::Mutex;

use crate::error::StoreResult;

pub struct Store {
    pub(crate) conn: Arc<Mutex<Connection>>,
    /// Last audit timestamp handed out per (automation_type, action_name);
    /// keeps single-writer chains monotonic even if the wall clock steps back.
    pub(crate) audit_clock: Arc<Mutex<HashMap<(String, String), DateTime<Utc>>>>,
}

impl Store {
    /// Open (or create) the store at the given path.
    pub async fn open(db_path: &Path) -> StoreResult<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        Self::from_connection(conn).await
    }

    /// In-memory store for tests and one-shot tools.
    pub async fn in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn).await
    }

    async fn from_connection(conn: Connection) -> StoreResult<Self> {
        conn.busy_timeout(Duration::from_secs(10))?;
        // PRAGMA journal_mode returns a row; use query_row to consume it.
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(())).ok();
        conn.execute("PRAGMA synchronous = NORMAL", [])?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            audit_clock: Arc::new(Mutex::new(HashMap::new())),
        };
        store.init_schema().await?;
        Ok(store)
    }

    pub async fn init_schema(&self) -> StoreResult<()> {
        let conn = self.conn.lock().await;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS audit_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                automation_type TEXT NOT NULL,
                action_name TEXT NOT NULL,
                model TEXT NOT NULL,
                record_id INTEGER,
                status TEXT NOT NULL DEFAULT 'pending',
                confidence REAL NOT NULL DEFAULT 0,
                reasoning TEXT NOT NULL DEFAULT '',
                input_data TEXT NOT NULL DEFAULT '{}',
                output_data TEXT NOT NULL DEFAULT '{}',
                error_message TEXT,
                executed_at TEXT,
                approved_by TEXT,
                tokens_used INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_audit_logs_timestamp ON audit_logs(timestamp);
            CREATE INDEX IF NOT EXISTS idx_audit_logs_status ON audit_logs(status);

            CREATE TABLE IF NOT EXISTS automation_rules (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                automation_type TEXT NOT NULL,
                action_name TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                confidence_threshold REAL NOT NULL DEFAULT 0.85,
                auto_approve INTEGER NOT NULL DEFAULT 0,
                auto_approve_threshold REAL NOT NULL DEFAULT 0.95,
                config TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(automation_type, action_name)
            );

            CREATE TABLE IF NOT EXISTS webhook_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                received_at TEXT NOT NULL,
                event_type TEXT NOT NULL,
                model TEXT NOT NULL,
                record_id INTEGER,
                payload TEXT NOT NULL DEFAULT '{}',
                payload_hash TEXT NOT NULL,
                correlation_id TEXT NOT NULL DEFAULT '',
                processed INTEGER NOT NULL DEFAULT 0,
                processing_started_at TEXT,
                processing_completed_at TEXT,
                error TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_webhook_events_hash
                ON webhook_events(model, record_id, payload_hash);

            CREATE TABLE IF NOT EXISTS scan_markers (
                automation_type TEXT NOT NULL,
                scan_name TEXT NOT NULL,
                target TEXT NOT NULL,
                day TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY(automation_type, scan_name, target, day)
            );

            CREATE TABLE IF NOT EXISTS agent_runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                agent_type TEXT NOT NULL,
                trigger_type TEXT NOT NULL,
                trigger_id TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                started_at TEXT NOT NULL,
                completed_at TEXT,
                total_steps INTEGER NOT NULL DEFAULT 0,
                token_usage INTEGER NOT NULL DEFAULT 0,
                initial_state TEXT NOT NULL DEFAULT '{}',
                final_state TEXT,
                error TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_agent_runs_type ON agent_runs(agent_type);
            CREATE INDEX IF NOT EXISTS idx_agent_runs_status ON agent_runs(status);
            CREATE INDEX IF NOT EXISTS idx_agent_runs_started ON agent_runs(started_at);

            CREATE TABLE IF NOT EXISTS agent_steps (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                agent_run_id INTEGER NOT NULL REFERENCES agent_runs(id) ON DELETE CASCADE,
                step_name TEXT NOT NULL,
                step_index INTEGER NOT NULL,
                input_data TEXT NOT NULL DEFAULT '{}',
                output_data TEXT NOT NULL DEFAULT '{}',
                duration_ms INTEGER,
                status TEXT NOT NULL DEFAULT 'pending',
                tokens_used INTEGER NOT NULL DEFAULT 0,
                started_at TEXT,
                completed_at TEXT,
                UNIQUE(agent_run_id, step_index)
            );
            CREATE INDEX IF NOT EXISTS idx_agent_steps_run ON agent_steps(agent_run_id);
            CREATE INDEX IF NOT EXISTS idx_agent_steps_status ON agent_steps(status);

            CREATE TABLE IF NOT EXISTS agent_decisions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                agent_step_id INTEGER NOT NULL REFERENCES agent_steps(id) ON DELETE CASCADE,
                prompt_hash TEXT NOT NULL DEFAULT '',
                response TEXT NOT NULL DEFAULT '{}',
                confidence REAL NOT NULL DEFAULT 0,
                tools_used TEXT NOT NULL DEFAULT '[]',
                tokens_input INTEGER NOT NULL DEFAULT 0,
                tokens_output INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_agent_decisions_step ON agent_decisions(agent_step_id);

            CREATE TABLE IF NOT EXISTS agent_suspensions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                agent_run_id INTEGER NOT NULL REFERENCES agent_runs(id) ON DELETE CASCADE,
                resume_condition TEXT NOT NULL,
                resume_data TEXT NOT NULL DEFAULT '{}',
                suspended_at_step TEXT NOT NULL DEFAULT '',
                timeout_at TEXT,
                suspended_at TEXT NOT NULL,
                resumed_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_agent_suspensions_run ON agent_suspensions(agent_run_id);
            CREATE INDEX IF NOT EXISTS idx_agent_suspensions_timeout ON agent_suspensions(timeout_at);

            CREATE TABLE IF NOT EXISTS reconciliation_sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL DEFAULT 'admin',
                journal_id INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                total_lines INTEGER NOT NULL DEFAULT 0,
                auto_matched INTEGER NOT NULL DEFAULT 0,
                manually_matched INTEGER NOT NULL DEFAULT 0,
                skipped INTEGER NOT NULL DEFAULT 0,
                remaining INTEGER NOT NULL DEFAULT 0,
                learned_rules TEXT NOT NULL DEFAULT '[]',
                started_at TEXT NOT NULL,
                last_activity TEXT NOT NULL,
                completed_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_recon_sessions_status ON reconciliation_sessions(status);
            CREATE INDEX IF NOT EXISTS idx_recon_sessions_user ON reconciliation_sessions(user_id);

            CREATE TABLE IF NOT EXISTS deduplication_scans (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                scan_type TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'running',
                total_records INTEGER NOT NULL DEFAULT 0,
                duplicates_found INTEGER NOT NULL DEFAULT 0,
                auto_merged INTEGER NOT NULL DEFAULT 0,
                pending_review INTEGER NOT NULL DEFAULT 0,
                started_at TEXT NOT NULL,
                completed_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_dedup_scans_type ON deduplication_scans(scan_type);

            CREATE TABLE IF NOT EXISTS duplicate_groups (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                scan_id INTEGER NOT NULL REFERENCES deduplication_scans(id) ON DELETE CASCADE,
                model TEXT NOT NULL,
                record_ids TEXT NOT NULL,
                master_record_id INTEGER NOT NULL,
                similarity_score REAL NOT NULL DEFAULT 0,
                match_fields TEXT NOT NULL DEFAULT '[]',
                status TEXT NOT NULL DEFAULT 'pending',
                resolved_at TEXT,
                resolved_by TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_duplicate_groups_scan ON duplicate_groups(scan_id);
            CREATE INDEX IF NOT EXISTS idx_duplicate_groups_status ON duplicate_groups(status);

            CREATE TABLE IF NOT EXISTS credit_scores (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                customer_id INTEGER NOT NULL UNIQUE,
                customer_name TEXT NOT NULL DEFAULT '',
                credit_score REAL NOT NULL DEFAULT 0,
                credit_limit REAL NOT NULL DEFAULT 0,
                current_exposure REAL NOT NULL DEFAULT 0,
                overdue_amount REAL NOT NULL DEFAULT 0,
                payment_history_score REAL NOT NULL DEFAULT 0,
                order_volume_score REAL NOT NULL DEFAULT 0,
                risk_level TEXT NOT NULL DEFAULT 'normal',
                hold_active INTEGER NOT NULL DEFAULT 0,
                hold_reason TEXT,
                last_calculated TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_credit_scores_hold ON credit_scores(hold_active);

            CREATE TABLE IF NOT EXISTS cash_forecasts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                forecast_date TEXT NOT NULL,
                target_date TEXT NOT NULL,
                predicted_balance REAL NOT NULL,
                confidence_low REAL NOT NULL DEFAULT 0,
                confidence_high REAL NOT NULL DEFAULT 0,
                ar_expected REAL NOT NULL DEFAULT 0,
                ap_expected REAL NOT NULL DEFAULT 0,
                pipeline_expected REAL NOT NULL DEFAULT 0,
                recurring_expected REAL NOT NULL DEFAULT 0,
                model_version TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_cash_forecasts_dates
                ON cash_forecasts(forecast_date, target_date);

            CREATE TABLE IF NOT EXISTS forecast_scenarios (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                adjustments TEXT NOT NULL DEFAULT '{}',
                base_forecast_id INTEGER,
                result_data TEXT NOT NULL DEFAULT '{}',
                created_by TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS forecast_accuracy_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                forecast_id INTEGER,
                target_date TEXT NOT NULL,
                predicted_balance REAL NOT NULL DEFAULT 0,
                actual_balance REAL NOT NULL DEFAULT 0,
                error_pct REAL NOT NULL DEFAULT 0,
                logged_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_forecast_accuracy_date
                ON forecast_accuracy_log(target_date);

            CREATE TABLE IF NOT EXISTS daily_digests (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_role TEXT NOT NULL,
                digest_date TEXT NOT NULL,
                content TEXT NOT NULL DEFAULT '{}',
                channels_sent TEXT NOT NULL DEFAULT '[]',
                delivered INTEGER NOT NULL DEFAULT 0,
                generated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_digest_date_role ON daily_digests(digest_date, user_role);

            CREATE TABLE IF NOT EXISTS report_jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                request_text TEXT NOT NULL,
                parsed_query TEXT NOT NULL DEFAULT '{}',
                result_data TEXT NOT NULL DEFAULT '{}',
                format TEXT NOT NULL DEFAULT 'table',
                requested_by TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL DEFAULT 'pending',
                error_message TEXT,
                created_at TEXT NOT NULL,
                completed_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_report_jobs_status ON report_jobs(status);

            CREATE TABLE IF NOT EXISTS month_end_closings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                period TEXT NOT NULL UNIQUE,
                status TEXT NOT NULL DEFAULT 'in_progress',
                started_at TEXT NOT NULL,
                completed_at TEXT,
                started_by TEXT NOT NULL DEFAULT '',
                issues_found TEXT NOT NULL DEFAULT '[]',
                summary TEXT
            );

            CREATE TABLE IF NOT EXISTS closing_steps (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                closing_id INTEGER NOT NULL REFERENCES month_end_closings(id) ON DELETE CASCADE,
                step_name TEXT NOT NULL,
                step_order INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                check_result TEXT NOT NULL DEFAULT '{}',
                items_found INTEGER NOT NULL DEFAULT 0,
                items_resolved INTEGER NOT NULL DEFAULT 0,
                completed_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_closing_steps_closing ON closing_steps(closing_id);

            CREATE TABLE IF NOT EXISTS document_jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                file_name TEXT NOT NULL DEFAULT '',
                file_type TEXT NOT NULL DEFAULT '',
                document_type TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL DEFAULT 'queued',
                source TEXT NOT NULL DEFAULT 'upload',
                uploaded_by TEXT NOT NULL DEFAULT '',
                extraction_result TEXT NOT NULL DEFAULT '{}',
                matched_po_id INTEGER,
                matched_vendor_id INTEGER,
                overall_confidence REAL NOT NULL DEFAULT 0,
                field_confidences TEXT NOT NULL DEFAULT '{}',
                erp_record_created INTEGER,
                erp_model_created TEXT,
                error_message TEXT,
                processing_time_ms INTEGER,
                created_at TEXT NOT NULL,
                completed_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_doc_jobs_status ON document_jobs(status);
            CREATE INDEX IF NOT EXISTS idx_doc_jobs_type ON document_jobs(document_type);

            CREATE TABLE IF NOT EXISTS extraction_corrections (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id INTEGER NOT NULL REFERENCES document_jobs(id) ON DELETE CASCADE,
                field_name TEXT NOT NULL,
                original_value TEXT NOT NULL DEFAULT '',
                corrected_value TEXT NOT NULL DEFAULT '',
                corrected_by TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_corrections_job ON extraction_corrections(job_id);

            CREATE TABLE IF NOT EXISTS supplier_risk_scores (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                vendor_id INTEGER NOT NULL,
                vendor_name TEXT NOT NULL DEFAULT '',
                score REAL NOT NULL,
                previous_score REAL,
                classification TEXT NOT NULL,
                summary TEXT NOT NULL DEFAULT '',
                scored_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_risk_scores_vendor ON supplier_risk_scores(vendor_id);
            CREATE INDEX IF NOT EXISTS idx_risk_scores_classification
                ON supplier_risk_scores(classification);

            CREATE TABLE IF NOT EXISTS supplier_risk_factors (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                risk_score_id INTEGER NOT NULL REFERENCES supplier_risk_scores(id) ON DELETE CASCADE,
                factor_name TEXT NOT NULL,
                weight REAL NOT NULL,
                raw_value REAL NOT NULL DEFAULT 0,
                weighted_score REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_risk_factors_score
                ON supplier_risk_factors(risk_score_id);

            CREATE TABLE IF NOT EXISTS disruption_predictions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                vendor_id INTEGER NOT NULL,
                vendor_name TEXT NOT NULL DEFAULT '',
                prediction_type TEXT NOT NULL,
                probability REAL NOT NULL,
                estimated_impact TEXT NOT NULL DEFAULT '{}',
                recommended_actions TEXT NOT NULL DEFAULT '[]',
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                expires_at TEXT,
                resolved_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_disruption_vendor ON disruption_predictions(vendor_id);
            CREATE INDEX IF NOT EXISTS idx_disruption_active ON disruption_predictions(is_active);

            CREATE TABLE IF NOT EXISTS supply_chain_alerts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                vendor_id INTEGER NOT NULL,
                vendor_name TEXT NOT NULL DEFAULT '',
                alert_type TEXT NOT NULL,
                severity TEXT NOT NULL,
                title TEXT NOT NULL,
                message TEXT NOT NULL,
                acknowledged_by TEXT,
                acknowledged_at TEXT,
                resolved_at TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_sc_alerts_vendor ON supply_chain_alerts(vendor_id);
            CREATE INDEX IF NOT EXISTS idx_sc_alerts_severity ON supply_chain_alerts(severity);
            ",
        )?;

        Ok(())
    }
}

// Timestamp helpers shared by the impl modules.

pub(crate) fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

pub(crate) fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

pub(crate) fn parse_ts_opt(s: Option<String>) -> Option<DateTime<Utc>> {
    s.map(|s| parse_ts(&s))
}

pub(crate) fn json_or_default(s: String) -> serde_json::Value {
    serde_json::from_str(&s).unwrap_or(serde_json::Value::Null)
}
