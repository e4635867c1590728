// Domain tables: reconciliation sessions, dedup scans, credit scores,
// forecasts, digests, report jobs, month-end closings, document jobs, and
// supplier risk. Parent records are append-mostly; status and summary
// fields mutate, history rows never do.

use chrono::{NaiveDate, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde_json::Value;

use relay_types::{
    AgentRunStatus, AlertSeverity, CashForecast, ClosingStep, CreditScoreRecord,
    DailyDigestRecord, DeduplicationScan, DisruptionPrediction, DocumentJob, DuplicateGroup,
    ExtractionCorrection, ForecastAccuracyEntry, ForecastScenario, GroupResolution,
    MonthEndClosing, ReconciliationSession, ReconciliationStatus, ReportJobRecord,
    RiskClassification, SupplierRiskFactor, SupplierRiskScore, SupplyChainAlert,
};

use crate::db::{json_or_default, parse_ts, parse_ts_opt, ts, Store};
use crate::error::{StoreError, StoreResult};

#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub agent_type: Option<String>,
    pub status: Option<AgentRunStatus>,
    pub limit: usize,
}

fn parse_date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap_or(NaiveDate::MIN)
}

// ---------------------------------------------------------------------------
// Reconciliation sessions
// ---------------------------------------------------------------------------

fn recon_from_row(row: &Row<'_>) -> rusqlite::Result<ReconciliationSession> {
    let status: String = row.get("status")?;
    Ok(ReconciliationSession {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        journal_id: row.get("journal_id")?,
        status: ReconciliationStatus::parse(&status).unwrap_or(ReconciliationStatus::Cancelled),
        total_lines: row.get("total_lines")?,
        auto_matched: row.get("auto_matched")?,
        manually_matched: row.get("manually_matched")?,
        skipped: row.get("skipped")?,
        remaining: row.get("remaining")?,
        learned_rules: json_or_default(row.get("learned_rules")?),
        started_at: parse_ts(&row.get::<_, String>("started_at")?),
        last_activity: parse_ts(&row.get::<_, String>("last_activity")?),
        completed_at: parse_ts_opt(row.get("completed_at")?),
    })
}

impl Store {
    pub async fn create_recon_session(
        &self,
        user_id: &str,
        journal_id: i64,
        total_lines: i64,
        learned_rules: &Value,
    ) -> StoreResult<i64> {
        let conn = self.conn.lock().await;
        let now = ts(Utc::now());
        conn.execute(
            "INSERT INTO reconciliation_sessions (user_id, journal_id, status, total_lines,
                remaining, learned_rules, started_at, last_activity)
             VALUES (?1, ?2, 'active', ?3, ?3, ?4, ?5, ?5)",
            params![user_id, journal_id, total_lines, learned_rules.to_string(), now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn get_recon_session(&self, id: i64) -> StoreResult<ReconciliationSession> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT * FROM reconciliation_sessions WHERE id = ?1",
            [id],
            recon_from_row,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("reconciliation session {id}")))
    }

    /// Apply counter deltas; `remaining` is always recomputed from the other
    /// four counters so the derived invariant holds by construction.
    pub async fn bump_recon_counters(
        &self,
        id: i64,
        auto_delta: i64,
        manual_delta: i64,
        skip_delta: i64,
    ) -> StoreResult<ReconciliationSession> {
        {
            let conn = self.conn.lock().await;
            let changed = conn.execute(
                "UPDATE reconciliation_sessions SET
                    auto_matched = auto_matched + ?2,
                    manually_matched = manually_matched + ?3,
                    skipped = skipped + ?4,
                    remaining = MAX(total_lines - (auto_matched + ?2)
                        - (manually_matched + ?3) - (skipped + ?4), 0),
                    last_activity = ?5
                 WHERE id = ?1 AND status = 'active'",
                params![id, auto_delta, manual_delta, skip_delta, ts(Utc::now())],
            )?;
            if changed == 0 {
                return Err(StoreError::Invariant(format!(
                    "reconciliation session {id} is not active"
                )));
            }
        }
        self.get_recon_session(id).await
    }

    pub async fn append_learned_rule(&self, id: i64, rule: &Value) -> StoreResult<()> {
        let session = self.get_recon_session(id).await?;
        let mut rules = match session.learned_rules {
            Value::Array(items) => items,
            _ => Vec::new(),
        };
        rules.push(rule.clone());
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE reconciliation_sessions SET learned_rules = ?2, last_activity = ?3
             WHERE id = ?1",
            params![id, Value::Array(rules).to_string(), ts(Utc::now())],
        )?;
        Ok(())
    }

    pub async fn complete_recon_session(
        &self,
        id: i64,
        status: ReconciliationStatus,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE reconciliation_sessions SET status = ?2, completed_at = ?3 WHERE id = ?1",
            params![id, status.as_str(), ts(Utc::now())],
        )?;
        Ok(())
    }

    /// Learned rules from the most recent completed session for the journal.
    pub async fn latest_learned_rules(&self, journal_id: i64) -> StoreResult<Value> {
        let conn = self.conn.lock().await;
        let rules: Option<String> = conn
            .query_row(
                "SELECT learned_rules FROM reconciliation_sessions
                 WHERE journal_id = ?1 AND status = 'completed'
                 ORDER BY completed_at DESC LIMIT 1",
                [journal_id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(rules
            .map(json_or_default)
            .unwrap_or(Value::Array(Vec::new())))
    }

    // -----------------------------------------------------------------
    // Dedup scans and groups
    // -----------------------------------------------------------------

    pub async fn create_dedup_scan(&self, scan_type: &str) -> StoreResult<i64> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO deduplication_scans (scan_type, status, started_at)
             VALUES (?1, 'running', ?2)",
            params![scan_type, ts(Utc::now())],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn complete_dedup_scan(
        &self,
        scan_id: i64,
        total_records: i64,
        duplicates_found: i64,
        pending_review: i64,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE deduplication_scans SET status = 'completed', total_records = ?2,
                duplicates_found = ?3, pending_review = ?4, completed_at = ?5
             WHERE id = ?1",
            params![scan_id, total_records, duplicates_found, pending_review, ts(Utc::now())],
        )?;
        Ok(())
    }

    pub async fn insert_duplicate_group(
        &self,
        scan_id: i64,
        model: &str,
        record_ids: &[i64],
        master_record_id: i64,
        similarity_score: f64,
        match_fields: &[String],
    ) -> StoreResult<i64> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO duplicate_groups (scan_id, model, record_ids, master_record_id,
                similarity_score, match_fields)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                scan_id,
                model,
                serde_json::to_string(record_ids)?,
                master_record_id,
                similarity_score,
                serde_json::to_string(match_fields)?,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn get_dedup_scan(&self, id: i64) -> StoreResult<DeduplicationScan> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT * FROM deduplication_scans WHERE id = ?1",
            [id],
            scan_from_row,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("dedup scan {id}")))
    }

    pub async fn list_dedup_scans(&self, limit: usize) -> StoreResult<Vec<DeduplicationScan>> {
        let conn = self.conn.lock().await;
        let limit = if limit == 0 { 50 } else { limit };
        let mut stmt = conn.prepare(&format!(
            "SELECT * FROM deduplication_scans ORDER BY id DESC LIMIT {limit}"
        ))?;
        let rows = stmt.query_map([], scan_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub async fn get_duplicate_group(&self, id: i64) -> StoreResult<DuplicateGroup> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT * FROM duplicate_groups WHERE id = ?1",
            [id],
            group_from_row,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("duplicate group {id}")))
    }

    pub async fn groups_for_scan(&self, scan_id: i64) -> StoreResult<Vec<DuplicateGroup>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT * FROM duplicate_groups WHERE scan_id = ?1 ORDER BY similarity_score DESC, id",
        )?;
        let rows = stmt.query_map([scan_id], group_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Transition a pending group to merged/dismissed. Re-resolving is a
    /// business-invariant violation surfaced to the API as a 400.
    pub async fn resolve_group(
        &self,
        id: i64,
        resolution: GroupResolution,
        resolved_by: &str,
        master_record_id: Option<i64>,
    ) -> StoreResult<DuplicateGroup> {
        {
            let conn = self.conn.lock().await;
            let changed = conn.execute(
                "UPDATE duplicate_groups SET status = ?2, resolved_at = ?3, resolved_by = ?4,
                    master_record_id = COALESCE(?5, master_record_id)
                 WHERE id = ?1 AND status = 'pending'",
                params![
                    id,
                    resolution.as_str(),
                    ts(Utc::now()),
                    resolved_by,
                    master_record_id,
                ],
            )?;
            if changed == 0 {
                return Err(StoreError::Invariant(format!(
                    "duplicate group {id} is not pending"
                )));
            }
        }
        self.get_duplicate_group(id).await
    }

    // -----------------------------------------------------------------
    // Credit scores
    // -----------------------------------------------------------------

    pub async fn upsert_credit_score(&self, score: &CreditScoreRecord) -> StoreResult<i64> {
        let conn = self.conn.lock().await;
        let now = ts(Utc::now());
        conn.execute(
            "INSERT INTO credit_scores (customer_id, customer_name, credit_score, credit_limit,
                current_exposure, overdue_amount, payment_history_score, order_volume_score,
                risk_level, hold_active, hold_reason, last_calculated, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)
             ON CONFLICT(customer_id) DO UPDATE SET
                customer_name = excluded.customer_name,
                credit_score = excluded.credit_score,
                credit_limit = excluded.credit_limit,
                current_exposure = excluded.current_exposure,
                overdue_amount = excluded.overdue_amount,
                payment_history_score = excluded.payment_history_score,
                order_volume_score = excluded.order_volume_score,
                risk_level = excluded.risk_level,
                hold_active = excluded.hold_active,
                hold_reason = excluded.hold_reason,
                last_calculated = excluded.last_calculated",
            params![
                score.customer_id,
                score.customer_name,
                score.credit_score,
                score.credit_limit,
                score.current_exposure,
                score.overdue_amount,
                score.payment_history_score,
                score.order_volume_score,
                score.risk_level,
                score.hold_active as i64,
                score.hold_reason,
                now,
            ],
        )?;
        let id: i64 = conn.query_row(
            "SELECT id FROM credit_scores WHERE customer_id = ?1",
            [score.customer_id],
            |r| r.get(0),
        )?;
        Ok(id)
    }

    pub async fn get_credit_score(&self, customer_id: i64) -> StoreResult<Option<CreditScoreRecord>> {
        let conn = self.conn.lock().await;
        Ok(conn
            .query_row(
                "SELECT * FROM credit_scores WHERE customer_id = ?1",
                [customer_id],
                credit_from_row,
            )
            .optional()?)
    }

    pub async fn active_holds(&self) -> StoreResult<Vec<CreditScoreRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare("SELECT * FROM credit_scores WHERE hold_active = 1 ORDER BY customer_id")?;
        let rows = stmt.query_map([], credit_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // -----------------------------------------------------------------
    // Cash forecasts
    // -----------------------------------------------------------------

    pub async fn insert_forecast(&self, f: &CashForecast) -> StoreResult<i64> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO cash_forecasts (forecast_date, target_date, predicted_balance,
                confidence_low, confidence_high, ar_expected, ap_expected, pipeline_expected,
                recurring_expected, model_version, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                f.forecast_date.to_string(),
                f.target_date.to_string(),
                f.predicted_balance,
                f.confidence_low,
                f.confidence_high,
                f.ar_expected,
                f.ap_expected,
                f.pipeline_expected,
                f.recurring_expected,
                f.model_version,
                ts(Utc::now()),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn forecasts_for_target(&self, target: NaiveDate) -> StoreResult<Vec<CashForecast>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT * FROM cash_forecasts WHERE target_date = ?1 ORDER BY forecast_date DESC",
        )?;
        let rows = stmt.query_map([target.to_string()], forecast_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub async fn insert_scenario(&self, s: &ForecastScenario) -> StoreResult<i64> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO forecast_scenarios (name, description, adjustments, base_forecast_id,
                result_data, created_by, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                s.name,
                s.description,
                s.adjustments.to_string(),
                s.base_forecast_id,
                s.result_data.to_string(),
                s.created_by,
                ts(Utc::now()),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn log_forecast_accuracy(&self, entry: &ForecastAccuracyEntry) -> StoreResult<i64> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO forecast_accuracy_log (forecast_id, target_date, predicted_balance,
                actual_balance, error_pct, logged_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                entry.forecast_id,
                entry.target_date.to_string(),
                entry.predicted_balance,
                entry.actual_balance,
                entry.error_pct,
                ts(Utc::now()),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn accuracy_entries_since(
        &self,
        cutoff: NaiveDate,
    ) -> StoreResult<Vec<ForecastAccuracyEntry>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT * FROM forecast_accuracy_log WHERE target_date >= ?1 ORDER BY target_date",
        )?;
        let rows = stmt.query_map([cutoff.to_string()], |row| {
            Ok(ForecastAccuracyEntry {
                id: row.get("id")?,
                forecast_id: row.get("forecast_id")?,
                target_date: parse_date(&row.get::<_, String>("target_date")?),
                predicted_balance: row.get("predicted_balance")?,
                actual_balance: row.get("actual_balance")?,
                error_pct: row.get("error_pct")?,
                logged_at: parse_ts(&row.get::<_, String>("logged_at")?),
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // -----------------------------------------------------------------
    // Daily digests
    // -----------------------------------------------------------------

    pub async fn insert_digest(
        &self,
        role: &str,
        digest_date: NaiveDate,
        content: &Value,
    ) -> StoreResult<i64> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO daily_digests (user_role, digest_date, content, generated_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![role, digest_date.to_string(), content.to_string(), ts(Utc::now())],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn mark_digest_delivered(&self, id: i64, channels: &[String]) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE daily_digests SET delivered = 1, channels_sent = ?2 WHERE id = ?1",
            params![id, serde_json::to_string(channels)?],
        )?;
        Ok(())
    }

    pub async fn digest_for(
        &self,
        role: &str,
        digest_date: NaiveDate,
    ) -> StoreResult<Option<DailyDigestRecord>> {
        let conn = self.conn.lock().await;
        Ok(conn
            .query_row(
                "SELECT * FROM daily_digests WHERE user_role = ?1 AND digest_date = ?2
                 ORDER BY id DESC LIMIT 1",
                params![role, digest_date.to_string()],
                digest_from_row,
            )
            .optional()?)
    }

    // -----------------------------------------------------------------
    // Report jobs
    // -----------------------------------------------------------------

    pub async fn create_report_job(&self, request_text: &str, requested_by: &str) -> StoreResult<i64> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO report_jobs (request_text, requested_by, status, created_at)
             VALUES (?1, ?2, 'pending', ?3)",
            params![request_text, requested_by, ts(Utc::now())],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn complete_report_job(
        &self,
        id: i64,
        parsed_query: &Value,
        result_data: &Value,
        error: Option<&str>,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        let status = if error.is_some() { "error" } else { "completed" };
        conn.execute(
            "UPDATE report_jobs SET parsed_query = ?2, result_data = ?3, status = ?4,
                error_message = ?5, completed_at = ?6
             WHERE id = ?1",
            params![
                id,
                parsed_query.to_string(),
                result_data.to_string(),
                status,
                error,
                ts(Utc::now()),
            ],
        )?;
        Ok(())
    }

    pub async fn get_report_job(&self, id: i64) -> StoreResult<ReportJobRecord> {
        let conn = self.conn.lock().await;
        conn.query_row("SELECT * FROM report_jobs WHERE id = ?1", [id], report_from_row)
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("report job {id}")))
    }

    // -----------------------------------------------------------------
    // Month-end closings
    // -----------------------------------------------------------------

    /// Unique per period; starting twice returns the existing closing id.
    pub async fn create_closing(&self, period: &str, started_by: &str) -> StoreResult<(i64, bool)> {
        let conn = self.conn.lock().await;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO month_end_closings (period, started_at, started_by)
             VALUES (?1, ?2, ?3)",
            params![period, ts(Utc::now()), started_by],
        )?;
        let id: i64 = conn.query_row(
            "SELECT id FROM month_end_closings WHERE period = ?1",
            [period],
            |r| r.get(0),
        )?;
        Ok((id, inserted > 0))
    }

    pub async fn closing_for_period(&self, period: &str) -> StoreResult<Option<MonthEndClosing>> {
        let conn = self.conn.lock().await;
        Ok(conn
            .query_row(
                "SELECT * FROM month_end_closings WHERE period = ?1",
                [period],
                closing_from_row,
            )
            .optional()?)
    }

    pub async fn update_closing(
        &self,
        id: i64,
        status: &str,
        issues_found: &Value,
        summary: Option<&str>,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        let completed_at = if status == "completed" {
            Some(ts(Utc::now()))
        } else {
            None
        };
        conn.execute(
            "UPDATE month_end_closings SET status = ?2, issues_found = ?3,
                summary = COALESCE(?4, summary), completed_at = COALESCE(?5, completed_at)
             WHERE id = ?1",
            params![id, status, issues_found.to_string(), summary, completed_at],
        )?;
        Ok(())
    }

    pub async fn add_closing_step(
        &self,
        closing_id: i64,
        step_name: &str,
        step_order: i64,
        status: &str,
        check_result: &Value,
        items_found: i64,
    ) -> StoreResult<i64> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO closing_steps (closing_id, step_name, step_order, status,
                check_result, items_found, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                closing_id,
                step_name,
                step_order,
                status,
                check_result.to_string(),
                items_found,
                if status == "completed" { Some(ts(Utc::now())) } else { None },
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn steps_for_closing(&self, closing_id: i64) -> StoreResult<Vec<ClosingStep>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT * FROM closing_steps WHERE closing_id = ?1 ORDER BY step_order",
        )?;
        let rows = stmt.query_map([closing_id], |row| {
            Ok(ClosingStep {
                id: row.get("id")?,
                closing_id: row.get("closing_id")?,
                step_name: row.get("step_name")?,
                step_order: row.get("step_order")?,
                status: row.get("status")?,
                check_result: json_or_default(row.get("check_result")?),
                items_found: row.get("items_found")?,
                items_resolved: row.get("items_resolved")?,
                completed_at: parse_ts_opt(row.get("completed_at")?),
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // -----------------------------------------------------------------
    // Document jobs
    // -----------------------------------------------------------------

    pub async fn create_document_job(&self, job: NewDocumentJob<'_>) -> StoreResult<i64> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO document_jobs (file_name, file_type, document_type, status, source,
                uploaded_by, created_at)
             VALUES (?1, ?2, ?3, 'queued', ?4, ?5, ?6)",
            params![
                job.file_name,
                job.file_type,
                job.document_type,
                job.source,
                job.uploaded_by,
                ts(Utc::now()),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn finish_document_job(
        &self,
        id: i64,
        status: &str,
        extraction_result: &Value,
        overall_confidence: f64,
        field_confidences: &Value,
        matched_po_id: Option<i64>,
        matched_vendor_id: Option<i64>,
        erp_record_created: Option<i64>,
        erp_model_created: Option<&str>,
        error: Option<&str>,
        processing_time_ms: i64,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE document_jobs SET status = ?2, extraction_result = ?3,
                overall_confidence = ?4, field_confidences = ?5, matched_po_id = ?6,
                matched_vendor_id = ?7, erp_record_created = ?8, erp_model_created = ?9,
                error_message = ?10, processing_time_ms = ?11, completed_at = ?12
             WHERE id = ?1",
            params![
                id,
                status,
                extraction_result.to_string(),
                overall_confidence,
                field_confidences.to_string(),
                matched_po_id,
                matched_vendor_id,
                erp_record_created,
                erp_model_created,
                error,
                processing_time_ms,
                ts(Utc::now()),
            ],
        )?;
        Ok(())
    }

    pub async fn get_document_job(&self, id: i64) -> StoreResult<DocumentJob> {
        let conn = self.conn.lock().await;
        conn.query_row("SELECT * FROM document_jobs WHERE id = ?1", [id], doc_from_row)
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("document job {id}")))
    }

    pub async fn add_correction(
        &self,
        job_id: i64,
        field_name: &str,
        original_value: &str,
        corrected_value: &str,
        corrected_by: &str,
    ) -> StoreResult<i64> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO extraction_corrections (job_id, field_name, original_value,
                corrected_value, corrected_by, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                job_id,
                field_name,
                original_value,
                corrected_value,
                corrected_by,
                ts(Utc::now()),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Recent corrections across jobs, newest first; used to bias future
    /// extractions toward operator-corrected values.
    pub async fn recent_corrections(&self, limit: usize) -> StoreResult<Vec<ExtractionCorrection>> {
        let conn = self.conn.lock().await;
        let limit = if limit == 0 { 100 } else { limit };
        let mut stmt = conn.prepare(&format!(
            "SELECT * FROM extraction_corrections ORDER BY id DESC LIMIT {limit}"
        ))?;
        let rows = stmt.query_map([], |row| {
            Ok(ExtractionCorrection {
                id: row.get("id")?,
                job_id: row.get("job_id")?,
                field_name: row.get("field_name")?,
                original_value: row.get("original_value")?,
                corrected_value: row.get("corrected_value")?,
                corrected_by: row.get("corrected_by")?,
                created_at: parse_ts(&row.get::<_, String>("created_at")?),
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // -----------------------------------------------------------------
    // Supplier risk
    // -----------------------------------------------------------------

    pub async fn insert_risk_score(&self, new: NewRiskScore<'_>) -> StoreResult<i64> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO supplier_risk_scores (vendor_id, vendor_name, score, previous_score,
                classification, summary, scored_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                new.vendor_id,
                new.vendor_name,
                new.score,
                new.previous_score,
                new.classification.as_str(),
                new.summary,
                ts(Utc::now()),
            ],
        )?;
        let score_id = tx.last_insert_rowid();
        for factor in new.factors {
            tx.execute(
                "INSERT INTO supplier_risk_factors (risk_score_id, factor_name, weight,
                    raw_value, weighted_score)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    score_id,
                    factor.factor_name,
                    factor.weight,
                    factor.raw_value,
                    factor.weighted_score,
                ],
            )?;
        }
        tx.commit()?;
        Ok(score_id)
    }

    pub async fn latest_risk_score(&self, vendor_id: i64) -> StoreResult<Option<SupplierRiskScore>> {
        let conn = self.conn.lock().await;
        Ok(conn
            .query_row(
                "SELECT * FROM supplier_risk_scores WHERE vendor_id = ?1
                 ORDER BY scored_at DESC, id DESC LIMIT 1",
                [vendor_id],
                risk_from_row,
            )
            .optional()?)
    }

    pub async fn factors_for_score(&self, score_id: i64) -> StoreResult<Vec<SupplierRiskFactor>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT * FROM supplier_risk_factors WHERE risk_score_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map([score_id], |row| {
            Ok(SupplierRiskFactor {
                id: row.get("id")?,
                risk_score_id: row.get("risk_score_id")?,
                factor_name: row.get("factor_name")?,
                weight: row.get("weight")?,
                raw_value: row.get("raw_value")?,
                weighted_score: row.get("weighted_score")?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub async fn insert_prediction(&self, p: &DisruptionPrediction) -> StoreResult<i64> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO disruption_predictions (vendor_id, vendor_name, prediction_type,
                probability, estimated_impact, recommended_actions, is_active, created_at,
                expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, ?8)",
            params![
                p.vendor_id,
                p.vendor_name,
                p.prediction_type,
                p.probability,
                p.estimated_impact.to_string(),
                serde_json::to_string(&p.recommended_actions)?,
                ts(Utc::now()),
                p.expires_at.map(ts),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn insert_alert(&self, a: &SupplyChainAlert) -> StoreResult<i64> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO supply_chain_alerts (vendor_id, vendor_name, alert_type, severity,
                title, message, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                a.vendor_id,
                a.vendor_name,
                a.alert_type,
                a.severity.as_str(),
                a.title,
                a.message,
                ts(Utc::now()),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn open_alerts(&self) -> StoreResult<Vec<SupplyChainAlert>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT * FROM supply_chain_alerts WHERE resolved_at IS NULL ORDER BY id DESC",
        )?;
        let rows = stmt.query_map([], alert_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

#[derive(Debug, Clone)]
pub struct NewDocumentJob<'a> {
    pub file_name: &'a str,
    pub file_type: &'a str,
    pub document_type: &'a str,
    pub source: &'a str,
    pub uploaded_by: &'a str,
}

#[derive(Debug, Clone)]
pub struct NewRiskScore<'a> {
    pub vendor_id: i64,
    pub vendor_name: &'a str,
    pub score: f64,
    pub previous_score: Option<f64>,
    pub classification: RiskClassification,
    pub summary: &'a str,
    pub factors: Vec<SupplierRiskFactor>,
}

// ---------------------------------------------------------------------------
// Row mappers
// ---------------------------------------------------------------------------

fn scan_from_row(row: &Row<'_>) -> rusqlite::Result<DeduplicationScan> {
    Ok(DeduplicationScan {
        id: row.get("id")?,
        scan_type: row.get("scan_type")?,
        status: row.get("status")?,
        total_records: row.get("total_records")?,
        duplicates_found: row.get("duplicates_found")?,
        auto_merged: row.get("auto_merged")?,
        pending_review: row.get("pending_review")?,
        started_at: parse_ts(&row.get::<_, String>("started_at")?),
        completed_at: parse_ts_opt(row.get("completed_at")?),
    })
}

fn group_from_row(row: &Row<'_>) -> rusqlite::Result<DuplicateGroup> {
    let status: String = row.get("status")?;
    let record_ids: String = row.get("record_ids")?;
    let match_fields: String = row.get("match_fields")?;
    Ok(DuplicateGroup {
        id: row.get("id")?,
        scan_id: row.get("scan_id")?,
        model: row.get("model")?,
        record_ids: serde_json::from_str(&record_ids).unwrap_or_default(),
        master_record_id: row.get("master_record_id")?,
        similarity_score: row.get("similarity_score")?,
        match_fields: serde_json::from_str(&match_fields).unwrap_or_default(),
        status: GroupResolution::parse(&status).unwrap_or(GroupResolution::Pending),
        resolved_at: parse_ts_opt(row.get("resolved_at")?),
        resolved_by: row.get("resolved_by")?,
    })
}

fn credit_from_row(row: &Row<'_>) -> rusqlite::Result<CreditScoreRecord> {
    Ok(CreditScoreRecord {
        id: row.get("id")?,
        customer_id: row.get("customer_id")?,
        customer_name: row.get("customer_name")?,
        credit_score: row.get("credit_score")?,
        credit_limit: row.get("credit_limit")?,
        current_exposure: row.get("current_exposure")?,
        overdue_amount: row.get("overdue_amount")?,
        payment_history_score: row.get("payment_history_score")?,
        order_volume_score: row.get("order_volume_score")?,
        risk_level: row.get("risk_level")?,
        hold_active: row.get::<_, i64>("hold_active")? != 0,
        hold_reason: row.get("hold_reason")?,
        last_calculated: parse_ts(&row.get::<_, String>("last_calculated")?),
        created_at: parse_ts(&row.get::<_, String>("created_at")?),
    })
}

fn forecast_from_row(row: &Row<'_>) -> rusqlite::Result<CashForecast> {
    Ok(CashForecast {
        id: row.get("id")?,
        forecast_date: parse_date(&row.get::<_, String>("forecast_date")?),
        target_date: parse_date(&row.get::<_, String>("target_date")?),
        predicted_balance: row.get("predicted_balance")?,
        confidence_low: row.get("confidence_low")?,
        confidence_high: row.get("confidence_high")?,
        ar_expected: row.get("ar_expected")?,
        ap_expected: row.get("ap_expected")?,
        pipeline_expected: row.get("pipeline_expected")?,
        recurring_expected: row.get("recurring_expected")?,
        model_version: row.get("model_version")?,
        created_at: parse_ts(&row.get::<_, String>("created_at")?),
    })
}

fn digest_from_row(row: &Row<'_>) -> rusqlite::Result<DailyDigestRecord> {
    let channels: String = row.get("channels_sent")?;
    Ok(DailyDigestRecord {
        id: row.get("id")?,
        user_role: row.get("user_role")?,
        digest_date: parse_date(&row.get::<_, String>("digest_date")?),
        content: json_or_default(row.get("content")?),
        channels_sent: serde_json::from_str(&channels).unwrap_or_default(),
        delivered: row.get::<_, i64>("delivered")? != 0,
        generated_at: parse_ts(&row.get::<_, String>("generated_at")?),
    })
}

fn report_from_row(row: &Row<'_>) -> rusqlite::Result<ReportJobRecord> {
    Ok(ReportJobRecord {
        id: row.get("id")?,
        request_text: row.get("request_text")?,
        parsed_query: json_or_default(row.get("parsed_query")?),
        result_data: json_or_default(row.get("result_data")?),
        format: row.get("format")?,
        requested_by: row.get("requested_by")?,
        status: row.get("status")?,
        error_message: row.get("error_message")?,
        created_at: parse_ts(&row.get::<_, String>("created_at")?),
        completed_at: parse_ts_opt(row.get("completed_at")?),
    })
}

fn closing_from_row(row: &Row<'_>) -> rusqlite::Result<MonthEndClosing> {
    Ok(MonthEndClosing {
        id: row.get("id")?,
        period: row.get("period")?,
        status: row.get("status")?,
        started_at: parse_ts(&row.get::<_, String>("started_at")?),
        completed_at: parse_ts_opt(row.get("completed_at")?),
        started_by: row.get("started_by")?,
        issues_found: json_or_default(row.get("issues_found")?),
        summary: row.get("summary")?,
    })
}

fn doc_from_row(row: &Row<'_>) -> rusqlite::Result<DocumentJob> {
    Ok(DocumentJob {
        id: row.get("id")?,
        file_name: row.get("file_name")?,
        file_type: row.get("file_type")?,
        document_type: row.get("document_type")?,
        status: row.get("status")?,
        source: row.get("source")?,
        uploaded_by: row.get("uploaded_by")?,
        extraction_result: json_or_default(row.get("extraction_result")?),
        matched_po_id: row.get("matched_po_id")?,
        matched_vendor_id: row.get("matched_vendor_id")?,
        overall_confidence: row.get("overall_confidence")?,
        field_confidences: json_or_default(row.get("field_confidences")?),
        erp_record_created: row.get("erp_record_created")?,
        erp_model_created: row.get("erp_model_created")?,
        error_message: row.get("error_message")?,
        processing_time_ms: row.get("processing_time_ms")?,
        created_at: parse_ts(&row.get::<_, String>("created_at")?),
        completed_at: parse_ts_opt(row.get("completed_at")?),
    })
}

fn risk_from_row(row: &Row<'_>) -> rusqlite::Result<SupplierRiskScore> {
    let classification: String = row.get("classification")?;
    Ok(SupplierRiskScore {
        id: row.get("id")?,
        vendor_id: row.get("vendor_id")?,
        vendor_name: row.get("vendor_name")?,
        score: row.get("score")?,
        previous_score: row.get("previous_score")?,
        classification: RiskClassification::parse(&classification)
            .unwrap_or(RiskClassification::Watch),
        summary: row.get("summary")?,
        scored_at: parse_ts(&row.get::<_, String>("scored_at")?),
    })
}

fn alert_from_row(row: &Row<'_>) -> rusqlite::Result<SupplyChainAlert> {
    let severity: String = row.get("severity")?;
    Ok(SupplyChainAlert {
        id: row.get("id")?,
        vendor_id: row.get("vendor_id")?,
        vendor_name: row.get("vendor_name")?,
        alert_type: row.get("alert_type")?,
        severity: AlertSeverity::parse(&severity).unwrap_or(AlertSeverity::Medium),
        title: row.get("title")?,
        message: row.get("message")?,
        acknowledged_by: row.get("acknowledged_by")?,
        acknowledged_at: parse_ts_opt(row.get("acknowledged_at")?),
        resolved_at: parse_ts_opt(row.get("resolved_at")?),
        created_at: parse_ts(&row.get::<_, String>("created_at")?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn recon_remaining_is_derived() {
        let store = Store::in_memory().await.unwrap();
        let id = store
            .create_recon_session("admin", 7, 10, &json!([]))
            .await
            .unwrap();

        let s = store.bump_recon_counters(id, 3, 0, 0).await.unwrap();
        assert_eq!(s.remaining, 7);
        let s = store.bump_recon_counters(id, 0, 2, 1).await.unwrap();
        assert_eq!(s.remaining, 4);
        assert_eq!(s.remaining, s.derived_remaining());
        assert_eq!(s.total_lines, 10);
    }

    #[tokio::test]
    async fn recon_counters_require_active_session() {
        let store = Store::in_memory().await.unwrap();
        let id = store
            .create_recon_session("admin", 7, 2, &json!([]))
            .await
            .unwrap();
        store
            .complete_recon_session(id, ReconciliationStatus::Completed)
            .await
            .unwrap();
        assert!(store.bump_recon_counters(id, 1, 0, 0).await.is_err());
    }

    #[tokio::test]
    async fn learned_rules_flow_to_next_session() {
        let store = Store::in_memory().await.unwrap();
        let id = store
            .create_recon_session("admin", 7, 1, &json!([]))
            .await
            .unwrap();
        store
            .append_learned_rule(id, &json!({"bank_ref_pattern": "wire acme"}))
            .await
            .unwrap();
        store
            .complete_recon_session(id, ReconciliationStatus::Completed)
            .await
            .unwrap();

        let rules = store.latest_learned_rules(7).await.unwrap();
        assert_eq!(rules.as_array().unwrap().len(), 1);
        assert!(store
            .latest_learned_rules(99)
            .await
            .unwrap()
            .as_array()
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn group_resolution_is_single_shot() {
        let store = Store::in_memory().await.unwrap();
        let scan_id = store.create_dedup_scan("contacts").await.unwrap();
        let group_id = store
            .insert_duplicate_group(scan_id, "res.partner", &[1, 2], 1, 1.0, &["email".into()])
            .await
            .unwrap();

        let resolved = store
            .resolve_group(group_id, GroupResolution::Merged, "admin", Some(2))
            .await
            .unwrap();
        assert_eq!(resolved.status, GroupResolution::Merged);
        assert_eq!(resolved.master_record_id, 2);

        let again = store
            .resolve_group(group_id, GroupResolution::Merged, "admin", None)
            .await;
        assert!(matches!(again, Err(StoreError::Invariant(_))));
    }

    #[tokio::test]
    async fn credit_scores_unique_per_customer() {
        let store = Store::in_memory().await.unwrap();
        let mut score = CreditScoreRecord {
            id: 0,
            customer_id: 42,
            customer_name: "Acme".to_string(),
            credit_score: 71.0,
            credit_limit: 50_000.0,
            current_exposure: 48_000.0,
            overdue_amount: 0.0,
            payment_history_score: 80.0,
            order_volume_score: 55.0,
            risk_level: "normal".to_string(),
            hold_active: false,
            hold_reason: None,
            last_calculated: Utc::now(),
            created_at: Utc::now(),
        };
        let id1 = store.upsert_credit_score(&score).await.unwrap();
        score.credit_score = 65.0;
        score.hold_active = true;
        score.hold_reason = Some("exposure over limit".to_string());
        let id2 = store.upsert_credit_score(&score).await.unwrap();
        assert_eq!(id1, id2);

        let loaded = store.get_credit_score(42).await.unwrap().unwrap();
        assert_eq!(loaded.credit_score, 65.0);
        assert_eq!(store.active_holds().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn closing_is_unique_per_period() {
        let store = Store::in_memory().await.unwrap();
        let (id1, fresh1) = store.create_closing("2026-02", "controller").await.unwrap();
        let (id2, fresh2) = store.create_closing("2026-02", "controller").await.unwrap();
        assert_eq!(id1, id2);
        assert!(fresh1);
        assert!(!fresh2);
    }
}
