// Agent run/step/decision/suspension persistence.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde_json::Value;

use relay_types::{AgentRun, AgentRunStatus, AgentStep, AgentStepStatus, AgentSuspension};

use crate::db::{json_or_default, parse_ts, parse_ts_opt, ts, Store};
use crate::error::{StoreError, StoreResult};

#[derive(Debug, Clone)]
pub struct NewStep {
    pub step_name: String,
    pub step_index: i64,
    pub input_data: Value,
    pub output_data: Value,
    pub status: AgentStepStatus,
    pub tokens_used: i64,
    pub duration_ms: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct NewDecision {
    pub prompt_hash: String,
    pub response: Value,
    pub confidence: f64,
    pub tools_used: Vec<String>,
    pub tokens_input: i64,
    pub tokens_output: i64,
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<AgentRun> {
    let status: String = row.get("status")?;
    Ok(AgentRun {
        id: row.get("id")?,
        agent_type: row.get("agent_type")?,
        trigger_type: row.get("trigger_type")?,
        trigger_id: row.get("trigger_id")?,
        status: AgentRunStatus::parse(&status).unwrap_or(AgentRunStatus::Failed),
        started_at: parse_ts(&row.get::<_, String>("started_at")?),
        completed_at: parse_ts_opt(row.get("completed_at")?),
        total_steps: row.get("total_steps")?,
        token_usage: row.get("token_usage")?,
        initial_state: json_or_default(row.get("initial_state")?),
        final_state: row
            .get::<_, Option<String>>("final_state")?
            .map(json_or_default),
        error: row.get("error")?,
    })
}

fn step_from_row(row: &Row<'_>) -> rusqlite::Result<AgentStep> {
    let status: String = row.get("status")?;
    Ok(AgentStep {
        id: row.get("id")?,
        agent_run_id: row.get("agent_run_id")?,
        step_name: row.get("step_name")?,
        step_index: row.get("step_index")?,
        input_data: json_or_default(row.get("input_data")?),
        output_data: json_or_default(row.get("output_data")?),
        duration_ms: row.get("duration_ms")?,
        status: AgentStepStatus::parse(&status).unwrap_or(AgentStepStatus::Failed),
        tokens_used: row.get("tokens_used")?,
        started_at: parse_ts_opt(row.get("started_at")?),
        completed_at: parse_ts_opt(row.get("completed_at")?),
    })
}

fn suspension_from_row(row: &Row<'_>) -> rusqlite::Result<AgentSuspension> {
    Ok(AgentSuspension {
        id: row.get("id")?,
        agent_run_id: row.get("agent_run_id")?,
        resume_condition: row.get("resume_condition")?,
        resume_data: json_or_default(row.get("resume_data")?),
        suspended_at_step: row.get("suspended_at_step")?,
        timeout_at: parse_ts_opt(row.get("timeout_at")?),
        suspended_at: parse_ts(&row.get::<_, String>("suspended_at")?),
        resumed_at: parse_ts_opt(row.get("resumed_at")?),
    })
}

impl Store {
    pub async fn create_run(
        &self,
        agent_type: &str,
        trigger_type: &str,
        trigger_id: Option<&str>,
        initial_state: &Value,
    ) -> StoreResult<i64> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO agent_runs (agent_type, trigger_type, trigger_id, status,
                started_at, initial_state)
             VALUES (?1, ?2, ?3, 'running', ?4, ?5)",
            params![
                agent_type,
                trigger_type,
                trigger_id,
                ts(Utc::now()),
                initial_state.to_string(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn get_run(&self, run_id: i64) -> StoreResult<AgentRun> {
        let conn = self.conn.lock().await;
        conn.query_row("SELECT * FROM agent_runs WHERE id = ?1", [run_id], run_from_row)
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("agent run {run_id}")))
    }

    pub async fn complete_run(
        &self,
        run_id: i64,
        status: AgentRunStatus,
        total_steps: i64,
        token_usage: i64,
        final_state: &Value,
        error: Option<&str>,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        let completed_at = if status.is_terminal() {
            Some(ts(Utc::now()))
        } else {
            None
        };
        conn.execute(
            "UPDATE agent_runs SET status = ?2, completed_at = ?3, total_steps = ?4,
                token_usage = ?5, final_state = ?6, error = ?7
             WHERE id = ?1",
            params![
                run_id,
                status.as_str(),
                completed_at,
                total_steps,
                token_usage,
                final_state.to_string(),
                error,
            ],
        )?;
        Ok(())
    }

    pub async fn set_run_status(&self, run_id: i64, status: AgentRunStatus) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE agent_runs SET status = ?2 WHERE id = ?1",
            params![run_id, status.as_str()],
        )?;
        Ok(())
    }

    pub async fn append_step(&self, run_id: i64, step: NewStep) -> StoreResult<i64> {
        let conn = self.conn.lock().await;
        let now = ts(Utc::now());
        conn.execute(
            "INSERT INTO agent_steps (agent_run_id, step_name, step_index, input_data,
                output_data, duration_ms, status, tokens_used, started_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
            params![
                run_id,
                step.step_name,
                step.step_index,
                step.input_data.to_string(),
                step.output_data.to_string(),
                step.duration_ms,
                step.status.as_str(),
                step.tokens_used,
                now,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn steps_for_run(&self, run_id: i64) -> StoreResult<Vec<AgentStep>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT * FROM agent_steps WHERE agent_run_id = ?1 ORDER BY step_index",
        )?;
        let rows = stmt.query_map([run_id], step_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub async fn count_steps(&self, run_id: i64) -> StoreResult<i64> {
        let conn = self.conn.lock().await;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM agent_steps WHERE agent_run_id = ?1",
            [run_id],
            |r| r.get(0),
        )?)
    }

    pub async fn append_decision(&self, step_id: i64, decision: NewDecision) -> StoreResult<i64> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO agent_decisions (agent_step_id, prompt_hash, response, confidence,
                tools_used, tokens_input, tokens_output, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                step_id,
                decision.prompt_hash,
                decision.response.to_string(),
                decision.confidence,
                serde_json::to_string(&decision.tools_used)?,
                decision.tokens_input,
                decision.tokens_output,
                ts(Utc::now()),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Persist a suspension row and flip the run to SUSPENDED in one unit.
    pub async fn suspend_run(
        &self,
        run_id: i64,
        resume_condition: &str,
        suspended_at_step: &str,
        timeout_at: Option<DateTime<Utc>>,
        final_state: &Value,
        total_steps: i64,
        token_usage: i64,
    ) -> StoreResult<i64> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE agent_runs SET status = 'suspended', final_state = ?2,
                total_steps = ?3, token_usage = ?4
             WHERE id = ?1",
            params![run_id, final_state.to_string(), total_steps, token_usage],
        )?;
        tx.execute(
            "INSERT INTO agent_suspensions (agent_run_id, resume_condition,
                suspended_at_step, timeout_at, suspended_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                run_id,
                resume_condition,
                suspended_at_step,
                timeout_at.map(ts),
                ts(Utc::now()),
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(id)
    }

    pub async fn open_suspension_for(&self, run_id: i64) -> StoreResult<Option<AgentSuspension>> {
        let conn = self.conn.lock().await;
        Ok(conn
            .query_row(
                "SELECT * FROM agent_suspensions
                 WHERE agent_run_id = ?1 AND resumed_at IS NULL
                 ORDER BY id DESC LIMIT 1",
                [run_id],
                suspension_from_row,
            )
            .optional()?)
    }

    /// Fill resume bookkeeping and flip the run back to RUNNING.
    pub async fn resume_run(&self, run_id: i64, resume_data: &Value) -> StoreResult<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let updated = tx.execute(
            "UPDATE agent_suspensions SET resumed_at = ?2, resume_data = ?3
             WHERE agent_run_id = ?1 AND resumed_at IS NULL",
            params![run_id, ts(Utc::now()), resume_data.to_string()],
        )?;
        if updated == 0 {
            return Err(StoreError::Invariant(format!(
                "run {run_id} has no open suspension"
            )));
        }
        tx.execute(
            "UPDATE agent_runs SET status = 'running' WHERE id = ?1",
            [run_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Open suspensions whose timeout already passed.
    pub async fn expired_suspensions(
        &self,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<AgentSuspension>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT * FROM agent_suspensions
             WHERE resumed_at IS NULL AND timeout_at IS NOT NULL AND timeout_at < ?1",
        )?;
        let rows = stmt.query_map([ts(now)], suspension_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub async fn list_runs(&self, filter: crate::domain::RunFilter) -> StoreResult<Vec<AgentRun>> {
        let conn = self.conn.lock().await;
        let limit = if filter.limit == 0 { 50 } else { filter.limit };
        let mut sql = "SELECT * FROM agent_runs WHERE 1=1".to_string();
        let mut args: Vec<String> = Vec::new();
        if let Some(agent_type) = filter.agent_type {
            sql.push_str(" AND agent_type = ?");
            args.push(agent_type);
        }
        if let Some(status) = filter.status {
            sql.push_str(" AND status = ?");
            args.push(status.as_str().to_string());
        }
        sql.push_str(&format!(" ORDER BY id DESC LIMIT {limit}"));
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), run_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}
