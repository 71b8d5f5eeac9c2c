use anyhow::Result;
use rusqlite::params;

use super::catalog::bad_column;
use super::types::{ExecutionRecord, ExecutionStatus};
use super::{Store, now_rfc3339, parse_rfc3339};

/// Terminal outcome of an execution, as persisted by `finalize_execution`.
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    Completed { output: serde_json::Value },
    Failed { error: String },
}

pub struct NewExecution {
    pub id: String,
    pub agent_id: String,
    pub user_id: String,
    pub account_id: Option<String>,
    pub input: serde_json::Value,
    pub request_id: String,
}

/// Execution tracker. The dispatcher exclusively owns status writes; the
/// state machine is pending -> running -> {completed | failed}, and a
/// terminal row is immutable: a second finalize affects zero rows and is
/// reported as false (the AlreadyFinalized condition, which callers treat as
/// an idempotent no-op).
impl Store {
    pub async fn create_execution(&self, new_execution: NewExecution) -> Result<ExecutionRecord> {
        let started_at = now_rfc3339();
        let db = self.db().lock().await;
        db.execute(
            "INSERT INTO executions (id, agent_id, user_id, account_id, input, status, started_at, request_id)
             VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?7)",
            params![
                new_execution.id,
                new_execution.agent_id,
                new_execution.user_id,
                new_execution.account_id,
                new_execution.input.to_string(),
                started_at,
                new_execution.request_id,
            ],
        )?;
        Ok(ExecutionRecord {
            id: new_execution.id,
            agent_id: new_execution.agent_id,
            user_id: new_execution.user_id,
            account_id: new_execution.account_id,
            input: new_execution.input,
            status: ExecutionStatus::Pending,
            output: None,
            error: None,
            started_at,
            finished_at: None,
            duration_ms: None,
            credits_charged: 0,
            request_id: new_execution.request_id,
        })
    }

    pub async fn mark_execution_running(&self, execution_id: &str) -> Result<bool> {
        let db = self.db().lock().await;
        let updated = db.execute(
            "UPDATE executions SET status = 'running' WHERE id = ?1 AND status = 'pending'",
            params![execution_id],
        )?;
        Ok(updated > 0)
    }

    /// Transitions to a terminal state exactly once. Returns false if the
    /// execution was already finalized; the row is left untouched in that
    /// case.
    pub async fn finalize_execution(
        &self,
        execution_id: &str,
        outcome: &ExecutionOutcome,
        credits_charged: i64,
    ) -> Result<bool> {
        let finished_at = now_rfc3339();
        let db = self.db().lock().await;

        let started_at: Option<String> = db
            .query_row(
                "SELECT started_at FROM executions WHERE id = ?1",
                params![execution_id],
                |row| row.get(0),
            )
            .ok();
        let duration_ms = started_at
            .as_deref()
            .and_then(parse_rfc3339)
            .and_then(|started| {
                parse_rfc3339(&finished_at).map(|finished| (finished - started).num_milliseconds())
            });

        let (status, output, error) = match outcome {
            ExecutionOutcome::Completed { output } => {
                (ExecutionStatus::Completed, Some(output.to_string()), None)
            }
            ExecutionOutcome::Failed { error } => {
                (ExecutionStatus::Failed, None, Some(error.as_str()))
            }
        };

        let updated = db.execute(
            "UPDATE executions
             SET status = ?1, output = ?2, error = ?3, finished_at = ?4, duration_ms = ?5, credits_charged = ?6
             WHERE id = ?7 AND status IN ('pending', 'running')",
            params![
                status.as_str(),
                output,
                error,
                finished_at,
                duration_ms,
                credits_charged,
                execution_id,
            ],
        )?;
        Ok(updated > 0)
    }

    pub async fn get_execution(&self, execution_id: &str) -> Result<Option<ExecutionRecord>> {
        let db = self.db().lock().await;
        let mut stmt = db.prepare(
            "SELECT id, agent_id, user_id, account_id, input, status, output, error,
                    started_at, finished_at, duration_ms, credits_charged, request_id
             FROM executions WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map(params![execution_id], execution_from_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    pub async fn executions_for_user(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>> {
        let db = self.db().lock().await;
        let mut stmt = db.prepare(
            "SELECT id, agent_id, user_id, account_id, input, status, output, error,
                    started_at, finished_at, duration_ms, credits_charged, request_id
             FROM executions WHERE user_id = ?1 ORDER BY started_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![user_id, limit as i64], execution_from_row)?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub async fn executions_for_agent(
        &self,
        agent_id: &str,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>> {
        let db = self.db().lock().await;
        let mut stmt = db.prepare(
            "SELECT id, agent_id, user_id, account_id, input, status, output, error,
                    started_at, finished_at, duration_ms, credits_charged, request_id
             FROM executions WHERE agent_id = ?1 ORDER BY started_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![agent_id, limit as i64], execution_from_row)?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }
}

fn execution_from_row(row: &rusqlite::Row) -> rusqlite::Result<ExecutionRecord> {
    let status_raw: String = row.get(5)?;
    let status = ExecutionStatus::from_status(&status_raw)
        .ok_or_else(|| bad_column(5, format!("unknown execution status '{status_raw}'")))?;
    let input_raw: String = row.get(4)?;
    let input = serde_json::from_str(&input_raw)
        .map_err(|e| bad_column(4, format!("input is not valid JSON: {e}")))?;
    let output_raw: Option<String> = row.get(6)?;
    let output = match output_raw {
        Some(o) => Some(
            serde_json::from_str(&o)
                .map_err(|e| bad_column(6, format!("output is not valid JSON: {e}")))?,
        ),
        None => None,
    };
    Ok(ExecutionRecord {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        user_id: row.get(2)?,
        account_id: row.get(3)?,
        input,
        status,
        output,
        error: row.get(7)?,
        started_at: row.get(8)?,
        finished_at: row.get(9)?,
        duration_ms: row.get(10)?,
        credits_charged: row.get(11)?,
        request_id: row.get(12)?,
    })
}
