//! Append-only action log.

use super::Database;
use super::tasks::parse_text_column;
use crate::types::ActionLog;
use anyhow::Result;
use rusqlite::{Row, params};

fn parse_action_row(row: &Row) -> rusqlite::Result<ActionLog> {
    Ok(ActionLog {
        task_id: row.get("task_id")?,
        action_type: row.get("action_type")?,
        auto_approved: row.get("auto_approved")?,
        result: parse_text_column(row, "result")?,
        output: row.get("output")?,
        duration_ms: row.get("duration_ms")?,
        timestamp: row.get("timestamp")?,
    })
}

impl Database {
    pub fn append_action_log(&self, entry: &ActionLog) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO action_log (
                    task_id, action_type, auto_approved, result, output, duration_ms, timestamp
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    entry.task_id,
                    entry.action_type,
                    entry.auto_approved,
                    entry.result.as_str(),
                    entry.output,
                    entry.duration_ms,
                    entry.timestamp,
                ],
            )?;
            Ok(())
        })
    }

    /// Most recent entries, returned oldest first.
    pub fn list_action_log(&self, limit: usize) -> Result<Vec<ActionLog>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM (
                    SELECT * FROM action_log ORDER BY id DESC LIMIT ?1
                 ) ORDER BY id ASC",
            )?;
            let entries = stmt
                .query_map(params![limit as i64], parse_action_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(entries)
        })
    }

    pub fn action_log_for_task(&self, task_id: &str) -> Result<Vec<ActionLog>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT * FROM action_log WHERE task_id = ?1 ORDER BY id ASC")?;
            let entries = stmt
                .query_map(params![task_id], parse_action_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(entries)
        })
    }
}
