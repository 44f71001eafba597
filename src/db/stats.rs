//! Aggregation queries for statistics.

use super::Database;
use crate::types::{Priority, TaskStats, TaskStatus};
use anyhow::Result;
use rusqlite::params;
use std::collections::HashMap;

impl Database {
    /// Task counts by status and priority, optionally scoped to a project.
    /// Retry gates are judged against `now`.
    pub fn get_stats(&self, project_id: Option<&str>, now: i64) -> Result<TaskStats> {
        self.with_conn(|conn| {
            let (filter, scope): (&str, Vec<&str>) = match project_id {
                Some(pid) => ("WHERE project_id = ?1", vec![pid]),
                None => ("", vec![]),
            };

            // Every known state is reported, including zero counts
            let mut tasks_by_status: HashMap<String, i64> = TaskStatus::ALL
                .iter()
                .map(|s| (s.as_str().to_string(), 0))
                .collect();
            let mut tasks_by_priority: HashMap<String, i64> = Priority::ALL
                .iter()
                .map(|p| (p.as_str().to_string(), 0))
                .collect();

            let sql = format!("SELECT status, COUNT(*) FROM tasks {filter} GROUP BY status");
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(scope.iter()), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (status, count) = row?;
                *tasks_by_status.entry(status).or_insert(0) += count;
            }

            let sql = format!("SELECT priority, COUNT(*) FROM tasks {filter} GROUP BY priority");
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(scope.iter()), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (priority, count) = row?;
                *tasks_by_priority.entry(priority).or_insert(0) += count;
            }

            let total_tasks = tasks_by_status.values().sum();

            let awaiting_retry: i64 = match project_id {
                Some(pid) => conn.query_row(
                    "SELECT COUNT(*) FROM tasks
                     WHERE status = 'todo' AND next_retry_at > ?1 AND project_id = ?2",
                    params![now, pid],
                    |row| row.get(0),
                )?,
                None => conn.query_row(
                    "SELECT COUNT(*) FROM tasks WHERE status = 'todo' AND next_retry_at > ?1",
                    params![now],
                    |row| row.get(0),
                )?,
            };

            Ok(TaskStats {
                total_tasks,
                tasks_by_status,
                tasks_by_priority,
                awaiting_retry,
            })
        })
    }
}
