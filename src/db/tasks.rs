//! Task CRUD operations.

use super::deps::{load_dependency_map, replace_dependencies_internal};
use super::Database;
use crate::error::Error;
use crate::types::{DEFAULT_MAX_RETRIES, Task, TaskInput, TaskPatch, TaskStatus, parse_priority};
use anyhow::Result;
use rusqlite::types::Type;
use rusqlite::{Connection, Row, params};
use std::str::FromStr;
use uuid::Uuid;

/// Stable listing order: creation time, then insertion order for equal timestamps.
const TASK_ORDER: &str = "ORDER BY created_at ASC, rowid ASC";

/// Parse a TEXT column into an enum that implements `FromStr<Err = String>`.
pub(crate) fn parse_text_column<T>(row: &Row, name: &str) -> rusqlite::Result<T>
where
    T: FromStr<Err = String>,
{
    let raw: String = row.get(name)?;
    raw.parse::<T>().map_err(|e| {
        let idx = row.as_ref().column_index(name).unwrap_or_default();
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into())
    })
}

/// Parse a task row. `blocked_by` is filled in separately from the
/// dependency table.
pub fn parse_task_row(row: &Row) -> rusqlite::Result<Task> {
    let priority: String = row.get("priority")?;

    Ok(Task {
        id: row.get("id")?,
        project_id: row.get("project_id")?,
        title: row.get("title")?,
        description: row.get("description")?,
        status: parse_text_column(row, "status")?,
        priority: parse_priority(&priority),
        retry_count: row.get("retry_count")?,
        max_retries: row.get("max_retries")?,
        last_error: row.get("last_error")?,
        last_attempt_at: row.get("last_attempt_at")?,
        next_retry_at: row.get("next_retry_at")?,
        blocked_by: Vec::new(),
        scheduled_at: row.get("scheduled_at")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

/// Internal helper to get a task using an existing connection (avoids deadlock).
pub(crate) fn get_task_internal(conn: &Connection, task_id: &str) -> Result<Option<Task>> {
    let mut stmt = conn.prepare("SELECT * FROM tasks WHERE id = ?1")?;

    let result = stmt.query_row(params![task_id], parse_task_row);

    match result {
        Ok(mut task) => {
            let mut deps = load_dependency_map(conn, Some(task_id))?;
            task.blocked_by = deps.remove(task_id).unwrap_or_default();
            Ok(Some(task))
        }
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Run a task query and attach each task's dependencies.
fn query_tasks(conn: &Connection, sql: &str, param: Option<&str>) -> Result<Vec<Task>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = match param {
        Some(p) => stmt.query_map(params![p], parse_task_row)?,
        None => stmt.query_map([], parse_task_row)?,
    };
    let mut tasks = rows.collect::<rusqlite::Result<Vec<Task>>>()?;

    let mut deps = load_dependency_map(conn, None)?;
    for task in &mut tasks {
        task.blocked_by = deps.remove(&task.id).unwrap_or_default();
    }
    Ok(tasks)
}

fn validate_input(input: &TaskInput) -> Result<()> {
    if input.title.trim().is_empty() {
        return Err(Error::missing_field("title").into());
    }
    if let Some(id) = &input.id {
        if id.trim().is_empty() {
            return Err(Error::invalid_value("id", "id must not be empty").into());
        }
    }
    if matches!(input.max_retries, Some(n) if n < 0) {
        return Err(Error::invalid_value("max_retries", "max_retries must be >= 0").into());
    }
    Ok(())
}

impl Database {
    /// Create a new task in `todo`.
    /// If an id is provided it is used as-is; otherwise a UUID7 is generated.
    pub fn create_task(&self, input: TaskInput, now: i64) -> Result<Task> {
        validate_input(&input)?;

        let task_id = input.id.unwrap_or_else(|| Uuid::now_v7().to_string());
        let priority = input.priority.unwrap_or_default();
        let max_retries = input.max_retries.unwrap_or(DEFAULT_MAX_RETRIES);

        self.with_tx(|tx| {
            if get_task_internal(tx, &task_id)?.is_some() {
                return Err(Error::already_exists(&task_id).into());
            }

            tx.execute(
                "INSERT INTO tasks (
                    id, project_id, title, description, status, priority,
                    retry_count, max_retries, scheduled_at, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?8, ?9, ?10)",
                params![
                    &task_id,
                    &input.project_id,
                    &input.title,
                    &input.description,
                    TaskStatus::Todo.as_str(),
                    priority.as_str(),
                    max_retries,
                    input.scheduled_at,
                    now,
                    now,
                ],
            )?;

            let blocked_by = replace_dependencies_internal(tx, &task_id, &input.blocked_by)?;

            Ok(Task {
                id: task_id,
                project_id: input.project_id,
                title: input.title,
                description: input.description,
                status: TaskStatus::Todo,
                priority,
                retry_count: 0,
                max_retries,
                last_error: None,
                last_attempt_at: None,
                next_retry_at: None,
                blocked_by,
                scheduled_at: input.scheduled_at,
                created_at: now,
                updated_at: now,
            })
        })
    }

    /// Get a task by ID.
    pub fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        self.with_conn(|conn| get_task_internal(conn, task_id))
    }

    /// Apply a partial update. Returns `None` for an unknown id.
    /// Always refreshes `updated_at`.
    pub fn update_task(&self, task_id: &str, patch: TaskPatch, now: i64) -> Result<Option<Task>> {
        if let Some(title) = &patch.title {
            if title.trim().is_empty() {
                return Err(Error::invalid_value("title", "title must not be empty").into());
            }
        }

        self.with_tx(|tx| {
            let Some(task) = get_task_internal(tx, task_id)? else {
                return Ok(None);
            };

            let title = patch.title.unwrap_or(task.title);
            let description = patch.description.unwrap_or(task.description);
            let project_id = patch.project_id.unwrap_or(task.project_id);
            let status = patch.status.unwrap_or(task.status);
            let priority = patch.priority.unwrap_or(task.priority);
            let retry_count = patch.retry_count.unwrap_or(task.retry_count);
            let max_retries = patch.max_retries.unwrap_or(task.max_retries);
            let last_error = patch.last_error.unwrap_or(task.last_error);
            let last_attempt_at = patch.last_attempt_at.unwrap_or(task.last_attempt_at);
            let next_retry_at = patch.next_retry_at.unwrap_or(task.next_retry_at);
            let scheduled_at = patch.scheduled_at.unwrap_or(task.scheduled_at);

            tx.execute(
                "UPDATE tasks SET
                    title = ?1, description = ?2, project_id = ?3, status = ?4,
                    priority = ?5, retry_count = ?6, max_retries = ?7, last_error = ?8,
                    last_attempt_at = ?9, next_retry_at = ?10, scheduled_at = ?11,
                    updated_at = ?12
                 WHERE id = ?13",
                params![
                    title,
                    description,
                    project_id,
                    status.as_str(),
                    priority.as_str(),
                    retry_count,
                    max_retries,
                    last_error,
                    last_attempt_at,
                    next_retry_at,
                    scheduled_at,
                    now,
                    task_id,
                ],
            )?;

            if let Some(blocked_by) = &patch.blocked_by {
                replace_dependencies_internal(tx, task_id, blocked_by)?;
            }

            get_task_internal(tx, task_id)
        })
    }

    /// Delete a task. Dependency edges referencing it go with it.
    pub fn delete_task(&self, task_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let deleted = conn.execute("DELETE FROM tasks WHERE id = ?1", params![task_id])?;
            Ok(deleted > 0)
        })
    }

    /// List all tasks, oldest first.
    pub fn list_tasks(&self) -> Result<Vec<Task>> {
        self.with_conn(|conn| query_tasks(conn, &format!("SELECT * FROM tasks {TASK_ORDER}"), None))
    }

    /// List tasks belonging to a project.
    pub fn list_tasks_by_project(&self, project_id: &str) -> Result<Vec<Task>> {
        self.with_conn(|conn| {
            query_tasks(
                conn,
                &format!("SELECT * FROM tasks WHERE project_id = ?1 {TASK_ORDER}"),
                Some(project_id),
            )
        })
    }

    /// List tasks in a given status.
    pub fn list_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        self.with_conn(|conn| {
            query_tasks(
                conn,
                &format!("SELECT * FROM tasks WHERE status = ?1 {TASK_ORDER}"),
                Some(status.as_str()),
            )
        })
    }

    /// Return tasks stranded in `in_progress` by a previous process to `todo`.
    /// Tasks parked behind a pending approval keep their status.
    pub fn recover_interrupted(&self, now: i64) -> Result<Vec<String>> {
        self.with_tx(|tx| {
            let ids: Vec<String> = {
                let mut stmt = tx.prepare(
                    "SELECT id FROM tasks t
                     WHERE t.status = 'in_progress'
                     AND NOT EXISTS (
                         SELECT 1 FROM approval_requests a
                         WHERE a.task_id = t.id AND a.status = 'pending'
                     )",
                )?;
                stmt.query_map([], |row| row.get(0))?
                    .collect::<rusqlite::Result<Vec<String>>>()?
            };
            for id in &ids {
                tx.execute(
                    "UPDATE tasks SET status = 'todo', updated_at = ?1 WHERE id = ?2",
                    params![now, id],
                )?;
            }
            Ok(ids)
        })
    }
}
