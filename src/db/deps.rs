//! Dependency edges and cycle detection.

use super::Database;
use crate::error::Error;
use anyhow::Result;
use rusqlite::{Connection, params};
use std::collections::{HashMap, HashSet, VecDeque};

/// Load `task_id -> [depends_on]` for one task or for all tasks.
pub(crate) fn load_dependency_map(
    conn: &Connection,
    task_id: Option<&str>,
) -> Result<HashMap<String, Vec<String>>> {
    let mut map: HashMap<String, Vec<String>> = HashMap::new();
    let mut push = |row: &rusqlite::Row| -> rusqlite::Result<()> {
        let task: String = row.get(0)?;
        let dep: String = row.get(1)?;
        map.entry(task).or_default().push(dep);
        Ok(())
    };

    match task_id {
        Some(id) => {
            let mut stmt = conn.prepare(
                "SELECT task_id, depends_on FROM task_dependencies
                 WHERE task_id = ?1 ORDER BY rowid",
            )?;
            let mut rows = stmt.query(params![id])?;
            while let Some(row) = rows.next()? {
                push(row)?;
            }
        }
        None => {
            let mut stmt = conn
                .prepare("SELECT task_id, depends_on FROM task_dependencies ORDER BY rowid")?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                push(row)?;
            }
        }
    }

    Ok(map)
}

/// Check whether making `task_id` depend on `depends_on` would close a cycle,
/// i.e. whether `depends_on` already (transitively) depends on `task_id`.
fn would_create_cycle(conn: &Connection, task_id: &str, depends_on: &str) -> Result<bool> {
    if task_id == depends_on {
        return Ok(true);
    }

    let mut stmt = conn.prepare("SELECT depends_on FROM task_dependencies WHERE task_id = ?1")?;
    let mut visited: HashSet<String> = HashSet::new();
    let mut queue: VecDeque<String> = VecDeque::new();
    queue.push_back(depends_on.to_string());

    while let Some(current) = queue.pop_front() {
        if current == task_id {
            return Ok(true);
        }
        if !visited.insert(current.clone()) {
            continue;
        }

        let next: Vec<String> = stmt
            .query_map(params![&current], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        for dep in next {
            if !visited.contains(&dep) {
                queue.push_back(dep);
            }
        }
    }

    Ok(false)
}

fn task_exists(conn: &Connection, task_id: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM tasks WHERE id = ?1",
        params![task_id],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn insert_dependency_internal(conn: &Connection, task_id: &str, depends_on: &str) -> Result<()> {
    if !task_exists(conn, depends_on)? {
        return Err(Error::unknown_dependency(depends_on).into());
    }
    if would_create_cycle(conn, task_id, depends_on)? {
        return Err(Error::dependency_cycle(task_id, depends_on).into());
    }
    conn.execute(
        "INSERT OR IGNORE INTO task_dependencies (task_id, depends_on) VALUES (?1, ?2)",
        params![task_id, depends_on],
    )?;
    Ok(())
}

/// Replace the full dependency set of a task. Returns the deduplicated set.
pub(crate) fn replace_dependencies_internal(
    conn: &Connection,
    task_id: &str,
    depends_on: &[String],
) -> Result<Vec<String>> {
    conn.execute(
        "DELETE FROM task_dependencies WHERE task_id = ?1",
        params![task_id],
    )?;

    let mut seen = HashSet::new();
    let mut kept = Vec::new();
    for dep in depends_on {
        if seen.insert(dep.as_str()) {
            insert_dependency_internal(conn, task_id, dep)?;
            kept.push(dep.clone());
        }
    }
    Ok(kept)
}

impl Database {
    /// Make `task_id` wait for `depends_on`.
    pub fn add_dependency(&self, task_id: &str, depends_on: &str, now: i64) -> Result<()> {
        self.with_conn(|conn| {
            if !task_exists(conn, task_id)? {
                return Err(Error::task_not_found(task_id).into());
            }
            insert_dependency_internal(conn, task_id, depends_on)?;
            conn.execute(
                "UPDATE tasks SET updated_at = ?1 WHERE id = ?2",
                params![now, task_id],
            )?;
            Ok(())
        })
    }

    /// Remove a dependency edge. Returns whether one existed.
    pub fn remove_dependency(&self, task_id: &str, depends_on: &str, now: i64) -> Result<bool> {
        self.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM task_dependencies WHERE task_id = ?1 AND depends_on = ?2",
                params![task_id, depends_on],
            )?;
            if removed > 0 {
                conn.execute(
                    "UPDATE tasks SET updated_at = ?1 WHERE id = ?2",
                    params![now, task_id],
                )?;
            }
            Ok(removed > 0)
        })
    }

    /// Dependencies of a task that are not yet done.
    pub fn get_unfinished_dependencies(&self, task_id: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT d.depends_on FROM task_dependencies d
                 INNER JOIN tasks blocker ON d.depends_on = blocker.id
                 WHERE d.task_id = ?1 AND blocker.status != 'done'
                 ORDER BY d.rowid",
            )?;
            let ids = stmt
                .query_map(params![task_id], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(ids)
        })
    }

    /// Tasks that wait on the given task.
    pub fn get_dependents(&self, task_id: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT task_id FROM task_dependencies WHERE depends_on = ?1 ORDER BY rowid",
            )?;
            let ids = stmt
                .query_map(params![task_id], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(ids)
        })
    }
}
