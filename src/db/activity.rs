//! Activity trail storage.

use super::Database;
use crate::activity::ActivitySink;
use crate::clock::now_ms;
use anyhow::Result;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// A stored activity entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub id: i64,
    pub category: String,
    pub action: String,
    pub details: Value,
    pub context: Option<String>,
    pub timestamp: i64,
}

impl Database {
    pub fn append_activity(
        &self,
        category: &str,
        action: &str,
        details: &Value,
        context: Option<&str>,
    ) -> Result<()> {
        let details = serde_json::to_string(details)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO activity_log (category, action, details, context, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![category, action, details, context, now_ms()],
            )?;
            Ok(())
        })
    }

    /// Most recent activity, newest first, optionally filtered by category.
    pub fn list_activity(&self, category: Option<&str>, limit: usize) -> Result<Vec<ActivityEntry>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, category, action, details, context, timestamp FROM activity_log
                 WHERE (?1 IS NULL OR category = ?1)
                 ORDER BY id DESC LIMIT ?2",
            )?;
            let entries = stmt
                .query_map(params![category, limit as i64], |row| {
                    let details: Option<String> = row.get(3)?;
                    Ok(ActivityEntry {
                        id: row.get(0)?,
                        category: row.get(1)?,
                        action: row.get(2)?,
                        details: details
                            .and_then(|s| serde_json::from_str(&s).ok())
                            .unwrap_or(Value::Null),
                        context: row.get(4)?,
                        timestamp: row.get(5)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(entries)
        })
    }
}

impl ActivitySink for Database {
    fn append(&self, category: &str, action: &str, details: Value, context: Option<&str>) {
        if let Err(e) = self.append_activity(category, action, &details, context) {
            warn!(category, action, error = %e, "Failed to record activity");
        }
    }
}
