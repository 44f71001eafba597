//! Approval request persistence.

use super::tasks::parse_text_column;
use super::Database;
use crate::types::{ApprovalRequest, ApprovalStatus};
use anyhow::Result;
use rusqlite::{Connection, Row, params};

/// An approval request together with the execution result it is holding back.
#[derive(Debug, Clone)]
pub struct ParkedApproval {
    pub request: ApprovalRequest,
    pub output: Option<String>,
    pub duration_ms: i64,
}

fn parse_approval_row(row: &Row) -> rusqlite::Result<ApprovalRequest> {
    Ok(ApprovalRequest {
        id: row.get("id")?,
        task_id: row.get("task_id")?,
        task_title: row.get("task_title")?,
        action_type: parse_text_column(row, "action_type")?,
        description: row.get("description")?,
        details: row.get("details")?,
        status: parse_text_column(row, "status")?,
        created_at: row.get("created_at")?,
        resolved_at: row.get("resolved_at")?,
        resolution_reason: row.get("resolution_reason")?,
    })
}

fn get_parked_internal(conn: &Connection, request_id: &str) -> Result<Option<ParkedApproval>> {
    let result = conn.query_row(
        "SELECT * FROM approval_requests WHERE id = ?1",
        params![request_id],
        |row| {
            Ok(ParkedApproval {
                request: parse_approval_row(row)?,
                output: row.get("output")?,
                duration_ms: row.get("duration_ms")?,
            })
        },
    );

    match result {
        Ok(parked) => Ok(Some(parked)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

impl Database {
    /// Store a new approval request with the result it parks.
    pub fn insert_approval(
        &self,
        request: &ApprovalRequest,
        output: Option<&str>,
        duration_ms: i64,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO approval_requests (
                    id, task_id, task_title, action_type, description, details,
                    status, created_at, resolved_at, resolution_reason, output, duration_ms
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    request.id,
                    request.task_id,
                    request.task_title,
                    request.action_type.as_str(),
                    request.description,
                    request.details,
                    request.status.as_str(),
                    request.created_at,
                    request.resolved_at,
                    request.resolution_reason,
                    output,
                    duration_ms,
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_approval(&self, request_id: &str) -> Result<Option<ApprovalRequest>> {
        Ok(self.get_parked_approval(request_id)?.map(|p| p.request))
    }

    pub fn get_parked_approval(&self, request_id: &str) -> Result<Option<ParkedApproval>> {
        self.with_conn(|conn| get_parked_internal(conn, request_id))
    }

    /// List approval requests, oldest first, optionally filtered by status.
    pub fn list_approvals(&self, status: Option<ApprovalStatus>) -> Result<Vec<ApprovalRequest>> {
        self.with_conn(|conn| {
            let requests = match status {
                Some(status) => {
                    let mut stmt = conn.prepare(
                        "SELECT * FROM approval_requests WHERE status = ?1
                         ORDER BY created_at, rowid",
                    )?;
                    stmt.query_map(params![status.as_str()], parse_approval_row)?
                        .collect::<rusqlite::Result<Vec<_>>>()?
                }
                None => {
                    let mut stmt =
                        conn.prepare("SELECT * FROM approval_requests ORDER BY created_at, rowid")?;
                    stmt.query_map([], parse_approval_row)?
                        .collect::<rusqlite::Result<Vec<_>>>()?
                }
            };
            Ok(requests)
        })
    }

    /// Move a pending request to approved/rejected.
    /// Returns `None` when the id is unknown or the request was already resolved.
    pub fn resolve_approval(
        &self,
        request_id: &str,
        status: ApprovalStatus,
        reason: Option<&str>,
        now: i64,
    ) -> Result<Option<ParkedApproval>> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE approval_requests
                 SET status = ?1, resolved_at = ?2, resolution_reason = ?3
                 WHERE id = ?4 AND status = 'pending'",
                params![status.as_str(), now, reason, request_id],
            )?;
            if changed == 0 {
                return Ok(None);
            }
            get_parked_internal(conn, request_id)
        })
    }
}
