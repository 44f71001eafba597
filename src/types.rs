//! Core types for the task controller.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Default number of attempts before a task is marked failed.
pub const DEFAULT_MAX_RETRIES: i32 = 3;

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Todo,
    InProgress,
    Done,
    Failed,
    Blocked,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Todo,
        TaskStatus::InProgress,
        TaskStatus::Done,
        TaskStatus::Failed,
        TaskStatus::Blocked,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Todo => "todo",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
            TaskStatus::Blocked => "blocked",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "todo" => Ok(TaskStatus::Todo),
            "in_progress" => Ok(TaskStatus::InProgress),
            "done" => Ok(TaskStatus::Done),
            "failed" => Ok(TaskStatus::Failed),
            "blocked" => Ok(TaskStatus::Blocked),
            other => Err(format!("unknown task status: {}", other)),
        }
    }
}

/// Task priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl Priority {
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Medium, Priority::Low];

    /// Sort rank: lower runs first.
    pub fn rank(&self) -> u8 {
        match self {
            Priority::High => 0,
            Priority::Medium => 1,
            Priority::Low => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parse a priority string ("high", "medium", "low").
/// Returns medium for unrecognized values.
pub fn parse_priority(s: &str) -> Priority {
    match s.to_lowercase().as_str() {
        "high" => Priority::High,
        "low" => Priority::Low,
        _ => Priority::Medium,
    }
}

/// A schedulable unit of delegated work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub status: TaskStatus,
    pub priority: Priority,

    // Retry bookkeeping
    pub retry_count: i32,
    pub max_retries: i32,
    pub last_error: Option<String>,
    pub last_attempt_at: Option<i64>,
    /// Backoff gate: not eligible before this instant.
    pub next_retry_at: Option<i64>,

    /// Ids of tasks that must be done before this one may run.
    #[serde(default)]
    pub blocked_by: Vec<String>,
    pub scheduled_at: Option<i64>,

    pub created_at: i64,
    pub updated_at: i64,
}

impl Task {
    /// Prompt handed to the execution agent.
    pub fn prompt(&self) -> String {
        match self.description.as_deref() {
            Some(desc) if !desc.trim().is_empty() && desc != self.title => {
                format!("{}\n\n{}", self.title, desc)
            }
            _ => self.title.clone(),
        }
    }
}

/// Input for creating a task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskInput {
    /// Custom task ID (UUID7 generated if not provided).
    pub id: Option<String>,
    pub project_id: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub priority: Option<Priority>,
    pub max_retries: Option<i32>,
    #[serde(default)]
    pub blocked_by: Vec<String>,
    pub scheduled_at: Option<i64>,
}

impl TaskInput {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn blocked_by(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.blocked_by = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn scheduled_at(mut self, at: i64) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn in_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }
}

/// Partial update for a task. `None` leaves a field untouched; for nullable
/// fields `Some(None)` clears it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskPatch {
    pub title: Option<String>,
    pub description: Option<Option<String>>,
    pub project_id: Option<Option<String>>,
    pub status: Option<TaskStatus>,
    pub priority: Option<Priority>,
    pub retry_count: Option<i32>,
    pub max_retries: Option<i32>,
    pub last_error: Option<Option<String>>,
    pub last_attempt_at: Option<Option<i64>>,
    pub next_retry_at: Option<Option<i64>>,
    pub blocked_by: Option<Vec<String>>,
    pub scheduled_at: Option<Option<i64>>,
}

impl TaskPatch {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// Patch that writes every retry-related field of `task`.
    pub fn retry_state(task: &Task) -> Self {
        Self {
            status: Some(task.status),
            retry_count: Some(task.retry_count),
            last_error: Some(task.last_error.clone()),
            last_attempt_at: Some(task.last_attempt_at),
            next_retry_at: Some(task.next_retry_at),
            ..Default::default()
        }
    }
}

/// Aggregate task counts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskStats {
    pub total_tasks: i64,
    pub tasks_by_status: HashMap<String, i64>,
    pub tasks_by_priority: HashMap<String, i64>,
    /// Todo tasks currently gated by a retry backoff.
    pub awaiting_retry: i64,
}

/// Kind of risky outcome an approval request guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalActionType {
    Planning,
    Architecture,
    GitPush,
    LargeEdit,
}

impl ApprovalActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalActionType::Planning => "planning",
            ApprovalActionType::Architecture => "architecture",
            ApprovalActionType::GitPush => "git_push",
            ApprovalActionType::LargeEdit => "large_edit",
        }
    }
}

impl fmt::Display for ApprovalActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApprovalActionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "planning" => Ok(ApprovalActionType::Planning),
            "architecture" => Ok(ApprovalActionType::Architecture),
            "git_push" => Ok(ApprovalActionType::GitPush),
            "large_edit" => Ok(ApprovalActionType::LargeEdit),
            other => Err(format!("unknown approval action type: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
        }
    }
}

impl FromStr for ApprovalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ApprovalStatus::Pending),
            "approved" => Ok(ApprovalStatus::Approved),
            "rejected" => Ok(ApprovalStatus::Rejected),
            other => Err(format!("unknown approval status: {}", other)),
        }
    }
}

/// A parked decision waiting for the operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub task_id: String,
    pub task_title: String,
    pub action_type: ApprovalActionType,
    pub description: String,
    pub details: String,
    pub status: ApprovalStatus,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionResult {
    Success,
    Failure,
    Skipped,
}

impl ActionResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionResult::Success => "success",
            ActionResult::Failure => "failure",
            ActionResult::Skipped => "skipped",
        }
    }
}

impl FromStr for ActionResult {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(ActionResult::Success),
            "failure" => Ok(ActionResult::Failure),
            "skipped" => Ok(ActionResult::Skipped),
            other => Err(format!("unknown action result: {}", other)),
        }
    }
}

/// Audit record of one completed cycle iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionLog {
    pub task_id: String,
    pub action_type: String,
    pub auto_approved: bool,
    pub result: ActionResult,
    pub output: Option<String>,
    pub duration_ms: i64,
    pub timestamp: i64,
}

/// Input/output token counts reported by one execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCounts {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenCounts {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_rank_orders_high_first() {
        assert!(Priority::High.rank() < Priority::Medium.rank());
        assert!(Priority::Medium.rank() < Priority::Low.rank());
    }

    #[test]
    fn parse_priority_defaults_to_medium() {
        assert_eq!(parse_priority("HIGH"), Priority::High);
        assert_eq!(parse_priority("low"), Priority::Low);
        assert_eq!(parse_priority("urgent"), Priority::Medium);
    }

    #[test]
    fn status_string_roundtrip() {
        for status in TaskStatus::ALL {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("archived".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn prompt_includes_distinct_description() {
        let mut task = Task {
            id: "t".into(),
            project_id: None,
            title: "Fix login".into(),
            description: Some("Session cookie expires too early".into()),
            status: TaskStatus::Todo,
            priority: Priority::Medium,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            last_error: None,
            last_attempt_at: None,
            next_retry_at: None,
            blocked_by: vec![],
            scheduled_at: None,
            created_at: 0,
            updated_at: 0,
        };
        assert_eq!(
            task.prompt(),
            "Fix login\n\nSession cookie expires too early"
        );

        task.description = Some("Fix login".into());
        assert_eq!(task.prompt(), "Fix login");
    }
}
