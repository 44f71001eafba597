//! Output formatting utilities for markdown and JSON.

use crate::controller::ControllerState;
use crate::types::{ActionLog, ApprovalRequest, Task, TaskStats, TaskStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Output format for CLI results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    Json,
    #[default]
    Markdown,
}

impl OutputFormat {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "json" => Some(OutputFormat::Json),
            "markdown" | "md" | "text" => Some(OutputFormat::Markdown),
            _ => None,
        }
    }
}

/// Render `value` as pretty JSON, or with `markdown` otherwise.
pub fn render<T: Serialize + ?Sized>(
    format: OutputFormat,
    value: &T,
    markdown: impl FnOnce(&T) -> String,
) -> String {
    match format {
        OutputFormat::Json => {
            serde_json::to_string_pretty(value).unwrap_or_else(|e| format!("{{\"error\": \"{}\"}}", e))
        }
        OutputFormat::Markdown => markdown(value),
    }
}

fn timestamp(ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| ms.to_string())
}

/// Format a single task as markdown.
pub fn format_task_markdown(task: &Task) -> String {
    let mut md = String::new();

    md.push_str(&format!("## Task: {}\n", task.title));
    md.push_str(&format!("- **id**: `{}`\n", task.id));
    md.push_str(&format!("- **status**: {}\n", task.status));
    md.push_str(&format!("- **priority**: {}\n", task.priority));

    if let Some(ref project) = task.project_id {
        md.push_str(&format!("- **project**: {}\n", project));
    }

    if !task.blocked_by.is_empty() {
        let blockers: Vec<String> = task.blocked_by.iter().map(|id| format!("`{}`", id)).collect();
        md.push_str(&format!("- **blocked_by**: {}\n", blockers.join(", ")));
    }

    if task.retry_count > 0 {
        md.push_str(&format!(
            "- **attempts**: {}/{}\n",
            task.retry_count, task.max_retries
        ));
    }
    if let Some(at) = task.next_retry_at {
        md.push_str(&format!("- **next_retry_at**: {}\n", timestamp(at)));
    }
    if let Some(at) = task.scheduled_at {
        md.push_str(&format!("- **scheduled_at**: {}\n", timestamp(at)));
    }
    if let Some(ref err) = task.last_error {
        md.push_str(&format!("- **last_error**: {}\n", err));
    }

    if let Some(ref desc) = task.description {
        md.push_str("\n### Description\n");
        md.push_str(desc);
        md.push('\n');
    }

    md
}

/// Format a list of tasks as markdown, grouped by status.
pub fn format_tasks_markdown(tasks: &[Task]) -> String {
    let mut md = String::new();

    md.push_str(&format!("# Tasks ({})\n\n", tasks.len()));

    for status in TaskStatus::ALL {
        let group: Vec<&Task> = tasks.iter().filter(|t| t.status == status).collect();
        if group.is_empty() {
            continue;
        }
        md.push_str(&format!("## {} ({})\n", status, group.len()));
        for task in group {
            md.push_str(&format!(
                "- `{}` [{}] {}",
                task.id, task.priority, task.title
            ));
            if !task.blocked_by.is_empty() {
                md.push_str(&format!(" (after {})", task.blocked_by.join(", ")));
            }
            md.push('\n');
        }
        md.push('\n');
    }

    md
}

pub fn format_stats_markdown(stats: &TaskStats) -> String {
    let mut md = format!("# Task stats\n- **total**: {}\n", stats.total_tasks);

    for status in TaskStatus::ALL {
        let count = stats.tasks_by_status.get(status.as_str()).copied().unwrap_or(0);
        md.push_str(&format!("- **{}**: {}\n", status, count));
    }
    md.push_str(&format!("- **awaiting_retry**: {}\n", stats.awaiting_retry));

    let mut priorities: Vec<_> = stats.tasks_by_priority.iter().collect();
    priorities.sort();
    let parts: Vec<String> = priorities
        .into_iter()
        .map(|(p, n)| format!("{} {}", n, p))
        .collect();
    md.push_str(&format!("- **by priority**: {}\n", parts.join(", ")));
    md
}

pub fn format_approvals_markdown(requests: &[ApprovalRequest]) -> String {
    if requests.is_empty() {
        return "No approval requests.\n".to_string();
    }

    let mut md = format!("# Approval requests ({})\n\n", requests.len());
    for req in requests {
        md.push_str(&format!(
            "## `{}` {} [{}]\n- **task**: {} (`{}`)\n- **reason**: {}\n- **created**: {}\n",
            req.id,
            req.action_type,
            req.status.as_str(),
            req.task_title,
            req.task_id,
            req.description,
            timestamp(req.created_at),
        ));
        if let Some(ref reason) = req.resolution_reason {
            md.push_str(&format!("- **resolution**: {}\n", reason));
        }
        if !req.details.is_empty() {
            md.push_str("\n```\n");
            md.push_str(&req.details);
            md.push_str("\n```\n");
        }
        md.push('\n');
    }
    md
}

pub fn format_action_log_markdown(entries: &[ActionLog]) -> String {
    if entries.is_empty() {
        return "No actions recorded.\n".to_string();
    }

    let mut md = format!("# Action log ({})\n\n", entries.len());
    for entry in entries {
        md.push_str(&format!(
            "- {} `{}` {} {} ({} ms){}\n",
            timestamp(entry.timestamp),
            entry.task_id,
            entry.action_type,
            entry.result.as_str(),
            entry.duration_ms,
            if entry.auto_approved { "" } else { " [manual]" },
        ));
    }
    md
}

/// One-line status summary for the operator console.
pub fn format_controller_line(state: &ControllerState) -> String {
    let pct = state.usage.percentages();
    let mut line = format!(
        "status={} processed={} approved={} rejected={} errors={} usage={:.1}%/h {:.1}%/d ({})",
        state.status,
        state.processed_count,
        state.approved_count,
        state.rejected_count,
        state.error_count,
        pct.hourly,
        pct.daily,
        serde_json::to_value(state.usage_limit_status)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default(),
    );
    if state.paused_due_to_limit {
        line.push_str(" [limit pause]");
    }
    if let Some(ref task) = state.current_task_id {
        line.push_str(&format!(" task={}", task));
    }
    if let Some(ref progress) = state.current_progress {
        line.push_str(&format!(
            " step={}/{} ({})",
            progress.step, progress.total_steps, progress.phase
        ));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Priority;
    use crate::usage::UsageLimitConfig;

    fn task(id: &str, status: TaskStatus) -> Task {
        Task {
            id: id.into(),
            project_id: None,
            title: format!("Task {}", id),
            description: None,
            status,
            priority: Priority::High,
            retry_count: 0,
            max_retries: 3,
            last_error: None,
            last_attempt_at: None,
            next_retry_at: None,
            blocked_by: vec![],
            scheduled_at: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn parse_output_format() {
        assert_eq!(OutputFormat::from_str("JSON"), Some(OutputFormat::Json));
        assert_eq!(OutputFormat::from_str("md"), Some(OutputFormat::Markdown));
        assert_eq!(OutputFormat::from_str("yaml"), None);
    }

    #[test]
    fn tasks_are_grouped_by_status() {
        let md = format_tasks_markdown(&[
            task("a", TaskStatus::Done),
            task("b", TaskStatus::Todo),
            task("c", TaskStatus::Todo),
        ]);
        assert!(md.starts_with("# Tasks (3)"));
        let todo = md.find("## todo (2)").unwrap();
        let done = md.find("## done (1)").unwrap();
        assert!(todo < done);
        assert!(!md.contains("## failed"));
    }

    #[test]
    fn json_rendering_skips_markdown() {
        let out = render(OutputFormat::Json, &task("a", TaskStatus::Todo), |_| {
            unreachable!()
        });
        assert!(out.contains("\"status\": \"todo\""));
    }

    #[test]
    fn controller_line_mentions_limit_pause() {
        let mut state = ControllerState::new(UsageLimitConfig::default(), 0);
        state.paused_due_to_limit = true;
        let line = format_controller_line(&state);
        assert!(line.starts_with("status=idle"));
        assert!(line.contains("(ok)"));
        assert!(line.ends_with("[limit pause]"));
    }
}
