//! `task` subcommands.

use crate::types::{TaskInput, parse_priority};
use chrono::DateTime;
use clap::{Args, Subcommand};

#[derive(Subcommand, Debug)]
pub enum TaskCommand {
    /// Queue a new task
    Add(AddArgs),

    /// List tasks
    List(ListArgs),

    /// Show one task
    Show {
        id: String,
    },

    /// Delete a task and its dependency edges
    Delete {
        id: String,
    },

    /// Aggregate counts by status and priority
    Stats {
        #[arg(long)]
        project: Option<String>,
    },

    /// Add (or remove) a dependency edge
    Depend(DependArgs),
}

#[derive(Args, Debug)]
pub struct AddArgs {
    /// Short title; also the first line of the prompt
    pub title: String,

    /// Longer instructions appended to the prompt
    #[arg(short = 'D', long)]
    pub description: Option<String>,

    /// high, medium or low
    #[arg(short, long, default_value = "medium")]
    pub priority: String,

    /// Comma-separated ids that must be done first
    #[arg(long, value_delimiter = ',')]
    pub after: Vec<String>,

    #[arg(long)]
    pub project: Option<String>,

    #[arg(long)]
    pub max_retries: Option<i32>,

    /// Not before: RFC 3339 time or a relative offset like +30m, +2h, +1d
    #[arg(long, value_name = "WHEN")]
    pub at: Option<String>,

    /// Custom id (UUID v7 generated if omitted)
    #[arg(long)]
    pub id: Option<String>,
}

impl AddArgs {
    pub fn to_input(&self, now: i64) -> Result<TaskInput, String> {
        let scheduled_at = self
            .at
            .as_deref()
            .map(|when| parse_schedule(when, now))
            .transpose()?;

        Ok(TaskInput {
            id: self.id.clone(),
            project_id: self.project.clone(),
            title: self.title.clone(),
            description: self.description.clone(),
            priority: Some(parse_priority(&self.priority)),
            max_retries: self.max_retries,
            blocked_by: self.after.clone(),
            scheduled_at,
        })
    }
}

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Filter by status
    #[arg(short, long)]
    pub status: Option<String>,

    /// Filter by project
    #[arg(long)]
    pub project: Option<String>,
}

#[derive(Args, Debug)]
pub struct DependArgs {
    /// Task that waits
    pub task_id: String,

    /// Task it waits for
    pub depends_on: String,

    /// Remove the edge instead of adding it
    #[arg(long)]
    pub remove: bool,
}

/// Parse an absolute RFC 3339 time or a `+<n><s|m|h|d>` offset from `now`.
pub fn parse_schedule(when: &str, now: i64) -> Result<i64, String> {
    let when = when.trim();

    if let Some(offset) = when.strip_prefix('+') {
        let split = offset
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(offset.len());
        let (amount, unit) = offset.split_at(split);
        let amount: i64 = amount
            .parse()
            .map_err(|_| format!("invalid offset: {}", when))?;
        let unit_ms = match unit {
            "s" => 1_000,
            "" | "m" => 60_000,
            "h" => 3_600_000,
            "d" => 86_400_000,
            other => return Err(format!("unknown time unit '{}' in {}", other, when)),
        };
        return Ok(now + amount * unit_ms);
    }

    DateTime::parse_from_rfc3339(when)
        .map(|dt| dt.timestamp_millis())
        .map_err(|e| format!("invalid time '{}': {}", when, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Priority;

    #[test]
    fn relative_offsets() {
        assert_eq!(parse_schedule("+30m", 1_000), Ok(1_000 + 30 * 60_000));
        assert_eq!(parse_schedule("+2h", 0), Ok(7_200_000));
        assert_eq!(parse_schedule("+1d", 0), Ok(86_400_000));
        assert_eq!(parse_schedule("+15", 0), Ok(900_000));
        assert!(parse_schedule("+3w", 0).is_err());
        assert!(parse_schedule("+m", 0).is_err());
    }

    #[test]
    fn absolute_time() {
        assert_eq!(
            parse_schedule("2026-03-01T10:00:00Z", 0),
            Ok(1_772_359_200_000)
        );
        assert!(parse_schedule("tomorrow", 0).is_err());
    }

    #[test]
    fn add_args_build_input() {
        let args = AddArgs {
            title: "Write docs".into(),
            description: None,
            priority: "HIGH".into(),
            after: vec!["a".into(), "b".into()],
            project: Some("web".into()),
            max_retries: Some(5),
            at: Some("+1h".into()),
            id: None,
        };
        let input = args.to_input(0).unwrap();
        assert_eq!(input.priority, Some(Priority::High));
        assert_eq!(input.blocked_by, vec!["a", "b"]);
        assert_eq!(input.scheduled_at, Some(3_600_000));
        assert_eq!(input.max_retries, Some(5));
    }
}
