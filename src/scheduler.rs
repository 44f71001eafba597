//! Task selection, wake-time computation, retry backoff and blocked-state
//! reconciliation.
//!
//! Everything here is a pure function over a task snapshot and a caller
//! supplied `now` (epoch milliseconds); persistence is the caller's job.

use crate::types::{Task, TaskStatus};
use std::collections::{HashMap, HashSet};

/// First retry delay.
pub const RETRY_BASE_DELAY_MS: i64 = 60_000;
/// Upper bound on the retry delay.
pub const RETRY_MAX_DELAY_MS: i64 = 16 * 60_000;

/// Ids of tasks that are done.
pub fn completed_ids(tasks: &[Task]) -> HashSet<&str> {
    tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Done)
        .map(|t| t.id.as_str())
        .collect()
}

fn dependencies_satisfied(task: &Task, completed: &HashSet<&str>) -> bool {
    task.blocked_by
        .iter()
        .all(|dep| completed.contains(dep.as_str()))
}

/// Whether a task may be dispatched right now.
pub fn is_executable(task: &Task, now: i64, completed: &HashSet<&str>) -> bool {
    task.status == TaskStatus::Todo
        && dependencies_satisfied(task, completed)
        && task.next_retry_at.is_none_or(|at| at <= now)
        && task.scheduled_at.is_none_or(|at| at <= now)
}

/// Pick the next task: highest priority first, oldest first within a
/// priority. Ties on `created_at` keep snapshot order.
pub fn select_next(tasks: &[Task], now: i64) -> Option<&Task> {
    let completed = completed_ids(tasks);
    let mut ready: Vec<&Task> = tasks
        .iter()
        .filter(|t| is_executable(t, now, &completed))
        .collect();
    ready.sort_by_key(|t| (t.priority.rank(), t.created_at));
    ready.into_iter().next()
}

/// When the controller should look again if nothing is runnable.
///
/// Returns `None` when a task is runnable now, or when no todo task with
/// satisfied dependencies has a future gate. A task gated by both a retry
/// backoff and a schedule becomes eligible at the later of the two.
pub fn next_wake_time(tasks: &[Task], now: i64) -> Option<i64> {
    let completed = completed_ids(tasks);
    if tasks.iter().any(|t| is_executable(t, now, &completed)) {
        return None;
    }

    tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Todo && dependencies_satisfied(t, &completed))
        .filter_map(|t| {
            let gate = t.next_retry_at.into_iter().chain(t.scheduled_at).max()?;
            (gate > now).then_some(gate)
        })
        .min()
}

/// Backoff delay after the `attempt`-th consecutive failure (1-based):
/// 1, 2, 4, 8, 16, 16, ... minutes.
pub fn retry_delay_ms(attempt: i32) -> i64 {
    let exponent = attempt.saturating_sub(1).clamp(0, 30) as u32;
    RETRY_BASE_DELAY_MS
        .saturating_mul(1i64 << exponent)
        .min(RETRY_MAX_DELAY_MS)
}

/// Record a failed attempt. Either re-queues the task behind a backoff gate
/// or, once `max_retries` is reached, marks it failed for good.
pub fn schedule_retry(task: &Task, error: &str, now: i64) -> Task {
    let mut next = task.clone();
    next.retry_count += 1;
    next.last_error = Some(error.to_string());
    next.last_attempt_at = Some(now);

    if next.retry_count >= next.max_retries {
        next.status = TaskStatus::Failed;
        next.next_retry_at = None;
    } else {
        next.status = TaskStatus::Todo;
        next.next_retry_at = Some(now + retry_delay_ms(next.retry_count));
    }
    next
}

/// A status change produced by [`reconcile_blocked`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub task_id: String,
    pub status: TaskStatus,
}

/// Keep `blocked` in sync with dependency completion.
///
/// Tasks that are done, failed or in progress are left alone. Only actual
/// changes are returned, so a second pass over the updated snapshot yields
/// nothing.
pub fn reconcile_blocked(tasks: &[Task]) -> Vec<StatusUpdate> {
    let status_by_id: HashMap<&str, TaskStatus> =
        tasks.iter().map(|t| (t.id.as_str(), t.status)).collect();

    tasks
        .iter()
        .filter(|t| matches!(t.status, TaskStatus::Todo | TaskStatus::Blocked))
        .filter_map(|t| {
            let unfinished = t
                .blocked_by
                .iter()
                .any(|dep| status_by_id.get(dep.as_str()) != Some(&TaskStatus::Done));
            let target = if unfinished {
                TaskStatus::Blocked
            } else {
                TaskStatus::Todo
            };
            (target != t.status).then(|| StatusUpdate {
                task_id: t.id.clone(),
                status: target,
            })
        })
        .collect()
}

/// Apply updates from [`reconcile_blocked`] to an in-memory snapshot.
pub fn apply_updates(tasks: &mut [Task], updates: &[StatusUpdate]) {
    for update in updates {
        if let Some(task) = tasks.iter_mut().find(|t| t.id == update.task_id) {
            task.status = update.status;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DEFAULT_MAX_RETRIES, Priority};

    const MIN: i64 = 60_000;

    fn task(id: &str, priority: Priority, created_at: i64) -> Task {
        Task {
            id: id.to_string(),
            project_id: None,
            title: id.to_string(),
            description: None,
            status: TaskStatus::Todo,
            priority,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            last_error: None,
            last_attempt_at: None,
            next_retry_at: None,
            blocked_by: vec![],
            scheduled_at: None,
            created_at,
            updated_at: created_at,
        }
    }

    #[test]
    fn selects_earliest_high_priority_task() {
        let tasks = vec![
            task("low", Priority::Low, 1),
            task("high-1", Priority::High, 2),
            task("medium", Priority::Medium, 3),
            task("high-2", Priority::High, 4),
        ];
        assert_eq!(select_next(&tasks, 10).unwrap().id, "high-1");
    }

    #[test]
    fn equal_timestamps_keep_snapshot_order() {
        let tasks = vec![task("a", Priority::Medium, 5), task("b", Priority::Medium, 5)];
        assert_eq!(select_next(&tasks, 10).unwrap().id, "a");
    }

    #[test]
    fn never_selects_task_with_unfinished_dependency() {
        let mut dep = task("dep", Priority::Low, 1);
        let mut blocked = task("blocked", Priority::High, 2);
        blocked.blocked_by = vec!["dep".into()];

        // dep in progress: neither is selectable
        dep.status = TaskStatus::InProgress;
        let tasks = vec![dep.clone(), blocked.clone()];
        assert!(select_next(&tasks, 10).is_none());

        // dep failed: still blocked
        dep.status = TaskStatus::Failed;
        let tasks = vec![dep.clone(), blocked.clone()];
        assert!(select_next(&tasks, 10).is_none());

        dep.status = TaskStatus::Done;
        let tasks = vec![dep, blocked];
        assert_eq!(select_next(&tasks, 10).unwrap().id, "blocked");
    }

    #[test]
    fn dependency_on_unknown_task_is_unfinished() {
        let mut t = task("t", Priority::High, 1);
        t.blocked_by = vec!["ghost".into()];
        assert!(select_next(&[t], 10).is_none());
    }

    #[test]
    fn respects_retry_and_schedule_gates() {
        let mut retrying = task("retry", Priority::High, 1);
        retrying.next_retry_at = Some(100);
        let mut scheduled = task("scheduled", Priority::High, 2);
        scheduled.scheduled_at = Some(200);
        let tasks = vec![retrying, scheduled];

        assert!(select_next(&tasks, 50).is_none());
        assert_eq!(select_next(&tasks, 100).unwrap().id, "retry");
        assert_eq!(select_next(&tasks, 150).unwrap().id, "retry");
    }

    #[test]
    fn non_todo_tasks_are_not_executable() {
        let completed = HashSet::new();
        for status in [
            TaskStatus::InProgress,
            TaskStatus::Done,
            TaskStatus::Failed,
            TaskStatus::Blocked,
        ] {
            let mut t = task("t", Priority::High, 1);
            t.status = status;
            assert!(!is_executable(&t, 10, &completed));
        }
    }

    #[test]
    fn wake_time_is_none_when_something_is_runnable() {
        let mut gated = task("gated", Priority::High, 1);
        gated.next_retry_at = Some(500);
        let tasks = vec![gated, task("ready", Priority::Low, 2)];
        assert_eq!(next_wake_time(&tasks, 10), None);
    }

    #[test]
    fn wake_time_is_earliest_future_gate() {
        let mut a = task("a", Priority::High, 1);
        a.next_retry_at = Some(500);
        let mut b = task("b", Priority::Low, 2);
        b.scheduled_at = Some(300);
        let mut c = task("c", Priority::Low, 3);
        c.next_retry_at = Some(100);
        c.scheduled_at = Some(900);

        assert_eq!(next_wake_time(&[a, b, c], 10), Some(300));
    }

    #[test]
    fn wake_time_ignores_dependency_blocked_tasks() {
        let mut dep = task("dep", Priority::High, 1);
        dep.status = TaskStatus::InProgress;
        let mut waiting = task("waiting", Priority::High, 2);
        waiting.blocked_by = vec!["dep".into()];
        waiting.scheduled_at = Some(50);

        assert_eq!(next_wake_time(&[dep, waiting], 10), None);
    }

    #[test]
    fn backoff_sequence_doubles_then_caps() {
        let mut t = task("t", Priority::High, 1);
        t.max_retries = 10;
        let mut now = 0;
        let mut delays = Vec::new();
        for _ in 0..7 {
            t = schedule_retry(&t, "boom", now);
            assert_eq!(t.status, TaskStatus::Todo);
            delays.push((t.next_retry_at.unwrap() - now) / MIN);
            now = t.next_retry_at.unwrap();
        }
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 16, 16]);
    }

    #[test]
    fn exhausting_retries_marks_failed() {
        let mut t = task("t", Priority::High, 1);
        t = schedule_retry(&t, "first", 0);
        assert_eq!(t.retry_count, 1);
        assert_eq!(t.next_retry_at, Some(MIN));

        t = schedule_retry(&t, "second", 10);
        assert_eq!(t.status, TaskStatus::Todo);
        assert_eq!(t.next_retry_at, Some(10 + 2 * MIN));

        t = schedule_retry(&t, "third", 20);
        assert_eq!(t.retry_count, 3);
        assert_eq!(t.status, TaskStatus::Failed);
        assert_eq!(t.next_retry_at, None);
        assert_eq!(t.last_error.as_deref(), Some("third"));
        assert_eq!(t.last_attempt_at, Some(20));
    }

    #[test]
    fn zero_max_retries_fails_immediately() {
        let mut t = task("t", Priority::High, 1);
        t.max_retries = 0;
        let t = schedule_retry(&t, "nope", 5);
        assert_eq!(t.status, TaskStatus::Failed);
    }

    #[test]
    fn reconcile_blocks_and_unblocks() {
        let a = task("a", Priority::High, 1);
        let mut b = task("b", Priority::Medium, 2);
        b.blocked_by = vec!["a".into()];
        let mut tasks = vec![a, b];

        let updates = reconcile_blocked(&tasks);
        assert_eq!(
            updates,
            vec![StatusUpdate {
                task_id: "b".into(),
                status: TaskStatus::Blocked
            }]
        );
        apply_updates(&mut tasks, &updates);

        tasks[0].status = TaskStatus::Done;
        let updates = reconcile_blocked(&tasks);
        assert_eq!(
            updates,
            vec![StatusUpdate {
                task_id: "b".into(),
                status: TaskStatus::Todo
            }]
        );
    }

    #[test]
    fn reconcile_is_idempotent() {
        let mut a = task("a", Priority::High, 1);
        a.status = TaskStatus::InProgress;
        let mut b = task("b", Priority::Medium, 2);
        b.blocked_by = vec!["a".into()];
        let mut c = task("c", Priority::Low, 3);
        c.status = TaskStatus::Blocked;
        let mut tasks = vec![a, b, c];

        let first = reconcile_blocked(&tasks);
        assert_eq!(first.len(), 2);
        apply_updates(&mut tasks, &first);
        assert!(reconcile_blocked(&tasks).is_empty());
    }

    #[test]
    fn reconcile_leaves_active_and_terminal_tasks_alone() {
        let dep = task("dep", Priority::High, 1);
        let mut running = task("running", Priority::High, 2);
        running.status = TaskStatus::InProgress;
        running.blocked_by = vec!["dep".into()];
        let mut failed = task("failed", Priority::High, 3);
        failed.status = TaskStatus::Failed;
        failed.blocked_by = vec!["dep".into()];

        assert!(reconcile_blocked(&[dep, running, failed]).is_empty());
    }
}
