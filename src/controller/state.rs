//! Observable controller state.

use crate::usage::{UsageLimitConfig, UsageLimitStatus, UsageLimiter, should_pause};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ControllerStatus {
    #[default]
    Idle,
    Running,
    Paused,
    WaitingApproval,
    WaitingInput,
    /// Finishing an in-flight execution after a deactivate request.
    WindingDown,
}

impl ControllerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControllerStatus::Idle => "idle",
            ControllerStatus::Running => "running",
            ControllerStatus::Paused => "paused",
            ControllerStatus::WaitingApproval => "waiting_approval",
            ControllerStatus::WaitingInput => "waiting_input",
            ControllerStatus::WindingDown => "winding_down",
        }
    }
}

impl fmt::Display for ControllerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the current execution is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub phase: String,
    pub step: u32,
    pub total_steps: u32,
    pub step_description: String,
    pub started_at: i64,
}

/// Execution phases, in order.
pub(crate) const PHASES: [(&str, &str); 3] = [
    ("dispatching", "Marking task in progress"),
    ("executing", "Waiting for the execution agent"),
    ("classifying", "Checking the result for risky actions"),
];

impl Progress {
    pub(crate) fn at_step(step: u32, started_at: i64) -> Self {
        let index = (step.max(1) as usize - 1).min(PHASES.len() - 1);
        let (phase, description) = PHASES[index];
        Self {
            phase: phase.to_string(),
            step: index as u32 + 1,
            total_steps: PHASES.len() as u32,
            step_description: description.to_string(),
            started_at,
        }
    }
}

/// Everything observers can see about the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerState {
    pub status: ControllerStatus,
    pub current_task_id: Option<String>,
    pub current_action: Option<String>,
    pub started_at: Option<i64>,

    pub processed_count: u64,
    pub approved_count: u64,
    pub rejected_count: u64,
    pub error_count: u64,

    pub current_progress: Option<Progress>,

    /// Token windows and budget (`token_usage`, `daily_token_usage`,
    /// `usage_limit_config`).
    #[serde(flatten)]
    pub usage: UsageLimiter,
    pub usage_limit_status: UsageLimitStatus,
    pub paused_due_to_limit: bool,

    /// Approval request holding back the cycle in this session.
    #[serde(default)]
    pub pending_request_id: Option<String>,
}

impl ControllerState {
    pub fn new(config: UsageLimitConfig, now: i64) -> Self {
        Self {
            status: ControllerStatus::Idle,
            current_task_id: None,
            current_action: None,
            started_at: None,
            processed_count: 0,
            approved_count: 0,
            rejected_count: 0,
            error_count: 0,
            current_progress: None,
            usage: UsageLimiter::new(config, now),
            usage_limit_status: UsageLimitStatus::Ok,
            paused_due_to_limit: false,
            pending_request_id: None,
        }
    }

    /// State carried over from a previous process: counters and usage
    /// survive, everything tied to a live session does not.
    pub fn restored(mut self, config: UsageLimitConfig, now: i64) -> Self {
        self.status = ControllerStatus::Idle;
        self.clear_current();
        self.pending_request_id = None;
        self.paused_due_to_limit = false;
        self.usage.set_config(config);
        self.usage.roll_windows(now);
        self.usage_limit_status = self.usage.status();
        self
    }

    pub fn clear_current(&mut self) {
        self.current_task_id = None;
        self.current_action = None;
        self.current_progress = None;
    }

    pub fn reset_counters(&mut self) {
        self.processed_count = 0;
        self.approved_count = 0;
        self.rejected_count = 0;
        self.error_count = 0;
    }

    /// Where the cycle goes once nothing holds it back.
    pub(crate) fn resume_target(&self) -> ControllerStatus {
        if self.pending_request_id.is_some() {
            ControllerStatus::WaitingApproval
        } else {
            ControllerStatus::Running
        }
    }

    /// Refresh the usage status and raise a limit pause if needed.
    /// Returns true when the status level or controller status changed.
    pub(crate) fn apply_usage_limits(&mut self) -> bool {
        let level = self.usage.status();
        let mut changed = level != self.usage_limit_status;
        self.usage_limit_status = level;

        if should_pause(level) {
            match self.status {
                ControllerStatus::Running => {
                    self.status = ControllerStatus::Paused;
                    self.paused_due_to_limit = true;
                    changed = true;
                }
                // Approval resolution lands in paused instead of running
                ControllerStatus::WaitingApproval if !self.paused_due_to_limit => {
                    self.paused_due_to_limit = true;
                    changed = true;
                }
                _ => {}
            }
        }
        changed
    }
}

/// Result of one [`super::Controller::run_cycle`] call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    /// The controller is not running, so nothing was selected.
    NotRunning,
    /// Nothing runnable; look again at `wake_at` if known.
    Idle { wake_at: Option<i64> },
    Completed { task_id: String },
    /// The execution failed; `retry_at` is `None` once retries are exhausted.
    Failed {
        task_id: String,
        error: String,
        retry_at: Option<i64>,
    },
    AwaitingApproval { task_id: String, request_id: String },
    Cancelled { task_id: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usage::HOUR_MS;

    const T0: i64 = 1_772_359_200_000;

    #[test]
    fn serialized_state_is_flat() {
        let state = ControllerState::new(UsageLimitConfig::default(), T0);
        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(value["status"], "idle");
        assert_eq!(value["token_usage"]["reset_at"], T0 + HOUR_MS);
        assert_eq!(value["daily_token_usage"]["date"], "2026-03-01");
        assert_eq!(value["usage_limit_config"]["max_tokens_per_hour"], 200_000);
        assert_eq!(value["usage_limit_status"], "ok");

        let back: ControllerState = serde_json::from_value(value).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn restore_keeps_counters_but_not_the_session() {
        let mut state = ControllerState::new(UsageLimitConfig::default(), T0);
        state.status = ControllerStatus::WaitingApproval;
        state.current_task_id = Some("t1".into());
        state.pending_request_id = Some("r1".into());
        state.processed_count = 4;
        state.usage.record(100, 100, T0);

        let restored = state.restored(UsageLimitConfig::default(), T0 + 1);
        assert_eq!(restored.status, ControllerStatus::Idle);
        assert_eq!(restored.current_task_id, None);
        assert_eq!(restored.pending_request_id, None);
        assert_eq!(restored.processed_count, 4);
        assert_eq!(restored.usage.token_usage.input_tokens, 100);
    }

    #[test]
    fn limit_pause_only_interrupts_running() {
        let config = UsageLimitConfig {
            max_tokens_per_hour: 100,
            ..Default::default()
        };
        let mut state = ControllerState::new(config, T0);
        state.status = ControllerStatus::Running;
        state.usage.record(90, 0, T0);

        assert!(state.apply_usage_limits());
        assert_eq!(state.status, ControllerStatus::Paused);
        assert!(state.paused_due_to_limit);
        assert_eq!(state.usage_limit_status, UsageLimitStatus::ApproachingLimit);

        let mut waiting = ControllerState::new(state.usage.usage_limit_config.clone(), T0);
        waiting.status = ControllerStatus::WaitingApproval;
        waiting.usage.record(100, 0, T0);
        waiting.apply_usage_limits();
        assert_eq!(waiting.status, ControllerStatus::WaitingApproval);
        assert!(waiting.paused_due_to_limit);
    }

    #[test]
    fn progress_steps_are_clamped() {
        let p = Progress::at_step(2, T0);
        assert_eq!(p.phase, "executing");
        assert_eq!(p.total_steps, 3);
        assert_eq!(Progress::at_step(9, T0).step, 3);
        assert_eq!(Progress::at_step(0, T0).step, 1);
    }
}
