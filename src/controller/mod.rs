//! The orchestrator: select a task, dispatch it, classify the result, then
//! either park it behind an approval or finalize it, and loop.
//!
//! Exactly one execution is in flight at a time. Only [`Controller::run_cycle`]
//! dispatches, and it registers the execution under the state lock after
//! re-checking that the controller is running, so a concurrent `deactivate`
//! either sees the execution and cancels it or prevents it from starting.

mod state;

pub use state::{ControllerState, ControllerStatus, CycleOutcome, Progress};

use crate::activity::{ActivitySink, category};
use crate::clock::Clock;
use crate::config::Config;
use crate::db::Database;
use crate::error::Result;
use crate::events::{ControllerEvent, EventKind, EventPublisher};
use crate::executor::{ExecutionOutcome, ExecutionRequest, Executor};
use crate::risk::{RiskClassifier, RiskDecision};
use crate::scheduler;
use crate::types::{
    ActionLog, ActionResult, ApprovalActionType, ApprovalRequest, ApprovalStatus, Task,
    TaskPatch, TaskStatus, TokenCounts,
};
use crate::usage::{UsageLimitConfig, should_auto_resume, should_pause};
use arc_swap::ArcSwap;
use serde::Serialize;
use serde_json::{Value, json};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Key of the persisted [`ControllerState`] snapshot.
pub const STATE_KEY: &str = "controller_state";

/// Action type recorded for regular task executions.
pub const EXECUTE_ACTION: &str = "execute_task";

/// Tunables the controller needs at runtime.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub execution_timeout: Duration,
    pub tick_interval: Duration,
    pub system_prompt: Option<String>,
    pub working_dir: Option<PathBuf>,
    pub output_limit: usize,
    pub usage: UsageLimitConfig,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl ControllerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            execution_timeout: config.controller.execution_timeout(),
            tick_interval: config.controller.tick_interval(),
            system_prompt: config.controller.system_prompt.clone(),
            working_dir: config.controller.working_dir.clone(),
            output_limit: config.controller.output_limit,
            usage: config.usage.clone(),
        }
    }
}

/// Injected collaborators.
#[derive(Clone)]
pub struct Collaborators {
    pub executor: Arc<dyn Executor>,
    pub classifier: Arc<dyn RiskClassifier>,
    pub events: Arc<dyn EventPublisher>,
    pub activity: Arc<dyn ActivitySink>,
    pub clock: Arc<dyn Clock>,
}

struct InFlight {
    execution_id: String,
    task_id: String,
    cancel: CancellationToken,
}

struct Shared {
    state: ControllerState,
    in_flight: Option<InFlight>,
}

pub struct Controller {
    db: Database,
    executor: Arc<dyn Executor>,
    classifier: Arc<dyn RiskClassifier>,
    events: Arc<dyn EventPublisher>,
    activity: Arc<dyn ActivitySink>,
    clock: Arc<dyn Clock>,
    settings: ControllerSettings,

    shared: Mutex<Shared>,
    /// Lock-free copy of the state for observers.
    snapshot: ArcSwap<ControllerState>,
    /// Fired whenever an in-flight execution has been fully settled.
    settled: Notify,
    /// Wakes the driver loop early.
    wake: Notify,
}

impl Controller {
    /// Build a controller, restoring the persisted state snapshot and
    /// returning tasks stranded `in_progress` by a previous process to `todo`.
    pub fn new(db: Database, parts: Collaborators, settings: ControllerSettings) -> Result<Self> {
        let now = parts.clock.now_ms();

        let state = match db.load_snapshot::<ControllerState>(STATE_KEY) {
            Ok(Some(saved)) => {
                debug!(processed = saved.processed_count, "Restored controller state");
                saved.restored(settings.usage.clone(), now)
            }
            Ok(None) => ControllerState::new(settings.usage.clone(), now),
            Err(e) => {
                warn!(error = %e, "Discarding unreadable controller state snapshot");
                ControllerState::new(settings.usage.clone(), now)
            }
        };

        let recovered = db.recover_interrupted(now)?;
        if !recovered.is_empty() {
            info!(count = recovered.len(), "Returned interrupted tasks to todo");
        }

        db.save_snapshot(STATE_KEY, &state)?;

        Ok(Self {
            db,
            executor: parts.executor,
            classifier: parts.classifier,
            events: parts.events,
            activity: parts.activity,
            clock: parts.clock,
            settings,
            snapshot: ArcSwap::from_pointee(state.clone()),
            shared: Mutex::new(Shared {
                state,
                in_flight: None,
            }),
            settled: Notify::new(),
            wake: Notify::new(),
        })
    }

    // ------------------------------------------------------------------
    // Read accessors
    // ------------------------------------------------------------------

    pub fn snapshot(&self) -> Arc<ControllerState> {
        self.snapshot.load_full()
    }

    pub fn status(&self) -> ControllerStatus {
        self.snapshot.load().status
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn pending_approvals(&self) -> Result<Vec<ApprovalRequest>> {
        Ok(self.db.list_approvals(Some(ApprovalStatus::Pending))?)
    }

    pub fn approvals(&self) -> Result<Vec<ApprovalRequest>> {
        Ok(self.db.list_approvals(None)?)
    }

    pub fn action_log(&self, limit: usize) -> Result<Vec<ActionLog>> {
        Ok(self.db.list_action_log(limit)?)
    }

    /// Ask the driver loop to look for work now.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// `idle → running`. Starts a new session.
    pub fn activate(&self) -> Result<bool> {
        let now = self.clock.now_ms();
        {
            let mut shared = self.lock();
            let state = &mut shared.state;
            if state.status != ControllerStatus::Idle {
                debug!(status = %state.status, "Ignoring activate");
                return Ok(false);
            }
            state.status = ControllerStatus::Running;
            state.started_at = Some(now);
            state.reset_counters();
            state.clear_current();
            state.paused_due_to_limit = false;
            state.pending_request_id = None;
            state.usage.roll_windows(now);
            state.apply_usage_limits();
            self.commit(state)?;
        }

        info!("Controller activated");
        self.activity.append(
            category::CONTROLLER,
            "activated",
            json!({ "started_at": now }),
            None,
        );
        self.wake.notify_one();
        Ok(true)
    }

    /// Any active state `→ winding_down → idle`. Cancels the in-flight
    /// execution, if any, and waits for it to settle.
    pub async fn deactivate(&self) -> Result<bool> {
        let in_flight = {
            let mut shared = self.lock();
            if matches!(
                shared.state.status,
                ControllerStatus::Idle | ControllerStatus::WindingDown
            ) {
                debug!(status = %shared.state.status, "Ignoring deactivate");
                return Ok(false);
            }
            shared.state.status = ControllerStatus::WindingDown;
            self.commit(&shared.state)?;
            shared
                .in_flight
                .as_ref()
                .map(|f| (f.execution_id.clone(), f.cancel.clone()))
        };

        if let Some((execution_id, cancel)) = in_flight {
            info!(%execution_id, "Cancelling in-flight execution");
            cancel.cancel();
            self.wait_settled().await;
        }

        {
            let mut shared = self.lock();
            let state = &mut shared.state;
            state.status = ControllerStatus::Idle;
            state.clear_current();
            state.pending_request_id = None;
            self.commit(state)?;
        }

        info!("Controller deactivated");
        self.activity
            .append(category::CONTROLLER, "deactivated", json!({}), None);
        self.wake.notify_one();
        Ok(true)
    }

    /// `running → paused`. An in-flight execution is allowed to finish.
    pub fn pause(&self) -> Result<bool> {
        {
            let mut shared = self.lock();
            let state = &mut shared.state;
            if state.status != ControllerStatus::Running {
                debug!(status = %state.status, "Ignoring pause");
                return Ok(false);
            }
            state.status = ControllerStatus::Paused;
            state.paused_due_to_limit = false;
            self.commit(state)?;
        }

        info!("Controller paused");
        self.activity
            .append(category::CONTROLLER, "paused", json!({ "manual": true }), None);
        Ok(true)
    }

    /// `paused → running`. A limit pause only lifts once the usage windows
    /// have rolled below the pause level.
    pub fn resume(&self) -> Result<bool> {
        let now = self.clock.now_ms();
        let resumed_to = {
            let mut shared = self.lock();
            let state = &mut shared.state;
            if state.status != ControllerStatus::Paused {
                debug!(status = %state.status, "Ignoring resume");
                return Ok(false);
            }
            if state.paused_due_to_limit {
                state.usage.roll_windows(now);
                state.usage_limit_status = state.usage.status();
                if should_pause(state.usage_limit_status) {
                    debug!(
                        usage_status = ?state.usage_limit_status,
                        "Usage still at pause level, staying paused"
                    );
                    self.commit(state)?;
                    return Ok(false);
                }
            }
            state.status = state.resume_target();
            state.paused_due_to_limit = false;
            self.commit(state)?;
            state.status
        };

        info!(status = %resumed_to, "Controller resumed");
        self.activity.append(
            category::CONTROLLER,
            "resumed",
            json!({ "status": resumed_to }),
            None,
        );
        self.wake.notify_one();
        Ok(true)
    }

    /// Periodic usage check: roll windows and auto-resume a limit pause when
    /// the hourly window resets. Returns true when anything changed.
    pub fn tick(&self) -> Result<bool> {
        let now = self.clock.now_ms();
        let (usage, auto_resumed) = {
            let mut shared = self.lock();
            let state = &mut shared.state;
            let rollover = state.usage.roll_windows(now);
            let mut changed = rollover.hourly || rollover.daily;
            let mut auto_resumed = false;

            let resume_allowed = should_auto_resume(
                &state.usage.usage_limit_config,
                rollover.hourly,
                state.paused_due_to_limit,
            ) && !should_pause(state.usage.status());

            if resume_allowed {
                match state.status {
                    ControllerStatus::Paused => {
                        state.status = state.resume_target();
                        state.paused_due_to_limit = false;
                        auto_resumed = true;
                    }
                    ControllerStatus::WaitingApproval => state.paused_due_to_limit = false,
                    _ => {}
                }
                changed = true;
            }

            changed |= state.apply_usage_limits();
            if !changed {
                return Ok(false);
            }
            self.commit(state)?;
            (usage_payload(state), auto_resumed)
        };

        self.publish(EventKind::UsageChanged, &usage);
        if auto_resumed {
            info!("Usage window reset, resuming");
            self.activity.append(
                category::CONTROLLER,
                "auto_resumed",
                usage.clone(),
                None,
            );
            self.wake.notify_one();
        }
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Approvals
    // ------------------------------------------------------------------

    /// Approve a pending request: the parked task is finalized `done`.
    /// Unknown or already resolved ids return `None`.
    pub fn approve_request(&self, request_id: &str) -> Result<Option<ApprovalRequest>> {
        let now = self.clock.now_ms();
        let Some(parked) =
            self.db
                .resolve_approval(request_id, ApprovalStatus::Approved, None, now)?
        else {
            debug!(%request_id, "No pending approval request to approve");
            return Ok(None);
        };
        let request = parked.request;

        let patch = TaskPatch {
            status: Some(TaskStatus::Done),
            last_error: Some(None),
            next_retry_at: Some(None),
            ..Default::default()
        };
        if let Some(task) = self.db.update_task(&request.task_id, patch, now)? {
            self.publish(EventKind::TaskChanged, &task);
        }

        self.log_action(ActionLog {
            task_id: request.task_id.clone(),
            action_type: request.action_type.as_str().to_string(),
            auto_approved: false,
            result: ActionResult::Success,
            output: parked.output,
            duration_ms: parked.duration_ms,
            timestamp: now,
        })?;

        self.after_resolution(&request.id, |state| {
            state.processed_count += 1;
            state.approved_count += 1;
        })?;

        info!(request_id = %request.id, task_id = %request.task_id, "Approval granted");
        self.publish(EventKind::ApprovalResolved, &request);
        self.activity.append(
            category::APPROVAL,
            "approved",
            json!({ "request_id": request.id, "action_type": request.action_type }),
            Some(&request.task_id),
        );
        Ok(Some(request))
    }

    /// Reject a pending request: the parked task fails without a retry.
    pub fn reject_request(
        &self,
        request_id: &str,
        reason: Option<&str>,
    ) -> Result<Option<ApprovalRequest>> {
        let reason = reason
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .unwrap_or("no reason given");

        let now = self.clock.now_ms();
        let Some(parked) =
            self.db
                .resolve_approval(request_id, ApprovalStatus::Rejected, Some(reason), now)?
        else {
            debug!(%request_id, "No pending approval request to reject");
            return Ok(None);
        };
        let request = parked.request;
        let message = format!("Rejected by operator: {}", reason);

        let patch = TaskPatch {
            status: Some(TaskStatus::Failed),
            last_error: Some(Some(message.clone())),
            next_retry_at: Some(None),
            ..Default::default()
        };
        if let Some(task) = self.db.update_task(&request.task_id, patch, now)? {
            self.publish(EventKind::TaskChanged, &task);
        }

        self.log_action(ActionLog {
            task_id: request.task_id.clone(),
            action_type: request.action_type.as_str().to_string(),
            auto_approved: false,
            result: ActionResult::Failure,
            output: Some(message),
            duration_ms: parked.duration_ms,
            timestamp: now,
        })?;

        self.after_resolution(&request.id, |state| state.rejected_count += 1)?;

        info!(request_id = %request.id, task_id = %request.task_id, %reason, "Approval rejected");
        self.publish(EventKind::ApprovalResolved, &request);
        self.activity.append(
            category::APPROVAL,
            "rejected",
            json!({ "request_id": request.id, "reason": reason }),
            Some(&request.task_id),
        );
        Ok(Some(request))
    }

    fn after_resolution(
        &self,
        request_id: &str,
        update: impl FnOnce(&mut ControllerState),
    ) -> Result<()> {
        let resumed = {
            let mut shared = self.lock();
            let state = &mut shared.state;
            update(state);

            let mut resumed = false;
            if state.pending_request_id.as_deref() == Some(request_id) {
                state.pending_request_id = None;
                if state.status == ControllerStatus::WaitingApproval {
                    state.status = if state.paused_due_to_limit {
                        ControllerStatus::Paused
                    } else {
                        ControllerStatus::Running
                    };
                    resumed = state.status == ControllerStatus::Running;
                }
            }
            self.commit(state)?;
            resumed
        };

        if resumed {
            self.wake.notify_one();
        }
        Ok(())
    }

    /// Cancel the in-flight execution if it is running `task_id`, and wait
    /// for it to settle. The task goes back to `todo` without using a retry.
    pub async fn cancel_task(&self, task_id: &str) -> bool {
        let cancel = {
            let shared = self.lock();
            match &shared.in_flight {
                Some(f) if f.task_id == task_id => f.cancel.clone(),
                _ => return false,
            }
        };
        info!(%task_id, "Cancelling task execution");
        cancel.cancel();
        self.wait_settled().await;
        true
    }

    // ------------------------------------------------------------------
    // Cycle
    // ------------------------------------------------------------------

    /// One iteration of the main cycle.
    pub async fn run_cycle(&self) -> Result<CycleOutcome> {
        if self.status() != ControllerStatus::Running {
            return Ok(CycleOutcome::NotRunning);
        }
        let now = self.clock.now_ms();

        let mut tasks = self.db.list_tasks()?;
        let updates = scheduler::reconcile_blocked(&tasks);
        for update in &updates {
            if let Some(task) = self
                .db
                .update_task(&update.task_id, TaskPatch::status(update.status), now)?
            {
                debug!(task_id = %task.id, status = %task.status, "Reconciled dependency state");
                self.publish(EventKind::TaskChanged, &task);
            }
        }
        scheduler::apply_updates(&mut tasks, &updates);

        let Some(task) = scheduler::select_next(&tasks, now).cloned() else {
            let wake_at = scheduler::next_wake_time(&tasks, now);
            return Ok(CycleOutcome::Idle { wake_at });
        };

        let execution_id = Uuid::now_v7().to_string();
        let cancel = CancellationToken::new();
        if !self.register(&task, &execution_id, &cancel, now)? {
            return Ok(CycleOutcome::NotRunning);
        }

        let outcome = self.supervise(&task, &execution_id, cancel).await;
        let cleared = self.clear_in_flight();
        let outcome = outcome?;
        cleared?;
        Ok(outcome)
    }

    /// Claim the single execution slot. Returns false if the controller
    /// stopped running or something is already in flight.
    fn register(
        &self,
        task: &Task,
        execution_id: &str,
        cancel: &CancellationToken,
        now: i64,
    ) -> Result<bool> {
        let mut shared = self.lock();
        if shared.state.status != ControllerStatus::Running || shared.in_flight.is_some() {
            return Ok(false);
        }
        shared.in_flight = Some(InFlight {
            execution_id: execution_id.to_string(),
            task_id: task.id.clone(),
            cancel: cancel.clone(),
        });
        let state = &mut shared.state;
        state.current_task_id = Some(task.id.clone());
        state.current_action = Some(format!("Executing: {}", task.title));
        state.current_progress = Some(Progress::at_step(1, now));

        if let Err(e) = self.commit(&shared.state) {
            shared.in_flight = None;
            shared.state.clear_current();
            return Err(e);
        }
        Ok(true)
    }

    fn clear_in_flight(&self) -> Result<()> {
        let result = {
            let mut shared = self.lock();
            shared.in_flight = None;
            shared.state.clear_current();
            self.commit(&shared.state)
        };
        self.settled.notify_waiters();
        result
    }

    async fn wait_settled(&self) {
        loop {
            // Registered before the check so a settle in between is not missed
            let notified = self.settled.notified();
            let busy = self.lock().in_flight.is_some();
            if !busy {
                return;
            }
            notified.await;
        }
    }

    async fn supervise(
        &self,
        task: &Task,
        execution_id: &str,
        cancel: CancellationToken,
    ) -> Result<CycleOutcome> {
        let started = Instant::now();
        let now = self.clock.now_ms();

        let patch = TaskPatch {
            status: Some(TaskStatus::InProgress),
            last_attempt_at: Some(Some(now)),
            ..Default::default()
        };
        let Some(running) = self.db.update_task(&task.id, patch, now)? else {
            warn!(task_id = %task.id, "Selected task disappeared before dispatch");
            return Ok(CycleOutcome::Idle { wake_at: None });
        };
        self.publish(EventKind::TaskChanged, &running);

        info!(task_id = %task.id, %execution_id, title = %task.title, "Dispatching task");
        self.activity.append(
            category::EXECUTION,
            "task_started",
            json!({ "execution_id": execution_id, "title": task.title }),
            Some(&task.id),
        );
        self.set_progress(2);

        let request = ExecutionRequest {
            execution_id: execution_id.to_string(),
            task_id: task.id.clone(),
            prompt: running.prompt(),
            system_prompt: self.settings.system_prompt.clone(),
            working_dir: self.settings.working_dir.clone(),
        };
        let timeout = self.settings.execution_timeout;
        let outcome =
            match tokio::time::timeout(timeout, self.executor.execute(request, cancel.clone()))
                .await
            {
                Ok(outcome) => outcome,
                Err(_) => {
                    cancel.cancel();
                    warn!(task_id = %task.id, %execution_id, "Execution timed out");
                    ExecutionOutcome::failed(format!(
                        "execution timed out after {}s",
                        timeout.as_secs()
                    ))
                }
            };

        let duration_ms = started.elapsed().as_millis() as i64;
        let now = self.clock.now_ms();

        // Usage is counted now but limits are enforced once the result has
        // settled, so a flagged result still parks for approval.
        let reported_usage = outcome.token_usage.is_some();
        if let Some(tokens) = outcome.token_usage {
            self.record_usage(tokens, now)?;
        }

        let result = if outcome.cancelled {
            self.finalize_cancelled(&running, duration_ms, now)?
        } else if !outcome.success {
            let error = outcome
                .error
                .unwrap_or_else(|| "execution failed without an error message".to_string());
            self.finalize_failure(&running, &error, duration_ms, now)?
        } else {
            self.set_progress(3);
            let decision = self.classifier.classify(&outcome.response_text);
            if decision.requires_approval {
                self.park_for_approval(&running, decision, &outcome.response_text, duration_ms, now)?
            } else {
                self.finalize_success(&running, &outcome.response_text, duration_ms, now)?
            }
        };

        if reported_usage {
            self.enforce_limits()?;
        }

        self.activity.append(
            category::EXECUTION,
            "task_finished",
            json!({
                "execution_id": execution_id,
                "duration_ms": duration_ms,
                "outcome": result,
            }),
            Some(&task.id),
        );
        Ok(result)
    }

    fn record_usage(&self, tokens: TokenCounts, now: i64) -> Result<()> {
        let usage = {
            let mut shared = self.lock();
            let state = &mut shared.state;
            state
                .usage
                .record(tokens.input_tokens, tokens.output_tokens, now);
            self.commit(state)?;
            usage_payload(state)
        };
        self.publish(EventKind::UsageChanged, &usage);
        Ok(())
    }

    /// Pause (or arm the post-approval pause) once the budget crosses the
    /// pause threshold.
    fn enforce_limits(&self) -> Result<()> {
        let (usage, limit_paused) = {
            let mut shared = self.lock();
            let state = &mut shared.state;
            let was_limited = state.paused_due_to_limit;
            if !state.apply_usage_limits() {
                return Ok(());
            }
            self.commit(state)?;
            (usage_payload(state), !was_limited && state.paused_due_to_limit)
        };

        if limit_paused {
            info!("Usage limit reached, pausing");
            self.activity
                .append(category::CONTROLLER, "limit_paused", usage, None);
        }
        Ok(())
    }

    fn finalize_success(
        &self,
        task: &Task,
        response: &str,
        duration_ms: i64,
        now: i64,
    ) -> Result<CycleOutcome> {
        let patch = TaskPatch {
            status: Some(TaskStatus::Done),
            last_error: Some(None),
            next_retry_at: Some(None),
            ..Default::default()
        };
        if let Some(done) = self.db.update_task(&task.id, patch, now)? {
            self.publish(EventKind::TaskChanged, &done);
        }

        self.update_state(|state| state.processed_count += 1)?;
        self.log_action(ActionLog {
            task_id: task.id.clone(),
            action_type: EXECUTE_ACTION.to_string(),
            auto_approved: true,
            result: ActionResult::Success,
            output: Some(self.truncate(response)),
            duration_ms,
            timestamp: now,
        })?;

        info!(task_id = %task.id, duration_ms, "Task completed");
        Ok(CycleOutcome::Completed {
            task_id: task.id.clone(),
        })
    }

    fn finalize_failure(
        &self,
        task: &Task,
        error: &str,
        duration_ms: i64,
        now: i64,
    ) -> Result<CycleOutcome> {
        let next = scheduler::schedule_retry(task, error, now);
        if let Some(updated) = self
            .db
            .update_task(&task.id, TaskPatch::retry_state(&next), now)?
        {
            self.publish(EventKind::TaskChanged, &updated);
        }

        self.update_state(|state| state.error_count += 1)?;
        self.log_action(ActionLog {
            task_id: task.id.clone(),
            action_type: EXECUTE_ACTION.to_string(),
            auto_approved: false,
            result: ActionResult::Failure,
            output: Some(self.truncate(error)),
            duration_ms,
            timestamp: now,
        })?;

        if next.status == TaskStatus::Failed {
            error!(task_id = %task.id, attempts = next.retry_count, %error, "Task failed, retries exhausted");
        } else {
            warn!(
                task_id = %task.id,
                attempt = next.retry_count,
                retry_at = ?next.next_retry_at,
                %error,
                "Task execution failed, retry scheduled"
            );
        }

        Ok(CycleOutcome::Failed {
            task_id: task.id.clone(),
            error: error.to_string(),
            retry_at: next.next_retry_at,
        })
    }

    fn finalize_cancelled(&self, task: &Task, duration_ms: i64, now: i64) -> Result<CycleOutcome> {
        if let Some(updated) = self
            .db
            .update_task(&task.id, TaskPatch::status(TaskStatus::Todo), now)?
        {
            self.publish(EventKind::TaskChanged, &updated);
        }

        self.log_action(ActionLog {
            task_id: task.id.clone(),
            action_type: EXECUTE_ACTION.to_string(),
            auto_approved: false,
            result: ActionResult::Skipped,
            output: Some("execution cancelled".to_string()),
            duration_ms,
            timestamp: now,
        })?;

        info!(task_id = %task.id, "Task execution cancelled");
        Ok(CycleOutcome::Cancelled {
            task_id: task.id.clone(),
        })
    }

    fn park_for_approval(
        &self,
        task: &Task,
        decision: RiskDecision,
        response: &str,
        duration_ms: i64,
        now: i64,
    ) -> Result<CycleOutcome> {
        let output = self.truncate(response);
        let request = ApprovalRequest {
            id: Uuid::now_v7().to_string(),
            task_id: task.id.clone(),
            task_title: task.title.clone(),
            action_type: decision
                .action_type
                .unwrap_or(ApprovalActionType::Planning),
            description: decision
                .reason
                .unwrap_or_else(|| "Execution result needs review".to_string()),
            details: output.clone(),
            status: ApprovalStatus::Pending,
            created_at: now,
            resolved_at: None,
            resolution_reason: None,
        };
        {
            // Held across the insert so an approval cannot resolve the
            // request before it is recorded as pending.
            let mut shared = self.lock();
            self.db
                .insert_approval(&request, Some(&output), duration_ms)?;
            let state = &mut shared.state;
            match state.status {
                ControllerStatus::Running => {
                    state.status = ControllerStatus::WaitingApproval;
                    state.pending_request_id = Some(request.id.clone());
                }
                ControllerStatus::Paused => state.pending_request_id = Some(request.id.clone()),
                _ => {}
            }
            self.commit(state)?;
        }

        info!(
            task_id = %task.id,
            request_id = %request.id,
            action_type = %request.action_type,
            "Result needs approval"
        );
        self.publish(EventKind::ApprovalRequested, &request);
        self.activity.append(
            category::APPROVAL,
            "requested",
            json!({
                "request_id": request.id,
                "action_type": request.action_type,
                "reason": request.description,
            }),
            Some(&task.id),
        );

        Ok(CycleOutcome::AwaitingApproval {
            task_id: task.id.clone(),
            request_id: request.id,
        })
    }

    /// Drive the cycle until `shutdown` fires.
    ///
    /// Sleeps until the scheduler's wake time, a wake notification, or the
    /// tick interval, whichever comes first. Errors are logged and retried
    /// after a tick.
    pub async fn run(&self, shutdown: CancellationToken) {
        let tick = self.settings.tick_interval;
        info!(tick_secs = tick.as_secs(), "Controller loop started");

        while !shutdown.is_cancelled() {
            if let Err(e) = self.tick() {
                warn!(error = %e, "Usage tick failed");
            }

            let wait = match self.run_cycle().await {
                Ok(CycleOutcome::Idle {
                    wake_at: Some(wake_at),
                }) => {
                    let delta = (wake_at - self.clock.now_ms()).max(0) as u64;
                    Duration::from_millis(delta).min(tick)
                }
                Ok(
                    CycleOutcome::Idle { wake_at: None }
                    | CycleOutcome::NotRunning
                    | CycleOutcome::AwaitingApproval { .. },
                ) => tick,
                Ok(_) => continue,
                Err(e) => {
                    error!(error = %e, "Controller cycle failed");
                    tick
                }
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }

        info!("Controller loop stopped");
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Publish and persist a state change. Call with the lock held so
    /// snapshots are stored in mutation order.
    fn commit(&self, state: &ControllerState) -> Result<()> {
        self.snapshot.store(Arc::new(state.clone()));
        self.publish(EventKind::StatusChanged, state);
        self.db.save_snapshot(STATE_KEY, state)?;
        Ok(())
    }

    fn update_state(&self, update: impl FnOnce(&mut ControllerState)) -> Result<()> {
        let mut shared = self.lock();
        update(&mut shared.state);
        self.commit(&shared.state)
    }

    /// Progress is observable but not persisted.
    fn set_progress(&self, step: u32) {
        let progress = {
            let mut shared = self.lock();
            let state = &mut shared.state;
            let started_at = state
                .current_progress
                .as_ref()
                .map(|p| p.started_at)
                .unwrap_or_else(|| self.clock.now_ms());
            let progress = Progress::at_step(step, started_at);
            state.current_progress = Some(progress.clone());
            self.snapshot.store(Arc::new(state.clone()));
            progress
        };
        self.publish(EventKind::ProgressChanged, &progress);
    }

    fn log_action(&self, entry: ActionLog) -> Result<()> {
        self.db.append_action_log(&entry)?;
        self.publish(EventKind::ActionLogged, &entry);
        Ok(())
    }

    fn publish<T: Serialize>(&self, kind: EventKind, payload: &T) {
        let payload = serde_json::to_value(payload).unwrap_or_default();
        self.events.publish(ControllerEvent::new(kind, payload));
    }

    fn truncate(&self, text: &str) -> String {
        truncate_output(text, self.settings.output_limit)
    }
}

fn usage_payload(state: &ControllerState) -> Value {
    json!({
        "token_usage": state.usage.token_usage,
        "daily_token_usage": state.usage.daily_token_usage,
        "usage_limit_status": state.usage_limit_status,
        "paused_due_to_limit": state.paused_due_to_limit,
    })
}

/// Cut `text` to at most `limit` bytes on a char boundary.
pub fn truncate_output(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... [truncated]", &text[..end])
}
