//! Execution collaborator: runs one task prompt through an external agent.

use crate::config::ExecutorConfig;
use crate::types::TokenCounts;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// What to run.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub execution_id: String,
    pub task_id: String,
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub working_dir: Option<PathBuf>,
}

/// How it went.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub response_text: String,
    pub error: Option<String>,
    pub token_usage: Option<TokenCounts>,
    /// Set when the run was stopped through its cancellation token.
    pub cancelled: bool,
}

impl ExecutionOutcome {
    pub fn succeeded(response_text: impl Into<String>, token_usage: Option<TokenCounts>) -> Self {
        Self {
            success: true,
            response_text: response_text.into(),
            token_usage,
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn cancelled() -> Self {
        Self {
            success: false,
            error: Some("execution cancelled".to_string()),
            cancelled: true,
            ..Default::default()
        }
    }

    pub fn with_token_usage(mut self, usage: TokenCounts) -> Self {
        self.token_usage = Some(usage);
        self
    }
}

/// Runs prompts out of process. Must return promptly once `cancel` fires.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, request: ExecutionRequest, cancel: CancellationToken)
    -> ExecutionOutcome;
}

/// Runs a configured command, feeding the prompt on stdin.
pub struct ProcessExecutor {
    config: ExecutorConfig,
}

impl ProcessExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    fn build_command(&self, request: &ExecutionRequest) -> Command {
        let mut command = Command::new(&self.config.program);
        command.args(&self.config.args);

        if let (Some(flag), Some(system_prompt)) =
            (&self.config.system_prompt_flag, &request.system_prompt)
        {
            command.arg(flag).arg(system_prompt);
        }

        if let Some(dir) = request.working_dir.as_ref().or(self.config.working_dir.as_ref()) {
            command.current_dir(dir);
        }

        command
            .env("TASKPILOT_EXECUTION_ID", &request.execution_id)
            .env("TASKPILOT_TASK_ID", &request.task_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

#[async_trait]
impl Executor for ProcessExecutor {
    async fn execute(
        &self,
        request: ExecutionRequest,
        cancel: CancellationToken,
    ) -> ExecutionOutcome {
        let mut child = match self.build_command(&request).spawn() {
            Ok(child) => child,
            Err(e) => {
                return ExecutionOutcome::failed(format!(
                    "failed to spawn {}: {}",
                    self.config.program, e
                ));
            }
        };

        debug!(
            execution_id = %request.execution_id,
            pid = ?child.id(),
            "Agent process started"
        );

        // Write on a separate task so a chatty child can't deadlock us on a full pipe
        if let Some(mut stdin) = child.stdin.take() {
            let prompt = request.prompt.clone();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                    warn!(error = %e, "Failed to write prompt to agent stdin");
                }
            });
        }

        // Dropping the wait future drops the child, and kill_on_drop terminates it
        let output = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(execution_id = %request.execution_id, "Agent process cancelled");
                return ExecutionOutcome::cancelled();
            }
            output = child.wait_with_output() => output,
        };

        match output {
            Ok(output) if output.status.success() => {
                parse_agent_output(&String::from_utf8_lossy(&output.stdout))
            }
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let stderr = stderr.trim();
                let message = if stderr.is_empty() {
                    format!("agent exited with {}", output.status)
                } else {
                    format!("agent exited with {}: {}", output.status, stderr)
                };
                ExecutionOutcome::failed(message)
            }
            Err(e) => ExecutionOutcome::failed(format!("failed to wait for agent: {}", e)),
        }
    }
}

/// Interpret agent stdout.
///
/// Agents that emit a JSON envelope (`{"result": ..., "is_error": ...,
/// "usage": {"input_tokens": .., "output_tokens": ..}}`) get their text and
/// token counts extracted; anything else is taken verbatim.
pub fn parse_agent_output(stdout: &str) -> ExecutionOutcome {
    let trimmed = stdout.trim();

    let Ok(Value::Object(envelope)) = serde_json::from_str::<Value>(trimmed) else {
        return ExecutionOutcome::succeeded(trimmed, None);
    };

    let text = envelope
        .get("result")
        .and_then(Value::as_str)
        .unwrap_or(trimmed)
        .to_string();

    let usage = envelope.get("usage").map(|usage| {
        let count = |key: &str| usage.get(key).and_then(Value::as_u64).unwrap_or(0);
        TokenCounts::new(
            count("input_tokens")
                + count("cache_creation_input_tokens")
                + count("cache_read_input_tokens"),
            count("output_tokens"),
        )
    });

    let is_error = envelope
        .get("is_error")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    if is_error {
        let mut outcome = ExecutionOutcome::failed(text);
        outcome.token_usage = usage;
        outcome
    } else {
        ExecutionOutcome::succeeded(text, usage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn plain_text_is_taken_verbatim() {
        let outcome = parse_agent_output("  Updated two files.\n");
        assert!(outcome.success);
        assert_eq!(outcome.response_text, "Updated two files.");
        assert_eq!(outcome.token_usage, None);
    }

    #[test]
    fn json_envelope_yields_text_and_usage() {
        let outcome = parse_agent_output(
            r#"{"result":"Done.","is_error":false,"usage":{"input_tokens":120,"cache_read_input_tokens":30,"output_tokens":45}}"#,
        );
        assert!(outcome.success);
        assert_eq!(outcome.response_text, "Done.");
        assert_eq!(outcome.token_usage, Some(TokenCounts::new(150, 45)));
    }

    #[test]
    fn json_error_envelope_is_a_failure_with_usage() {
        let outcome = parse_agent_output(
            r#"{"result":"rate limited","is_error":true,"usage":{"input_tokens":5,"output_tokens":0}}"#,
        );
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("rate limited"));
        assert_eq!(outcome.token_usage, Some(TokenCounts::new(5, 0)));
    }

    fn request(prompt: &str) -> ExecutionRequest {
        ExecutionRequest {
            execution_id: "exec-1".into(),
            task_id: "task-1".into(),
            prompt: prompt.into(),
            system_prompt: None,
            working_dir: None,
        }
    }

    fn shell(script: &str) -> ProcessExecutor {
        ProcessExecutor::new(ExecutorConfig {
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
            system_prompt_flag: None,
            working_dir: None,
        })
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_executor_echoes_prompt() {
        let outcome = shell("cat")
            .execute(request("hello agent"), CancellationToken::new())
            .await;
        assert!(outcome.success, "{:?}", outcome.error);
        assert_eq!(outcome.response_text, "hello agent");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_executor_reports_nonzero_exit() {
        let outcome = shell("echo broken >&2; exit 3")
            .execute(request(""), CancellationToken::new())
            .await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("broken"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_executor_stops_on_cancel() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let outcome = shell("sleep 30").execute(request(""), cancel).await;
        assert!(outcome.cancelled);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn missing_program_is_a_failure() {
        let executor = ProcessExecutor::new(ExecutorConfig {
            program: "definitely-not-a-real-agent-binary".into(),
            args: vec![],
            system_prompt_flag: None,
            working_dir: None,
        });
        let outcome = executor
            .execute(request("x"), CancellationToken::new())
            .await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("failed to spawn"));
    }
}
