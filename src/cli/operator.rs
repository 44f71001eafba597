//! Operator console commands read from stdin while the controller runs.

use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorCommand {
    Status,
    Activate,
    Deactivate,
    Pause,
    Resume,
    Approvals,
    Approve(String),
    Reject { id: String, reason: Option<String> },
    Cancel(String),
    Help,
    /// Deactivate and exit.
    Stop,
}

pub const HELP: &str = "\
commands:
  status                 show controller state
  activate | deactivate  start or stop the cycle
  pause | resume         hold or continue task selection
  approvals              list pending approval requests
  approve <id>           approve a request
  reject <id> [reason]   reject a request
  cancel <task-id>       cancel the running execution of a task
  stop | quit            deactivate and exit";

impl FromStr for OperatorCommand {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let (verb, rest) = match line.split_once(char::is_whitespace) {
            Some((verb, rest)) => (verb, rest.trim()),
            None => (line, ""),
        };

        let required = |what: &str| -> Result<String, String> {
            let arg = rest.split_whitespace().next().unwrap_or_default();
            if arg.is_empty() {
                Err(format!("{} requires {}", verb, what))
            } else {
                Ok(arg.to_string())
            }
        };

        match verb.to_lowercase().as_str() {
            "status" | "s" => Ok(OperatorCommand::Status),
            "activate" | "start" => Ok(OperatorCommand::Activate),
            "deactivate" => Ok(OperatorCommand::Deactivate),
            "pause" => Ok(OperatorCommand::Pause),
            "resume" => Ok(OperatorCommand::Resume),
            "approvals" | "pending" => Ok(OperatorCommand::Approvals),
            "approve" => Ok(OperatorCommand::Approve(required("a request id")?)),
            "reject" => {
                let id = required("a request id")?;
                let reason = rest[id.len()..].trim();
                Ok(OperatorCommand::Reject {
                    id,
                    reason: (!reason.is_empty()).then(|| reason.to_string()),
                })
            }
            "cancel" => Ok(OperatorCommand::Cancel(required("a task id")?)),
            "help" | "?" => Ok(OperatorCommand::Help),
            "stop" | "quit" | "exit" => Ok(OperatorCommand::Stop),
            other => Err(format!("unknown command '{}' (try 'help')", other)),
        }
    }
}
