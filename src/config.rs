//! Configuration loading and management.
//!
//! Resolution order (first found wins for the file, then overrides apply):
//! 1. explicit path (`--config`)
//! 2. `TASKPILOT_CONFIG`
//! 3. `./taskpilot.yaml`
//! 4. `~/.taskpilot/config.yaml`
//! 5. built-in defaults
//!
//! Environment variables then override individual fields:
//! - `TASKPILOT_DB_PATH`
//! - `TASKPILOT_MAX_TOKENS_PER_HOUR`
//! - `TASKPILOT_MAX_TOKENS_PER_DAY`
//! - `TASKPILOT_EXECUTION_TIMEOUT_SECS`

use crate::risk::RiskRuleConfig;
use crate::usage::UsageLimitConfig;
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

pub const CONFIG_ENV: &str = "TASKPILOT_CONFIG";
pub const PROJECT_CONFIG_FILE: &str = "taskpilot.yaml";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub controller: ControllerConfig,

    #[serde(default)]
    pub usage: UsageLimitConfig,

    #[serde(default)]
    pub executor: ExecutorConfig,

    #[serde(default)]
    pub risk: RiskConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from(".taskpilot/taskpilot.db")
}

/// Cycle driver settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Upper bound on a single execution.
    #[serde(default = "default_execution_timeout")]
    pub execution_timeout_secs: u64,

    /// How often usage windows are re-checked while nothing else happens.
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,

    /// System prompt handed to every execution.
    #[serde(default)]
    pub system_prompt: Option<String>,

    /// Working directory for executions (defaults to the executor's own).
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// Buffered events per observer before it starts losing them.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Bytes of execution output kept in approval details and action logs.
    #[serde(default = "default_output_limit")]
    pub output_limit: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            execution_timeout_secs: default_execution_timeout(),
            tick_interval_secs: default_tick_interval(),
            system_prompt: None,
            working_dir: None,
            event_capacity: default_event_capacity(),
            output_limit: default_output_limit(),
        }
    }
}

impl ControllerConfig {
    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs.max(1))
    }
}

fn default_execution_timeout() -> u64 {
    1800 // 30 minutes
}

fn default_tick_interval() -> u64 {
    30
}

fn default_event_capacity() -> usize {
    256
}

fn default_output_limit() -> usize {
    8 * 1024
}

/// External agent command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "default_program")]
    pub program: String,

    #[serde(default = "default_args")]
    pub args: Vec<String>,

    /// Flag used to pass the system prompt, if the agent supports one.
    #[serde(default = "default_system_prompt_flag")]
    pub system_prompt_flag: Option<String>,

    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: default_args(),
            system_prompt_flag: default_system_prompt_flag(),
            working_dir: None,
        }
    }
}

fn default_program() -> String {
    "claude".to_string()
}

fn default_args() -> Vec<String> {
    vec![
        "-p".to_string(),
        "--output-format".to_string(),
        "json".to_string(),
    ]
}

fn default_system_prompt_flag() -> Option<String> {
    Some("--append-system-prompt".to_string())
}

/// Additional classifier rules.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RiskConfig {
    #[serde(default)]
    pub extra_rules: Vec<RiskRuleConfig>,
}

impl Config {
    /// Load configuration from file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }

    /// Candidate config files in priority order.
    pub fn search_paths(explicit: Option<&Path>) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Some(path) = explicit {
            paths.push(path.to_path_buf());
        }
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            paths.push(PathBuf::from(path));
        }
        paths.push(PathBuf::from(PROJECT_CONFIG_FILE));
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".taskpilot").join("config.yaml"));
        }
        paths
    }

    /// Resolve the effective configuration and the file it came from.
    ///
    /// An explicitly requested file must exist; the implicit locations are
    /// optional.
    pub fn resolve(explicit: Option<&Path>) -> Result<(Self, Option<PathBuf>)> {
        if let Some(path) = explicit {
            if !path.exists() {
                return Err(anyhow!("config file not found: {}", path.display()));
            }
        }

        let mut found = None;
        for path in Self::search_paths(explicit) {
            if path.is_file() {
                found = Some((Self::load(&path)?, Some(path)));
                break;
            }
        }
        let (mut config, path) = found.unwrap_or_else(|| (Self::default(), None));

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok((config, path))
    }

    /// Apply `TASKPILOT_*` overrides from a key lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("TASKPILOT_DB_PATH") {
            self.database.path = PathBuf::from(path);
        }

        fn parsed<T: std::str::FromStr>(key: &str, raw: Option<String>) -> Option<T> {
            let raw = raw?;
            match raw.parse() {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!(key, value = %raw, "Ignoring unparsable environment override");
                    None
                }
            }
        }

        if let Some(limit) = parsed(
            "TASKPILOT_MAX_TOKENS_PER_HOUR",
            lookup("TASKPILOT_MAX_TOKENS_PER_HOUR"),
        ) {
            self.usage.max_tokens_per_hour = limit;
        }
        if let Some(limit) = parsed(
            "TASKPILOT_MAX_TOKENS_PER_DAY",
            lookup("TASKPILOT_MAX_TOKENS_PER_DAY"),
        ) {
            self.usage.max_tokens_per_day = limit;
        }
        if let Some(timeout) = parsed(
            "TASKPILOT_EXECUTION_TIMEOUT_SECS",
            lookup("TASKPILOT_EXECUTION_TIMEOUT_SECS"),
        ) {
            self.controller.execution_timeout_secs = timeout;
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.usage
            .validate()
            .map_err(|e| anyhow!("invalid usage config: {}", e))?;
        if self.controller.execution_timeout_secs == 0 {
            return Err(anyhow!("controller.execution_timeout_secs must be > 0"));
        }
        if self.executor.program.trim().is_empty() {
            return Err(anyhow!("executor.program must not be empty"));
        }
        Ok(())
    }

    /// Ensure the database directory exists.
    pub fn ensure_db_dir(&self) -> Result<()> {
        if let Some(parent) = self.database.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn empty_yaml_yields_defaults() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.database.path, default_db_path());
        assert_eq!(config.controller.execution_timeout_secs, 1800);
        assert_eq!(config.usage, UsageLimitConfig::default());
        assert_eq!(config.executor.program, "claude");
        assert!(config.risk.extra_rules.is_empty());
    }

    #[test]
    fn partial_yaml_keeps_other_defaults() {
        let yaml = r#"
usage:
  max_tokens_per_hour: 5000
  pause_threshold: 0.9
executor:
  program: my-agent
  args: ["--json"]
risk:
  extra_rules:
    - pattern: "(?i)migrat(e|ion)"
      action_type: architecture
      reason: Schema migration
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.usage.max_tokens_per_hour, 5000);
        assert_eq!(config.usage.pause_threshold, 0.9);
        assert_eq!(config.usage.warning_threshold, 0.6);
        assert_eq!(config.executor.args, vec!["--json"]);
        assert_eq!(
            config.executor.system_prompt_flag.as_deref(),
            Some("--append-system-prompt")
        );
        assert_eq!(config.risk.extra_rules.len(), 1);
    }

    #[test]
    fn overrides_apply_and_bad_values_are_ignored() {
        let env: HashMap<&str, &str> = [
            ("TASKPILOT_DB_PATH", "/tmp/pilot.db"),
            ("TASKPILOT_MAX_TOKENS_PER_HOUR", "1234"),
            ("TASKPILOT_MAX_TOKENS_PER_DAY", "lots"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.database.path, PathBuf::from("/tmp/pilot.db"));
        assert_eq!(config.usage.max_tokens_per_hour, 1234);
        assert_eq!(
            config.usage.max_tokens_per_day,
            UsageLimitConfig::default().max_tokens_per_day
        );
    }

    #[test]
    fn explicit_file_is_loaded() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pilot.yaml");
        std::fs::write(&path, "controller:\n  tick_interval_secs: 5\n").unwrap();

        let (config, used) = Config::resolve(Some(&path)).unwrap();
        assert_eq!(config.controller.tick_interval_secs, 5);
        assert_eq!(used.as_deref(), Some(path.as_path()));
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(Config::resolve(Some(&dir.path().join("nope.yaml"))).is_err());
    }

    #[test]
    fn validate_rejects_inverted_thresholds() {
        let mut config = Config::default();
        config.usage.warning_threshold = 0.95;
        assert!(config.validate().is_err());
    }
}
