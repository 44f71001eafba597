//! Token budget tracking with hourly and daily windows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const HOUR_MS: i64 = 60 * 60 * 1000;

/// Budget and threshold settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageLimitConfig {
    /// Hourly token budget (input + output). 0 disables the hourly limit.
    #[serde(default = "default_max_tokens_per_hour")]
    pub max_tokens_per_hour: u64,

    /// Daily token budget (input + output). 0 disables the daily limit.
    #[serde(default = "default_max_tokens_per_day")]
    pub max_tokens_per_day: u64,

    /// Fraction of a budget at which the controller pauses.
    #[serde(default = "default_pause_threshold")]
    pub pause_threshold: f64,

    /// Fraction of a budget at which status turns to warning.
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: f64,

    /// Resume automatically when the hourly window rolls over after a limit pause.
    #[serde(default = "default_auto_resume")]
    pub auto_resume_on_reset: bool,
}

impl Default for UsageLimitConfig {
    fn default() -> Self {
        Self {
            max_tokens_per_hour: default_max_tokens_per_hour(),
            max_tokens_per_day: default_max_tokens_per_day(),
            pause_threshold: default_pause_threshold(),
            warning_threshold: default_warning_threshold(),
            auto_resume_on_reset: default_auto_resume(),
        }
    }
}

fn default_max_tokens_per_hour() -> u64 {
    200_000
}

fn default_max_tokens_per_day() -> u64 {
    2_000_000
}

fn default_pause_threshold() -> f64 {
    0.8
}

fn default_warning_threshold() -> f64 {
    0.6
}

fn default_auto_resume() -> bool {
    true
}

impl UsageLimitConfig {
    pub fn validate(&self) -> Result<(), String> {
        for (name, value) in [
            ("pause_threshold", self.pause_threshold),
            ("warning_threshold", self.warning_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(format!("{} must be within [0, 1], got {}", name, value));
            }
        }
        if self.warning_threshold > self.pause_threshold {
            return Err(format!(
                "warning_threshold ({}) must not exceed pause_threshold ({})",
                self.warning_threshold, self.pause_threshold
            ));
        }
        Ok(())
    }
}

/// Rolling hourly window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub limit: u64,
    /// End of the current window.
    pub reset_at: i64,
}

/// Calendar-day window (UTC).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyTokenUsage {
    pub input: u64,
    pub output: u64,
    /// `YYYY-MM-DD`
    pub date: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UsageLimitStatus {
    #[default]
    Ok,
    Warning,
    ApproachingLimit,
    AtLimit,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UsagePercentages {
    pub hourly: f64,
    pub daily: f64,
}

/// Which windows were reset by a rollover check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rollover {
    pub hourly: bool,
    pub daily: bool,
}

fn utc_date(now: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(now)
        .map(|dt| dt.date_naive().to_string())
        .unwrap_or_default()
}

fn percent(used: u64, limit: u64) -> f64 {
    if limit == 0 {
        return 0.0;
    }
    100.0 * used as f64 / limit as f64
}

/// Token windows plus the budget they are measured against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageLimiter {
    pub token_usage: TokenUsage,
    pub daily_token_usage: DailyTokenUsage,
    pub usage_limit_config: UsageLimitConfig,
}

impl UsageLimiter {
    pub fn new(config: UsageLimitConfig, now: i64) -> Self {
        Self {
            token_usage: TokenUsage {
                input_tokens: 0,
                output_tokens: 0,
                limit: config.max_tokens_per_hour,
                reset_at: now + HOUR_MS,
            },
            daily_token_usage: DailyTokenUsage {
                input: 0,
                output: 0,
                date: utc_date(now),
            },
            usage_limit_config: config,
        }
    }

    /// Replace the budget settings, keeping consumption.
    pub fn set_config(&mut self, config: UsageLimitConfig) {
        self.token_usage.limit = config.max_tokens_per_hour;
        self.usage_limit_config = config;
    }

    /// Reset any window whose period has elapsed. No residue is carried.
    pub fn roll_windows(&mut self, now: i64) -> Rollover {
        let mut rollover = Rollover::default();

        if now >= self.token_usage.reset_at {
            self.token_usage.input_tokens = 0;
            self.token_usage.output_tokens = 0;
            self.token_usage.reset_at = now + HOUR_MS;
            rollover.hourly = true;
        }

        let today = utc_date(now);
        if today != self.daily_token_usage.date {
            self.daily_token_usage = DailyTokenUsage {
                input: 0,
                output: 0,
                date: today,
            };
            rollover.daily = true;
        }

        rollover
    }

    /// Add consumption to both windows, rolling them first if due.
    pub fn record(&mut self, input: u64, output: u64, now: i64) -> Rollover {
        let rollover = self.roll_windows(now);

        // Counts come from the agent's own report
        let hourly = &mut self.token_usage;
        hourly.input_tokens = hourly.input_tokens.saturating_add(input);
        hourly.output_tokens = hourly.output_tokens.saturating_add(output);
        let daily = &mut self.daily_token_usage;
        daily.input = daily.input.saturating_add(input);
        daily.output = daily.output.saturating_add(output);

        rollover
    }

    pub fn percentages(&self) -> UsagePercentages {
        UsagePercentages {
            hourly: percent(
                self.token_usage
                    .input_tokens
                    .saturating_add(self.token_usage.output_tokens),
                self.usage_limit_config.max_tokens_per_hour,
            ),
            daily: percent(
                self.daily_token_usage
                    .input
                    .saturating_add(self.daily_token_usage.output),
                self.usage_limit_config.max_tokens_per_day,
            ),
        }
    }

    pub fn status(&self) -> UsageLimitStatus {
        status(self.percentages(), &self.usage_limit_config)
    }
}

/// Derive the status level from window percentages.
pub fn status(percentages: UsagePercentages, config: &UsageLimitConfig) -> UsageLimitStatus {
    let worst = percentages.hourly.max(percentages.daily);

    if worst >= 100.0 {
        UsageLimitStatus::AtLimit
    } else if worst >= 100.0 * config.pause_threshold {
        UsageLimitStatus::ApproachingLimit
    } else if worst >= 100.0 * config.warning_threshold {
        UsageLimitStatus::Warning
    } else {
        UsageLimitStatus::Ok
    }
}

pub fn should_pause(status: UsageLimitStatus) -> bool {
    matches!(
        status,
        UsageLimitStatus::AtLimit | UsageLimitStatus::ApproachingLimit
    )
}

/// Auto-resume only undoes a limit pause, never a manual one.
pub fn should_auto_resume(
    config: &UsageLimitConfig,
    hourly_just_reset: bool,
    paused_due_to_limit: bool,
) -> bool {
    config.auto_resume_on_reset && hourly_just_reset && paused_due_to_limit
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2026-03-01T10:00:00Z
    const T0: i64 = 1_772_359_200_000;

    fn limiter(per_hour: u64, per_day: u64) -> UsageLimiter {
        UsageLimiter::new(
            UsageLimitConfig {
                max_tokens_per_hour: per_hour,
                max_tokens_per_day: per_day,
                ..Default::default()
            },
            T0,
        )
    }

    #[test]
    fn record_adds_to_both_windows() {
        let mut l = limiter(1_000, 10_000);
        l.record(100, 50, T0 + 1);
        l.record(10, 5, T0 + 2);

        assert_eq!(l.token_usage.input_tokens, 110);
        assert_eq!(l.token_usage.output_tokens, 55);
        assert_eq!(l.daily_token_usage.input, 110);
        assert_eq!(l.daily_token_usage.output, 55);

        let pct = l.percentages();
        assert!((pct.hourly - 16.5).abs() < 1e-9);
        assert!((pct.daily - 1.65).abs() < 1e-9);
    }

    #[test]
    fn oversized_reports_saturate() {
        let mut l = limiter(1_000, 10_000);
        l.record(u64::MAX, u64::MAX, T0 + 1);
        l.record(5, 5, T0 + 2);

        assert_eq!(l.token_usage.input_tokens, u64::MAX);
        assert_eq!(l.daily_token_usage.output, u64::MAX);
        assert_eq!(l.status(), UsageLimitStatus::AtLimit);
    }

    #[test]
    fn percentages_never_decrease_within_a_window() {
        let mut l = limiter(1_000, 10_000);
        let mut last = l.percentages();
        for i in 0..20 {
            l.record(i * 7, i * 3, T0 + i as i64 * 1_000);
            let now = l.percentages();
            assert!(now.hourly >= last.hourly);
            assert!(now.daily >= last.daily);
            last = now;
        }
    }

    #[test]
    fn hourly_rollover_drops_previous_consumption() {
        let mut l = limiter(1_000, 10_000);
        l.record(600, 300, T0 + 10);
        assert!((l.percentages().hourly - 90.0).abs() < 1e-9);

        let rollover = l.record(50, 50, T0 + HOUR_MS + 1);
        assert!(rollover.hourly);
        assert!(!rollover.daily);
        assert!((l.percentages().hourly - 10.0).abs() < 1e-9);
        // Daily window keeps accumulating
        assert_eq!(l.daily_token_usage.input + l.daily_token_usage.output, 1_000);
        assert_eq!(l.token_usage.reset_at, T0 + 2 * HOUR_MS + 1);
    }

    #[test]
    fn daily_rollover_at_date_change() {
        let mut l = limiter(1_000, 10_000);
        l.record(400, 100, T0);
        let tomorrow = T0 + 24 * HOUR_MS;
        let rollover = l.roll_windows(tomorrow);
        assert!(rollover.hourly && rollover.daily);
        assert_eq!(l.daily_token_usage.input, 0);
        assert_eq!(l.daily_token_usage.date, "2026-03-02");
    }

    #[test]
    fn status_thresholds() {
        let config = UsageLimitConfig::default();
        let at = |hourly: f64, daily: f64| status(UsagePercentages { hourly, daily }, &config);

        assert_eq!(at(10.0, 10.0), UsageLimitStatus::Ok);
        assert_eq!(at(60.0, 0.0), UsageLimitStatus::Warning);
        assert_eq!(at(0.0, 80.0), UsageLimitStatus::ApproachingLimit);
        assert_eq!(at(99.9, 0.0), UsageLimitStatus::ApproachingLimit);
        assert_eq!(at(100.0, 0.0), UsageLimitStatus::AtLimit);
        assert_eq!(at(5.0, 140.0), UsageLimitStatus::AtLimit);
    }

    #[test]
    fn pause_and_resume_decisions() {
        assert!(should_pause(UsageLimitStatus::AtLimit));
        assert!(should_pause(UsageLimitStatus::ApproachingLimit));
        assert!(!should_pause(UsageLimitStatus::Warning));
        assert!(!should_pause(UsageLimitStatus::Ok));

        let config = UsageLimitConfig::default();
        assert!(should_auto_resume(&config, true, true));
        assert!(!should_auto_resume(&config, true, false));
        assert!(!should_auto_resume(&config, false, true));

        let manual = UsageLimitConfig {
            auto_resume_on_reset: false,
            ..Default::default()
        };
        assert!(!should_auto_resume(&manual, true, true));
    }

    #[test]
    fn zero_limit_means_unlimited() {
        let mut l = limiter(0, 0);
        l.record(1_000_000, 1_000_000, T0);
        assert_eq!(l.status(), UsageLimitStatus::Ok);
    }

    #[test]
    fn validate_rejects_bad_thresholds() {
        let mut config = UsageLimitConfig::default();
        assert!(config.validate().is_ok());

        config.pause_threshold = 1.5;
        assert!(config.validate().is_err());

        config.pause_threshold = 0.5;
        config.warning_threshold = 0.7;
        assert!(config.validate().is_err());
    }
}
