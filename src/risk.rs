//! Risk classification of execution output.
//!
//! Only the agent's reported output is inspected, never the task's own
//! title or description: the operator already approved the intent when the
//! task was queued. Classification is best-effort pattern matching, so
//! missed risks are possible.

use crate::types::ApprovalActionType;
use anyhow::{Context, Result};
use regex_lite::Regex;
use serde::{Deserialize, Serialize};

/// Outcome of classifying one execution result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskDecision {
    pub requires_approval: bool,
    pub reason: Option<String>,
    pub action_type: Option<ApprovalActionType>,
}

impl RiskDecision {
    pub fn safe() -> Self {
        Self {
            requires_approval: false,
            reason: None,
            action_type: None,
        }
    }

    pub fn flagged(action_type: ApprovalActionType, reason: impl Into<String>) -> Self {
        Self {
            requires_approval: true,
            reason: Some(reason.into()),
            action_type: Some(action_type),
        }
    }
}

/// Strategy for deciding whether an execution result needs a human.
pub trait RiskClassifier: Send + Sync {
    fn classify(&self, text: &str) -> RiskDecision;
}

/// A classifier rule as written in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskRuleConfig {
    pub pattern: String,
    pub action_type: ApprovalActionType,
    pub reason: String,
}

struct RiskRule {
    regex: Regex,
    action_type: ApprovalActionType,
    reason: String,
}

/// Built-in rules, checked in order.
const BUILTIN_RULES: &[(&str, ApprovalActionType, &str)] = &[
    (
        r"(?i)\bgit\s+push\b|\b(force[- ]?)?pushed\s+(\S+\s+)?to\s+(origin|upstream|remote)\b|\bforce[- ]push|\b(npm|cargo|pnpm|yarn)\s+publish\b|\bpublished\s+(the\s+)?(package|crate)\b",
        ApprovalActionType::GitPush,
        "Output reports publishing changes to a remote",
    ),
    (
        r"(?i)\brm\s+-(rf|fr|r)\b|\b(deleted|removed)\s+\d{2,}\s+files\b|\b(wiped|deleted|removed)\s+(the\s+)?(entire\s+)?(directory|folder|repository|repo)\b",
        ApprovalActionType::LargeEdit,
        "Output reports bulk file deletion",
    ),
    (
        r"(?i)\bdrop\s+(table|database|schema|collection)\b|\btruncate\s+(table\s+)?\w+|\bdelete\s+from\s+\w+\s*(;|$)|\bflushall\b|\bflushdb\b",
        ApprovalActionType::Architecture,
        "Output reports a destructive data-store operation",
    ),
    (
        r"(?i)\b(deployed|released|shipped|promoted)\s+(\S+\s+)?to\s+(production|prod)\b|\bproduction\s+(deploy|deployment|release)\b|\b(released|tagged)\s+(release\s+)?v\d+(\.\d+)*\b",
        ApprovalActionType::GitPush,
        "Output reports a production release",
    ),
];

/// Ordered regex rules; the first match wins.
pub struct PatternClassifier {
    rules: Vec<RiskRule>,
}

impl PatternClassifier {
    /// Built-in rules followed by `extra` rules from configuration.
    pub fn new(extra: &[RiskRuleConfig]) -> Result<Self> {
        let mut rules = Vec::with_capacity(BUILTIN_RULES.len() + extra.len());

        for (pattern, action_type, reason) in BUILTIN_RULES {
            rules.push(RiskRule {
                regex: Regex::new(pattern).context("built-in risk pattern")?,
                action_type: *action_type,
                reason: (*reason).to_string(),
            });
        }

        for rule in extra {
            rules.push(RiskRule {
                regex: Regex::new(&rule.pattern)
                    .with_context(|| format!("invalid risk pattern: {}", rule.pattern))?,
                action_type: rule.action_type,
                reason: rule.reason.clone(),
            });
        }

        Ok(Self { rules })
    }

    /// Built-in rules only.
    pub fn builtin() -> Result<Self> {
        Self::new(&[])
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}

impl RiskClassifier for PatternClassifier {
    fn classify(&self, text: &str) -> RiskDecision {
        self.rules
            .iter()
            .find(|rule| rule.regex.is_match(text))
            .map(|rule| RiskDecision::flagged(rule.action_type, rule.reason.clone()))
            .unwrap_or_else(RiskDecision::safe)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(text: &str) -> RiskDecision {
        PatternClassifier::builtin().unwrap().classify(text)
    }

    #[test]
    fn push_to_origin_requires_approval() {
        let decision = classify("Committed the fix and pushed to origin/main.");
        assert!(decision.requires_approval);
        assert_eq!(decision.action_type, Some(ApprovalActionType::GitPush));
        assert!(decision.reason.is_some());
    }

    #[test]
    fn prose_about_code_changes_is_safe() {
        let decision = classify(
            "Refactored the session module, added unit tests for token refresh \
             and updated the README with the new configuration options.",
        );
        assert_eq!(decision, RiskDecision::safe());
    }

    #[test]
    fn recognizes_each_category() {
        assert_eq!(
            classify("Ran `git push --force` on the feature branch").action_type,
            Some(ApprovalActionType::GitPush)
        );
        assert_eq!(
            classify("Cleaned up with rm -rf build/ and deleted 42 files").action_type,
            Some(ApprovalActionType::LargeEdit)
        );
        assert_eq!(
            classify("Executed DROP TABLE users; to reset the schema").action_type,
            Some(ApprovalActionType::Architecture)
        );
        assert_eq!(
            classify("The service was deployed to production at 14:02").action_type,
            Some(ApprovalActionType::GitPush)
        );
    }

    #[test]
    fn first_matching_rule_wins() {
        // Mentions both a bulk deletion and a push; push is checked first.
        let decision = classify("Removed 30 files and pushed to origin");
        assert_eq!(decision.action_type, Some(ApprovalActionType::GitPush));
    }

    #[test]
    fn qualified_delete_is_not_flagged() {
        assert!(!classify("DELETE FROM sessions WHERE expired = 1").requires_approval);
    }

    #[test]
    fn extra_rules_run_after_builtins() {
        let classifier = PatternClassifier::new(&[RiskRuleConfig {
            pattern: r"(?i)\bnew\s+architecture\b".into(),
            action_type: ApprovalActionType::Planning,
            reason: "Proposes a new architecture".into(),
        }])
        .unwrap();
        assert_eq!(classifier.rule_count(), BUILTIN_RULES.len() + 1);

        let decision = classifier.classify("Drafted a new architecture for the sync engine");
        assert_eq!(decision.action_type, Some(ApprovalActionType::Planning));
    }

    #[test]
    fn invalid_extra_rule_is_rejected() {
        let result = PatternClassifier::new(&[RiskRuleConfig {
            pattern: "(unclosed".into(),
            action_type: ApprovalActionType::Planning,
            reason: "broken".into(),
        }]);
        assert!(result.is_err());
    }
}
