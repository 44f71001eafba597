//! Cross-cutting audit trail for controller-level events.
//!
//! The action log records one entry per finished cycle; the activity trail
//! records what happened around it (activation, pauses, approval decisions,
//! execution start and end).

use serde_json::Value;

/// Audit categories used by the controller.
pub mod category {
    pub const CONTROLLER: &str = "controller";
    pub const APPROVAL: &str = "approval";
    pub const EXECUTION: &str = "execution";
}

/// Sink for audit events. Implementations must not fail the caller.
pub trait ActivitySink: Send + Sync {
    fn append(&self, category: &str, action: &str, details: Value, context: Option<&str>);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopActivity;

impl ActivitySink for NoopActivity {
    fn append(&self, _category: &str, _action: &str, _details: Value, _context: Option<&str>) {}
}
