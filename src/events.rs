//! Controller event broadcasting.
//!
//! Every observable mutation of controller state is published as a
//! [`ControllerEvent`]. Delivery is fire-and-forget: publishing never blocks,
//! and a subscriber that falls behind loses the oldest events.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

/// Categories of observable changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Controller status or counters changed.
    StatusChanged,
    /// Progress of the current execution moved.
    ProgressChanged,
    /// A task was created, updated, or had its status changed.
    TaskChanged,
    /// An approval request was added.
    ApprovalRequested,
    /// An approval request was approved or rejected.
    ApprovalResolved,
    /// An action log entry was appended.
    ActionLogged,
    /// Token usage or limit status changed.
    UsageChanged,
}

impl EventKind {
    /// Channel name observers listen on.
    pub fn event_name(&self) -> &'static str {
        match self {
            EventKind::StatusChanged => "taskpilot:status",
            EventKind::ProgressChanged => "taskpilot:progress",
            EventKind::TaskChanged => "taskpilot:task",
            EventKind::ApprovalRequested => "taskpilot:approval-requested",
            EventKind::ApprovalResolved => "taskpilot:approval-resolved",
            EventKind::ActionLogged => "taskpilot:action",
            EventKind::UsageChanged => "taskpilot:usage",
        }
    }
}

/// One published change.
#[derive(Debug, Clone, Serialize)]
pub struct ControllerEvent {
    pub kind: EventKind,
    pub payload: Value,
}

impl ControllerEvent {
    pub fn new(kind: EventKind, payload: Value) -> Self {
        Self { kind, payload }
    }

    pub fn name(&self) -> &'static str {
        self.kind.event_name()
    }
}

/// Fire-and-forget publisher.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: ControllerEvent);
}

/// In-process broadcast bus.
pub struct EventBus {
    sender: broadcast::Sender<ControllerEvent>,
}

impl EventBus {
    pub const DEFAULT_CAPACITY: usize = 256;

    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

impl EventPublisher for EventBus {
    fn publish(&self, event: ControllerEvent) {
        // No subscribers is not an error
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn publish_without_subscribers_is_silent() {
        let bus = EventBus::default();
        bus.publish(ControllerEvent::new(EventKind::StatusChanged, json!({})));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn subscribers_receive_events_in_order() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        bus.publish(ControllerEvent::new(EventKind::TaskChanged, json!({"id": "a"})));
        bus.publish(ControllerEvent::new(EventKind::ActionLogged, json!({"id": "b"})));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.name(), "taskpilot:task");
        assert_eq!(first.payload["id"], "a");
        let second = rx.recv().await.unwrap();
        assert_eq!(second.kind, EventKind::ActionLogged);
    }

    #[tokio::test]
    async fn slow_subscriber_lags_instead_of_blocking() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for i in 0..5 {
            bus.publish(ControllerEvent::new(EventKind::ProgressChanged, json!({ "step": i })));
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
    }
}
