//! Forward Event System
//!
//! Broadcasts rule status and statistics changes to presentation-layer
//! subscribers. Emission never blocks; events are dropped when nobody listens.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::rule::ForwardStatus;
use super::stats::ForwardStats;

/// Forward event types emitted to subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ForwardEvent {
    /// Forwarder started, stopped or failed
    StatusChanged {
        rule_id: String,
        name: String,
        status: ForwardStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Published statistics changed (at most once per publish interval)
    StatsUpdated { rule_id: String, stats: ForwardStats },
    /// Rule set was added to, edited or shrunk
    RulesChanged,
}

/// Event emitter for forwarding module
///
/// Can be a no-op for tests or when events are not needed.
#[derive(Clone)]
pub struct ForwardEventEmitter {
    sender: Option<broadcast::Sender<ForwardEvent>>,
}

impl ForwardEventEmitter {
    /// Create an emitter buffering up to `capacity` events per slow subscriber
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Some(sender),
        }
    }

    /// Create a no-op emitter
    pub fn noop() -> Self {
        Self { sender: None }
    }

    /// Subscribe to future events; a no-op emitter yields a closed receiver
    pub fn subscribe(&self) -> broadcast::Receiver<ForwardEvent> {
        match self.sender {
            Some(ref sender) => sender.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    pub fn emit(&self, event: ForwardEvent) {
        if let Some(ref sender) = self.sender {
            // Err only means there are no subscribers right now
            let _ = sender.send(event);
        }
    }

    pub fn emit_status_changed(
        &self,
        rule_id: &str,
        name: &str,
        status: ForwardStatus,
        error: Option<String>,
    ) {
        self.emit(ForwardEvent::StatusChanged {
            rule_id: rule_id.to_string(),
            name: name.to_string(),
            status,
            error,
        });
    }

    pub fn emit_stats_updated(&self, rule_id: &str, stats: ForwardStats) {
        self.emit(ForwardEvent::StatsUpdated {
            rule_id: rule_id.to_string(),
            stats,
        });
    }

    pub fn emit_rules_changed(&self) {
        self.emit(ForwardEvent::RulesChanged);
    }
}

impl std::fmt::Debug for ForwardEventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardEventEmitter")
            .field("has_sender", &self.sender.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noop_emitter() {
        let emitter = ForwardEventEmitter::noop();
        // Should not panic
        emitter.emit_status_changed("fwd-1", "web", ForwardStatus::Active, None);
        emitter.emit_rules_changed();
    }

    #[test]
    fn test_emit_without_subscribers() {
        let emitter = ForwardEventEmitter::new(4);
        emitter.emit_rules_changed();
    }

    #[tokio::test]
    async fn test_subscriber_receives_events() {
        let emitter = ForwardEventEmitter::new(4);
        let mut rx = emitter.subscribe();
        emitter.emit_status_changed("fwd-1", "web", ForwardStatus::Error, Some("bind".into()));

        match rx.recv().await.unwrap() {
            ForwardEvent::StatusChanged { rule_id, status, error, .. } => {
                assert_eq!(rule_id, "fwd-1");
                assert_eq!(status, ForwardStatus::Error);
                assert_eq!(error.as_deref(), Some("bind"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_event_serialization() {
        let event = ForwardEvent::StatusChanged {
            rule_id: "fwd-1".into(),
            name: "web".into(),
            status: ForwardStatus::Active,
            error: None,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("statusChanged"));
        assert!(json.contains("fwd-1"));
        assert!(!json.contains("error"));
    }
}
