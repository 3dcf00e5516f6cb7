//! In-process event bus backed by a `tokio::sync::broadcast` channel.
//!
//! [`EventBus`] is the publish/subscribe hub for [`RunEvent`]s. It is
//! designed to be shared via `Arc<EventBus>` between the engine, the tool
//! orchestrator and any monitoring subscriber.

use std::fmt;

use attestor_core::outcome::CheckStatus;
use attestor_core::types::{RecordId, RuleId, RunId, Timestamp};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// EventKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "run.started")]
    RunStarted,
    #[serde(rename = "run.completed")]
    RunCompleted,
    #[serde(rename = "run.failed")]
    RunFailed,
    #[serde(rename = "tool.call.started")]
    ToolCallStarted,
    #[serde(rename = "tool.call.completed")]
    ToolCallCompleted,
    #[serde(rename = "tool.call.error")]
    ToolCallError,
    #[serde(rename = "rule.check.started")]
    RuleCheckStarted,
    #[serde(rename = "rule.check.completed")]
    RuleCheckCompleted,
}

impl EventKind {
    /// Dot-separated event name, e.g. `"tool.call.error"`.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::RunStarted => "run.started",
            EventKind::RunCompleted => "run.completed",
            EventKind::RunFailed => "run.failed",
            EventKind::ToolCallStarted => "tool.call.started",
            EventKind::ToolCallCompleted => "tool.call.completed",
            EventKind::ToolCallError => "tool.call.error",
            EventKind::RuleCheckStarted => "rule.check.started",
            EventKind::RuleCheckCompleted => "rule.check.completed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// RunEvent
// ---------------------------------------------------------------------------

/// Something that happened during a run.
///
/// Constructed via [`RunEvent::new`] and enriched with the builder methods
/// ([`with_rule`](RunEvent::with_rule), [`with_tool`](RunEvent::with_tool),
/// ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    pub kind: EventKind,
    pub run_id: RunId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<RuleId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_id: Option<RecordId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<CheckStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    pub timestamp: Timestamp,
}

impl RunEvent {
    /// Create an event with only the required fields.
    pub fn new(kind: EventKind, run_id: impl Into<RunId>) -> Self {
        Self {
            kind,
            run_id: run_id.into(),
            rule_id: None,
            record_id: None,
            tool: None,
            status: None,
            latency_ms: None,
            error_code: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_rule(mut self, rule_id: impl Into<RuleId>) -> Self {
        self.rule_id = Some(rule_id.into());
        self
    }

    pub fn with_record(mut self, record_id: Option<&str>) -> Self {
        self.record_id = record_id.map(str::to_string);
        self
    }

    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tool = Some(tool.into());
        self
    }

    pub fn with_status(mut self, status: CheckStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_latency_ms(mut self, latency_ms: u64) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }

    pub fn with_error_code(mut self, code: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 1024;

/// In-process fan-out event bus.
///
/// ```rust
/// use attestor_events::bus::{EventBus, EventKind, RunEvent};
///
/// let bus = EventBus::default();
/// let mut rx = bus.subscribe();
///
/// bus.publish(RunEvent::new(EventKind::RunStarted, "run-1"));
/// ```
pub struct EventBus {
    sender: broadcast::Sender<RunEvent>,
}

impl EventBus {
    /// Create a bus with a specific channel capacity.
    ///
    /// When the buffer is full the oldest un-consumed events are dropped and
    /// slow receivers observe `RecvError::Lagged`; publishers never wait.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all current subscribers.
    pub fn publish(&self, event: RunEvent) {
        // A SendError only means there are zero receivers.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_and_receive_single_subscriber() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        let event = RunEvent::new(EventKind::ToolCallError, "run-7")
            .with_rule("amount_matches")
            .with_record(Some("r1"))
            .with_tool("erp")
            .with_latency_ms(12)
            .with_error_code("timeout");

        bus.publish(event);

        let received = rx.recv().await.expect("should receive the event");
        assert_eq!(received.kind, EventKind::ToolCallError);
        assert_eq!(received.run_id, "run-7");
        assert_eq!(received.rule_id.as_deref(), Some("amount_matches"));
        assert_eq!(received.record_id.as_deref(), Some("r1"));
        assert_eq!(received.error_code.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn multiple_subscribers_receive_same_event() {
        let bus = EventBus::default();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(RunEvent::new(EventKind::RunStarted, "run-1"));

        let e1 = rx1.recv().await.expect("subscriber 1 should receive");
        let e2 = rx2.recv().await.expect("subscriber 2 should receive");
        assert_eq!(e1.kind, EventKind::RunStarted);
        assert_eq!(e2.kind, EventKind::RunStarted);
    }

    #[test]
    fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::default();
        bus.publish(RunEvent::new(EventKind::RunCompleted, "orphan"));
    }

    #[test]
    fn full_buffer_never_blocks_publisher() {
        let bus = EventBus::new(2);
        let _rx = bus.subscribe();
        for _ in 0..100 {
            bus.publish(RunEvent::new(EventKind::RuleCheckStarted, "busy"));
        }
    }

    #[test]
    fn wire_names_are_dotted() {
        let event = RunEvent::new(EventKind::RuleCheckCompleted, "r").with_status(CheckStatus::Warn);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "rule.check.completed");
        assert_eq!(json["status"], "warn");
        assert!(json.get("tool").is_none());
    }
}
