//! Tracing mirror for run events.
//!
//! [`EventLogger`] subscribes to the [`EventBus`](crate::bus::EventBus)
//! broadcast channel and writes every received [`RunEvent`] as a structured
//! `tracing` record. It runs as a background task and exits when the bus
//! sender is dropped.

use tokio::sync::broadcast;

use crate::bus::{EventKind, RunEvent};

/// Background service that logs run events.
pub struct EventLogger;

impl EventLogger {
    /// Run the logging loop until the channel closes.
    ///
    /// Returns the number of events logged.
    pub async fn run(mut receiver: broadcast::Receiver<RunEvent>) -> u64 {
        let mut logged = 0u64;
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    Self::log(&event);
                    logged += 1;
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "Event logger lagged, some events were dropped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracing::debug!("Event bus closed, event logger shutting down");
                    break;
                }
            }
        }
        logged
    }

    fn log(event: &RunEvent) {
        let rule_id = event.rule_id.as_deref().unwrap_or("");
        let record_id = event.record_id.as_deref().unwrap_or("");
        let tool = event.tool.as_deref().unwrap_or("");
        let status = event.status.map(|s| s.as_str()).unwrap_or("");
        let latency_ms = event.latency_ms.unwrap_or(0);

        match event.kind {
            EventKind::RunFailed | EventKind::ToolCallError => tracing::warn!(
                event = %event.kind,
                run_id = %event.run_id,
                rule_id,
                record_id,
                tool,
                latency_ms,
                error_code = event.error_code.as_deref().unwrap_or(""),
                "Run event",
            ),
            EventKind::RunStarted | EventKind::RunCompleted => tracing::info!(
                event = %event.kind,
                run_id = %event.run_id,
                status,
                latency_ms,
                "Run event",
            ),
            _ => tracing::debug!(
                event = %event.kind,
                run_id = %event.run_id,
                rule_id,
                record_id,
                tool,
                status,
                latency_ms,
                "Run event",
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;

    #[tokio::test]
    async fn logger_drains_until_bus_dropped() {
        let bus = EventBus::default();
        let handle = tokio::spawn(EventLogger::run(bus.subscribe()));

        bus.publish(RunEvent::new(EventKind::RunStarted, "run-1"));
        bus.publish(RunEvent::new(EventKind::ToolCallError, "run-1").with_error_code("auth"));
        bus.publish(RunEvent::new(EventKind::RunCompleted, "run-1"));
        drop(bus);

        let logged = handle.await.expect("logger task should not panic");
        assert_eq!(logged, 3);
    }
}
