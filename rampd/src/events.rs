//! Broadcast channel for rollout events (JSON lines).
//!
//! Dashboards and tests subscribe to a live stream of transition events.
//! Slow subscribers lag and lose messages rather than applying backpressure
//! to the controller.

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::warn;

const DEFAULT_BUFFER: usize = 256;

/// Broadcast bus for daemon events.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<String>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(DEFAULT_BUFFER);
        Self { sender }
    }

    /// Subscribe to the event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.sender.subscribe()
    }

    /// Emit a structured event with payload. Dropped silently when nobody is
    /// subscribed.
    pub fn emit<T: Serialize>(&self, event: &str, data: &T) {
        let payload = json!({
            "event": event,
            "data": data,
            "timestamp": Utc::now().to_rfc3339(),
        });
        match serde_json::to_string(&payload) {
            Ok(serialized) => {
                let _ = self.sender.send(serialized);
            }
            Err(err) => warn!("Failed to serialize event {}: {}", event, err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn emit_delivers_json_with_envelope() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.emit("rollout_transition", &json!({ "feature": "widget" }));

        let msg = tokio::time::timeout(Duration::from_millis(50), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("broadcast recv failed");

        let parsed: serde_json::Value = serde_json::from_str(&msg).unwrap();
        assert_eq!(parsed["event"], "rollout_transition");
        assert_eq!(parsed["data"]["feature"], "widget");
        chrono::DateTime::parse_from_rfc3339(parsed["timestamp"].as_str().unwrap()).unwrap();
    }

    #[tokio::test]
    async fn emit_without_subscribers_is_a_noop() {
        let bus = EventBus::new();
        // Must not panic or block.
        bus.emit("rollout_transition", &json!({ "feature": "widget" }));
    }
}
