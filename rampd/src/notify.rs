//! Notification sinks for rollout events.
//!
//! Sinks are external collaborators with at-least-once semantics; the
//! controller never waits for acknowledgment, and a misbehaving sink must
//! not block a state transition.

use crate::events::EventBus;
use ramp_common::RolloutEvent;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tracing::{info, warn};

/// Receives every rollout state transition.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, event: &RolloutEvent);

    /// Name used when a sink misbehaves.
    fn name(&self) -> &'static str;
}

/// Structured-log sink; the minimum every deployment carries.
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn notify(&self, event: &RolloutEvent) {
        info!(
            feature = %event.feature_id,
            from = %event.from_stage,
            to = %event.to_stage,
            trigger = ?event.trigger,
            reason = %event.reason,
            "Rollout transition"
        );
    }

    fn name(&self) -> &'static str {
        "tracing"
    }
}

/// Publishes transitions onto the broadcast event bus for dashboards.
pub struct EventBusSink {
    bus: EventBus,
}

impl EventBusSink {
    pub fn new(bus: EventBus) -> Self {
        Self { bus }
    }
}

impl NotificationSink for EventBusSink {
    fn notify(&self, event: &RolloutEvent) {
        self.bus.emit("rollout_transition", event);
    }

    fn name(&self) -> &'static str {
        "event_bus"
    }
}

/// Fan-out over all configured sinks.
#[derive(Clone, Default)]
pub struct SinkSet {
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl SinkSet {
    pub fn new(sinks: Vec<Arc<dyn NotificationSink>>) -> Self {
        Self { sinks }
    }

    pub fn push(&mut self, sink: Arc<dyn NotificationSink>) {
        self.sinks.push(sink);
    }

    /// Deliver to every sink. A panic in one sink is contained and logged;
    /// remaining sinks still receive the event.
    pub fn notify_all(&self, event: &RolloutEvent) {
        for sink in &self.sinks {
            if catch_unwind(AssertUnwindSafe(|| sink.notify(event))).is_err() {
                warn!(sink = sink.name(), "Notification sink panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ramp_common::{FeatureId, Stage, TransitionTrigger};
    use std::sync::Mutex;

    fn event() -> RolloutEvent {
        RolloutEvent {
            event_id: uuid::Uuid::new_v4(),
            feature_id: FeatureId::new("widget"),
            from_stage: Stage::Off,
            to_stage: Stage::Canary,
            trigger: TransitionTrigger::Manual,
            reason: "start".to_string(),
            timestamp: Utc::now(),
        }
    }

    struct RecordingSink {
        seen: Mutex<Vec<RolloutEvent>>,
    }

    impl NotificationSink for RecordingSink {
        fn notify(&self, event: &RolloutEvent) {
            self.seen.lock().unwrap().push(event.clone());
        }

        fn name(&self) -> &'static str {
            "recording"
        }
    }

    struct PanickingSink;

    impl NotificationSink for PanickingSink {
        fn notify(&self, _event: &RolloutEvent) {
            panic!("sink exploded");
        }

        fn name(&self) -> &'static str {
            "panicking"
        }
    }

    #[test]
    fn fan_out_reaches_all_sinks() {
        let recorder = Arc::new(RecordingSink {
            seen: Mutex::new(Vec::new()),
        });
        let set = SinkSet::new(vec![recorder.clone(), Arc::new(TracingSink)]);

        set.notify_all(&event());
        assert_eq!(recorder.seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn panicking_sink_does_not_stop_delivery() {
        let recorder = Arc::new(RecordingSink {
            seen: Mutex::new(Vec::new()),
        });
        let set = SinkSet::new(vec![Arc::new(PanickingSink), recorder.clone()]);

        set.notify_all(&event());
        assert_eq!(recorder.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn event_bus_sink_publishes_json() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let set = SinkSet::new(vec![Arc::new(EventBusSink::new(bus))]);

        set.notify_all(&event());

        let msg = rx.try_recv().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&msg).unwrap();
        assert_eq!(parsed["event"], "rollout_transition");
        assert_eq!(parsed["data"]["to_stage"], "canary");
    }
}
