use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

/// One observable control-plane event (routing, invocation, breaker, alert).
#[derive(Debug, Clone, Serialize)]
pub struct GatewayEvent {
    pub event_type: String,
    pub payload: Value,
    pub timestamp_ms: u64,
}

impl GatewayEvent {
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            timestamp_ms: Utc::now().timestamp_millis() as u64,
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<GatewayEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(2048);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: GatewayEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
