use serde_json::Value;
use tokio::sync::broadcast;

use lumen_types::EngineEvent;

pub const EVENT_TURN_PHASE: &str = "turn.phase";
pub const EVENT_TURN_PARTIAL: &str = "turn.partial";
pub const EVENT_TURN_ESCALATED: &str = "turn.escalated";
pub const EVENT_NOTICE: &str = "notice";
pub const EVENT_SESSION_UPDATED: &str = "session.updated";
pub const EVENT_MESSAGE_APPENDED: &str = "message.appended";

const DEFAULT_CAPACITY: usize = 2048;

/// Fan-out of engine events to UI subscribers. Publishing never blocks; slow
/// subscribers observe `Lagged`.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(DEFAULT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    pub fn emit(&self, event_type: &str, properties: Value) {
        self.publish(EngineEvent::new(event_type, properties));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
