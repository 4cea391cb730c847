//! Typed event fan-out.
//!
//! Components communicate outward through a fixed, enumerated event set
//! over a broadcast channel — no dynamic event-name maps. Subscribers that
//! lag or disconnect never block an emitter.

use uuid::Uuid;

use crate::message::UnackReason;
use crate::queue::QueueId;

/// Component lifecycle transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    GoingUp,
    Up,
    GoingDown,
    Down,
}

/// Everything the engine reports to collaborators.
#[derive(Debug, Clone)]
pub enum Event {
    /// A component moved through its lifecycle.
    Component {
        component: String,
        transition: Transition,
    },
    /// A component hit its generic error path.
    ComponentError { component: String, error: String },

    MessageReceived {
        message_id: Uuid,
        queue: QueueId,
        consumer_id: Uuid,
    },
    MessageAcknowledged {
        message_id: Uuid,
        queue: QueueId,
        consumer_id: Uuid,
    },
    MessageUnacknowledged {
        message_id: Uuid,
        queue: QueueId,
        consumer_id: Uuid,
        reason: UnackReason,
    },
    MessageDeadLettered {
        message_id: Uuid,
        queue: QueueId,
        consumer_id: Uuid,
    },
    MessageDelayed {
        message_id: Uuid,
        queue: QueueId,
        consumer_id: Uuid,
    },
    MessageRequeued {
        message_id: Uuid,
        queue: QueueId,
        consumer_id: Uuid,
    },

    LockUp { lock_id: String },
    LockDown { lock_id: String },
    LockError { lock_id: String, error: String },
}

/// Cloneable handle for emitting events. Emission never fails: with no
/// subscribers the event is simply dropped.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emit_without_subscribers_is_fine() {
        let bus = EventBus::new(8);
        bus.emit(Event::LockUp {
            lock_id: "l1".to_string(),
        });
    }

    #[tokio::test]
    async fn subscribers_receive_emitted_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.emit(Event::Component {
            component: "dequeue".to_string(),
            transition: Transition::Up,
        });
        match rx.recv().await.unwrap() {
            Event::Component { component, transition } => {
                assert_eq!(component, "dequeue");
                assert_eq!(transition, Transition::Up);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
