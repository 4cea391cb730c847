//! Message domain types: the envelope, its state ledger, status projection,
//! and scheduling computation.

pub mod schedule;
pub mod state;
pub mod status;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::queue::QueueId;

pub use schedule::{next_occurrence, MessageSchedule};
pub use state::MessageState;
pub use status::{MessageStatus, UnackReason};

/// Where a message is bound: exactly one queue, plus a consumer group for
/// pub/sub queues.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Destination {
    pub queue: QueueId,
    pub group: Option<String>,
}

/// Message envelope: immutable user payload plus mutable delivery metadata.
/// This is the persisted record — one per message id, independently
/// addressable in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub body: Vec<u8>,
    pub priority: Option<u8>,
    /// Time-to-live in milliseconds from publish; 0 disables expiry.
    pub ttl_ms: u64,
    /// Unacknowledgements before dead-lettering.
    pub retry_threshold: u32,
    /// Delay before a failed message re-enters pending; 0 requeues in place.
    pub retry_delay_ms: u64,
    /// Handler deadline; 0 disables the timeout race.
    pub consume_timeout_ms: u64,
    pub schedule: MessageSchedule,
    destination: Option<Destination>,
    pub status: MessageStatus,
    pub state: MessageState,
}

impl Message {
    /// Generate a new UUIDv7 message ID.
    pub fn new_id() -> Uuid {
        Uuid::now_v7()
    }

    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            id: Self::new_id(),
            body: body.into(),
            priority: None,
            ttl_ms: 0,
            retry_threshold: 3,
            retry_delay_ms: 0,
            consume_timeout_ms: 0,
            schedule: MessageSchedule::default(),
            destination: None,
            status: MessageStatus::Unpublished,
            state: MessageState::new(),
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_ttl(mut self, ttl_ms: u64) -> Self {
        self.ttl_ms = ttl_ms;
        self
    }

    pub fn with_retry_threshold(mut self, threshold: u32) -> Self {
        self.retry_threshold = threshold;
        self
    }

    pub fn with_retry_delay(mut self, delay_ms: u64) -> Self {
        self.retry_delay_ms = delay_ms;
        self
    }

    pub fn with_consume_timeout(mut self, timeout_ms: u64) -> Self {
        self.consume_timeout_ms = timeout_ms;
        self
    }

    pub fn with_schedule(mut self, schedule: MessageSchedule) -> Self {
        self.schedule = schedule;
        self
    }

    /// Set the destination. A message is bound to exactly one destination
    /// for its whole life.
    ///
    /// # Panics
    ///
    /// Panics if a destination was already set — re-targeting a message is
    /// a programming error, not a recoverable condition.
    pub fn set_destination(&mut self, destination: Destination) {
        assert!(
            self.destination.is_none(),
            "message {} destination may only be set once",
            self.id
        );
        self.destination = Some(destination);
    }

    pub fn destination(&self) -> Option<&Destination> {
        self.destination.as_ref()
    }

    /// Whether the TTL has elapsed relative to `now_ms`. Unpublished
    /// messages never count as expired.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        if self.ttl_ms == 0 {
            return false;
        }
        match self.state.published_at {
            Some(published) => published.saturating_add(self.ttl_ms) <= now_ms,
            None => false,
        }
    }

    /// The immutable, serialization-safe projection handed to user handler
    /// code.
    pub fn transferable(&self) -> TransferableMessage {
        TransferableMessage {
            id: self.id,
            destination: self
                .destination
                .clone()
                .expect("transferable form requires a destination"),
            body: self.body.clone(),
            priority: self.priority,
            attempts: self.state.attempts,
            published_at: self.state.published_at,
            parent_id: self.state.parent_id,
        }
    }

    /// Create the descendant message queued for a periodic schedule firing.
    /// The child carries the parent's payload attributes but a fresh id,
    /// fresh state with lineage, and no schedule of its own.
    pub fn spawn_scheduled_child(&self) -> Message {
        let mut child = Message {
            id: Self::new_id(),
            body: self.body.clone(),
            priority: self.priority,
            ttl_ms: self.ttl_ms,
            retry_threshold: self.retry_threshold,
            retry_delay_ms: self.retry_delay_ms,
            consume_timeout_ms: self.consume_timeout_ms,
            schedule: MessageSchedule::default(),
            destination: self.destination.clone(),
            status: MessageStatus::Unpublished,
            state: MessageState::new(),
        };
        child.state.parent_id = Some(self.id);
        child
    }
}

/// Immutable projection of a message handed to user handler code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferableMessage {
    pub id: Uuid,
    pub destination: Destination,
    pub body: Vec<u8>,
    pub priority: Option<u8>,
    pub attempts: u32,
    pub published_at: Option<u64>,
    pub parent_id: Option<Uuid>,
}
