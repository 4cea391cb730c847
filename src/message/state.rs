use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The mutable ledger of a message's life: counters, timestamps, and flags,
/// serialized as part of the message record. Status is derived from this.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageState {
    /// Consume tries. Only ever increases, except through `reset`.
    pub attempts: u32,
    pub requeue_count: u32,
    pub repeat_count: u32,
    pub scheduled_count: u32,

    pub published_at: Option<u64>,
    pub processing_started_at: Option<u64>,
    pub requeued_at: Option<u64>,
    pub last_requeued_at: Option<u64>,
    pub dead_lettered_at: Option<u64>,
    pub acknowledged_at: Option<u64>,
    pub unacknowledged_at: Option<u64>,
    pub last_unacknowledged_at: Option<u64>,
    pub scheduled_at: Option<u64>,
    pub last_scheduled_at: Option<u64>,
    pub last_retried_at: Option<u64>,

    pub cron_fired: bool,
    pub expired: bool,

    /// One-shot delay consumed the next time a schedule timestamp is
    /// computed. Private so the single-use contract of
    /// `take_scheduled_delay` cannot be bypassed.
    effective_scheduled_delay: u64,

    /// Parent message id when this message is the scheduled or requeued
    /// descendant of another.
    pub parent_id: Option<Uuid>,
}

impl MessageState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a one-shot delay for the next scheduling computation.
    pub fn set_scheduled_delay(&mut self, delay_ms: u64) {
        self.effective_scheduled_delay = delay_ms;
    }

    /// Read and clear the effective scheduled delay. Returns the configured
    /// value once; subsequent calls return 0 until it is armed again. This
    /// keeps a stale delay from re-applying on every scheduling computation.
    pub fn take_scheduled_delay(&mut self) -> u64 {
        std::mem::take(&mut self.effective_scheduled_delay)
    }

    pub fn increment_attempts(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    /// Clear all counters, timestamps, and flags. The only sanctioned way
    /// for `attempts` to decrease.
    pub fn reset(&mut self) {
        *self = Self {
            parent_id: self.parent_id,
            ..Self::default()
        };
    }
}
