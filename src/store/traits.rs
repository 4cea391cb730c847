//! The atomic-operation contract between the engines and the backing store.
//!
//! Every method here is a single atomic transition on the store side —
//! either one server-side script or one optimistic transaction. The engines
//! never compose multi-step mutations out of these; each method's reply
//! tells the caller exactly which branch the store took.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::AckRetention;
use crate::error::StoreError;
use crate::message::{Message, UnackReason};
use crate::queue::{QueueId, QueueProperties, QueueType, RateLimit};

/// Reply of the pending→processing checkout transition.
#[derive(Debug)]
pub enum CheckoutOutcome {
    /// Transition applied; the updated record is returned.
    Checked(Box<Message>),
    /// The record exists but is not in pending status.
    NotPending,
    /// No record under this id.
    NotFound,
}

/// Reply of the acknowledge transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Acknowledged,
    /// The message was not in this consumer's processing list. Unreachable
    /// through the dequeue→consume pairing; reaching it means double
    /// delivery.
    NotInProcessing,
}

/// Which branch the unacknowledgement resolver took for one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnackOutcome {
    Requeued,
    Delayed,
    DeadLettered,
}

/// Snapshot of per-queue counters. These double as capacity/back-pressure
/// signals for producers and operators, which is why every transition
/// adjusts them in the same atomic operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounters {
    pub pending: u64,
    pub processing: u64,
    pub acknowledged: u64,
    pub dead_lettered: u64,
    pub scheduled: u64,
}

/// Presence record a consumer registers against a queue at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumerInfo {
    pub hostname: String,
    pub pid: u32,
    pub started_at: u64,
}

impl ConsumerInfo {
    pub fn for_this_process() -> Self {
        Self {
            hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string()),
            pid: std::process::id(),
            started_at: crate::clock::now_ms(),
        }
    }
}

/// What a schedule promotion pushes into pending.
#[derive(Debug)]
pub enum PromoteTarget {
    /// The scheduled message itself becomes pending (one-shot delays,
    /// delayed retries).
    Original,
    /// A descendant goes to pending while the original stays the schedule
    /// anchor (periodic schedules).
    Child(Box<Message>),
}

/// One due scheduled message leaving the scheduled set, applied atomically:
/// remove from scheduled, persist the updated original record (or delete it
/// when exhausted with a child target), persist and enqueue the target, and
/// adjust counters — all in one transition.
#[derive(Debug)]
pub struct SchedulePromotion {
    /// The original record with its state already advanced by the caller
    /// (scheduled counters, repeat bookkeeping, status).
    pub original: Message,
    pub target: PromoteTarget,
    /// Re-arm timestamp for the original; `None` means the schedule is
    /// exhausted.
    pub next_fire_at: Option<u64>,
}

/// Parameters of a dequeue stream: one per (consumer, queue) subscription.
#[derive(Debug, Clone)]
pub struct DequeueTarget {
    pub queue: QueueId,
    pub group: Option<String>,
    pub consumer_id: Uuid,
    pub queue_type: QueueType,
}

/// Dequeue-side connection handle. Obtained per subscription; an exclusive
/// handle owns a private connection so indefinite blocking pops cannot
/// starve anyone else. Dropped handles are destroyed, never reused — the
/// server may still consider them mid-block.
#[async_trait]
pub trait DequeueHandle: Send {
    /// One non-blocking pop-and-push attempt from pending to this
    /// consumer's processing structure. Priority targets pop the
    /// highest-priority item, insertion order within equal priority.
    async fn pop(&mut self, target: &DequeueTarget) -> Result<Option<Uuid>, StoreError>;

    /// Blocking pop-and-push with indefinite wait. Only valid for FIFO and
    /// LIFO targets. May return `None` if the wait is interrupted.
    async fn pop_blocking(&mut self, target: &DequeueTarget) -> Result<Option<Uuid>, StoreError>;
}

/// The backing store. Implementations must be thread-safe; all operations
/// are atomic on the store side and fail only with infrastructure errors —
/// domain branches come back through the typed replies.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Acquire a dequeue handle. `exclusive` requests a private connection,
    /// required for blocking pops.
    async fn dequeue_handle(&self, exclusive: bool) -> Result<Box<dyn DequeueHandle>, StoreError>;

    // --- Queue operations ---

    /// Create a queue. Returns false if it already exists.
    async fn create_queue(
        &self,
        queue: &QueueId,
        properties: &QueueProperties,
    ) -> Result<bool, StoreError>;

    /// Latest committed queue configuration.
    async fn queue_properties(
        &self,
        queue: &QueueId,
    ) -> Result<Option<QueueProperties>, StoreError>;

    /// Register a consumer's presence against a queue, failing fast (false)
    /// if the queue does not exist.
    async fn register_consumer(
        &self,
        queue: &QueueId,
        consumer_id: Uuid,
        info: &ConsumerInfo,
    ) -> Result<bool, StoreError>;

    async fn deregister_consumer(&self, queue: &QueueId, consumer_id: Uuid)
        -> Result<(), StoreError>;

    /// Create the consumer group if it does not exist yet.
    async fn ensure_group(&self, queue: &QueueId, group: &str) -> Result<(), StoreError>;

    async fn queue_counters(&self, queue: &QueueId) -> Result<QueueCounters, StoreError>;

    // --- Message records ---

    async fn get_message(&self, namespace: &str, id: Uuid) -> Result<Option<Message>, StoreError>;

    // --- Publish paths ---

    /// Persist the record and insert it into pending (priority-aware).
    /// Returns false if the destination queue does not exist.
    async fn publish_pending(&self, message: &Message) -> Result<bool, StoreError>;

    /// Persist the record and park it in the scheduled set.
    /// Returns false if the destination queue does not exist.
    async fn publish_scheduled(
        &self,
        message: &Message,
        fire_at_ms: u64,
    ) -> Result<bool, StoreError>;

    // --- Delivery transitions ---

    /// Atomic pending→processing status transition, conditioned on the
    /// record still being in pending status.
    async fn checkout(
        &self,
        queue: &QueueId,
        consumer_id: Uuid,
        id: Uuid,
    ) -> Result<CheckoutOutcome, StoreError>;

    /// Atomic acknowledge: remove from processing, record the outcome under
    /// the retention policy, adjust counters.
    async fn acknowledge(
        &self,
        queue: &QueueId,
        consumer_id: Uuid,
        id: Uuid,
        retention: &AckRetention,
    ) -> Result<AckOutcome, StoreError>;

    /// Resolve one or more unacknowledged in-flight messages in a single
    /// atomic transition per message: count the failed attempt, then
    /// dead-letter / delay / requeue per the message's own policy. Ids no
    /// longer in this consumer's processing list are skipped.
    async fn resolve_unacknowledged(
        &self,
        queue: &QueueId,
        consumer_id: Uuid,
        ids: &[Uuid],
        reason: UnackReason,
    ) -> Result<Vec<(Uuid, UnackOutcome)>, StoreError>;

    /// Ids currently in this consumer's processing list.
    async fn processing_ids(
        &self,
        queue: &QueueId,
        consumer_id: Uuid,
    ) -> Result<Vec<Uuid>, StoreError>;

    // --- Scheduling ---

    /// Ids whose fire time has passed, earliest first.
    async fn due_scheduled(
        &self,
        queue: &QueueId,
        now_ms: u64,
        limit: usize,
    ) -> Result<Vec<Uuid>, StoreError>;

    /// Apply one schedule promotion atomically.
    async fn promote_scheduled(
        &self,
        queue: &QueueId,
        promotion: SchedulePromotion,
    ) -> Result<(), StoreError>;

    // --- Rate limiting ---

    /// Fixed-window usage check: counts this probe and reports whether the
    /// window's budget is exhausted.
    async fn rate_limit_exceeded(
        &self,
        queue: &QueueId,
        limit: &RateLimit,
    ) -> Result<bool, StoreError>;

    // --- Locks ---

    /// Set-if-absent-with-expiry. True when this holder now owns the lock.
    async fn lock_acquire(
        &self,
        resource: &str,
        holder: &str,
        ttl_ms: u64,
    ) -> Result<bool, StoreError>;

    /// Set-expiry-if-value-equals-mine. False means the lock was lost to
    /// another holder.
    async fn lock_extend(
        &self,
        resource: &str,
        holder: &str,
        ttl_ms: u64,
    ) -> Result<bool, StoreError>;

    /// Delete-if-value-equals-mine. False means the key held another
    /// holder's value (or nothing) and was left untouched.
    async fn lock_release(&self, resource: &str, holder: &str) -> Result<bool, StoreError>;
}
