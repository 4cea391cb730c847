//! # cola
//!
//! A distributed message queue layered on Redis. Producers and consumers
//! get queue, pub/sub (consumer-group), and point-to-point delivery with
//! at-least-once guarantees, retry/backoff, dead-lettering, scheduling,
//! and distributed-lock coordination.
//!
//! The engine is a client of the store: every state transition is a single
//! atomic server-side operation, so at most one consumer ever owns a unit
//! of work — across process crashes, partitions, and concurrent workers.

pub mod clock;
pub mod config;
pub mod consumer;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod lock;
pub mod message;
pub mod producer;
pub mod queue;
pub mod store;
pub mod telemetry;

pub use config::{AckRetention, Config, ConsumerConfig, LockConfig, StoreConfig};
pub use consumer::{Consumer, Disposition, FnHandler, MessageHandler};
pub use error::{
    ConsumeError, ConsumerError, DequeueError, HandlerError, LockError, PublishError, StoreError,
    UnackError,
};
pub use events::{Event, EventBus, Transition};
pub use lock::{AutoRenewer, DistributedLock};
pub use message::{Message, MessageSchedule, MessageState, MessageStatus, TransferableMessage, UnackReason};
pub use producer::Producer;
pub use queue::{DeliveryModel, QueueId, QueueProperties, QueueType, RateLimit, RateLimitChecker};
pub use store::{MemoryStore, QueueCounters, RedisStore, Store, UnackOutcome};
