//! Store backends and the atomic-operation contract they implement.

pub mod keys;
pub mod memory;
pub mod redis;
pub mod traits;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;
pub use self::traits::{
    AckOutcome, CheckoutOutcome, ConsumerInfo, DequeueHandle, DequeueTarget, PromoteTarget,
    QueueCounters, SchedulePromotion, Store, UnackOutcome,
};
