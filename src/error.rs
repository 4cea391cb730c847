//! Error types.
//!
//! `StoreError` is the infrastructure error every store operation can fail
//! with — the domain-level operation enums embed it via `#[from]`. Callers
//! branch on the domain variants; infrastructure failures pass through.

/// Low-level store errors (Redis transport, serialization, corrupt replies).
/// This is the error type for the `Store` trait — store operations can only
/// fail with infrastructure errors, never domain errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("corrupt store reply: {0}")]
    CorruptReply(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Redis(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Errors publishing a message.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("queue not found: {0}")]
    QueueNotFound(String),

    #[error("queue {0} fans out per consumer group; the message must carry a group id")]
    GroupRequired(String),

    #[error("queue {0} is point-to-point; the message must not carry a group id")]
    GroupNotAllowed(String),

    #[error("message has no destination")]
    MissingDestination,

    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors bringing up or running the dequeue engine.
#[derive(Debug, thiserror::Error)]
pub enum DequeueError {
    #[error("queue not found: {0}")]
    QueueNotFound(String),

    #[error("queue {0} fans out per consumer group; the subscription must carry a group id")]
    GroupRequired(String),

    #[error("queue {0} is point-to-point; the subscription must not carry a group id")]
    GroupNotAllowed(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors consuming a dequeued message.
#[derive(Debug, thiserror::Error)]
pub enum ConsumeError {
    /// The message was dequeued but its record is no longer in pending
    /// status. A dequeue cannot happen without the matching checkout
    /// succeeding, so this indicates a concurrency invariant violation
    /// somewhere else in the system.
    #[error("checkout conflict: message {0} is not in pending status")]
    NotPending(uuid::Uuid),

    #[error("message not found: {0}")]
    NotFound(uuid::Uuid),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors resolving an unacknowledged message.
#[derive(Debug, thiserror::Error)]
pub enum UnackError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from the distributed lock.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// An extend or release found another holder's value under the key.
    /// The lease expired and someone else took the lock — terminal for
    /// this acquisition, not a transient error.
    #[error("lock {0} lost to another holder")]
    Lost(String),

    /// Extend called on a lock that was never acquired.
    #[error("lock {0} was never acquired")]
    NotAcquired(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Top-level consumer errors.
#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error(transparent)]
    Dequeue(#[from] DequeueError),

    #[error(transparent)]
    Consume(#[from] ConsumeError),

    #[error(transparent)]
    Unack(#[from] UnackError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("unknown worker: {0}")]
    UnknownWorker(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A user handler failure. The engine does not interpret the content —
/// any handler error drives the unacknowledgement path the same way.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}
