use serde::Deserialize;

/// Top-level engine configuration, deserializable from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub consumer: ConsumerConfig,
    pub lock: LockConfig,
    pub ack_retention: AckRetention,
}

/// Store connection configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Redis connection URL.
    pub url: String,
    /// Key namespace prefixing every key the engine touches.
    pub namespace: String,
}

/// Consumer-side tunables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Use blocking pops for non-priority queues. Requires an exclusive
    /// store connection per subscription.
    pub blocking: bool,
    /// Consecutive empty non-blocking cycles before the idle backoff kicks in.
    pub idle_threshold: u32,
    /// Idle and rate-limit backoff, in milliseconds.
    pub backoff_ms: u64,
    /// Issue the first dequeue automatically on startup.
    pub auto_dequeue: bool,
    /// Interval between per-queue worker runs, in milliseconds.
    pub worker_tick_ms: u64,
    /// Maximum due scheduled messages promoted per worker run.
    pub worker_batch: usize,
    /// Event broadcast channel capacity.
    pub event_capacity: usize,
}

/// Distributed-lock defaults for per-queue worker coordination.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Lease duration, in milliseconds.
    pub lease_ms: u64,
    /// Auto-renew interval, in milliseconds. Must be a sub-interval of the
    /// lease so renewal lands before expiry.
    pub renew_interval_ms: u64,
}

/// Retention policy for acknowledged message records.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct AckRetention {
    /// Keep acknowledged records at all. When false, records are deleted
    /// on acknowledge.
    pub store: bool,
    /// Cap on the acknowledged store size per queue.
    pub queue_size: Option<u64>,
    /// Expiry on the acknowledged store, in milliseconds.
    pub expire_ms: Option<u64>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            namespace: "cola".to_string(),
        }
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            blocking: true,
            idle_threshold: 5,
            backoff_ms: 1_000,
            auto_dequeue: true,
            worker_tick_ms: 1_000,
            worker_batch: 100,
            event_capacity: 1_024,
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease_ms: 60_000,
            renew_interval_ms: 20_000,
        }
    }
}
