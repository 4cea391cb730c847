use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Fully qualified queue identity: namespace plus name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueId {
    pub namespace: String,
    pub name: String,
}

impl QueueId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.name)
    }
}

/// Operational queue type, branching dequeue behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueType {
    /// First in, first out. The default.
    Fifo,
    /// Last in, first out.
    Lifo,
    /// Highest priority first; insertion order within equal priority.
    Priority,
}

/// Delivery model: who sees a published message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeliveryModel {
    /// Each message goes to exactly one consumer of the queue.
    PointToPoint,
    /// Messages fan out per consumer group; each group sees every message.
    PubSub,
}

/// Per-queue dequeue rate limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    /// Maximum dequeues per interval.
    pub limit: u32,
    /// Window length in milliseconds.
    pub interval_ms: u64,
}

/// Queue configuration as committed in the store. The engines read this at
/// startup and branch on it; queue CRUD itself is owned elsewhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueProperties {
    pub queue_type: QueueType,
    pub delivery_model: DeliveryModel,
    pub rate_limit: Option<RateLimit>,
}

impl QueueProperties {
    pub fn new(queue_type: QueueType, delivery_model: DeliveryModel) -> Self {
        Self {
            queue_type,
            delivery_model,
            rate_limit: None,
        }
    }

    pub fn with_rate_limit(mut self, limit: RateLimit) -> Self {
        self.rate_limit = Some(limit);
        self
    }
}

/// Externally owned rate-limit accounting. Given a queue and its configured
/// limit, reports whether the current window is exhausted.
#[async_trait::async_trait]
pub trait RateLimitChecker: Send + Sync {
    async fn is_exceeded(&self, queue: &QueueId, limit: &RateLimit) -> Result<bool, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_id_display() {
        let q = QueueId::new("app", "orders");
        assert_eq!(q.to_string(), "app:orders");
    }

    #[test]
    fn queue_type_serializes_kebab_case() {
        assert_eq!(
            serde_json::to_string(&QueueType::Priority).unwrap(),
            "\"priority\""
        );
        assert_eq!(
            serde_json::to_string(&DeliveryModel::PointToPoint).unwrap(),
            "\"point-to-point\""
        );
    }
}
