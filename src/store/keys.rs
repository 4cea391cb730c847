//! Key layout for the backing store.
//!
//! All keys are flat strings prefixed by the configured namespace, with `:`
//! separators. Per-queue structures embed the queue's own namespace so
//! applications sharing one store never collide.

use uuid::Uuid;

use crate::queue::QueueId;

/// Key builder bound to a store namespace prefix.
#[derive(Debug, Clone)]
pub struct Keys {
    prefix: String,
}

impl Keys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Root of a queue's key subtree; per-structure keys hang off it.
    pub(crate) fn queue_root(&self, queue: &QueueId) -> String {
        format!(
            "{}:{}:queue:{}",
            self.prefix, queue.namespace, queue.name
        )
    }

    /// One record per message id.
    pub fn message(&self, namespace: &str, id: Uuid) -> String {
        format!("{}{}", self.message_prefix(namespace), id)
    }

    /// Shared prefix of all message keys in a namespace; store scripts
    /// append the id and the `:status` / `:state` suffixes themselves.
    pub fn message_prefix(&self, namespace: &str) -> String {
        format!("{}:{}:message:", self.prefix, namespace)
    }

    /// Pending list (FIFO/LIFO queues). Pub/sub queues hold one per group.
    pub fn pending(&self, queue: &QueueId, group: Option<&str>) -> String {
        match group {
            Some(g) => format!("{}:groups:{}:pending", self.queue_root(queue), g),
            None => format!("{}:pending", self.queue_root(queue)),
        }
    }

    /// Pending sorted-set (priority queues).
    pub fn priority(&self, queue: &QueueId, group: Option<&str>) -> String {
        match group {
            Some(g) => format!("{}:groups:{}:priority", self.queue_root(queue), g),
            None => format!("{}:priority", self.queue_root(queue)),
        }
    }

    /// Per-(queue, consumer) in-flight list.
    pub fn processing(&self, queue: &QueueId, consumer_id: Uuid) -> String {
        format!("{}:processing:{}", self.queue_root(queue), consumer_id)
    }

    pub fn acknowledged(&self, queue: &QueueId) -> String {
        format!("{}:acknowledged", self.queue_root(queue))
    }

    pub fn dead_lettered(&self, queue: &QueueId) -> String {
        format!("{}:dead-lettered", self.queue_root(queue))
    }

    /// Sorted-set of message ids scored by fire timestamp (delayed retries
    /// and producer-scheduled messages).
    pub fn scheduled(&self, queue: &QueueId) -> String {
        format!("{}:scheduled", self.queue_root(queue))
    }

    pub fn properties(&self, queue: &QueueId) -> String {
        format!("{}:properties", self.queue_root(queue))
    }

    pub fn consumers(&self, queue: &QueueId) -> String {
        format!("{}:consumers", self.queue_root(queue))
    }

    pub fn groups(&self, queue: &QueueId) -> String {
        format!("{}:groups", self.queue_root(queue))
    }

    pub fn counters(&self, queue: &QueueId) -> String {
        format!("{}:counters", self.queue_root(queue))
    }

    /// Monotonic insertion counter for priority tie-breaking.
    pub fn seq(&self, queue: &QueueId) -> String {
        format!("{}:seq", self.queue_root(queue))
    }

    /// Fixed-window rate-limit counter.
    pub fn rate_window(&self, queue: &QueueId, window_start_ms: u64) -> String {
        format!("{}:rate:{}", self.queue_root(queue), window_start_ms)
    }

    /// One key per lock resource, holding the current holder id.
    pub fn lock(&self, resource: &str) -> String {
        format!("{}:lock:{}", self.prefix, resource)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> Keys {
        Keys::new("cola")
    }

    fn q() -> QueueId {
        QueueId::new("app", "orders")
    }

    #[test]
    fn queue_scoped_keys_embed_both_namespaces() {
        assert_eq!(keys().pending(&q(), None), "cola:app:queue:orders:pending");
        assert_eq!(
            keys().pending(&q(), Some("billing")),
            "cola:app:queue:orders:groups:billing:pending"
        );
        assert_eq!(
            keys().scheduled(&q()),
            "cola:app:queue:orders:scheduled"
        );
    }

    #[test]
    fn processing_key_is_per_consumer() {
        let a = Uuid::now_v7();
        let b = Uuid::now_v7();
        assert_ne!(keys().processing(&q(), a), keys().processing(&q(), b));
    }

    #[test]
    fn lock_keys_are_namespace_global() {
        assert_eq!(keys().lock("workers:orders"), "cola:lock:workers:orders");
    }
}
