//! Engine tests, run against the in-memory store backend.

mod consume;
mod dequeue;
mod pipeline;
mod workers;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::config::{Config, ConsumerConfig};
use crate::consumer::{FnHandler, MessageHandler};
use crate::error::HandlerError;
use crate::events::Event;
use crate::message::{Message, TransferableMessage};
use crate::producer::Producer;
use crate::queue::{DeliveryModel, QueueId, QueueProperties, QueueType};
use crate::store::{DequeueTarget, MemoryStore, Store};

pub(super) fn test_queue(name: &str) -> QueueId {
    QueueId::new("test", name)
}

/// Store with one queue created.
pub(super) async fn store_with_queue(
    name: &str,
    queue_type: QueueType,
    delivery_model: DeliveryModel,
) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store
        .create_queue(
            &test_queue(name),
            &QueueProperties::new(queue_type, delivery_model),
        )
        .await
        .unwrap();
    store
}

/// Consumer config tuned for tests: polling mode with short backoffs.
pub(super) fn fast_config() -> Config {
    Config {
        consumer: ConsumerConfig {
            blocking: false,
            idle_threshold: 1_000,
            backoff_ms: 10,
            worker_tick_ms: 25,
            ..ConsumerConfig::default()
        },
        ..Config::default()
    }
}

/// Publish a plain message and return its id.
pub(super) async fn publish(
    store: &Arc<MemoryStore>,
    queue: &QueueId,
    message: Message,
) -> Uuid {
    Producer::new(store.clone() as Arc<dyn Store>)
        .publish(message, queue.clone(), None)
        .await
        .unwrap()
}

/// Pop one message id into the given consumer's processing list.
pub(super) async fn dequeue_one(
    store: &Arc<MemoryStore>,
    queue: &QueueId,
    consumer_id: Uuid,
    queue_type: QueueType,
) -> Uuid {
    let mut handle = store.dequeue_handle(false).await.unwrap();
    handle
        .pop(&DequeueTarget {
            queue: queue.clone(),
            group: None,
            consumer_id,
            queue_type,
        })
        .await
        .unwrap()
        .expect("expected a pending message")
}

/// Handler that counts invocations and always succeeds.
pub(super) fn counting_handler(counter: Arc<AtomicUsize>) -> Arc<dyn MessageHandler> {
    Arc::new(FnHandler(move |_msg: TransferableMessage| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<(), HandlerError>(())
        }
    }))
}

/// Handler that always fails.
pub(super) fn failing_handler() -> Arc<dyn MessageHandler> {
    Arc::new(FnHandler(|_msg: TransferableMessage| async move {
        Err::<(), HandlerError>(HandlerError::new("nope"))
    }))
}

/// Await `count` events matching the predicate, panicking on timeout.
pub(super) async fn wait_for_events(
    rx: &mut broadcast::Receiver<Event>,
    count: usize,
    timeout: Duration,
    mut matches: impl FnMut(&Event) -> bool,
) {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut seen = 0;
    while seen < count {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .expect("timed out waiting for events");
        let event = tokio::time::timeout(remaining, rx.recv())
            .await
            .expect("timed out waiting for events")
            .expect("event bus closed");
        if matches(&event) {
            seen += 1;
        }
    }
}
