use super::*;
use crate::consumer::dequeue::{DequeueEngine, StoreRateLimitChecker};
use crate::error::DequeueError;
use crate::events::EventBus;
use crate::queue::RateLimit;

fn make_engine(
    store: &Arc<MemoryStore>,
    queue: &QueueId,
    group: Option<String>,
    consumer_id: Uuid,
) -> DequeueEngine {
    let config = fast_config();
    DequeueEngine::new(
        store.clone(),
        queue.clone(),
        group,
        consumer_id,
        &config.consumer,
        Arc::new(StoreRateLimitChecker::new(store.clone())),
        EventBus::new(16),
    )
}

#[tokio::test]
async fn startup_fails_fast_when_queue_missing() {
    let store = Arc::new(MemoryStore::new());
    let mut engine = make_engine(&store, &test_queue("ghost"), None, Uuid::new_v4());
    assert!(matches!(
        engine.go_up().await,
        Err(DequeueError::QueueNotFound(_))
    ));
}

#[tokio::test]
async fn startup_validates_delivery_model_against_group() {
    let store = store_with_queue("p2p", QueueType::Fifo, DeliveryModel::PointToPoint).await;
    let mut with_group = make_engine(
        &store,
        &test_queue("p2p"),
        Some("g1".to_string()),
        Uuid::new_v4(),
    );
    assert!(matches!(
        with_group.go_up().await,
        Err(DequeueError::GroupNotAllowed(_))
    ));

    let store = store_with_queue("fanout", QueueType::Fifo, DeliveryModel::PubSub).await;
    let mut without_group = make_engine(&store, &test_queue("fanout"), None, Uuid::new_v4());
    assert!(matches!(
        without_group.go_up().await,
        Err(DequeueError::GroupRequired(_))
    ));
}

#[tokio::test]
async fn priority_queue_dequeues_highest_first() {
    let queue = test_queue("prio");
    let store = store_with_queue("prio", QueueType::Priority, DeliveryModel::PointToPoint).await;

    let mut ids = Vec::new();
    for priority in [5u8, 1, 5, 3] {
        let id = publish(
            &store,
            &queue,
            Message::new(vec![priority]).with_priority(priority),
        )
        .await;
        ids.push(id);
    }

    let mut engine = make_engine(&store, &queue, None, Uuid::new_v4());
    engine.go_up().await.unwrap();

    let mut order = Vec::new();
    for _ in 0..4 {
        order.push(engine.next().await.unwrap().unwrap());
    }
    assert_eq!(order, vec![ids[0], ids[2], ids[3], ids[1]]);
    assert_eq!(engine.next().await.unwrap(), None);
    engine.go_down().await;
}

#[tokio::test]
async fn pubsub_subscription_pops_from_its_group() {
    let queue = test_queue("fanout2");
    let store = store_with_queue("fanout2", QueueType::Fifo, DeliveryModel::PubSub).await;

    let producer = Producer::new(store.clone() as Arc<dyn Store>);
    let id = producer
        .publish(Message::new(b"to-billing".to_vec()), queue.clone(), Some("billing".to_string()))
        .await
        .unwrap();

    let mut engine = make_engine(&store, &queue, Some("billing".to_string()), Uuid::new_v4());
    engine.go_up().await.unwrap();
    assert_eq!(engine.next().await.unwrap(), Some(id));
    engine.go_down().await;
}

#[tokio::test]
async fn rate_limited_cycle_yields_no_message() {
    let queue = test_queue("limited");
    let store = Arc::new(MemoryStore::new());
    store
        .create_queue(
            &queue,
            &QueueProperties::new(QueueType::Fifo, DeliveryModel::PointToPoint).with_rate_limit(
                RateLimit {
                    limit: 1,
                    interval_ms: 60_000,
                },
            ),
        )
        .await
        .unwrap();

    publish(&store, &queue, Message::new(b"a".to_vec())).await;
    publish(&store, &queue, Message::new(b"b".to_vec())).await;

    let mut engine = make_engine(&store, &queue, None, Uuid::new_v4());
    engine.go_up().await.unwrap();

    // First cycle's probe fits the window and pops a message; the second
    // exceeds the limit and backs off without dequeuing.
    assert!(engine.next().await.unwrap().is_some());
    assert_eq!(engine.next().await.unwrap(), None);
    let counters = store.queue_counters(&queue).await.unwrap();
    assert_eq!(counters.pending, 1, "second message must stay pending");
    engine.go_down().await;
}

#[tokio::test]
async fn presence_registered_and_dropped_with_lifecycle() {
    let queue = test_queue("presence");
    let store = store_with_queue("presence", QueueType::Fifo, DeliveryModel::PointToPoint).await;
    let consumer_id = Uuid::new_v4();

    let mut engine = make_engine(&store, &queue, None, consumer_id);
    engine.go_up().await.unwrap();
    engine.go_down().await;
    // Deregistration happens on the way down; a second go_up must succeed
    // again from scratch.
    let mut engine = make_engine(&store, &queue, None, consumer_id);
    engine.go_up().await.unwrap();
    engine.go_down().await;
}
