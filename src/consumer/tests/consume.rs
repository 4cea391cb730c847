use super::*;
use crate::config::AckRetention;
use crate::consumer::consume::{ConsumeEngine, Disposition};
use crate::events::EventBus;
use crate::message::{MessageStatus, UnackReason};
use crate::store::UnackOutcome;

fn make_engine(
    store: &Arc<MemoryStore>,
    queue: &QueueId,
    consumer_id: Uuid,
    handler: Arc<dyn MessageHandler>,
) -> ConsumeEngine {
    ConsumeEngine::new(
        store.clone(),
        queue.clone(),
        consumer_id,
        handler,
        AckRetention {
            store: true,
            ..Default::default()
        },
        EventBus::new(64),
    )
}

#[tokio::test]
async fn successful_handler_acknowledges() {
    let queue = test_queue("ok");
    let store = store_with_queue("ok", QueueType::Fifo, DeliveryModel::PointToPoint).await;
    let consumer_id = Uuid::new_v4();

    let id = publish(&store, &queue, Message::new(b"work".to_vec())).await;
    let popped = dequeue_one(&store, &queue, consumer_id, QueueType::Fifo).await;
    assert_eq!(popped, id);

    let counter = Arc::new(AtomicUsize::new(0));
    let engine = make_engine(&store, &queue, consumer_id, counting_handler(counter.clone()));
    engine.go_up();

    let disposition = engine.consume(id).await.unwrap();
    assert_eq!(disposition, Disposition::Acknowledged);
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    let record = store.get_message("test", id).await.unwrap().unwrap();
    assert_eq!(record.status, MessageStatus::Acknowledged);
    let counters = store.queue_counters(&queue).await.unwrap();
    assert_eq!(counters.processing, 0);
    assert_eq!(counters.acknowledged, 1);
}

#[tokio::test]
async fn failing_handler_requeues_and_counts_the_attempt() {
    let queue = test_queue("fail");
    let store = store_with_queue("fail", QueueType::Fifo, DeliveryModel::PointToPoint).await;
    let consumer_id = Uuid::new_v4();

    let id = publish(&store, &queue, Message::new(b"bad".to_vec())).await;
    dequeue_one(&store, &queue, consumer_id, QueueType::Fifo).await;

    let engine = make_engine(&store, &queue, consumer_id, failing_handler());
    engine.go_up();

    let disposition = engine.consume(id).await.unwrap();
    assert_eq!(
        disposition,
        Disposition::Unacknowledged(UnackReason::HandlerError, UnackOutcome::Requeued)
    );

    let record = store.get_message("test", id).await.unwrap().unwrap();
    assert_eq!(record.status, MessageStatus::Pending);
    assert_eq!(record.state.attempts, 1);
    assert_eq!(record.state.requeue_count, 1);
}

#[tokio::test]
async fn checkout_of_non_pending_message_fails_loudly() {
    let queue = test_queue("conflict");
    let store = store_with_queue("conflict", QueueType::Fifo, DeliveryModel::PointToPoint).await;
    let consumer_id = Uuid::new_v4();

    let id = publish(&store, &queue, Message::new(b"x".to_vec())).await;
    dequeue_one(&store, &queue, consumer_id, QueueType::Fifo).await;

    let counter = Arc::new(AtomicUsize::new(0));
    let engine = make_engine(&store, &queue, consumer_id, counting_handler(counter));
    engine.go_up();
    engine.consume(id).await.unwrap();

    // The record is now acknowledged; a second consume must refuse at
    // checkout instead of re-running the handler.
    assert!(engine.consume(id).await.is_err());
}

#[tokio::test]
async fn timeout_wins_and_late_resolution_is_discarded() {
    let queue = test_queue("slow");
    let store = store_with_queue("slow", QueueType::Fifo, DeliveryModel::PointToPoint).await;
    let consumer_id = Uuid::new_v4();

    let id = publish(
        &store,
        &queue,
        Message::new(b"slow".to_vec()).with_consume_timeout(100),
    )
    .await;
    dequeue_one(&store, &queue, consumer_id, QueueType::Fifo).await;

    let late_done = Arc::new(AtomicUsize::new(0));
    let flag = late_done.clone();
    let handler = Arc::new(FnHandler(move |_msg: TransferableMessage| {
        let flag = flag.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(400)).await;
            flag.fetch_add(1, Ordering::SeqCst);
            Ok::<(), crate::error::HandlerError>(())
        }
    }));

    let engine = make_engine(&store, &queue, consumer_id, handler);
    engine.go_up();

    let started = tokio::time::Instant::now();
    let disposition = engine.consume(id).await.unwrap();
    assert_eq!(
        disposition,
        Disposition::Unacknowledged(UnackReason::Timeout, UnackOutcome::Requeued)
    );
    assert!(
        started.elapsed() < Duration::from_millis(300),
        "timeout must resolve well before the handler"
    );

    // Let the late handler resolution arrive; it must have no observable
    // effect on the message.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(late_done.load(Ordering::SeqCst), 1, "handler ran to completion");
    let record = store.get_message("test", id).await.unwrap().unwrap();
    assert_eq!(record.status, MessageStatus::Pending);
    assert_eq!(record.state.attempts, 1, "no double resolution");
    let counters = store.queue_counters(&queue).await.unwrap();
    assert_eq!(counters.pending, 1);
    assert_eq!(counters.acknowledged, 0);
}

#[tokio::test]
async fn expired_message_skips_the_handler() {
    let queue = test_queue("expired");
    let store = store_with_queue("expired", QueueType::Fifo, DeliveryModel::PointToPoint).await;
    let consumer_id = Uuid::new_v4();

    let id = publish(
        &store,
        &queue,
        Message::new(b"stale".to_vec()).with_ttl(10),
    )
    .await;
    dequeue_one(&store, &queue, consumer_id, QueueType::Fifo).await;
    tokio::time::sleep(Duration::from_millis(30)).await;

    let counter = Arc::new(AtomicUsize::new(0));
    let engine = make_engine(&store, &queue, consumer_id, counting_handler(counter.clone()));
    engine.go_up();

    let disposition = engine.consume(id).await.unwrap();
    assert_eq!(
        disposition,
        Disposition::Unacknowledged(UnackReason::TtlExpired, UnackOutcome::DeadLettered)
    );
    assert_eq!(counter.load(Ordering::SeqCst), 0, "handler never invoked");

    let record = store.get_message("test", id).await.unwrap().unwrap();
    assert_eq!(record.status, MessageStatus::DeadLettered);
    assert!(record.state.expired);
}

#[tokio::test]
async fn panicking_handler_counts_as_failure() {
    let queue = test_queue("panic");
    let store = store_with_queue("panic", QueueType::Fifo, DeliveryModel::PointToPoint).await;
    let consumer_id = Uuid::new_v4();

    let id = publish(&store, &queue, Message::new(b"boom".to_vec())).await;
    dequeue_one(&store, &queue, consumer_id, QueueType::Fifo).await;

    let handler: Arc<dyn MessageHandler> = Arc::new(FnHandler(|_msg: TransferableMessage| async move {
        if true {
            panic!("handler exploded");
        }
        Ok::<(), crate::error::HandlerError>(())
    }));
    let engine = make_engine(&store, &queue, consumer_id, handler);
    engine.go_up();

    let disposition = engine.consume(id).await.unwrap();
    assert_eq!(
        disposition,
        Disposition::Unacknowledged(UnackReason::HandlerError, UnackOutcome::Requeued)
    );
}
