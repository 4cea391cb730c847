use super::*;
use crate::consumer::Consumer;
use crate::message::MessageStatus;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn consumes_published_messages_end_to_end() {
    let queue = test_queue("e2e");
    let store = store_with_queue("e2e", QueueType::Fifo, DeliveryModel::PointToPoint).await;

    let counter = Arc::new(AtomicUsize::new(0));
    let mut consumer = Consumer::new(store.clone(), fast_config());
    consumer.subscribe(queue.clone(), None, counting_handler(counter.clone()));
    let mut events = consumer.events();
    consumer.run().await.unwrap();

    let mut ids = Vec::new();
    for i in 0..5u8 {
        ids.push(publish(&store, &queue, Message::new(vec![i])).await);
    }

    wait_for_events(&mut events, 5, Duration::from_secs(5), |event| {
        matches!(event, Event::MessageAcknowledged { .. })
    })
    .await;
    consumer.shutdown().await;

    assert_eq!(counter.load(Ordering::SeqCst), 5);
    let counters = store.queue_counters(&queue).await.unwrap();
    assert_eq!(counters.acknowledged, 5);
    assert_eq!(counters.pending, 0);
    assert_eq!(counters.processing, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn at_most_one_outstanding_message_per_subscription() {
    let queue = test_queue("backpressure");
    let store =
        store_with_queue("backpressure", QueueType::Fifo, DeliveryModel::PointToPoint).await;

    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (current_c, peak_c) = (current.clone(), peak.clone());
    let handler = Arc::new(FnHandler(move |_msg: TransferableMessage| {
        let current = current_c.clone();
        let peak = peak_c.clone();
        async move {
            let in_flight = current.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(in_flight, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            current.fetch_sub(1, Ordering::SeqCst);
            Ok::<(), crate::error::HandlerError>(())
        }
    }));

    let mut consumer = Consumer::new(store.clone(), fast_config());
    consumer.subscribe(queue.clone(), None, handler);
    let mut events = consumer.events();
    consumer.run().await.unwrap();

    for i in 0..10u8 {
        publish(&store, &queue, Message::new(vec![i])).await;
    }
    wait_for_events(&mut events, 10, Duration::from_secs(5), |event| {
        matches!(event, Event::MessageAcknowledged { .. })
    })
    .await;
    consumer.shutdown().await;

    assert_eq!(
        peak.load(Ordering::SeqCst),
        1,
        "pipeline must never run two messages at once"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_mid_processing_unacknowledges_offline() {
    let queue = test_queue("midflight");
    let store = store_with_queue("midflight", QueueType::Fifo, DeliveryModel::PointToPoint).await;

    // Handler that never resolves within the test.
    let handler = Arc::new(FnHandler(|_msg: TransferableMessage| async move {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok::<(), crate::error::HandlerError>(())
    }));

    let mut consumer = Consumer::new(store.clone(), fast_config());
    consumer.subscribe(queue.clone(), None, handler);
    let mut events = consumer.events();
    consumer.run().await.unwrap();

    let id = publish(&store, &queue, Message::new(b"stuck".to_vec())).await;
    wait_for_events(&mut events, 1, Duration::from_secs(5), |event| {
        matches!(event, Event::MessageReceived { .. })
    })
    .await;

    consumer.shutdown().await;

    let counters = store.queue_counters(&queue).await.unwrap();
    assert_eq!(counters.processing, 0, "no orphaned in-flight messages");
    let record = store.get_message("test", id).await.unwrap().unwrap();
    assert_eq!(record.status, MessageStatus::Pending, "requeued as offline");
    assert_eq!(record.state.attempts, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn delayed_retry_comes_back_through_the_schedule_worker() {
    let queue = test_queue("comeback");
    let store = store_with_queue("comeback", QueueType::Fifo, DeliveryModel::PointToPoint).await;

    // Fail once, then succeed.
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_c = calls.clone();
    let handler = Arc::new(FnHandler(move |_msg: TransferableMessage| {
        let calls = calls_c.clone();
        async move {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(crate::error::HandlerError::new("first try fails"))
            } else {
                Ok(())
            }
        }
    }));

    let mut consumer = Consumer::new(store.clone(), fast_config());
    consumer.subscribe(queue.clone(), None, handler);
    let mut events = consumer.events();
    consumer.run().await.unwrap();

    let id = publish(
        &store,
        &queue,
        Message::new(b"flaky".to_vec())
            .with_retry_threshold(3)
            .with_retry_delay(50),
    )
    .await;

    wait_for_events(&mut events, 1, Duration::from_secs(5), |event| {
        matches!(event, Event::MessageDelayed { .. })
    })
    .await;
    // The per-queue schedule worker promotes the delayed message back to
    // pending once its delay elapses; the second attempt succeeds.
    wait_for_events(&mut events, 1, Duration::from_secs(5), |event| {
        matches!(event, Event::MessageAcknowledged { .. })
    })
    .await;
    consumer.shutdown().await;

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let record = store.get_message("test", id).await.unwrap();
    // Default retention does not keep acknowledged records.
    assert!(record.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn registered_message_worker_handles_a_subscription() {
    use crate::consumer::{FnHandler, MessageHandler};

    let queue = test_queue("worker-sub");
    let store = store_with_queue("worker-sub", QueueType::Fifo, DeliveryModel::PointToPoint).await;

    fn echo_worker() -> Box<dyn MessageHandler> {
        Box::new(FnHandler(|_msg: TransferableMessage| async move { Ok::<(), crate::error::HandlerError>(()) }))
    }

    let mut consumer = Consumer::new(store.clone(), fast_config());
    consumer.register_message_worker("echo", echo_worker);
    consumer.subscribe_worker(queue.clone(), None, "echo");
    let mut events = consumer.events();
    consumer.run().await.unwrap();

    publish(&store, &queue, Message::new(b"via-worker".to_vec())).await;
    wait_for_events(&mut events, 1, Duration::from_secs(5), |event| {
        matches!(event, Event::MessageAcknowledged { .. })
    })
    .await;
    consumer.shutdown().await;
}

#[tokio::test]
async fn unknown_message_worker_is_a_startup_error() {
    let queue = test_queue("no-such-worker");
    let store =
        store_with_queue("no-such-worker", QueueType::Fifo, DeliveryModel::PointToPoint).await;

    let mut consumer = Consumer::new(store.clone(), fast_config());
    consumer.subscribe_worker(queue, None, "missing");
    let err = consumer.run().await.unwrap_err();
    assert!(matches!(
        err,
        crate::error::ConsumerError::UnknownWorker(name) if name == "missing"
    ));
}
