use super::*;
use crate::consumer::workers::{QueueWorker, ScheduleWorker, WorkerContext, QUEUE_WORKERS};
use crate::message::{MessageSchedule, MessageStatus};

fn schedule_worker(store: &Arc<MemoryStore>, queue: &QueueId) -> ScheduleWorker {
    ScheduleWorker::new(WorkerContext {
        store: store.clone(),
        queue: queue.clone(),
        batch: 100,
    })
}

#[test]
fn registry_contains_the_schedule_worker() {
    assert!(QUEUE_WORKERS.iter().any(|(name, _)| *name == "schedule"));
}

#[tokio::test]
async fn one_shot_delay_promotes_the_message_itself() {
    let queue = test_queue("delayed");
    let store = store_with_queue("delayed", QueueType::Fifo, DeliveryModel::PointToPoint).await;

    let id = publish(
        &store,
        &queue,
        Message::new(b"later".to_vec()).with_schedule(MessageSchedule {
            delay_ms: 20,
            ..Default::default()
        }),
    )
    .await;
    let record = store.get_message("test", id).await.unwrap().unwrap();
    assert_eq!(record.status, MessageStatus::Scheduled);
    assert_eq!(store.queue_counters(&queue).await.unwrap().pending, 0);

    tokio::time::sleep(Duration::from_millis(40)).await;
    let mut worker = schedule_worker(&store, &queue);
    worker.run_once().await.unwrap();

    let record = store.get_message("test", id).await.unwrap().unwrap();
    assert_eq!(record.status, MessageStatus::Pending);
    let counters = store.queue_counters(&queue).await.unwrap();
    assert_eq!(counters.pending, 1);
    assert_eq!(counters.scheduled, 0);
}

#[tokio::test]
async fn periodic_schedule_spawns_children_with_lineage() {
    let queue = test_queue("periodic");
    let store = store_with_queue("periodic", QueueType::Fifo, DeliveryModel::PointToPoint).await;

    let parent_id = publish(
        &store,
        &queue,
        Message::new(b"tick".to_vec()).with_schedule(MessageSchedule {
            repeat: 2,
            repeat_period_ms: 10,
            ..Default::default()
        }),
    )
    .await;

    tokio::time::sleep(Duration::from_millis(30)).await;
    let mut worker = schedule_worker(&store, &queue);
    worker.run_once().await.unwrap();

    // One child in pending, carrying the parent's lineage; the parent is
    // re-armed for the remaining repeat budget.
    let consumer_id = Uuid::new_v4();
    let child_id = dequeue_one(&store, &queue, consumer_id, QueueType::Fifo).await;
    assert_ne!(child_id, parent_id);
    let child = store.get_message("test", child_id).await.unwrap().unwrap();
    assert_eq!(child.state.parent_id, Some(parent_id));
    assert!(!child.schedule.is_set());

    let counters = store.queue_counters(&queue).await.unwrap();
    assert_eq!(counters.scheduled, 1, "parent stays armed");

    // Drain the remaining occurrences; once the budget is spent the parent
    // anchor is removed.
    for _ in 0..2 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        worker.run_once().await.unwrap();
    }
    assert_eq!(store.queue_counters(&queue).await.unwrap().scheduled, 0);
    assert!(store.get_message("test", parent_id).await.unwrap().is_none());
}
