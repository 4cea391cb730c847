//! Producer: hands messages to the store, either straight into pending or
//! parked in the scheduled set.

use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use crate::clock::now_ms;
use crate::error::PublishError;
use crate::message::{next_occurrence, Destination, Message, MessageStatus};
use crate::queue::{DeliveryModel, QueueId};
use crate::store::Store;

pub struct Producer {
    store: Arc<dyn Store>,
}

impl Producer {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Publish a message to a queue. Validates the schedule and the
    /// delivery-model/group pairing, binds the destination (a message is
    /// bound exactly once), and applies the scheduled-vs-pending branch
    /// atomically on the store side.
    pub async fn publish(
        &self,
        mut message: Message,
        queue: QueueId,
        group: Option<String>,
    ) -> Result<Uuid, PublishError> {
        message
            .schedule
            .validate()
            .map_err(PublishError::InvalidSchedule)?;

        let properties = self
            .store
            .queue_properties(&queue)
            .await?
            .ok_or_else(|| PublishError::QueueNotFound(queue.to_string()))?;
        match (properties.delivery_model, &group) {
            (DeliveryModel::PointToPoint, Some(_)) => {
                return Err(PublishError::GroupNotAllowed(queue.to_string()));
            }
            (DeliveryModel::PubSub, None) => {
                return Err(PublishError::GroupRequired(queue.to_string()));
            }
            _ => {}
        }

        message.set_destination(Destination {
            queue: queue.clone(),
            group,
        });

        let now = now_ms();
        message.state.published_at = Some(now);
        let id = message.id;

        if message.schedule.is_set() {
            // Arm the one-shot delay for the scheduling computation; the
            // consuming getter clears it after this use.
            message.state.set_scheduled_delay(message.schedule.delay_ms);
            let schedule = message.schedule.clone();
            if let Some(fire_at) = next_occurrence(&schedule, &mut message.state, now) {
                message.status = MessageStatus::Scheduled;
                message.state.scheduled_at = Some(now);
                message.state.last_scheduled_at = Some(now);
                message.state.scheduled_count += 1;
                if !self.store.publish_scheduled(&message, fire_at).await? {
                    return Err(PublishError::QueueNotFound(queue.to_string()));
                }
                info!(%queue, message_id = %id, fire_at, "message scheduled");
                return Ok(id);
            }
        }

        message.status = MessageStatus::Pending;
        if !self.store.publish_pending(&message).await? {
            return Err(PublishError::QueueNotFound(queue.to_string()));
        }
        info!(%queue, message_id = %id, "message published");
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PublishError;
    use crate::message::MessageSchedule;
    use crate::queue::{DeliveryModel, QueueProperties, QueueType};
    use crate::store::MemoryStore;

    fn queue() -> QueueId {
        QueueId::new("test", "q1")
    }

    async fn setup(delivery_model: DeliveryModel) -> (Producer, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        store
            .create_queue(
                &queue(),
                &QueueProperties::new(QueueType::Fifo, delivery_model),
            )
            .await
            .unwrap();
        (Producer::new(store.clone()), store)
    }

    #[tokio::test]
    async fn publish_to_missing_queue_is_typed() {
        let producer = Producer::new(Arc::new(MemoryStore::new()));
        let err = producer
            .publish(Message::new(b"x".to_vec()), queue(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::QueueNotFound(_)));
    }

    #[tokio::test]
    async fn group_pairing_is_validated() {
        let (producer, _) = setup(DeliveryModel::PointToPoint).await;
        let err = producer
            .publish(Message::new(b"x".to_vec()), queue(), Some("g".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::GroupNotAllowed(_)));

        let (producer, _) = setup(DeliveryModel::PubSub).await;
        let err = producer
            .publish(Message::new(b"x".to_vec()), queue(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::GroupRequired(_)));
    }

    #[tokio::test]
    async fn invalid_cron_is_rejected_before_any_write() {
        let (producer, store) = setup(DeliveryModel::PointToPoint).await;
        let message = Message::new(b"x".to_vec()).with_schedule(MessageSchedule {
            cron: Some("bogus".to_string()),
            ..Default::default()
        });
        let err = producer.publish(message, queue(), None).await.unwrap_err();
        assert!(matches!(err, PublishError::InvalidSchedule(_)));
        assert_eq!(store.queue_counters(&queue()).await.unwrap().pending, 0);
    }

    #[tokio::test]
    async fn scheduled_and_immediate_branches() {
        let (producer, store) = setup(DeliveryModel::PointToPoint).await;

        let immediate = producer
            .publish(Message::new(b"now".to_vec()), queue(), None)
            .await
            .unwrap();
        let delayed = producer
            .publish(
                Message::new(b"later".to_vec()).with_schedule(MessageSchedule {
                    delay_ms: 60_000,
                    ..Default::default()
                }),
                queue(),
                None,
            )
            .await
            .unwrap();

        let counters = store.queue_counters(&queue()).await.unwrap();
        assert_eq!(counters.pending, 1);
        assert_eq!(counters.scheduled, 1);

        let now = store.get_message("test", immediate).await.unwrap().unwrap();
        assert_eq!(now.status, MessageStatus::Pending);
        assert!(now.state.published_at.is_some());
        let later = store.get_message("test", delayed).await.unwrap().unwrap();
        assert_eq!(later.status, MessageStatus::Scheduled);
        assert_eq!(later.state.scheduled_count, 1);
    }
}
