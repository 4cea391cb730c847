//! Unacknowledgement policy resolution.
//!
//! The store takes the branch decision and the mutation in one atomic
//! transition per message; this side supplies the reason, reports the
//! branch through events, and logs it. Several in-flight ids can resolve
//! in one call (bulk offline cleanup on shutdown).

use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use crate::error::UnackError;
use crate::events::{Event, EventBus};
use crate::message::UnackReason;
use crate::queue::QueueId;
use crate::store::{Store, UnackOutcome};

pub struct UnackPolicyResolver {
    store: Arc<dyn Store>,
    queue: QueueId,
    consumer_id: Uuid,
    events: EventBus,
}

impl UnackPolicyResolver {
    pub fn new(
        store: Arc<dyn Store>,
        queue: QueueId,
        consumer_id: Uuid,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            queue,
            consumer_id,
            events,
        }
    }

    /// Resolve the given in-flight messages and emit the event matching
    /// each branch taken.
    pub async fn resolve(
        &self,
        ids: &[Uuid],
        reason: UnackReason,
    ) -> Result<Vec<(Uuid, UnackOutcome)>, UnackError> {
        let outcomes = self
            .store
            .resolve_unacknowledged(&self.queue, self.consumer_id, ids, reason)
            .await?;

        for (id, outcome) in &outcomes {
            info!(
                queue = %self.queue,
                message_id = %id,
                reason = reason.as_str(),
                outcome = ?outcome,
                "message unacknowledged"
            );
            self.events.emit(Event::MessageUnacknowledged {
                message_id: *id,
                queue: self.queue.clone(),
                consumer_id: self.consumer_id,
                reason,
            });
            let branch_event = match outcome {
                UnackOutcome::Requeued => Event::MessageRequeued {
                    message_id: *id,
                    queue: self.queue.clone(),
                    consumer_id: self.consumer_id,
                },
                UnackOutcome::Delayed => Event::MessageDelayed {
                    message_id: *id,
                    queue: self.queue.clone(),
                    consumer_id: self.consumer_id,
                },
                UnackOutcome::DeadLettered => Event::MessageDeadLettered {
                    message_id: *id,
                    queue: self.queue.clone(),
                    consumer_id: self.consumer_id,
                },
            };
            self.events.emit(branch_event);
        }
        Ok(outcomes)
    }
}
