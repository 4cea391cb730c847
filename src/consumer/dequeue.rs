//! Dequeue engine: per-(consumer, queue) acquisition of work.
//!
//! Each cycle applies a fixed precedence: rate limit, then priority pop,
//! then blocking pop, then a single non-blocking attempt. The engine owns
//! its store connection — exclusive when blocking, shared otherwise.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ConsumerConfig;
use crate::error::{DequeueError, StoreError};
use crate::events::{Event, EventBus, Transition};
use crate::lifecycle::{run_steps, BoxFuture, RunState, StateCell, Step};
use crate::queue::{DeliveryModel, QueueId, QueueProperties, QueueType, RateLimit, RateLimitChecker};
use crate::store::{ConsumerInfo, DequeueHandle, DequeueTarget, Store};

/// Default rate-limit accounting: fixed windows kept in the store.
pub struct StoreRateLimitChecker {
    store: Arc<dyn Store>,
}

impl StoreRateLimitChecker {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl RateLimitChecker for StoreRateLimitChecker {
    async fn is_exceeded(&self, queue: &QueueId, limit: &RateLimit) -> Result<bool, StoreError> {
        self.store.rate_limit_exceeded(queue, limit).await
    }
}

pub struct DequeueEngine {
    store: Arc<dyn Store>,
    queue: QueueId,
    group: Option<String>,
    consumer_id: Uuid,
    blocking: bool,
    idle_threshold: u32,
    backoff: Duration,
    rate_checker: Arc<dyn RateLimitChecker>,
    events: EventBus,
    state: StateCell,

    handle: Option<Box<dyn DequeueHandle>>,
    properties: Option<QueueProperties>,
    target: Option<DequeueTarget>,
    idle_streak: u32,
}

impl DequeueEngine {
    const COMPONENT: &'static str = "dequeue";

    /// Ordered startup: connection, presence, properties + validation.
    /// All three must complete before the first dequeue.
    const UP_STEPS: &'static [Step<Self, DequeueError>] = &[
        ("acquire-connection", Self::step_acquire_connection),
        ("register-presence", Self::step_register_presence),
        ("load-properties", Self::step_load_properties),
    ];

    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        queue: QueueId,
        group: Option<String>,
        consumer_id: Uuid,
        config: &ConsumerConfig,
        rate_checker: Arc<dyn RateLimitChecker>,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            queue,
            group,
            consumer_id,
            blocking: config.blocking,
            idle_threshold: config.idle_threshold,
            backoff: Duration::from_millis(config.backoff_ms),
            rate_checker,
            events,
            state: StateCell::new(),
            handle: None,
            properties: None,
            target: None,
            idle_streak: 0,
        }
    }

    fn step_acquire_connection(&mut self) -> BoxFuture<'_, Result<(), DequeueError>> {
        Box::pin(async move {
            // Blocking pops must not starve other consumers sharing a
            // connection, so blocking mode takes an exclusive one.
            let handle = self.store.dequeue_handle(self.blocking).await?;
            self.handle = Some(handle);
            Ok(())
        })
    }

    fn step_register_presence(&mut self) -> BoxFuture<'_, Result<(), DequeueError>> {
        Box::pin(async move {
            let registered = self
                .store
                .register_consumer(&self.queue, self.consumer_id, &ConsumerInfo::for_this_process())
                .await?;
            if !registered {
                return Err(DequeueError::QueueNotFound(self.queue.to_string()));
            }
            Ok(())
        })
    }

    fn step_load_properties(&mut self) -> BoxFuture<'_, Result<(), DequeueError>> {
        Box::pin(async move {
            let properties = self
                .store
                .queue_properties(&self.queue)
                .await?
                .ok_or_else(|| DequeueError::QueueNotFound(self.queue.to_string()))?;

            match (properties.delivery_model, &self.group) {
                (DeliveryModel::PointToPoint, Some(_)) => {
                    return Err(DequeueError::GroupNotAllowed(self.queue.to_string()));
                }
                (DeliveryModel::PubSub, None) => {
                    return Err(DequeueError::GroupRequired(self.queue.to_string()));
                }
                (DeliveryModel::PubSub, Some(group)) => {
                    self.store.ensure_group(&self.queue, group).await?;
                }
                (DeliveryModel::PointToPoint, None) => {}
            }

            self.target = Some(DequeueTarget {
                queue: self.queue.clone(),
                group: self.group.clone(),
                consumer_id: self.consumer_id,
                queue_type: properties.queue_type,
            });
            self.properties = Some(properties);
            Ok(())
        })
    }

    pub async fn go_up(&mut self) -> Result<(), DequeueError> {
        self.state.set(RunState::GoingUp);
        self.emit(Transition::GoingUp);
        let result = run_steps(Self::COMPONENT, self, Self::UP_STEPS).await;
        match result {
            Ok(()) => {
                self.state.set(RunState::Up);
                self.emit(Transition::Up);
                info!(queue = %self.queue, consumer_id = %self.consumer_id, "dequeue engine up");
                Ok(())
            }
            Err(err) => {
                self.state.set(RunState::Down);
                Err(err)
            }
        }
    }

    /// One dequeue cycle. Policy precedence, in order:
    /// 1. Rate limit — exceeded windows sleep out the backoff and end the
    ///    cycle without touching the idle counter.
    /// 2. Priority pop for priority queues.
    /// 3. Blocking pop-and-push with indefinite wait.
    /// 4. A single non-blocking attempt, with the idle backoff after
    ///    `idle_threshold` consecutive empty cycles.
    pub async fn next(&mut self) -> Result<Option<Uuid>, DequeueError> {
        let target = self
            .target
            .clone()
            .expect("dequeue engine used before startup completed");
        let properties = self
            .properties
            .as_ref()
            .expect("dequeue engine used before startup completed");

        if let Some(limit) = properties.rate_limit {
            if self.rate_checker.is_exceeded(&self.queue, &limit).await? {
                debug!(queue = %self.queue, "rate limit exceeded, backing off");
                tokio::time::sleep(self.backoff).await;
                return Ok(None);
            }
        }

        let blocking = self.blocking && target.queue_type != QueueType::Priority;
        let handle = self
            .handle
            .as_mut()
            .expect("dequeue engine used before startup completed");
        let popped = if blocking {
            handle.pop_blocking(&target).await?
        } else {
            handle.pop(&target).await?
        };

        match popped {
            Some(id) => {
                self.idle_streak = 0;
                Ok(Some(id))
            }
            None => {
                if !blocking {
                    self.idle_streak += 1;
                    if self.idle_streak >= self.idle_threshold {
                        tokio::time::sleep(self.backoff).await;
                    }
                }
                Ok(None)
            }
        }
    }

    pub async fn go_down(&mut self) {
        self.state.set(RunState::GoingDown);
        self.emit(Transition::GoingDown);

        // An exclusive connection may be mid-block; dropping destroys it
        // rather than returning it for reuse.
        self.handle = None;

        if let Err(err) = self
            .store
            .deregister_consumer(&self.queue, self.consumer_id)
            .await
        {
            warn!(queue = %self.queue, error = %err, "failed to deregister consumer presence");
        }

        self.state.set(RunState::Down);
        self.emit(Transition::Down);
    }

    fn emit(&self, transition: Transition) {
        self.events.emit(Event::Component {
            component: Self::COMPONENT.to_string(),
            transition,
        });
    }
}
