//! Consumer side: dequeue, consume, unacknowledge, orchestration, and
//! per-queue background workers.

pub mod consume;
pub mod dequeue;
mod handler;
pub mod unack;
pub mod workers;

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

use crate::config::Config;
use crate::error::ConsumerError;
use crate::events::{Event, EventBus, Transition};
use crate::lifecycle::{RunState, StateCell};
use crate::queue::{QueueId, RateLimitChecker};
use crate::store::Store;

pub use consume::{ConsumeEngine, Disposition, FnHandler, MessageHandler};
pub use dequeue::{DequeueEngine, StoreRateLimitChecker};
pub use unack::UnackPolicyResolver;
pub use workers::{QueueWorker, ScheduleWorker, WorkerContext, WorkerCtor, WorkerPool, QUEUE_WORKERS};

use handler::MessageHandlerOrchestrator;

/// Constructor for a named message worker: an isolated handler resolved
/// from the registry at startup instead of a caller-supplied callback.
pub type MessageWorkerCtor = fn() -> Box<dyn MessageHandler>;

enum HandlerSpec {
    Callback(Arc<dyn MessageHandler>),
    Worker(String),
}

struct Subscription {
    queue: QueueId,
    group: Option<String>,
    handler: HandlerSpec,
}

/// A consumer instance: one lightweight task per queue subscription, a
/// shared event bus, and a single shutdown signal fanned out to every
/// subscription.
pub struct Consumer {
    id: Uuid,
    store: Arc<dyn Store>,
    config: Config,
    events: EventBus,
    rate_checker: Arc<dyn RateLimitChecker>,
    message_workers: HashMap<String, MessageWorkerCtor>,
    subscriptions: Vec<Subscription>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    state: StateCell,
}

impl Consumer {
    const COMPONENT: &'static str = "consumer";

    pub fn new(store: Arc<dyn Store>, config: Config) -> Self {
        let events = EventBus::new(config.consumer.event_capacity);
        let rate_checker = Arc::new(StoreRateLimitChecker::new(store.clone()));
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            id: Uuid::new_v4(),
            store,
            config,
            events,
            rate_checker,
            message_workers: HashMap::new(),
            subscriptions: Vec::new(),
            shutdown_tx,
            tasks: Vec::new(),
            state: StateCell::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Subscribe to the engine's event stream.
    pub fn events(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Register a named message worker. Workers are resolved when a
    /// subscription referencing them starts.
    pub fn register_message_worker(&mut self, name: impl Into<String>, ctor: MessageWorkerCtor) {
        self.message_workers.insert(name.into(), ctor);
    }

    /// Subscribe a callback handler to a queue.
    pub fn subscribe(
        &mut self,
        queue: QueueId,
        group: Option<String>,
        handler: Arc<dyn MessageHandler>,
    ) {
        self.subscriptions.push(Subscription {
            queue,
            group,
            handler: HandlerSpec::Callback(handler),
        });
    }

    /// Subscribe a registered message worker to a queue.
    pub fn subscribe_worker(
        &mut self,
        queue: QueueId,
        group: Option<String>,
        worker: impl Into<String>,
    ) {
        self.subscriptions.push(Subscription {
            queue,
            group,
            handler: HandlerSpec::Worker(worker.into()),
        });
    }

    /// Bring every subscription up, one orchestrator task each.
    pub async fn run(&mut self) -> Result<(), ConsumerError> {
        self.state.set(RunState::GoingUp);
        self.emit(Transition::GoingUp);

        let subscriptions = std::mem::take(&mut self.subscriptions);
        for subscription in subscriptions {
            let handler: Arc<dyn MessageHandler> = match subscription.handler {
                HandlerSpec::Callback(handler) => handler,
                HandlerSpec::Worker(name) => {
                    let ctor = self
                        .message_workers
                        .get(name.as_str())
                        .ok_or_else(|| ConsumerError::UnknownWorker(name.clone()))?;
                    Arc::from(ctor())
                }
            };

            let dequeue = DequeueEngine::new(
                self.store.clone(),
                subscription.queue.clone(),
                subscription.group.clone(),
                self.id,
                &self.config.consumer,
                self.rate_checker.clone(),
                self.events.clone(),
            );
            let consume = ConsumeEngine::new(
                self.store.clone(),
                subscription.queue.clone(),
                self.id,
                handler,
                self.config.ack_retention.clone(),
                self.events.clone(),
            );
            let workers = WorkerPool::new(
                self.store.clone(),
                subscription.queue.clone(),
                self.config.clone(),
                self.events.clone(),
            );
            let orchestrator = MessageHandlerOrchestrator::new(
                subscription.queue,
                dequeue,
                consume,
                workers,
                self.shutdown_tx.subscribe(),
                self.events.clone(),
                self.config.consumer.auto_dequeue,
                std::time::Duration::from_millis(self.config.consumer.backoff_ms),
            );
            self.tasks.push(tokio::spawn(orchestrator.run()));
        }

        self.state.set(RunState::Up);
        self.emit(Transition::Up);
        info!(consumer_id = %self.id, subscriptions = self.tasks.len(), "consumer up");
        Ok(())
    }

    /// Signal shutdown and wait for every subscription to finish its
    /// teardown (offline unacknowledge included). Idempotent.
    pub async fn shutdown(&mut self) {
        if self.state.get() == RunState::Down && self.tasks.is_empty() {
            return;
        }
        self.state.set(RunState::GoingDown);
        self.emit(Transition::GoingDown);
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        self.state.set(RunState::Down);
        self.emit(Transition::Down);
        info!(consumer_id = %self.id, "consumer down");
    }

    fn emit(&self, transition: Transition) {
        self.events.emit(Event::Component {
            component: Self::COMPONENT.to_string(),
            transition,
        });
    }
}
