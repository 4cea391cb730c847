//! Consume engine: checkout, handler invocation, and outcome resolution.
//!
//! The handler always runs in its own spawned task behind a single-fire
//! completion gate: the first resolution (result, panic, or timeout) wins
//! and late resolutions land on a dropped receiver, which makes them
//! no-ops rather than errors.

use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::clock::now_ms;
use crate::config::AckRetention;
use crate::consumer::unack::UnackPolicyResolver;
use crate::error::{ConsumeError, ConsumerError, HandlerError};
use crate::events::{Event, EventBus};
use crate::lifecycle::{RunState, StateCell};
use crate::message::{Message, TransferableMessage, UnackReason};
use crate::queue::QueueId;
use crate::store::{AckOutcome, CheckoutOutcome, Store, UnackOutcome};

/// User handler contract: given the transferable message, eventually
/// resolve with success or failure. A panic inside the handler counts as
/// failure — the spawned task contains it.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, message: TransferableMessage) -> Result<(), HandlerError>;
}

/// Adapter turning an async closure into a handler.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(TransferableMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, message: TransferableMessage) -> Result<(), HandlerError> {
        (self.0)(message).await
    }
}

/// How a consumed message ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Acknowledged,
    Unacknowledged(UnackReason, UnackOutcome),
}

enum HandlerResolution {
    Success,
    Failed(HandlerError),
    TimedOut,
}

pub struct ConsumeEngine {
    store: Arc<dyn Store>,
    queue: QueueId,
    consumer_id: Uuid,
    handler: Arc<dyn MessageHandler>,
    retention: AckRetention,
    resolver: UnackPolicyResolver,
    events: EventBus,
    state: StateCell,
    /// Handler task currently in flight, torn down on shutdown.
    current: Mutex<Option<JoinHandle<()>>>,
}

impl ConsumeEngine {
    pub fn new(
        store: Arc<dyn Store>,
        queue: QueueId,
        consumer_id: Uuid,
        handler: Arc<dyn MessageHandler>,
        retention: AckRetention,
        events: EventBus,
    ) -> Self {
        let resolver =
            UnackPolicyResolver::new(store.clone(), queue.clone(), consumer_id, events.clone());
        Self {
            store,
            queue,
            consumer_id,
            handler,
            retention,
            resolver,
            events,
            state: StateCell::new(),
            current: Mutex::new(None),
        }
    }

    pub fn go_up(&self) {
        self.state.set(RunState::Up);
    }

    /// Process one dequeued message id through checkout, TTL gate, handler
    /// race, and resolution.
    pub async fn consume(&self, id: Uuid) -> Result<Disposition, ConsumerError> {
        let message = match self.store.checkout(&self.queue, self.consumer_id, id).await? {
            CheckoutOutcome::Checked(message) => *message,
            // A message cannot be dequeued without its pending→processing
            // transition succeeding; either reply here means an ownership
            // invariant broke somewhere else.
            CheckoutOutcome::NotPending => {
                error!(queue = %self.queue, message_id = %id, "checkout found message not pending");
                return Err(ConsumeError::NotPending(id).into());
            }
            CheckoutOutcome::NotFound => {
                error!(queue = %self.queue, message_id = %id, "checkout found no record");
                return Err(ConsumeError::NotFound(id).into());
            }
        };

        self.events.emit(Event::MessageReceived {
            message_id: id,
            queue: self.queue.clone(),
            consumer_id: self.consumer_id,
        });

        // Expiry precedes dispatch: a message that outlived its TTL is
        // never handed to the handler.
        if message.is_expired(now_ms()) {
            return self.unacknowledge(id, UnackReason::TtlExpired).await;
        }

        let resolution = self.invoke_handler(&message).await;
        match resolution {
            HandlerResolution::Success => {
                match self
                    .store
                    .acknowledge(&self.queue, self.consumer_id, id, &self.retention)
                    .await?
                {
                    AckOutcome::Acknowledged => {
                        info!(queue = %self.queue, message_id = %id, "message acknowledged");
                        self.events.emit(Event::MessageAcknowledged {
                            message_id: id,
                            queue: self.queue.clone(),
                            consumer_id: self.consumer_id,
                        });
                        Ok(Disposition::Acknowledged)
                    }
                    AckOutcome::NotInProcessing => {
                        // Unreachable through the dequeue→consume pairing;
                        // reaching it means the message was delivered twice.
                        panic!(
                            "message {id} acknowledged but absent from processing: \
                             double delivery detected"
                        );
                    }
                }
            }
            HandlerResolution::Failed(err) => {
                warn!(queue = %self.queue, message_id = %id, error = %err, "handler failed");
                self.unacknowledge(id, UnackReason::HandlerError).await
            }
            HandlerResolution::TimedOut => {
                warn!(
                    queue = %self.queue,
                    message_id = %id,
                    timeout_ms = message.consume_timeout_ms,
                    "handler timed out"
                );
                self.unacknowledge(id, UnackReason::Timeout).await
            }
        }
    }

    async fn invoke_handler(&self, message: &Message) -> HandlerResolution {
        let (gate_tx, gate_rx) = oneshot::channel();
        let handler = self.handler.clone();
        let transferable = message.transferable();
        let task = tokio::spawn(async move {
            let result = handler.handle(transferable).await;
            // First resolution wins: when the engine already resolved the
            // message (timeout), the receiver is gone and this is a no-op.
            let _ = gate_tx.send(result);
        });
        *self.current.lock().expect("current task slot poisoned") = Some(task);

        let resolution = if message.consume_timeout_ms > 0 {
            let deadline = Duration::from_millis(message.consume_timeout_ms);
            match tokio::time::timeout(deadline, gate_rx).await {
                Ok(Ok(Ok(()))) => HandlerResolution::Success,
                Ok(Ok(Err(err))) => HandlerResolution::Failed(err),
                // Gate sender dropped without a send: the handler panicked.
                Ok(Err(_)) => HandlerResolution::Failed(HandlerError::new("handler panicked")),
                Err(_) => HandlerResolution::TimedOut,
            }
        } else {
            match gate_rx.await {
                Ok(Ok(())) => HandlerResolution::Success,
                Ok(Err(err)) => HandlerResolution::Failed(err),
                Err(_) => HandlerResolution::Failed(HandlerError::new("handler panicked")),
            }
        };
        self.current.lock().expect("current task slot poisoned").take();
        resolution
    }

    async fn unacknowledge(
        &self,
        id: Uuid,
        reason: UnackReason,
    ) -> Result<Disposition, ConsumerError> {
        let outcomes = self.resolver.resolve(&[id], reason).await?;
        match outcomes.first() {
            Some((_, outcome)) => Ok(Disposition::Unacknowledged(reason, *outcome)),
            None => {
                // The id was no longer in processing — same broken-ownership
                // class as a failing checkout.
                Err(ConsumeError::NotFound(id).into())
            }
        }
    }

    /// Shutdown: proactively unacknowledge everything this consumer still
    /// has in processing (best-effort), then tear down a spawned handler.
    pub async fn go_down(&self) {
        self.state.set(RunState::GoingDown);

        match self
            .store
            .processing_ids(&self.queue, self.consumer_id)
            .await
        {
            Ok(ids) if !ids.is_empty() => {
                info!(
                    queue = %self.queue,
                    count = ids.len(),
                    "unacknowledging in-flight messages before shutdown"
                );
                if let Err(err) = self.resolver.resolve(&ids, UnackReason::Offline).await {
                    warn!(queue = %self.queue, error = %err, "offline unacknowledge failed");
                }
            }
            Ok(_) => {}
            Err(err) => {
                warn!(queue = %self.queue, error = %err, "failed to list in-flight messages");
            }
        }

        if let Some(task) = self.current.lock().expect("current task slot poisoned").take() {
            task.abort();
        }
        self.state.set(RunState::Down);
    }
}
