//! Message handler orchestrator: one dequeue engine and one consume engine
//! per queue subscription, wired into a strict one-outstanding-message
//! pipeline. The next dequeue is never issued until the previous message's
//! disposition has fully resolved — that sequencing is the back-pressure
//! mechanism; there is no prefetch.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::consumer::consume::ConsumeEngine;
use crate::consumer::dequeue::DequeueEngine;
use crate::consumer::workers::WorkerPool;
use crate::events::{Event, EventBus, Transition};
use crate::lifecycle::{RunState, StateCell};
use crate::queue::QueueId;

pub(crate) struct MessageHandlerOrchestrator {
    queue: QueueId,
    dequeue: DequeueEngine,
    consume: ConsumeEngine,
    workers: WorkerPool,
    shutdown: watch::Receiver<bool>,
    events: EventBus,
    state: StateCell,
    auto_dequeue: bool,
    error_backoff: Duration,
}

impl MessageHandlerOrchestrator {
    const COMPONENT: &'static str = "message-handler";

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        queue: QueueId,
        dequeue: DequeueEngine,
        consume: ConsumeEngine,
        workers: WorkerPool,
        shutdown: watch::Receiver<bool>,
        events: EventBus,
        auto_dequeue: bool,
        error_backoff: Duration,
    ) -> Self {
        Self {
            queue,
            dequeue,
            consume,
            workers,
            shutdown,
            events,
            state: StateCell::new(),
            auto_dequeue,
            error_backoff,
        }
    }

    /// Drive the subscription until shutdown. Runs as one task per
    /// (consumer, queue) pair.
    pub(crate) async fn run(mut self) {
        self.state.set(RunState::GoingUp);
        self.emit(Transition::GoingUp);

        // Startup order: dequeue engine, consume engine, then the worker
        // pool; the first dequeue follows as the loop entry.
        if let Err(err) = self.dequeue.go_up().await {
            warn!(queue = %self.queue, error = %err, "subscription startup failed");
            self.events.emit(Event::ComponentError {
                component: Self::COMPONENT.to_string(),
                error: err.to_string(),
            });
            self.state.set(RunState::Down);
            self.emit(Transition::Down);
            return;
        }
        self.consume.go_up();
        self.workers.go_up();
        self.state.set(RunState::Up);
        self.emit(Transition::Up);
        info!(queue = %self.queue, "subscription up");

        if self.auto_dequeue {
            self.pipeline().await;
        } else {
            // Manual mode: hold the engines up until shutdown.
            while !*self.shutdown.borrow() {
                if self.shutdown.changed().await.is_err() {
                    break;
                }
            }
        }

        self.state.set(RunState::GoingDown);
        self.emit(Transition::GoingDown);
        // Teardown order: worker pool first, then the engines. Each step is
        // best-effort.
        self.workers.go_down().await;
        self.consume.go_down().await;
        self.dequeue.go_down().await;
        self.state.set(RunState::Down);
        self.emit(Transition::Down);
        info!(queue = %self.queue, "subscription down");
    }

    /// idle → dequeuing → checking-out → consuming → acking|unacking → idle
    async fn pipeline(&mut self) {
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            let next = tokio::select! {
                _ = self.shutdown.changed() => break,
                next = self.dequeue.next() => next,
            };
            match next {
                Ok(Some(id)) => {
                    // A shutdown mid-consume leaves the message in
                    // processing; the consume engine's teardown
                    // unacknowledges it as offline.
                    let disposition = tokio::select! {
                        _ = self.shutdown.changed() => break,
                        disposition = self.consume.consume(id) => disposition,
                    };
                    if let Err(err) = disposition {
                        warn!(queue = %self.queue, message_id = %id, error = %err, "consume failed");
                        self.events.emit(Event::ComponentError {
                            component: Self::COMPONENT.to_string(),
                            error: err.to_string(),
                        });
                        tokio::time::sleep(self.error_backoff).await;
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(queue = %self.queue, error = %err, "dequeue cycle failed");
                    self.events.emit(Event::ComponentError {
                        component: Self::COMPONENT.to_string(),
                        error: err.to_string(),
                    });
                    tokio::time::sleep(self.error_backoff).await;
                }
            }
        }
    }

    fn emit(&self, transition: Transition) {
        self.events.emit(Event::Component {
            component: Self::COMPONENT.to_string(),
            transition,
        });
    }
}
