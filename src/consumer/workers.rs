//! Per-queue background workers.
//!
//! Workers are constructed from a statically registered table and run under
//! the queue's distributed lock, so exactly one consumer process services a
//! queue's background work at a time. Losing the lock is an abort signal
//! for the whole pool, not a retryable error.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::now_ms;
use crate::config::Config;
use crate::error::ConsumerError;
use crate::events::{Event, EventBus};
use crate::lifecycle::{BoxFuture, RunState, StateCell};
use crate::lock::{AutoRenewer, DistributedLock};
use crate::message::{next_occurrence, MessageStatus};
use crate::queue::QueueId;
use crate::store::{PromoteTarget, SchedulePromotion, Store};

/// Everything a worker needs to act on its queue.
#[derive(Clone)]
pub struct WorkerContext {
    pub store: Arc<dyn Store>,
    pub queue: QueueId,
    pub batch: usize,
}

/// One maintenance job for a queue, ticked while the pool holds the lock.
pub trait QueueWorker: Send {
    fn name(&self) -> &'static str;
    fn run_once(&mut self) -> BoxFuture<'_, Result<(), ConsumerError>>;
}

pub type WorkerCtor = fn(WorkerContext) -> Box<dyn QueueWorker>;

/// Statically registered worker table, resolved at pool startup.
pub const QUEUE_WORKERS: &[(&str, WorkerCtor)] =
    &[("schedule", |ctx| Box::new(ScheduleWorker::new(ctx)))];

/// Moves due scheduled messages into pending. One-shot delays and delayed
/// retries promote the message itself; periodic schedules queue a
/// descendant carrying the parent's lineage and re-arm the next occurrence.
pub struct ScheduleWorker {
    ctx: WorkerContext,
}

impl ScheduleWorker {
    pub fn new(ctx: WorkerContext) -> Self {
        Self { ctx }
    }

    async fn promote_due(&mut self) -> Result<(), ConsumerError> {
        let now = now_ms();
        let due = self
            .ctx
            .store
            .due_scheduled(&self.ctx.queue, now, self.ctx.batch)
            .await?;
        for id in due {
            let Some(mut original) = self
                .ctx
                .store
                .get_message(&self.ctx.queue.namespace, id)
                .await?
            else {
                warn!(queue = %self.ctx.queue, message_id = %id, "due entry without a record");
                continue;
            };

            let promotion = if original.schedule.is_periodic() {
                let mut child = original.spawn_scheduled_child();
                child.status = MessageStatus::Pending;
                child.state.published_at = Some(now);

                let next = next_occurrence(&original.schedule.clone(), &mut original.state, now);
                if next.is_some() {
                    original.state.last_scheduled_at = Some(now);
                    original.state.scheduled_count += 1;
                }
                SchedulePromotion {
                    original,
                    target: PromoteTarget::Child(Box::new(child)),
                    next_fire_at: next,
                }
            } else {
                original.status = MessageStatus::Pending;
                SchedulePromotion {
                    original,
                    target: PromoteTarget::Original,
                    next_fire_at: None,
                }
            };

            debug!(queue = %self.ctx.queue, message_id = %id, "promoting scheduled message");
            self.ctx
                .store
                .promote_scheduled(&self.ctx.queue, promotion)
                .await?;
        }
        Ok(())
    }
}

impl QueueWorker for ScheduleWorker {
    fn name(&self) -> &'static str {
        "schedule"
    }

    fn run_once(&mut self) -> BoxFuture<'_, Result<(), ConsumerError>> {
        Box::pin(self.promote_due())
    }
}

/// Worker pool for one queue subscription: acquires the queue's worker
/// lock (retrying with backoff), keeps the lease renewed, and ticks every
/// registered worker while it holds the lock.
pub struct WorkerPool {
    queue: QueueId,
    store: Arc<dyn Store>,
    config: Config,
    events: EventBus,
    state: StateCell,
    stop_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl WorkerPool {
    const COMPONENT: &'static str = "worker-pool";

    pub fn new(store: Arc<dyn Store>, queue: QueueId, config: Config, events: EventBus) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            queue,
            store,
            config,
            events,
            state: StateCell::new(),
            stop_tx,
            task: None,
        }
    }

    pub fn go_up(&mut self) {
        self.state.set(RunState::GoingUp);
        let queue = self.queue.clone();
        let store = self.store.clone();
        let config = self.config.clone();
        let events = self.events.clone();
        let state = self.state.clone();
        let mut stop_rx = self.stop_tx.subscribe();

        self.task = Some(tokio::spawn(async move {
            let lock = Arc::new(
                DistributedLock::new(
                    store.clone(),
                    format!("{queue}:workers"),
                    config.lock.lease_ms,
                )
                .with_retry_on_fail(true),
            );

            // Contend for the lock, bailing if shutdown wins the race.
            tokio::select! {
                _ = stop_rx.changed() => return,
                acquired = lock.acquire() => {
                    if let Err(err) = acquired {
                        events.emit(Event::ComponentError {
                            component: Self::COMPONENT.to_string(),
                            error: err.to_string(),
                        });
                        return;
                    }
                }
            }
            // The acquire may have raced an external teardown; that race
            // must resolve to "released", never "silently held".
            if *stop_rx.borrow() {
                let _ = lock.release().await;
                return;
            }
            state.set(RunState::Up);
            events.emit(Event::LockUp {
                lock_id: lock.resource().to_string(),
            });
            info!(%queue, "worker pool holds the queue lock");

            let renewer = AutoRenewer::start(
                lock.clone(),
                Duration::from_millis(config.lock.renew_interval_ms),
                state.clone(),
                events.clone(),
            );
            let mut lost = renewer.lost();

            let ctx = WorkerContext {
                store,
                queue: queue.clone(),
                batch: config.consumer.worker_batch,
            };
            let mut workers: Vec<Box<dyn QueueWorker>> = QUEUE_WORKERS
                .iter()
                .map(|(_, ctor)| ctor(ctx.clone()))
                .collect();

            let mut ticker =
                tokio::time::interval(Duration::from_millis(config.consumer.worker_tick_ms));
            let mut lock_lost = false;
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = async { let _ = lost.wait_for(|lost| *lost).await; } => {
                        // Hard cancellation: another holder owns the queue.
                        lock_lost = true;
                        break;
                    }
                    _ = ticker.tick() => {
                        if !state.is_running() {
                            break;
                        }
                        for worker in &mut workers {
                            if let Err(err) = worker.run_once().await {
                                warn!(%queue, worker = worker.name(), error = %err, "worker run failed");
                                events.emit(Event::ComponentError {
                                    component: format!("{}:{}", Self::COMPONENT, worker.name()),
                                    error: err.to_string(),
                                });
                            }
                        }
                    }
                }
            }

            drop(renewer);
            if !lock_lost {
                let _ = lock.release().await;
                events.emit(Event::LockDown {
                    lock_id: lock.resource().to_string(),
                });
            }
            state.set(RunState::Down);
        }));
    }

    pub async fn go_down(&mut self) {
        self.state.set(RunState::GoingDown);
        let _ = self.stop_tx.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        self.state.set(RunState::Down);
    }
}
