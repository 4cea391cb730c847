//! In-memory store backend for tests and local development.
//!
//! Implements the same atomic-operation contract as the Redis backend: each
//! trait method takes the inner mutex once, so every transition is atomic
//! with respect to all others. Blocking pops park on a per-pending-structure
//! `Notify` instead of a server-side blocking command.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::warn;
use uuid::Uuid;

use crate::clock::now_ms;
use crate::config::AckRetention;
use crate::error::StoreError;
use crate::message::{Message, MessageStatus, UnackReason};
use crate::queue::{QueueId, QueueProperties, QueueType, RateLimit};
use crate::store::traits::{
    AckOutcome, CheckoutOutcome, ConsumerInfo, DequeueHandle, DequeueTarget, PromoteTarget,
    QueueCounters, SchedulePromotion, Store, UnackOutcome,
};

#[derive(Debug, Default)]
struct PendingSet {
    /// FIFO/LIFO storage. Published messages enter at the front; FIFO pops
    /// the back, LIFO pops the front. Requeues enter at the pop end.
    list: VecDeque<Uuid>,
    /// Priority storage: (priority, insertion seq, id).
    ranked: Vec<(u8, u64, Uuid)>,
}

#[derive(Debug)]
struct QueueData {
    properties: QueueProperties,
    pending: HashMap<Option<String>, PendingSet>,
    processing: HashMap<Uuid, Vec<Uuid>>,
    acknowledged: VecDeque<Uuid>,
    dead_lettered: VecDeque<Uuid>,
    /// (fire_at_ms, id), kept sorted on read.
    scheduled: Vec<(u64, Uuid)>,
    groups: HashSet<String>,
    consumers: HashMap<Uuid, ConsumerInfo>,
    acknowledged_total: u64,
    dead_lettered_total: u64,
    seq: u64,
    rate_windows: HashMap<u64, u32>,
}

impl QueueData {
    fn new(properties: QueueProperties) -> Self {
        Self {
            properties,
            pending: HashMap::new(),
            processing: HashMap::new(),
            acknowledged: VecDeque::new(),
            dead_lettered: VecDeque::new(),
            scheduled: Vec::new(),
            groups: HashSet::new(),
            consumers: HashMap::new(),
            acknowledged_total: 0,
            dead_lettered_total: 0,
            seq: 0,
            rate_windows: HashMap::new(),
        }
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }
}

#[derive(Debug)]
struct LockEntry {
    holder: String,
    expires_at: u64,
}

#[derive(Default)]
struct Inner {
    messages: HashMap<Uuid, Message>,
    queues: HashMap<QueueId, QueueData>,
    locks: HashMap<String, LockEntry>,
}

/// In-process `Store` implementation. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    signals: Arc<Mutex<HashMap<String, Arc<Notify>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn signal(&self, queue: &QueueId, group: Option<&str>) -> Arc<Notify> {
        let key = format!("{queue}:{}", group.unwrap_or(""));
        self.signals
            .lock()
            .expect("signal map poisoned")
            .entry(key)
            .or_default()
            .clone()
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("store state poisoned")
    }

    /// Insert a message id into a queue's pending structure. Requeues go to
    /// the pop end so a retried message is next in line.
    fn push_pending(inner: &mut Inner, message: &Message, requeue: bool) {
        let Some(dest) = message.destination() else {
            return;
        };
        let Some(qd) = inner.queues.get_mut(&dest.queue) else {
            return;
        };
        let queue_type = qd.properties.queue_type;
        let seq = qd.next_seq();
        let set = qd.pending.entry(dest.group.clone()).or_default();
        match queue_type {
            QueueType::Priority => {
                set.ranked
                    .push((message.priority.unwrap_or(0), seq, message.id));
            }
            QueueType::Fifo => {
                if requeue {
                    set.list.push_back(message.id);
                } else {
                    set.list.push_front(message.id);
                }
            }
            QueueType::Lifo => {
                // LIFO pops the front, which is also where new messages go.
                set.list.push_front(message.id);
            }
        }
    }

    fn try_pop(inner: &mut Inner, target: &DequeueTarget) -> Option<Uuid> {
        let qd = inner.queues.get_mut(&target.queue)?;
        let set = qd.pending.get_mut(&target.group)?;
        let id = match target.queue_type {
            QueueType::Fifo => set.list.pop_back()?,
            QueueType::Lifo => set.list.pop_front()?,
            QueueType::Priority => {
                // Highest priority first; insertion order within a priority.
                let best = set
                    .ranked
                    .iter()
                    .enumerate()
                    .max_by_key(|(_, (prio, seq, _))| (*prio, std::cmp::Reverse(*seq)))
                    .map(|(i, _)| i)?;
                set.ranked.remove(best).2
            }
        };
        qd.processing.entry(target.consumer_id).or_default().push(id);
        Some(id)
    }
}

struct MemoryDequeueHandle {
    store: MemoryStore,
}

#[async_trait]
impl DequeueHandle for MemoryDequeueHandle {
    async fn pop(&mut self, target: &DequeueTarget) -> Result<Option<Uuid>, StoreError> {
        let mut inner = self.store.lock_inner();
        Ok(MemoryStore::try_pop(&mut inner, target))
    }

    async fn pop_blocking(&mut self, target: &DequeueTarget) -> Result<Option<Uuid>, StoreError> {
        loop {
            let notify = {
                let mut inner = self.store.lock_inner();
                if let Some(id) = MemoryStore::try_pop(&mut inner, target) {
                    return Ok(Some(id));
                }
                self.store.signal(&target.queue, target.group.as_deref())
            };
            notify.notified().await;
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn dequeue_handle(&self, _exclusive: bool) -> Result<Box<dyn DequeueHandle>, StoreError> {
        Ok(Box::new(MemoryDequeueHandle {
            store: self.clone(),
        }))
    }

    async fn create_queue(
        &self,
        queue: &QueueId,
        properties: &QueueProperties,
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock_inner();
        if inner.queues.contains_key(queue) {
            return Ok(false);
        }
        inner
            .queues
            .insert(queue.clone(), QueueData::new(properties.clone()));
        Ok(true)
    }

    async fn queue_properties(
        &self,
        queue: &QueueId,
    ) -> Result<Option<QueueProperties>, StoreError> {
        let inner = self.lock_inner();
        Ok(inner.queues.get(queue).map(|qd| qd.properties.clone()))
    }

    async fn register_consumer(
        &self,
        queue: &QueueId,
        consumer_id: Uuid,
        info: &ConsumerInfo,
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock_inner();
        match inner.queues.get_mut(queue) {
            Some(qd) => {
                qd.consumers.insert(consumer_id, info.clone());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn deregister_consumer(
        &self,
        queue: &QueueId,
        consumer_id: Uuid,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock_inner();
        if let Some(qd) = inner.queues.get_mut(queue) {
            qd.consumers.remove(&consumer_id);
        }
        Ok(())
    }

    async fn ensure_group(&self, queue: &QueueId, group: &str) -> Result<(), StoreError> {
        let mut inner = self.lock_inner();
        if let Some(qd) = inner.queues.get_mut(queue) {
            qd.groups.insert(group.to_string());
        }
        Ok(())
    }

    async fn queue_counters(&self, queue: &QueueId) -> Result<QueueCounters, StoreError> {
        let inner = self.lock_inner();
        let Some(qd) = inner.queues.get(queue) else {
            return Ok(QueueCounters::default());
        };
        let pending = qd
            .pending
            .values()
            .map(|set| set.list.len() + set.ranked.len())
            .sum::<usize>() as u64;
        let processing = qd.processing.values().map(Vec::len).sum::<usize>() as u64;
        Ok(QueueCounters {
            pending,
            processing,
            acknowledged: qd.acknowledged_total,
            dead_lettered: qd.dead_lettered_total,
            scheduled: qd.scheduled.len() as u64,
        })
    }

    async fn get_message(&self, _namespace: &str, id: Uuid) -> Result<Option<Message>, StoreError> {
        let inner = self.lock_inner();
        Ok(inner.messages.get(&id).cloned())
    }

    async fn publish_pending(&self, message: &Message) -> Result<bool, StoreError> {
        let dest = message.destination().cloned();
        let Some(dest) = dest else {
            return Ok(false);
        };
        {
            let mut inner = self.lock_inner();
            if !inner.queues.contains_key(&dest.queue) {
                return Ok(false);
            }
            inner.messages.insert(message.id, message.clone());
            Self::push_pending(&mut inner, message, false);
        }
        self.signal(&dest.queue, dest.group.as_deref()).notify_one();
        Ok(true)
    }

    async fn publish_scheduled(
        &self,
        message: &Message,
        fire_at_ms: u64,
    ) -> Result<bool, StoreError> {
        let Some(dest) = message.destination() else {
            return Ok(false);
        };
        let mut inner = self.lock_inner();
        if !inner.queues.contains_key(&dest.queue) {
            return Ok(false);
        }
        let queue = dest.queue.clone();
        inner.messages.insert(message.id, message.clone());
        if let Some(qd) = inner.queues.get_mut(&queue) {
            qd.scheduled.push((fire_at_ms, message.id));
        }
        Ok(true)
    }

    async fn checkout(
        &self,
        _queue: &QueueId,
        _consumer_id: Uuid,
        id: Uuid,
    ) -> Result<CheckoutOutcome, StoreError> {
        let mut inner = self.lock_inner();
        let Some(msg) = inner.messages.get_mut(&id) else {
            return Ok(CheckoutOutcome::NotFound);
        };
        if msg.status != MessageStatus::Pending {
            return Ok(CheckoutOutcome::NotPending);
        }
        msg.status = MessageStatus::Processing;
        msg.state.processing_started_at = Some(now_ms());
        Ok(CheckoutOutcome::Checked(Box::new(msg.clone())))
    }

    async fn acknowledge(
        &self,
        queue: &QueueId,
        consumer_id: Uuid,
        id: Uuid,
        retention: &AckRetention,
    ) -> Result<AckOutcome, StoreError> {
        let mut inner = self.lock_inner();
        let inner = &mut *inner;
        let Some(qd) = inner.queues.get_mut(queue) else {
            return Ok(AckOutcome::NotInProcessing);
        };
        let Some(list) = qd.processing.get_mut(&consumer_id) else {
            return Ok(AckOutcome::NotInProcessing);
        };
        let Some(pos) = list.iter().position(|x| *x == id) else {
            return Ok(AckOutcome::NotInProcessing);
        };
        list.remove(pos);
        qd.acknowledged_total += 1;

        if retention.store {
            if let Some(msg) = inner.messages.get_mut(&id) {
                msg.status = MessageStatus::Acknowledged;
                msg.state.acknowledged_at = Some(now_ms());
            }
            qd.acknowledged.push_front(id);
            // expire_ms has no background reaper here; only the size cap
            // applies in memory.
            if let Some(cap) = retention.queue_size {
                while qd.acknowledged.len() as u64 > cap {
                    if let Some(evicted) = qd.acknowledged.pop_back() {
                        inner.messages.remove(&evicted);
                    }
                }
            }
        } else {
            inner.messages.remove(&id);
        }
        Ok(AckOutcome::Acknowledged)
    }

    async fn resolve_unacknowledged(
        &self,
        queue: &QueueId,
        consumer_id: Uuid,
        ids: &[Uuid],
        reason: UnackReason,
    ) -> Result<Vec<(Uuid, UnackOutcome)>, StoreError> {
        let now = now_ms();
        let mut outcomes = Vec::with_capacity(ids.len());
        let mut requeued: Vec<Uuid> = Vec::new();
        {
            let mut inner = self.lock_inner();
            let inner = &mut *inner;
            for &id in ids {
                let Some(qd) = inner.queues.get_mut(queue) else {
                    break;
                };
                let in_processing = qd
                    .processing
                    .get_mut(&consumer_id)
                    .and_then(|list| list.iter().position(|x| *x == id).map(|pos| {
                        list.remove(pos);
                    }))
                    .is_some();
                if !in_processing {
                    warn!(%queue, message_id = %id, "unack skipped: not in processing");
                    continue;
                }
                let Some(msg) = inner.messages.get_mut(&id) else {
                    warn!(%queue, message_id = %id, "unack skipped: record missing");
                    continue;
                };

                msg.state.increment_attempts();
                if msg.state.unacknowledged_at.is_none() {
                    msg.state.unacknowledged_at = Some(now);
                }
                msg.state.last_unacknowledged_at = Some(now);

                let dead_letter = reason == UnackReason::TtlExpired
                    || msg.state.attempts >= msg.retry_threshold;
                if dead_letter {
                    msg.status = MessageStatus::DeadLettered;
                    msg.state.dead_lettered_at = Some(now);
                    if reason == UnackReason::TtlExpired {
                        msg.state.expired = true;
                    }
                    qd.dead_lettered.push_front(id);
                    qd.dead_lettered_total += 1;
                    outcomes.push((id, UnackOutcome::DeadLettered));
                } else if msg.retry_delay_ms > 0 {
                    msg.status = MessageStatus::Scheduled;
                    msg.state.last_retried_at = Some(now);
                    if msg.state.scheduled_at.is_none() {
                        msg.state.scheduled_at = Some(now);
                    }
                    msg.state.last_scheduled_at = Some(now);
                    msg.state.scheduled_count += 1;
                    let fire_at = now + msg.retry_delay_ms;
                    qd.scheduled.push((fire_at, id));
                    outcomes.push((id, UnackOutcome::Delayed));
                } else {
                    msg.status = MessageStatus::Pending;
                    msg.state.requeue_count += 1;
                    if msg.state.requeued_at.is_none() {
                        msg.state.requeued_at = Some(now);
                    }
                    msg.state.last_requeued_at = Some(now);
                    let msg = msg.clone();
                    Self::push_pending(inner, &msg, true);
                    requeued.push(id);
                    outcomes.push((id, UnackOutcome::Requeued));
                }
            }
            // Wake blocked dequeuers for each requeued message.
            for id in &requeued {
                if let Some(msg) = inner.messages.get(id) {
                    if let Some(dest) = msg.destination() {
                        self.signal(&dest.queue, dest.group.as_deref()).notify_one();
                    }
                }
            }
        }
        Ok(outcomes)
    }

    async fn processing_ids(
        &self,
        queue: &QueueId,
        consumer_id: Uuid,
    ) -> Result<Vec<Uuid>, StoreError> {
        let inner = self.lock_inner();
        Ok(inner
            .queues
            .get(queue)
            .and_then(|qd| qd.processing.get(&consumer_id))
            .cloned()
            .unwrap_or_default())
    }

    async fn due_scheduled(
        &self,
        queue: &QueueId,
        now_ms: u64,
        limit: usize,
    ) -> Result<Vec<Uuid>, StoreError> {
        let mut inner = self.lock_inner();
        let Some(qd) = inner.queues.get_mut(queue) else {
            return Ok(Vec::new());
        };
        qd.scheduled.sort_by_key(|(ts, _)| *ts);
        Ok(qd
            .scheduled
            .iter()
            .take_while(|(ts, _)| *ts <= now_ms)
            .take(limit)
            .map(|(_, id)| *id)
            .collect())
    }

    async fn promote_scheduled(
        &self,
        queue: &QueueId,
        promotion: SchedulePromotion,
    ) -> Result<(), StoreError> {
        let original_id = promotion.original.id;
        let dest = promotion.original.destination().cloned();
        {
            let mut inner = self.lock_inner();
            let inner = &mut *inner;
            let Some(qd) = inner.queues.get_mut(queue) else {
                return Ok(());
            };
            qd.scheduled.retain(|(_, id)| *id != original_id);
            if let Some(next) = promotion.next_fire_at {
                qd.scheduled.push((next, original_id));
            }

            match promotion.target {
                PromoteTarget::Original => {
                    inner
                        .messages
                        .insert(original_id, promotion.original.clone());
                    Self::push_pending(inner, &promotion.original, false);
                }
                PromoteTarget::Child(child) => {
                    if promotion.next_fire_at.is_some() {
                        inner
                            .messages
                            .insert(original_id, promotion.original.clone());
                    } else {
                        // Schedule exhausted: the anchor record goes away.
                        inner.messages.remove(&original_id);
                    }
                    inner.messages.insert(child.id, (*child).clone());
                    Self::push_pending(inner, &child, false);
                }
            }
        }
        if let Some(dest) = dest {
            self.signal(&dest.queue, dest.group.as_deref()).notify_one();
        }
        Ok(())
    }

    async fn rate_limit_exceeded(
        &self,
        queue: &QueueId,
        limit: &RateLimit,
    ) -> Result<bool, StoreError> {
        let now = now_ms();
        let interval = limit.interval_ms.max(1);
        let window = now - now % interval;
        let mut inner = self.lock_inner();
        let Some(qd) = inner.queues.get_mut(queue) else {
            return Ok(false);
        };
        qd.rate_windows.retain(|start, _| *start >= window);
        let count = qd.rate_windows.entry(window).or_insert(0);
        *count += 1;
        Ok(*count > limit.limit)
    }

    async fn lock_acquire(
        &self,
        resource: &str,
        holder: &str,
        ttl_ms: u64,
    ) -> Result<bool, StoreError> {
        let now = now_ms();
        let mut inner = self.lock_inner();
        match inner.locks.get(resource) {
            Some(entry) if entry.expires_at > now => Ok(false),
            _ => {
                inner.locks.insert(
                    resource.to_string(),
                    LockEntry {
                        holder: holder.to_string(),
                        expires_at: now + ttl_ms,
                    },
                );
                Ok(true)
            }
        }
    }

    async fn lock_extend(
        &self,
        resource: &str,
        holder: &str,
        ttl_ms: u64,
    ) -> Result<bool, StoreError> {
        let now = now_ms();
        let mut inner = self.lock_inner();
        match inner.locks.get_mut(resource) {
            Some(entry) if entry.expires_at > now && entry.holder == holder => {
                entry.expires_at = now + ttl_ms;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn lock_release(&self, resource: &str, holder: &str) -> Result<bool, StoreError> {
        let now = now_ms();
        let mut inner = self.lock_inner();
        match inner.locks.get(resource) {
            Some(entry) if entry.expires_at > now && entry.holder == holder => {
                inner.locks.remove(resource);
                Ok(true)
            }
            Some(entry) if entry.expires_at <= now => {
                // Lazy expiry cleanup; the release itself missed.
                inner.locks.remove(resource);
                Ok(false)
            }
            _ => Ok(false),
        }
    }
}
