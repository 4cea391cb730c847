//! Redis-backed store.
//!
//! Every multi-step transition is one server-side Lua script, created once
//! at startup; single-command transitions use the native atomic command.
//! Message status and state fields live under their own keys (record,
//! status string, state hash) so scripts mutate exactly the fields a
//! transition owns without re-encoding the record.
//!
//! Script reply codes: `1` applied, `0` precondition failed (not pending /
//! not mine / queue missing), `-1` entity missing. The unacknowledgement
//! script replies per-message branch codes: `1` requeued, `2` delayed,
//! `3` dead-lettered.

use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};
use tracing::warn;
use uuid::Uuid;

use crate::clock::now_ms;
use crate::config::{AckRetention, StoreConfig};
use crate::error::StoreError;
use crate::message::{Message, MessageState, MessageStatus, UnackReason};
use crate::queue::{QueueId, QueueProperties, QueueType, RateLimit};
use crate::store::keys::Keys;
use crate::store::traits::{
    AckOutcome, CheckoutOutcome, ConsumerInfo, DequeueHandle, DequeueTarget, PromoteTarget,
    QueueCounters, SchedulePromotion, Store, UnackOutcome,
};

// Priority scores pack `priority * 2^40 - seq` into one float: higher
// priority dominates, and within a priority an earlier insertion sequence
// yields a larger score, so ZPOPMAX preserves insertion order.

const PUBLISH_PENDING: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then return 0 end
redis.call('SET', KEYS[2], ARGV[1])
redis.call('SET', KEYS[3], 'pending')
redis.call('DEL', KEYS[4])
for i = 5, #ARGV, 2 do
  redis.call('HSET', KEYS[4], ARGV[i], ARGV[i + 1])
end
if ARGV[2] == 'priority' then
  local seq = redis.call('INCR', KEYS[7])
  redis.call('ZADD', KEYS[6], tonumber(ARGV[3]) * 1099511627776 - seq, ARGV[4])
else
  redis.call('LPUSH', KEYS[5], ARGV[4])
end
return 1
"#;

const PUBLISH_SCHEDULED: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then return 0 end
redis.call('SET', KEYS[2], ARGV[1])
redis.call('SET', KEYS[3], 'scheduled')
redis.call('DEL', KEYS[4])
for i = 4, #ARGV, 2 do
  redis.call('HSET', KEYS[4], ARGV[i], ARGV[i + 1])
end
redis.call('ZADD', KEYS[5], tonumber(ARGV[2]), ARGV[3])
return 1
"#;

const CHECKOUT: &str = r#"
local s = redis.call('GET', KEYS[1])
if not s then return -1 end
if s ~= 'pending' then return 0 end
redis.call('SET', KEYS[1], 'processing')
redis.call('HSET', KEYS[2], 'processing_started_at', ARGV[1])
return 1
"#;

const ACKNOWLEDGE: &str = r#"
local removed = redis.call('LREM', KEYS[1], 1, ARGV[1])
if removed == 0 then return -1 end
redis.call('HINCRBY', KEYS[6], 'acknowledged', 1)
if ARGV[3] == '1' then
  redis.call('SET', KEYS[3], 'acknowledged')
  redis.call('HSET', KEYS[4], 'acknowledged_at', ARGV[2])
  redis.call('LPUSH', KEYS[5], ARGV[1])
  if ARGV[4] ~= '' then
    local cap = tonumber(ARGV[4])
    local evicted = redis.call('LRANGE', KEYS[5], cap, -1)
    redis.call('LTRIM', KEYS[5], 0, cap - 1)
    for _, eid in ipairs(evicted) do
      redis.call('DEL', ARGV[6]..eid, ARGV[6]..eid..':status', ARGV[6]..eid..':state')
    end
  end
  if ARGV[5] ~= '' then redis.call('PEXPIRE', KEYS[5], tonumber(ARGV[5])) end
else
  redis.call('DEL', KEYS[2], KEYS[3], KEYS[4])
end
return 1
"#;

const UNACKNOWLEDGE: &str = r#"
local out = {}
local now = tonumber(ARGV[1])
local reason = ARGV[2]
local prefix = ARGV[5]
for i = 6, #ARGV, 4 do
  local id = ARGV[i]
  local threshold = tonumber(ARGV[i + 1])
  local delay = tonumber(ARGV[i + 2])
  local prio = tonumber(ARGV[i + 3])
  local removed = redis.call('LREM', KEYS[1], 1, id)
  if removed > 0 then
    local skey = prefix..id..':state'
    local stkey = prefix..id..':status'
    local attempts = redis.call('HINCRBY', skey, 'attempts', 1)
    local ua = redis.call('HGET', skey, 'unacknowledged_at')
    if (not ua) or ua == 'null' then redis.call('HSET', skey, 'unacknowledged_at', now) end
    redis.call('HSET', skey, 'last_unacknowledged_at', now)
    local code
    if reason == 'ttl-expired' or attempts >= threshold then
      redis.call('SET', stkey, 'dead-lettered')
      redis.call('HSET', skey, 'dead_lettered_at', now)
      if reason == 'ttl-expired' then redis.call('HSET', skey, 'expired', 'true') end
      redis.call('LPUSH', KEYS[5], id)
      redis.call('HINCRBY', KEYS[6], 'dead_lettered', 1)
      code = 3
    elseif delay > 0 then
      redis.call('SET', stkey, 'scheduled')
      local sa = redis.call('HGET', skey, 'scheduled_at')
      if (not sa) or sa == 'null' then redis.call('HSET', skey, 'scheduled_at', now) end
      redis.call('HSET', skey, 'last_retried_at', now, 'last_scheduled_at', now)
      redis.call('HINCRBY', skey, 'scheduled_count', 1)
      redis.call('ZADD', KEYS[4], now + delay, id)
      code = 2
    else
      redis.call('SET', stkey, 'pending')
      local ra = redis.call('HGET', skey, 'requeued_at')
      if (not ra) or ra == 'null' then redis.call('HSET', skey, 'requeued_at', now) end
      redis.call('HSET', skey, 'last_requeued_at', now)
      redis.call('HINCRBY', skey, 'requeue_count', 1)
      if ARGV[3] == 'priority' then
        local seq = redis.call('INCR', KEYS[7])
        redis.call('ZADD', KEYS[3], prio * 1099511627776 - seq, id)
      elseif ARGV[4] == 'left' then
        redis.call('LPUSH', KEYS[2], id)
      else
        redis.call('RPUSH', KEYS[2], id)
      end
      code = 1
    end
    table.insert(out, id)
    table.insert(out, code)
  end
end
return out
"#;

const POP_PRIORITY: &str = r#"
local popped = redis.call('ZPOPMAX', KEYS[1])
if #popped == 0 then return false end
redis.call('LPUSH', KEYS[2], popped[1])
return popped[1]
"#;

const PROMOTE: &str = r#"
local orig = ARGV[1]
redis.call('ZREM', KEYS[1], orig)
if ARGV[2] ~= '' then redis.call('ZADD', KEYS[1], tonumber(ARGV[2]), orig) end
local prefix = ARGV[6]
local okey = prefix..orig
local n = tonumber(ARGV[9])
if ARGV[3] == 'child-final' then
  redis.call('DEL', okey, okey..':status', okey..':state')
else
  for i = 10, 9 + n, 2 do
    redis.call('HSET', okey..':state', ARGV[i], ARGV[i + 1])
  end
  if ARGV[3] == 'original' then redis.call('SET', okey..':status', 'pending') end
end
local target = ARGV[7]
if ARGV[3] ~= 'original' then
  local tkey = prefix..target
  redis.call('SET', tkey, ARGV[8])
  redis.call('SET', tkey..':status', 'pending')
  local m = tonumber(ARGV[10 + n])
  for i = 11 + n, 10 + n + m, 2 do
    redis.call('HSET', tkey..':state', ARGV[i], ARGV[i + 1])
  end
end
if ARGV[4] == 'priority' then
  local seq = redis.call('INCR', KEYS[4])
  redis.call('ZADD', KEYS[3], tonumber(ARGV[5]) * 1099511627776 - seq, target)
else
  redis.call('LPUSH', KEYS[2], target)
end
return 1
"#;

const REGISTER_CONSUMER: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then return 0 end
redis.call('HSET', KEYS[2], ARGV[1], ARGV[2])
return 1
"#;

const RATE_PROBE: &str = r#"
local c = redis.call('INCR', KEYS[1])
if c == 1 then redis.call('PEXPIRE', KEYS[1], tonumber(ARGV[1]) * 2) end
return c
"#;

const COUNTERS: &str = r#"
local pending = redis.call('LLEN', KEYS[1]) + redis.call('ZCARD', KEYS[2])
for _, g in ipairs(redis.call('SMEMBERS', KEYS[3])) do
  pending = pending + redis.call('LLEN', ARGV[1]..':groups:'..g..':pending')
  pending = pending + redis.call('ZCARD', ARGV[1]..':groups:'..g..':priority')
end
local processing = 0
for _, cid in ipairs(redis.call('HKEYS', KEYS[4])) do
  processing = processing + redis.call('LLEN', ARGV[2]..cid)
end
local acked = tonumber(redis.call('HGET', KEYS[5], 'acknowledged') or '0') or 0
local dead = tonumber(redis.call('HGET', KEYS[5], 'dead_lettered') or '0') or 0
return {pending, processing, acked, dead, redis.call('ZCARD', KEYS[6])}
"#;

const LOCK_EXTEND: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  redis.call('PEXPIRE', KEYS[1], tonumber(ARGV[2]))
  return 1
end
return 0
"#;

const LOCK_RELEASE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// The fixed set of named atomic operations, compiled once at startup.
struct Scripts {
    publish_pending: Script,
    publish_scheduled: Script,
    checkout: Script,
    acknowledge: Script,
    unacknowledge: Script,
    pop_priority: Script,
    promote: Script,
    register_consumer: Script,
    rate_probe: Script,
    counters: Script,
    lock_extend: Script,
    lock_release: Script,
}

impl Scripts {
    fn new() -> Self {
        Self {
            publish_pending: Script::new(PUBLISH_PENDING),
            publish_scheduled: Script::new(PUBLISH_SCHEDULED),
            checkout: Script::new(CHECKOUT),
            acknowledge: Script::new(ACKNOWLEDGE),
            unacknowledge: Script::new(UNACKNOWLEDGE),
            pop_priority: Script::new(POP_PRIORITY),
            promote: Script::new(PROMOTE),
            register_consumer: Script::new(REGISTER_CONSUMER),
            rate_probe: Script::new(RATE_PROBE),
            counters: Script::new(COUNTERS),
            lock_extend: Script::new(LOCK_EXTEND),
            lock_release: Script::new(LOCK_RELEASE),
        }
    }
}

/// Flatten a state ledger into hash field/value pairs. Values are their
/// JSON encodings, which keeps integer fields HINCRBY-compatible.
fn state_pairs(state: &MessageState) -> Result<Vec<(String, String)>, StoreError> {
    let value = serde_json::to_value(state)?;
    let obj = value
        .as_object()
        .ok_or_else(|| StoreError::CorruptReply("state did not serialize to an object".into()))?;
    Ok(obj.iter().map(|(k, v)| (k.clone(), v.to_string())).collect())
}

fn state_from_map(map: HashMap<String, String>) -> Result<MessageState, StoreError> {
    let mut obj = serde_json::Map::new();
    for (k, v) in map {
        let value = serde_json::from_str(&v)
            .map_err(|e| StoreError::CorruptReply(format!("state field {k}: {e}")))?;
        obj.insert(k, value);
    }
    Ok(serde_json::from_value(serde_json::Value::Object(obj))?)
}

fn parse_id(raw: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(raw).map_err(|e| StoreError::CorruptReply(format!("bad message id: {e}")))
}

/// Production store backend: a client of an external Redis.
pub struct RedisStore {
    client: redis::Client,
    conn: MultiplexedConnection,
    keys: Keys,
    scripts: Scripts,
}

impl RedisStore {
    /// Connect and compile the script set.
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let client = redis::Client::open(config.url.as_str())?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self {
            client,
            conn,
            keys: Keys::new(config.namespace.clone()),
            scripts: Scripts::new(),
        })
    }

    async fn read_message(
        &self,
        namespace: &str,
        id: Uuid,
    ) -> Result<Option<Message>, StoreError> {
        let env_key = self.keys.message(namespace, id);
        let status_key = format!("{env_key}:status");
        let state_key = format!("{env_key}:state");
        let mut conn = self.conn.clone();
        let (envelope, status, state): (Option<String>, Option<String>, HashMap<String, String>) =
            redis::pipe()
                .atomic()
                .get(&env_key)
                .get(&status_key)
                .hgetall(&state_key)
                .query_async(&mut conn)
                .await?;
        let Some(envelope) = envelope else {
            return Ok(None);
        };
        let mut message: Message = serde_json::from_str(&envelope)?;
        if let Some(status) = status {
            message.status = MessageStatus::from_str(&status)
                .map_err(StoreError::CorruptReply)?;
        }
        if !state.is_empty() {
            message.state = state_from_map(state)?;
        }
        Ok(Some(message))
    }
}

struct RedisDequeueHandle {
    conn: MultiplexedConnection,
    keys: Keys,
    pop_priority: Script,
}

impl RedisDequeueHandle {
    fn pop_keys(&self, target: &DequeueTarget) -> (String, String) {
        let pending = match target.queue_type {
            QueueType::Priority => self.keys.priority(&target.queue, target.group.as_deref()),
            _ => self.keys.pending(&target.queue, target.group.as_deref()),
        };
        let processing = self.keys.processing(&target.queue, target.consumer_id);
        (pending, processing)
    }
}

#[async_trait]
impl DequeueHandle for RedisDequeueHandle {
    async fn pop(&mut self, target: &DequeueTarget) -> Result<Option<Uuid>, StoreError> {
        let (pending, processing) = self.pop_keys(target);
        let raw: Option<String> = match target.queue_type {
            QueueType::Priority => {
                self.pop_priority
                    .key(&pending)
                    .key(&processing)
                    .invoke_async(&mut self.conn)
                    .await?
            }
            QueueType::Fifo => {
                redis::cmd("LMOVE")
                    .arg(&pending)
                    .arg(&processing)
                    .arg("RIGHT")
                    .arg("LEFT")
                    .query_async(&mut self.conn)
                    .await?
            }
            QueueType::Lifo => {
                redis::cmd("LMOVE")
                    .arg(&pending)
                    .arg(&processing)
                    .arg("LEFT")
                    .arg("LEFT")
                    .query_async(&mut self.conn)
                    .await?
            }
        };
        raw.map(|r| parse_id(&r)).transpose()
    }

    async fn pop_blocking(&mut self, target: &DequeueTarget) -> Result<Option<Uuid>, StoreError> {
        let (pending, processing) = self.pop_keys(target);
        let from = match target.queue_type {
            QueueType::Lifo => "LEFT",
            _ => "RIGHT",
        };
        let raw: Option<String> = redis::cmd("BLMOVE")
            .arg(&pending)
            .arg(&processing)
            .arg(from)
            .arg("LEFT")
            .arg(0)
            .query_async(&mut self.conn)
            .await?;
        raw.map(|r| parse_id(&r)).transpose()
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn dequeue_handle(&self, exclusive: bool) -> Result<Box<dyn DequeueHandle>, StoreError> {
        // Blocking pops monopolize their connection for the duration of the
        // wait, so exclusive handles get a private one.
        let conn = if exclusive {
            self.client.get_multiplexed_async_connection().await?
        } else {
            self.conn.clone()
        };
        Ok(Box::new(RedisDequeueHandle {
            conn,
            keys: self.keys.clone(),
            pop_priority: Script::new(POP_PRIORITY),
        }))
    }

    async fn create_queue(
        &self,
        queue: &QueueId,
        properties: &QueueProperties,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(properties)?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.keys.properties(queue))
            .arg(json)
            .arg("NX")
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn queue_properties(
        &self,
        queue: &QueueId,
    ) -> Result<Option<QueueProperties>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(self.keys.properties(queue)).await?;
        raw.map(|r| serde_json::from_str(&r).map_err(StoreError::from))
            .transpose()
    }

    async fn register_consumer(
        &self,
        queue: &QueueId,
        consumer_id: Uuid,
        info: &ConsumerInfo,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let reply: i64 = self
            .scripts
            .register_consumer
            .key(self.keys.properties(queue))
            .key(self.keys.consumers(queue))
            .arg(consumer_id.to_string())
            .arg(serde_json::to_string(info)?)
            .invoke_async(&mut conn)
            .await?;
        Ok(reply == 1)
    }

    async fn deregister_consumer(
        &self,
        queue: &QueueId,
        consumer_id: Uuid,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .hdel(self.keys.consumers(queue), consumer_id.to_string())
            .await?;
        Ok(())
    }

    async fn ensure_group(&self, queue: &QueueId, group: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.sadd(self.keys.groups(queue), group).await?;
        Ok(())
    }

    async fn queue_counters(&self, queue: &QueueId) -> Result<QueueCounters, StoreError> {
        let mut conn = self.conn.clone();
        let queue_root = self.keys.queue_root(queue);
        let (pending, processing, acknowledged, dead_lettered, scheduled): (
            u64,
            u64,
            u64,
            u64,
            u64,
        ) = self
            .scripts
            .counters
            .key(self.keys.pending(queue, None))
            .key(self.keys.priority(queue, None))
            .key(self.keys.groups(queue))
            .key(self.keys.consumers(queue))
            .key(self.keys.counters(queue))
            .key(self.keys.scheduled(queue))
            .arg(&queue_root)
            .arg(format!("{queue_root}:processing:"))
            .invoke_async(&mut conn)
            .await?;
        Ok(QueueCounters {
            pending,
            processing,
            acknowledged,
            dead_lettered,
            scheduled,
        })
    }

    async fn get_message(&self, namespace: &str, id: Uuid) -> Result<Option<Message>, StoreError> {
        self.read_message(namespace, id).await
    }

    async fn publish_pending(&self, message: &Message) -> Result<bool, StoreError> {
        let Some(dest) = message.destination() else {
            return Ok(false);
        };
        let env_key = self.keys.message(&dest.queue.namespace, message.id);
        let queue_type = message_queue_type(self, &dest.queue).await?;
        let mut conn = self.conn.clone();
        let mut inv = self.scripts.publish_pending.prepare_invoke();
        inv.key(self.keys.properties(&dest.queue))
            .key(&env_key)
            .key(format!("{env_key}:status"))
            .key(format!("{env_key}:state"))
            .key(self.keys.pending(&dest.queue, dest.group.as_deref()))
            .key(self.keys.priority(&dest.queue, dest.group.as_deref()))
            .key(self.keys.seq(&dest.queue))
            .arg(serde_json::to_string(message)?)
            .arg(match queue_type {
                QueueType::Priority => "priority",
                _ => "list",
            })
            .arg(u32::from(message.priority.unwrap_or(0)))
            .arg(message.id.to_string());
        for (field, value) in state_pairs(&message.state)? {
            inv.arg(field).arg(value);
        }
        let reply: i64 = inv.invoke_async(&mut conn).await?;
        Ok(reply == 1)
    }

    async fn publish_scheduled(
        &self,
        message: &Message,
        fire_at_ms: u64,
    ) -> Result<bool, StoreError> {
        let Some(dest) = message.destination() else {
            return Ok(false);
        };
        let env_key = self.keys.message(&dest.queue.namespace, message.id);
        let mut conn = self.conn.clone();
        let mut inv = self.scripts.publish_scheduled.prepare_invoke();
        inv.key(self.keys.properties(&dest.queue))
            .key(&env_key)
            .key(format!("{env_key}:status"))
            .key(format!("{env_key}:state"))
            .key(self.keys.scheduled(&dest.queue))
            .arg(serde_json::to_string(message)?)
            .arg(fire_at_ms)
            .arg(message.id.to_string());
        for (field, value) in state_pairs(&message.state)? {
            inv.arg(field).arg(value);
        }
        let reply: i64 = inv.invoke_async(&mut conn).await?;
        Ok(reply == 1)
    }

    async fn checkout(
        &self,
        queue: &QueueId,
        _consumer_id: Uuid,
        id: Uuid,
    ) -> Result<CheckoutOutcome, StoreError> {
        let env_key = self.keys.message(&queue.namespace, id);
        let mut conn = self.conn.clone();
        let reply: i64 = self
            .scripts
            .checkout
            .key(format!("{env_key}:status"))
            .key(format!("{env_key}:state"))
            .arg(now_ms())
            .invoke_async(&mut conn)
            .await?;
        match reply {
            1 => match self.read_message(&queue.namespace, id).await? {
                Some(message) => Ok(CheckoutOutcome::Checked(Box::new(message))),
                None => Ok(CheckoutOutcome::NotFound),
            },
            0 => Ok(CheckoutOutcome::NotPending),
            -1 => Ok(CheckoutOutcome::NotFound),
            other => Err(StoreError::CorruptReply(format!(
                "checkout replied {other}"
            ))),
        }
    }

    async fn acknowledge(
        &self,
        queue: &QueueId,
        consumer_id: Uuid,
        id: Uuid,
        retention: &AckRetention,
    ) -> Result<AckOutcome, StoreError> {
        let env_key = self.keys.message(&queue.namespace, id);
        let mut conn = self.conn.clone();
        let reply: i64 = self
            .scripts
            .acknowledge
            .key(self.keys.processing(queue, consumer_id))
            .key(&env_key)
            .key(format!("{env_key}:status"))
            .key(format!("{env_key}:state"))
            .key(self.keys.acknowledged(queue))
            .key(self.keys.counters(queue))
            .arg(id.to_string())
            .arg(now_ms())
            .arg(if retention.store { "1" } else { "0" })
            .arg(retention.queue_size.map(|v| v.to_string()).unwrap_or_default())
            .arg(retention.expire_ms.map(|v| v.to_string()).unwrap_or_default())
            .arg(self.keys.message_prefix(&queue.namespace))
            .invoke_async(&mut conn)
            .await?;
        match reply {
            1 => Ok(AckOutcome::Acknowledged),
            -1 => Ok(AckOutcome::NotInProcessing),
            other => Err(StoreError::CorruptReply(format!(
                "acknowledge replied {other}"
            ))),
        }
    }

    async fn resolve_unacknowledged(
        &self,
        queue: &QueueId,
        consumer_id: Uuid,
        ids: &[Uuid],
        reason: UnackReason,
    ) -> Result<Vec<(Uuid, UnackOutcome)>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let properties = self.queue_properties(queue).await?;
        let queue_type = properties
            .map(|p| p.queue_type)
            .unwrap_or(QueueType::Fifo);
        // The requeue branch re-inserts at the pop end so a retried message
        // is next in line. FIFO pops the right, LIFO the left.
        let requeue_dir = match queue_type {
            QueueType::Lifo => "left",
            _ => "right",
        };

        // Per-message retry policy comes from the immutable envelope; the
        // atomic decision input (attempts) is incremented inside the script.
        let mut policies = Vec::with_capacity(ids.len());
        let mut group = None;
        for &id in ids {
            match self.read_message(&queue.namespace, id).await? {
                Some(msg) => {
                    group = msg.destination().and_then(|d| d.group.clone());
                    policies.push((
                        id,
                        msg.retry_threshold,
                        msg.retry_delay_ms,
                        u32::from(msg.priority.unwrap_or(0)),
                    ));
                }
                None => {
                    warn!(%queue, message_id = %id, "unack skipped: record missing");
                }
            }
        }

        let mut conn = self.conn.clone();
        let mut inv = self.scripts.unacknowledge.prepare_invoke();
        inv.key(self.keys.processing(queue, consumer_id))
            .key(self.keys.pending(queue, group.as_deref()))
            .key(self.keys.priority(queue, group.as_deref()))
            .key(self.keys.scheduled(queue))
            .key(self.keys.dead_lettered(queue))
            .key(self.keys.counters(queue))
            .key(self.keys.seq(queue))
            .arg(now_ms())
            .arg(reason.as_str())
            .arg(match queue_type {
                QueueType::Priority => "priority",
                _ => "list",
            })
            .arg(requeue_dir)
            .arg(self.keys.message_prefix(&queue.namespace));
        for (id, threshold, delay, priority) in &policies {
            inv.arg(id.to_string()).arg(threshold).arg(delay).arg(priority);
        }
        let raw: Vec<redis::Value> = inv.invoke_async(&mut conn).await?;

        let mut outcomes = Vec::new();
        for pair in raw.chunks(2) {
            if pair.len() != 2 {
                break;
            }
            let id: String = redis::from_redis_value(&pair[0])?;
            let code: i64 = redis::from_redis_value(&pair[1])?;
            let outcome = match code {
                1 => UnackOutcome::Requeued,
                2 => UnackOutcome::Delayed,
                3 => UnackOutcome::DeadLettered,
                other => {
                    return Err(StoreError::CorruptReply(format!(
                        "unacknowledge replied {other}"
                    )))
                }
            };
            outcomes.push((parse_id(&id)?, outcome));
        }
        Ok(outcomes)
    }

    async fn processing_ids(
        &self,
        queue: &QueueId,
        consumer_id: Uuid,
    ) -> Result<Vec<Uuid>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = conn
            .lrange(self.keys.processing(queue, consumer_id), 0, -1)
            .await?;
        raw.iter().map(|r| parse_id(r)).collect()
    }

    async fn due_scheduled(
        &self,
        queue: &QueueId,
        now_ms: u64,
        limit: usize,
    ) -> Result<Vec<Uuid>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.keys.scheduled(queue))
            .arg("-inf")
            .arg(now_ms)
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async(&mut conn)
            .await?;
        raw.iter().map(|r| parse_id(r)).collect()
    }

    async fn promote_scheduled(
        &self,
        queue: &QueueId,
        promotion: SchedulePromotion,
    ) -> Result<(), StoreError> {
        let properties = self.queue_properties(queue).await?;
        let queue_type = properties
            .map(|p| p.queue_type)
            .unwrap_or(QueueType::Fifo);
        let group = promotion
            .original
            .destination()
            .and_then(|d| d.group.clone());

        let (mode, target_id, target_envelope, target_priority, child_pairs) =
            match &promotion.target {
                PromoteTarget::Original => (
                    "original",
                    promotion.original.id,
                    String::new(),
                    u32::from(promotion.original.priority.unwrap_or(0)),
                    Vec::new(),
                ),
                PromoteTarget::Child(child) => (
                    if promotion.next_fire_at.is_some() {
                        "child"
                    } else {
                        "child-final"
                    },
                    child.id,
                    serde_json::to_string(child.as_ref())?,
                    u32::from(child.priority.unwrap_or(0)),
                    state_pairs(&child.state)?,
                ),
            };
        let orig_pairs = state_pairs(&promotion.original.state)?;

        let mut conn = self.conn.clone();
        let mut inv = self.scripts.promote.prepare_invoke();
        inv.key(self.keys.scheduled(queue))
            .key(self.keys.pending(queue, group.as_deref()))
            .key(self.keys.priority(queue, group.as_deref()))
            .key(self.keys.seq(queue))
            .arg(promotion.original.id.to_string())
            .arg(
                promotion
                    .next_fire_at
                    .map(|v| v.to_string())
                    .unwrap_or_default(),
            )
            .arg(mode)
            .arg(match queue_type {
                QueueType::Priority => "priority",
                _ => "list",
            })
            .arg(target_priority)
            .arg(self.keys.message_prefix(&queue.namespace))
            .arg(target_id.to_string())
            .arg(target_envelope)
            .arg(orig_pairs.len() * 2);
        for (field, value) in &orig_pairs {
            inv.arg(field).arg(value);
        }
        inv.arg(child_pairs.len() * 2);
        for (field, value) in &child_pairs {
            inv.arg(field).arg(value);
        }
        let _: i64 = inv.invoke_async(&mut conn).await?;
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
        let mut conn = self.conn.clone();
        let count: u32 = self
            .scripts
            .rate_probe
            .key(self.keys.rate_window(queue, window))
            .arg(interval)
            .invoke_async(&mut conn)
            .await?;
        Ok(count > limit.limit)
    }

    async fn lock_acquire(
        &self,
        resource: &str,
        holder: &str,
        ttl_ms: u64,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.keys.lock(resource))
            .arg(holder)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn lock_extend(
        &self,
        resource: &str,
        holder: &str,
        ttl_ms: u64,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let reply: i64 = self
            .scripts
            .lock_extend
            .key(self.keys.lock(resource))
            .arg(holder)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(reply == 1)
    }

    async fn lock_release(&self, resource: &str, holder: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let reply: i64 = self
            .scripts
            .lock_release
            .key(self.keys.lock(resource))
            .arg(holder)
            .invoke_async(&mut conn)
            .await?;
        Ok(reply == 1)
    }
}

/// Queue type lookup used by the publish path to pick the pending structure.
async fn message_queue_type(
    store: &RedisStore,
    queue: &QueueId,
) -> Result<QueueType, StoreError> {
    Ok(store
        .queue_properties(queue)
        .await?
        .map(|p| p.queue_type)
        .unwrap_or(QueueType::Fifo))
}
