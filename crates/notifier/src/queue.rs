//! At-least-once work queue with delay-until scheduling.
//!
//! Each (channel, queue name) pair is its own queue so a slow channel never
//! holds up another. Entries are task ids scored by the instant they become
//! ready. Popping moves an entry into an in-flight set with a visibility
//! deadline; entries that are never acknowledged are moved back to ready by
//! `requeue_expired`.
//!
//! Redis layout per queue:
//! - `courier:queue:{channel}:{queue}` ZSET, member = task id, score = ready-at ms
//! - `courier:queue:{channel}:{queue}:inflight` ZSET, score = visibility deadline ms

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use uuid::Uuid;

use courier_common::clock::Clock;
use courier_common::error::StoreError;
use courier_common::types::{Channel, Priority};

const POP_SCRIPT: &str = r#"
local items = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 1)
if #items == 0 then
    return false
end
redis.call('ZREM', KEYS[1], items[1])
redis.call('ZADD', KEYS[2], ARGV[2], items[1])
return items[1]
"#;

const REQUEUE_SCRIPT: &str = r#"
local items = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1])
for _, member in ipairs(items) do
    redis.call('ZREM', KEYS[2], member)
    redis.call('ZADD', KEYS[1], ARGV[1], member)
end
return #items
"#;

/// A popped queue entry. Acknowledge it once the task has been handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub task_id: Uuid,
    pub channel: Channel,
    pub queue_name: String,
}

#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Schedule `task_id` to become ready at `ready_at`. Re-pushing a queued
    /// task only moves its ready time.
    async fn push(
        &self,
        channel: Channel,
        queue_name: &str,
        task_id: Uuid,
        ready_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Pop the first ready entry, trying `queue_names` in order.
    async fn pop(
        &self,
        channel: Channel,
        queue_names: &[&str],
    ) -> Result<Option<QueueEntry>, StoreError>;

    async fn ack(&self, entry: &QueueEntry) -> Result<(), StoreError>;

    /// Return unacknowledged entries past their visibility deadline to ready.
    async fn requeue_expired(&self) -> Result<usize, StoreError>;
}

/// Queue names in the order workers drain them.
pub fn dequeue_order() -> Vec<&'static str> {
    Priority::DEQUEUE_ORDER
        .iter()
        .map(|p| p.queue_name())
        .collect()
}

fn queue_key(channel: Channel, queue_name: &str) -> String {
    format!("courier:queue:{}:{}", channel, queue_name)
}

fn inflight_key(channel: Channel, queue_name: &str) -> String {
    format!("courier:queue:{}:{}:inflight", channel, queue_name)
}

/// Redis sorted-set queue.
#[derive(Clone)]
pub struct RedisWorkQueue {
    redis: ConnectionManager,
    clock: Arc<dyn Clock>,
    visibility_timeout: Duration,
    pop_script: redis::Script,
    requeue_script: redis::Script,
}

impl RedisWorkQueue {
    pub fn new(redis: ConnectionManager, clock: Arc<dyn Clock>, visibility_timeout: Duration) -> Self {
        Self {
            redis,
            clock,
            visibility_timeout,
            pop_script: redis::Script::new(POP_SCRIPT),
            requeue_script: redis::Script::new(REQUEUE_SCRIPT),
        }
    }
}

#[async_trait]
impl WorkQueue for RedisWorkQueue {
    async fn push(
        &self,
        channel: Channel,
        queue_name: &str,
        task_id: Uuid,
        ready_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        redis::cmd("ZADD")
            .arg(queue_key(channel, queue_name))
            .arg(ready_at.timestamp_millis())
            .arg(task_id.to_string())
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn pop(
        &self,
        channel: Channel,
        queue_names: &[&str],
    ) -> Result<Option<QueueEntry>, StoreError> {
        let mut conn = self.redis.clone();
        let now = self.clock.now();
        let deadline = now
            + chrono::Duration::from_std(self.visibility_timeout).unwrap_or(chrono::Duration::MAX);

        for queue_name in queue_names {
            let member: Option<String> = self
                .pop_script
                .key(queue_key(channel, queue_name))
                .key(inflight_key(channel, queue_name))
                .arg(now.timestamp_millis())
                .arg(deadline.timestamp_millis())
                .invoke_async(&mut conn)
                .await?;

            if let Some(member) = member {
                match Uuid::parse_str(&member) {
                    Ok(task_id) => {
                        return Ok(Some(QueueEntry {
                            task_id,
                            channel,
                            queue_name: queue_name.to_string(),
                        }));
                    }
                    Err(e) => {
                        // An unparsable member can never be acked
                        tracing::error!(
                            queue = %queue_key(channel, queue_name),
                            member = %member,
                            error = %e,
                            "Dropping unparsable queue member"
                        );
                        redis::cmd("ZREM")
                            .arg(inflight_key(channel, queue_name))
                            .arg(&member)
                            .query_async::<()>(&mut conn)
                            .await?;
                    }
                }
            }
        }
        Ok(None)
    }

    async fn ack(&self, entry: &QueueEntry) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        redis::cmd("ZREM")
            .arg(inflight_key(entry.channel, &entry.queue_name))
            .arg(entry.task_id.to_string())
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn requeue_expired(&self) -> Result<usize, StoreError> {
        let mut conn = self.redis.clone();
        let now = self.clock.now().timestamp_millis();
        let mut moved = 0usize;

        for channel in Channel::ALL {
            for queue_name in dequeue_order() {
                let n: i64 = self
                    .requeue_script
                    .key(queue_key(channel, queue_name))
                    .key(inflight_key(channel, queue_name))
                    .arg(now)
                    .invoke_async(&mut conn)
                    .await?;
                moved += n.max(0) as usize;
            }
        }

        if moved > 0 {
            tracing::warn!(moved, "Re-queued entries past their visibility timeout");
        }
        Ok(moved)
    }
}

#[derive(Default)]
struct MemoryQueues {
    ready: HashMap<String, HashMap<Uuid, DateTime<Utc>>>,
    inflight: HashMap<String, HashMap<Uuid, DateTime<Utc>>>,
}

/// Process-local queue with the same semantics as the Redis queue.
pub struct InMemoryWorkQueue {
    clock: Arc<dyn Clock>,
    visibility_timeout: Duration,
    queues: Mutex<MemoryQueues>,
}

impl InMemoryWorkQueue {
    pub fn new(clock: Arc<dyn Clock>, visibility_timeout: Duration) -> Self {
        Self {
            clock,
            visibility_timeout,
            queues: Mutex::new(MemoryQueues::default()),
        }
    }

    /// Ready entries (due or not) in one queue.
    pub fn ready_len(&self, channel: Channel, queue_name: &str) -> usize {
        let queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        queues
            .ready
            .get(&queue_key(channel, queue_name))
            .map_or(0, |q| q.len())
    }

    /// Ready time of a queued task, if it is queued.
    pub fn ready_at(&self, channel: Channel, queue_name: &str, task_id: Uuid) -> Option<DateTime<Utc>> {
        let queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        queues
            .ready
            .get(&queue_key(channel, queue_name))
            .and_then(|q| q.get(&task_id).copied())
    }
}

#[async_trait]
impl WorkQueue for InMemoryWorkQueue {
    async fn push(
        &self,
        channel: Channel,
        queue_name: &str,
        task_id: Uuid,
        ready_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        queues
            .ready
            .entry(queue_key(channel, queue_name))
            .or_default()
            .insert(task_id, ready_at);
        Ok(())
    }

    async fn pop(
        &self,
        channel: Channel,
        queue_names: &[&str],
    ) -> Result<Option<QueueEntry>, StoreError> {
        let now = self.clock.now();
        let deadline = now
            + chrono::Duration::from_std(self.visibility_timeout).unwrap_or(chrono::Duration::MAX);
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());

        for queue_name in queue_names {
            let key = queue_key(channel, queue_name);
            let Some(ready) = queues.ready.get_mut(&key) else {
                continue;
            };
            let next = ready
                .iter()
                .filter(|(_, at)| **at <= now)
                .min_by_key(|(id, at)| (**at, **id))
                .map(|(id, _)| *id);

            if let Some(task_id) = next {
                ready.remove(&task_id);
                queues.inflight.entry(key).or_default().insert(task_id, deadline);
                return Ok(Some(QueueEntry {
                    task_id,
                    channel,
                    queue_name: queue_name.to_string(),
                }));
            }
        }
        Ok(None)
    }

    async fn ack(&self, entry: &QueueEntry) -> Result<(), StoreError> {
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(inflight) = queues
            .inflight
            .get_mut(&queue_key(entry.channel, &entry.queue_name))
        {
            inflight.remove(&entry.task_id);
        }
        Ok(())
    }

    async fn requeue_expired(&self) -> Result<usize, StoreError> {
        let now = self.clock.now();
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        let MemoryQueues { ready, inflight } = &mut *queues;
        let mut moved = 0;

        for (key, entries) in inflight.iter_mut() {
            let expired: Vec<Uuid> = entries
                .iter()
                .filter(|(_, deadline)| **deadline <= now)
                .map(|(id, _)| *id)
                .collect();
            for id in expired {
                entries.remove(&id);
                ready.entry(key.clone()).or_default().insert(id, now);
                moved += 1;
            }
        }
        Ok(moved)
    }
}
