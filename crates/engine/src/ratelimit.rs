//! Fixed-window send limits per tenant and channel.
//!
//! Redis keeps one counter per window (`INCR` + `PEXPIRE` on first hit, run as
//! a single script). A call over the limit reports how long until the window
//! resets so the caller can defer instead of failing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use uuid::Uuid;

use courier_common::clock::Clock;
use courier_common::error::StoreError;
use courier_common::types::{Channel, RateLimit};

const INCR_SCRIPT: &str = r#"
local n = redis.call('INCR', KEYS[1])
if n == 1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return {n, redis.call('PTTL', KEYS[1])}
"#;

#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Count one send. `Ok(None)` when allowed, `Ok(Some(wait))` when over the limit.
    async fn acquire(&self, key: &str, limit: RateLimit) -> Result<Option<Duration>, StoreError>;
}

pub fn rate_limit_key(tenant_id: Uuid, channel: Channel) -> String {
    format!("courier:ratelimit:{}:{}", tenant_id, channel)
}

#[derive(Clone)]
pub struct RedisRateLimiter {
    redis: ConnectionManager,
    script: redis::Script,
}

impl RedisRateLimiter {
    pub fn new(redis: ConnectionManager) -> Self {
        Self {
            redis,
            script: redis::Script::new(INCR_SCRIPT),
        }
    }
}

#[async_trait]
impl RateLimiter for RedisRateLimiter {
    async fn acquire(&self, key: &str, limit: RateLimit) -> Result<Option<Duration>, StoreError> {
        let mut conn = self.redis.clone();
        let window_ms = limit.window_secs.saturating_mul(1_000);
        let (count, ttl_ms): (u64, i64) = self
            .script
            .key(key)
            .arg(window_ms)
            .invoke_async(&mut conn)
            .await?;

        if count <= limit.max as u64 {
            Ok(None)
        } else {
            let wait = if ttl_ms > 0 { ttl_ms as u64 } else { window_ms };
            Ok(Some(Duration::from_millis(wait)))
        }
    }
}

/// Process-local limiter driven by an explicit clock.
pub struct InMemoryRateLimiter {
    clock: Arc<dyn Clock>,
    windows: Mutex<HashMap<String, (DateTime<Utc>, u32)>>,
}

impl InMemoryRateLimiter {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            windows: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl RateLimiter for InMemoryRateLimiter {
    async fn acquire(&self, key: &str, limit: RateLimit) -> Result<Option<Duration>, StoreError> {
        let now = self.clock.now();
        let window = chrono::Duration::seconds(limit.window_secs as i64);
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());

        let entry = windows.entry(key.to_string()).or_insert((now, 0));
        if now >= entry.0 + window {
            *entry = (now, 0);
        }
        entry.1 += 1;

        if entry.1 <= limit.max {
            Ok(None)
        } else {
            let wait = (entry.0 + window - now).to_std().unwrap_or_default();
            Ok(Some(wait))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_common::clock::ManualClock;

    #[tokio::test]
    async fn test_limit_then_reset() {
        let clock = ManualClock::default();
        let limiter = InMemoryRateLimiter::new(Arc::new(clock.clone()));
        let limit = RateLimit {
            max: 2,
            window_secs: 60,
        };
        let key = rate_limit_key(Uuid::new_v4(), Channel::Sms);

        assert_eq!(limiter.acquire(&key, limit).await.unwrap(), None);
        assert_eq!(limiter.acquire(&key, limit).await.unwrap(), None);

        clock.advance(Duration::from_secs(20));
        let wait = limiter.acquire(&key, limit).await.unwrap();
        assert_eq!(wait, Some(Duration::from_secs(40)));

        clock.advance(Duration::from_secs(40));
        assert_eq!(limiter.acquire(&key, limit).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let limiter = InMemoryRateLimiter::new(Arc::new(ManualClock::default()));
        let limit = RateLimit {
            max: 1,
            window_secs: 60,
        };
        let tenant = Uuid::new_v4();

        let sms = rate_limit_key(tenant, Channel::Sms);
        let push = rate_limit_key(tenant, Channel::Push);
        assert!(limiter.acquire(&sms, limit).await.unwrap().is_none());
        assert!(limiter.acquire(&push, limit).await.unwrap().is_none());
        assert!(limiter.acquire(&sms, limit).await.unwrap().is_some());
    }
}
