//! Dedup guard: lease-based exactly-once admission.
//!
//! A lease is an expiring claim on a key held by one holder token. Admission
//! succeeds only for the caller that atomically sets the key; everybody else
//! sees `admitted = false` and must no-op.
//!
//! The Redis store uses `SET key holder NX PX ttl` to claim and a
//! compare-and-delete script to release, so a holder whose lease already
//! expired (and was taken over) can never release the new holder's claim.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use uuid::Uuid;

use courier_common::clock::Clock;
use courier_common::error::{DeliveryError, StoreError};
use courier_common::types::DeliveryKey;

const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

/// Ephemeral lock record. Never outlives its TTL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub key: String,
    pub holder: String,
    pub expires_at: DateTime<Utc>,
}

/// Shared store offering atomic set-if-absent-with-TTL and holder-checked release.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Claim `key` for `holder` unless it is already claimed. `Ok(false)` means held.
    async fn try_acquire(&self, key: &str, holder: &str, ttl: Duration)
    -> Result<bool, StoreError>;

    /// Drop the claim if `holder` still owns it. Returns whether anything was removed.
    async fn release(&self, key: &str, holder: &str) -> Result<bool, StoreError>;
}

/// Redis-backed lease store.
#[derive(Clone)]
pub struct RedisLeaseStore {
    redis: ConnectionManager,
    release_script: redis::Script,
}

impl RedisLeaseStore {
    pub fn new(redis: ConnectionManager) -> Self {
        Self {
            redis,
            release_script: redis::Script::new(RELEASE_SCRIPT),
        }
    }
}

#[async_trait]
impl LeaseStore for RedisLeaseStore {
    async fn try_acquire(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        // Some("OK") when set, None when the key already exists
        let result: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(holder)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis().max(1) as u64)
            .query_async(&mut conn)
            .await?;
        Ok(result.is_some())
    }

    async fn release(&self, key: &str, holder: &str) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let removed: i64 = self
            .release_script
            .key(key)
            .arg(holder)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }
}

/// Process-local lease store driven by an explicit clock.
///
/// `set_available(false)` makes every call fail with `StoreError::Unavailable`,
/// which is how outages are exercised.
pub struct InMemoryLeaseStore {
    clock: Arc<dyn Clock>,
    leases: Mutex<HashMap<String, Lease>>,
    available: AtomicBool,
}

impl InMemoryLeaseStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            leases: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Unexpired leases currently held.
    pub fn active_count(&self) -> usize {
        let now = self.clock.now();
        self.leases
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|l| l.expires_at > now)
            .count()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("lease store offline".to_string()))
        }
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn try_acquire(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.check_available()?;
        let now = self.clock.now();
        let mut leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(existing) = leases.get(key)
            && existing.expires_at > now
        {
            return Ok(false);
        }

        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        leases.insert(
            key.to_string(),
            Lease {
                key: key.to_string(),
                holder: holder.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn release(&self, key: &str, holder: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        match leases.get(key) {
            Some(lease) if lease.holder == holder => {
                leases.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// What to do when the lease store cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    /// Admit anyway and log. For best-effort channels.
    Open,
    /// Refuse with `StoreUnavailable`. For idempotency-sensitive channels.
    Closed,
}

/// Result of an admission attempt.
#[derive(Debug)]
pub struct Admission {
    pub admitted: bool,
    /// Present when admitted through the store. `None` when rejected or when
    /// admitted fail-open without a lease.
    pub lease: Option<LeaseGuard>,
}

impl Admission {
    /// Admitted without a lease because the store was down.
    pub fn is_degraded(&self) -> bool {
        self.admitted && self.lease.is_none()
    }
}

/// Scoped ownership of a lease.
///
/// Call [`LeaseGuard::release`] on every normal exit or [`LeaseGuard::retain`]
/// to keep the claim until it expires. A guard dropped without either (early
/// return, panic, cancelled future) releases in a spawned task.
pub struct LeaseGuard {
    store: Arc<dyn LeaseStore>,
    lease: Lease,
    done: bool,
}

impl LeaseGuard {
    pub fn lease(&self) -> &Lease {
        &self.lease
    }

    pub async fn release(mut self) {
        self.done = true;
        match self.store.release(&self.lease.key, &self.lease.holder).await {
            Ok(true) => tracing::trace!(key = %self.lease.key, "Lease released"),
            Ok(false) => tracing::debug!(
                key = %self.lease.key,
                "Lease already expired or taken over at release"
            ),
            Err(e) => tracing::warn!(
                key = %self.lease.key,
                error = %e,
                "Lease release failed, waiting for TTL expiry"
            ),
        }
    }

    /// Keep the claim until its TTL runs out.
    pub fn retain(mut self) {
        self.done = true;
    }
}

impl std::fmt::Debug for LeaseGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseGuard")
            .field("lease", &self.lease)
            .field("done", &self.done)
            .finish()
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let store = self.store.clone();
        let key = std::mem::take(&mut self.lease.key);
        let holder = std::mem::take(&mut self.lease.holder);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = store.release(&key, &holder).await {
                        tracing::warn!(key = %key, error = %e, "Deferred lease release failed");
                    }
                });
            }
            Err(_) => {
                tracing::warn!(key = %key, "Lease dropped outside a runtime, waiting for TTL expiry");
            }
        }
    }
}

/// Admission front-end over a lease store.
#[derive(Clone)]
pub struct DedupGuard {
    store: Arc<dyn LeaseStore>,
    clock: Arc<dyn Clock>,
}

impl DedupGuard {
    pub fn new(store: Arc<dyn LeaseStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Lease key for one channel delivery.
    pub fn delivery_lease_key(key: &DeliveryKey) -> String {
        format!("courier:lease:delivery:{}", key)
    }

    /// Lease key for event intake (channel independent).
    pub fn intake_lease_key(tenant_id: Uuid, message_id: &str, generation: u32) -> String {
        format!("courier:lease:intake:{}:{}:{}", tenant_id, message_id, generation)
    }

    /// Admit one channel delivery. Fails closed for idempotency-sensitive channels.
    pub async fn admit(&self, key: &DeliveryKey, ttl: Duration) -> Result<Admission, DeliveryError> {
        let mode = if key.channel.is_idempotency_sensitive() {
            FailureMode::Closed
        } else {
            FailureMode::Open
        };
        self.admit_raw(&Self::delivery_lease_key(key), ttl, mode).await
    }

    /// Admit an incoming event. Intake always fails open: the per-channel
    /// delivery lease still protects the sensitive channels.
    pub async fn admit_event(
        &self,
        tenant_id: Uuid,
        message_id: &str,
        generation: u32,
        ttl: Duration,
    ) -> Result<Admission, DeliveryError> {
        let key = Self::intake_lease_key(tenant_id, message_id, generation);
        self.admit_raw(&key, ttl, FailureMode::Open).await
    }

    pub async fn admit_raw(
        &self,
        key: &str,
        ttl: Duration,
        mode: FailureMode,
    ) -> Result<Admission, DeliveryError> {
        let holder = Uuid::new_v4().to_string();

        match self.store.try_acquire(key, &holder, ttl).await {
            Ok(true) => {
                let expires_at = self.clock.now()
                    + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
                Ok(Admission {
                    admitted: true,
                    lease: Some(LeaseGuard {
                        store: self.store.clone(),
                        lease: Lease {
                            key: key.to_string(),
                            holder,
                            expires_at,
                        },
                        done: false,
                    }),
                })
            }
            Ok(false) => {
                tracing::debug!(key, "Admission rejected, key already leased");
                Ok(Admission {
                    admitted: false,
                    lease: None,
                })
            }
            Err(e) => match mode {
                FailureMode::Open => {
                    tracing::warn!(
                        key,
                        error = %e,
                        "Lease store unavailable, admitting fail-open"
                    );
                    Ok(Admission {
                        admitted: true,
                        lease: None,
                    })
                }
                FailureMode::Closed => {
                    tracing::error!(
                        key,
                        error = %e,
                        "Lease store unavailable, rejecting fail-closed"
                    );
                    Err(DeliveryError::StoreUnavailable(e.to_string()))
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_common::clock::ManualClock;
    use courier_common::types::Channel;

    fn setup() -> (ManualClock, Arc<InMemoryLeaseStore>, DedupGuard) {
        let clock = ManualClock::default();
        let store = Arc::new(InMemoryLeaseStore::new(Arc::new(clock.clone())));
        let guard = DedupGuard::new(store.clone(), Arc::new(clock.clone()));
        (clock, store, guard)
    }

    fn key(channel: Channel) -> DeliveryKey {
        DeliveryKey::new(Uuid::new_v4(), "msg-1", channel)
    }

    /// Yield until spawned releases have run.
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_second_admission_within_ttl_rejected() {
        let (_clock, _store, guard) = setup();
        let k = key(Channel::Email);

        let first = guard.admit(&k, Duration::from_secs(30)).await.unwrap();
        assert!(first.admitted);

        let second = guard.admit(&k, Duration::from_secs(30)).await.unwrap();
        assert!(!second.admitted);
        assert!(second.lease.is_none());

        first.lease.unwrap().retain();
    }

    #[tokio::test]
    async fn test_admission_after_ttl_expiry() {
        let (clock, _store, guard) = setup();
        let k = key(Channel::Email);

        let first = guard.admit(&k, Duration::from_secs(30)).await.unwrap();
        first.lease.unwrap().retain();

        clock.advance(Duration::from_secs(31));
        let again = guard.admit(&k, Duration::from_secs(30)).await.unwrap();
        assert!(again.admitted);
        again.lease.unwrap().retain();
    }

    #[tokio::test]
    async fn test_release_allows_readmission() {
        let (_clock, store, guard) = setup();
        let k = key(Channel::Push);

        let first = guard.admit(&k, Duration::from_secs(30)).await.unwrap();
        first.lease.unwrap().release().await;
        assert_eq!(store.active_count(), 0);

        let second = guard.admit(&k, Duration::from_secs(30)).await.unwrap();
        assert!(second.admitted);
        second.lease.unwrap().release().await;
    }

    #[tokio::test]
    async fn test_dropped_guard_releases() {
        let (_clock, store, guard) = setup();
        let k = key(Channel::Webhook);

        {
            let admission = guard.admit(&k, Duration::from_secs(30)).await.unwrap();
            assert!(admission.admitted);
        }
        settle().await;

        assert_eq!(store.active_count(), 0);
        let again = guard.admit(&k, Duration::from_secs(30)).await.unwrap();
        assert!(again.admitted);
        again.lease.unwrap().retain();
    }

    #[tokio::test]
    async fn test_panicking_holder_releases() {
        let (_clock, store, guard) = setup();
        let k = key(Channel::Sms);

        let task_guard = guard.clone();
        let task_key = k.clone();
        let handle = tokio::spawn(async move {
            let _admission = task_guard
                .admit(&task_key, Duration::from_secs(30))
                .await
                .unwrap();
            panic!("holder crashed mid-delivery");
        });
        assert!(handle.await.is_err());
        settle().await;

        assert_eq!(store.active_count(), 0);
    }

    #[tokio::test]
    async fn test_stale_holder_cannot_release_new_lease() {
        let (clock, store, guard) = setup();
        let k = key(Channel::Email);

        let stale = guard.admit(&k, Duration::from_secs(10)).await.unwrap();
        clock.advance(Duration::from_secs(11));

        let fresh = guard.admit(&k, Duration::from_secs(10)).await.unwrap();
        assert!(fresh.admitted);

        stale.lease.unwrap().release().await;
        assert_eq!(store.active_count(), 1, "fresh lease must survive");

        let blocked = guard.admit(&k, Duration::from_secs(10)).await.unwrap();
        assert!(!blocked.admitted);
        fresh.lease.unwrap().release().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_admission_admits_exactly_one() {
        let (_clock, _store, guard) = setup();
        let k = key(Channel::Whatsapp);

        let mut handles = Vec::new();
        for _ in 0..64 {
            let guard = guard.clone();
            let k = k.clone();
            handles.push(tokio::spawn(async move {
                let admission = guard.admit(&k, Duration::from_secs(30)).await.unwrap();
                let admitted = admission.admitted;
                if let Some(lease) = admission.lease {
                    lease.retain();
                }
                admitted
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
    }

    #[tokio::test]
    async fn test_store_outage_fails_open_for_in_app() {
        let (_clock, store, guard) = setup();
        store.set_available(false);

        let admission = guard
            .admit(&key(Channel::InApp), Duration::from_secs(30))
            .await
            .unwrap();
        assert!(admission.admitted);
        assert!(admission.is_degraded());
    }

    #[tokio::test]
    async fn test_store_outage_fails_closed_for_whatsapp() {
        let (_clock, store, guard) = setup();
        store.set_available(false);

        let result = guard
            .admit(&key(Channel::Whatsapp), Duration::from_secs(30))
            .await;
        assert!(matches!(result, Err(DeliveryError::StoreUnavailable(_))));
    }

    #[tokio::test]
    async fn test_intake_key_independent_of_delivery_key() {
        let (_clock, _store, guard) = setup();
        let tenant = Uuid::new_v4();

        let intake = guard
            .admit_event(tenant, "msg-1", 0, Duration::from_secs(30))
            .await
            .unwrap();
        assert!(intake.admitted);

        let delivery = guard
            .admit(
                &DeliveryKey::new(tenant, "msg-1", Channel::InApp),
                Duration::from_secs(30),
            )
            .await
            .unwrap();
        assert!(delivery.admitted);

        let resend = guard
            .admit_event(tenant, "msg-1", 1, Duration::from_secs(30))
            .await
            .unwrap();
        assert!(resend.admitted, "a new generation is a new key");

        intake.lease.unwrap().retain();
        delivery.lease.unwrap().retain();
        resend.lease.unwrap().retain();
    }
}
