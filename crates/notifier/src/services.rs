use std::sync::Arc;

use redis::aio::ConnectionManager;
use sqlx::PgPool;

use courier_common::clock::{Clock, SystemClock};
use courier_common::config::AppConfig;
use courier_common::{db, redis_pool};
use courier_engine::dedup::{DedupGuard, RedisLeaseStore};
use courier_engine::policy::{PgPolicyStore, PolicyDefaults, PolicyResolver};
use courier_engine::ratelimit::RedisRateLimiter;

use crate::dispatcher::{DeliveryDispatcher, DispatcherConfig};
use crate::pipeline::NotificationPipeline;
use crate::queue::RedisWorkQueue;
use crate::store::PgTaskStore;
use crate::transport::TransportRegistry;

/// Production wiring: Postgres, Redis and every configured transport.
#[derive(Clone)]
pub struct Services {
    pub pool: PgPool,
    pub redis: ConnectionManager,
    pub dispatcher: DeliveryDispatcher,
    pub pipeline: NotificationPipeline,
}

impl Services {
    pub async fn connect(config: &AppConfig) -> anyhow::Result<Self> {
        let pool = db::create_pool(&config.database_url, config.db_max_connections).await?;
        db::run_migrations(&pool).await?;

        let redis = redis_pool::create_redis_pool(&config.redis_url, config.transport_timeout()).await?;

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let guard = DedupGuard::new(Arc::new(RedisLeaseStore::new(redis.clone())), clock.clone());
        let transports = TransportRegistry::from_config(config, redis.clone())?;

        let dispatcher = DeliveryDispatcher::new(
            Arc::new(PgTaskStore::new(pool.clone())),
            Arc::new(RedisWorkQueue::new(
                redis.clone(),
                clock.clone(),
                config.queue_visibility_timeout(),
            )),
            guard.clone(),
            Arc::new(RedisRateLimiter::new(redis.clone())),
            transports,
            clock,
            DispatcherConfig::from_config(config),
        );

        let resolver = PolicyResolver::new(
            Arc::new(PgPolicyStore::new(pool.clone())),
            PolicyDefaults::from_config(config),
        );
        let pipeline = NotificationPipeline::new(
            resolver,
            guard,
            dispatcher.clone(),
            config.intake_dedup_ttl(),
        );

        Ok(Self {
            pool,
            redis,
            dispatcher,
            pipeline,
        })
    }
}
