use std::time::Duration;

use redis::Client;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};

/// Create a Redis connection manager shared by the lease store, the work
/// queue and the in-app broadcaster.
///
/// Commands time out after `response_timeout` so a degraded Redis surfaces as
/// `StoreUnavailable` quickly instead of stalling workers.
pub async fn create_redis_pool(
    redis_url: &str,
    response_timeout: Duration,
) -> anyhow::Result<ConnectionManager> {
    let client = Client::open(redis_url)?;
    let config = ConnectionManagerConfig::new()
        .set_connection_timeout(Duration::from_secs(5))
        .set_response_timeout(response_timeout);
    let manager = ConnectionManager::new_with_config(client, config).await?;

    tracing::info!(response_timeout_ms = response_timeout.as_millis() as u64, "Connected to Redis");
    Ok(manager)
}

/// Round-trip a PING; used by the health endpoint.
pub async fn ping(redis: &mut ConnectionManager) -> bool {
    redis::cmd("PING")
        .query_async::<String>(redis)
        .await
        .is_ok()
}
