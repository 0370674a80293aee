use redis::Client;
use redis::aio::ConnectionManager;
use tracing::{debug, info};

use super::RedisConfig;
use crate::common::{DatabaseError, RetryConfig, retry_with_backoff};

/// Open a `ConnectionManager` and verify it with PING.
pub async fn connect(url: &str) -> redis::RedisResult<ConnectionManager> {
    let client = Client::open(url)?;
    let manager = ConnectionManager::new(client).await?;

    let mut conn = manager.clone();
    let _: String = redis::cmd("PING").query_async(&mut conn).await?;

    info!("Connected to Redis");
    Ok(manager)
}

/// Connect with exponential backoff; `None` uses [`RetryConfig::default`].
pub async fn connect_from_config_with_retry(
    config: RedisConfig,
    retry_config: Option<RetryConfig>,
) -> redis::RedisResult<ConnectionManager> {
    let url = config.build_url();
    retry_with_backoff(|| connect(&url), retry_config.unwrap_or_default()).await
}

pub async fn check_health(conn: &mut ConnectionManager) -> Result<(), DatabaseError> {
    debug!("Running Redis health check");

    let response: String = redis::cmd("PING")
        .query_async(conn)
        .await
        .map_err(|e| DatabaseError::HealthCheckFailed(format!("Redis PING failed: {}", e)))?;

    if response != "PONG" {
        return Err(DatabaseError::HealthCheckFailed(format!(
            "Redis PING returned unexpected response: {}",
            response
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore] // Requires actual Redis
    async fn test_connect_and_ping() {
        let url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());

        let mut conn = connect(&url).await.unwrap();
        assert!(check_health(&mut conn).await.is_ok());
    }
}
