use async_trait::async_trait;
use redis::{AsyncCommands, Client, aio::MultiplexedConnection};
use tracing::info;

use crate::{
    clients::broker::TtlStore,
    error::{DispatchError, Result},
    models::retry::RetryConfig,
    utils::retry_with_backoff,
};

/// Redis-backed [`TtlStore`]. The multiplexed connection is cheap to clone,
/// so every call works on its own handle.
#[derive(Clone)]
pub struct RedisStore {
    connection: MultiplexedConnection,
}

impl RedisStore {
    pub async fn connect(url: &str, retry_config: &RetryConfig) -> Result<Self> {
        info!("Connecting to Redis");

        let client = Client::open(url)
            .map_err(|e| DispatchError::Store(format!("Invalid redis url: {}", e)))?;

        let connection = retry_with_backoff("redis_connect", retry_config, || {
            client.get_multiplexed_async_connection()
        })
        .await?;

        info!("Redis connection established");

        Ok(Self { connection })
    }
}

#[async_trait]
impl TtlStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut connection = self.connection.clone();
        let value: Option<String> = connection.get(key).await?;
        Ok(value)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<()> {
        let mut connection = self.connection.clone();
        connection
            .set_ex::<_, _, ()>(key, value, ttl_seconds)
            .await?;
        Ok(())
    }
}
