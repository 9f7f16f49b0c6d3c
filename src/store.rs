use async_trait::async_trait;
use redis::AsyncCommands;
use std::{collections::HashMap, time::Duration};
use thiserror::Error;
use tokio::time::timeout;

pub const WHITELIST_SET_KEY: &str = "whitelist:users";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store command failed: {0}")]
    Command(String),
    #[error("unexpected store value: {0}")]
    Corrupt(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() || err.is_timeout() || err.is_connection_dropped() {
            StoreError::Unavailable(err.to_string())
        } else {
            StoreError::Command(err.to_string())
        }
    }
}

/// The durable key-value/set store. All operations are idempotent at the
/// application level; no transactions are used.
#[async_trait]
pub trait Store: Send + Sync {
    async fn set_add(&self, key: &str, members: &[String]) -> Result<(), StoreError>;
    async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError>;
    async fn set_contains(&self, key: &str, member: &str) -> Result<bool, StoreError>;
    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError>;
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
    async fn hash_incr(&self, key: &str, field: &str, ttl: Duration) -> Result<(), StoreError>;
    async fn hash_get_all(&self, key: &str) -> Result<Vec<(String, String)>, StoreError>;
    async fn ping(&self) -> Result<(), StoreError>;
}

#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    connect_timeout: Duration,
    command_timeout: Duration,
}

impl RedisStore {
    pub fn open(url: &str) -> Result<Self, StoreError> {
        let client =
            redis::Client::open(url).map_err(|err| StoreError::Unavailable(err.to_string()))?;
        Ok(Self {
            client,
            connect_timeout: Duration::from_secs(3),
            command_timeout: Duration::from_secs(3),
        })
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection, StoreError> {
        bounded(
            self.connect_timeout,
            "connect",
            self.client.get_multiplexed_async_connection(),
        )
        .await
    }
}

/// Turns a command that outlives `limit` into `Unavailable` instead of a stall.
async fn bounded<T>(
    limit: Duration,
    op: &'static str,
    command: impl Future<Output = redis::RedisResult<T>>,
) -> Result<T, StoreError> {
    match timeout(limit, command).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(StoreError::Unavailable(format!("{op} timed out"))),
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn set_add(&self, key: &str, members: &[String]) -> Result<(), StoreError> {
        if members.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn().await?;
        bounded(self.command_timeout, "SADD", conn.sadd::<_, _, ()>(key, members)).await
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        bounded(self.command_timeout, "SREM", conn.srem::<_, _, ()>(key, member)).await
    }

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        bounded(self.command_timeout, "SISMEMBER", conn.sismember::<_, _, bool>(key, member)).await
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn().await?;
        bounded(self.command_timeout, "SMEMBERS", conn.smembers::<_, Vec<String>>(key)).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn().await?;
        bounded(self.command_timeout, "GET", conn.get::<_, Option<String>>(key)).await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        bounded(
            self.command_timeout,
            "SETEX",
            conn.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1)),
        )
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        bounded(self.command_timeout, "DEL", conn.del::<_, ()>(key)).await
    }

    async fn hash_incr(&self, key: &str, field: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        bounded(self.command_timeout, "HINCRBY", conn.hincr::<_, _, _, i64>(key, field, 1i64)).await?;
        bounded(self.command_timeout, "EXPIRE", conn.expire::<_, ()>(key, ttl.as_secs() as i64)).await
    }

    async fn hash_get_all(&self, key: &str) -> Result<Vec<(String, String)>, StoreError> {
        let mut conn = self.conn().await?;
        let map: HashMap<String, String> =
            bounded(self.command_timeout, "HGETALL", conn.hgetall(key)).await?;
        Ok(map.into_iter().collect())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let pong: String = bounded(
            self.command_timeout,
            "PING",
            redis::cmd("PING").query_async(&mut conn),
        )
        .await?;
        if pong.eq_ignore_ascii_case("PONG") {
            Ok(())
        } else {
            Err(StoreError::Corrupt(format!("unexpected PING reply: {pong}")))
        }
    }
}
