//! Redis storage backend for multi-instance deployments.
//!
//! Uses connection pooling for high performance. Conditional writes map onto
//! native Redis primitives: `SET NX PX` for creation, a Lua script for
//! owner-checked deletion and `WATCH`/`MULTI`/`EXEC` for read-modify-write.

use std::time::Duration;

use deadpool_redis::redis::{self, AsyncCommands, Script, cmd};
use deadpool_redis::{Config, Connection, Pool, PoolError, Runtime};

use crate::error::{ConnectionError, Result, StorageError};
use crate::storage::{Mutation, Storage, StorageEntry};

/// How many times an optimistic transaction is retried before giving up.
const MAX_ATOMIC_RETRIES: usize = 32;

/// Deletes KEYS[1] only if its JSON `owner` field equals ARGV[1].
const COMPARE_AND_DELETE: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then
    return 0
end
local entry = cjson.decode(raw)
if entry.owner == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Redis storage configuration.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Redis connection URL (e.g., "redis://localhost:6379")
    pub url: String,
    /// Connection pool size
    pub pool_size: usize,
    /// Prefix prepended to every key
    pub key_prefix: String,
    /// Connection timeout
    pub connection_timeout: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            pool_size: 10,
            key_prefix: String::new(),
            connection_timeout: Duration::from_secs(5),
        }
    }
}

impl RedisConfig {
    /// Create a new Redis configuration.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Set the key prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Set the pool size.
    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    /// Set the connection timeout.
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }
}

/// Redis storage backend.
///
/// # Example
///
/// ```ignore
/// use seckill_core::storage::{RedisStorage, RedisConfig};
///
/// let config = RedisConfig::new("redis://localhost:6379")
///     .with_prefix("shop:")
///     .with_pool_size(20);
///
/// let storage = RedisStorage::new(config).await?;
/// ```
pub struct RedisStorage {
    pool: Pool,
    key_prefix: String,
    compare_and_delete: Script,
}

impl std::fmt::Debug for RedisStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStorage")
            .field("key_prefix", &self.key_prefix)
            .finish()
    }
}

fn op_failed(err: redis::RedisError) -> StorageError {
    let retryable = err.is_io_error() || err.is_timeout() || err.is_connection_dropped();
    StorageError::operation_failed(err.to_string(), retryable)
}

fn pool_error(err: PoolError) -> StorageError {
    match err {
        PoolError::Timeout(_) => StorageError::PoolExhausted,
        other => StorageError::Unavailable(other.to_string()),
    }
}

fn encode(entry: &StorageEntry) -> std::result::Result<String, StorageError> {
    serde_json::to_string(entry).map_err(StorageError::from)
}

fn decode(raw: Option<String>) -> std::result::Result<Option<StorageEntry>, StorageError> {
    raw.map(|json| serde_json::from_str(&json))
        .transpose()
        .map_err(StorageError::from)
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

impl RedisStorage {
    /// Create a new Redis storage from configuration.
    pub async fn new(config: RedisConfig) -> Result<Self> {
        let mut cfg = Config::from_url(&config.url);
        cfg.pool = Some(deadpool_redis::PoolConfig::new(config.pool_size));
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| ConnectionError::ConnectionFailed(e.to_string()))?;

        let mut conn = tokio::time::timeout(config.connection_timeout, pool.get())
            .await
            .map_err(|_| ConnectionError::Timeout(config.connection_timeout))?
            .map_err(|e| ConnectionError::ConnectionFailed(e.to_string()))?;
        let _: () = cmd("PING")
            .query_async(&mut *conn)
            .await
            .map_err(|e| ConnectionError::ConnectionFailed(e.to_string()))?;

        tracing::info!(url = %config.url, pool_size = config.pool_size, "connected to redis");

        Ok(Self {
            pool,
            key_prefix: config.key_prefix,
            compare_and_delete: Script::new(COMPARE_AND_DELETE),
        })
    }

    /// Create a new Redis storage from a URL.
    pub async fn from_url(url: impl Into<String>) -> Result<Self> {
        Self::new(RedisConfig::new(url)).await
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    async fn get_conn(&self) -> Result<Connection> {
        self.pool
            .get()
            .await
            .map_err(|err| pool_error(err).into())
    }
}

impl Storage for RedisStorage {
    async fn get(&self, key: &str) -> Result<Option<StorageEntry>> {
        let mut conn = self.get_conn().await?;
        let raw: Option<String> = conn.get(self.full_key(key)).await.map_err(op_failed)?;
        Ok(decode(raw)?)
    }

    async fn set(&self, key: &str, entry: StorageEntry, ttl: Duration) -> Result<()> {
        let mut conn = self.get_conn().await?;
        let _: () = cmd("SET")
            .arg(self.full_key(key))
            .arg(encode(&entry)?)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut *conn)
            .await
            .map_err(op_failed)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.get_conn().await?;
        conn.del::<_, ()>(self.full_key(key)).await.map_err(op_failed)?;
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, entry: StorageEntry, ttl: Duration) -> Result<bool> {
        let mut conn = self.get_conn().await?;
        let reply: Option<String> = cmd("SET")
            .arg(self.full_key(key))
            .arg(encode(&entry)?)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut *conn)
            .await
            .map_err(op_failed)?;
        Ok(reply.is_some())
    }

    async fn compare_and_delete(&self, key: &str, owner: &str) -> Result<bool> {
        let mut conn = self.get_conn().await?;
        let removed: i64 = self
            .compare_and_delete
            .key(self.full_key(key))
            .arg(owner)
            .invoke_async(&mut *conn)
            .await
            .map_err(op_failed)?;
        Ok(removed > 0)
    }

    async fn execute_atomic<F, T>(&self, key: &str, ttl: Duration, mut operation: F) -> Result<T>
    where
        F: FnMut(Option<StorageEntry>) -> (Mutation, T) + Send,
        T: Send,
    {
        let mut conn = self.get_conn().await?;
        let full_key = self.full_key(key);

        for attempt in 0..MAX_ATOMIC_RETRIES {
            let _: () = cmd("WATCH")
                .arg(&full_key)
                .query_async(&mut *conn)
                .await
                .map_err(op_failed)?;

            let raw: redis::RedisResult<Option<String>> = conn.get(&full_key).await;
            let staged = match raw {
                Ok(raw) => stage(raw, &mut operation),
                Err(err) => Err(op_failed(err)),
            };
            // The connection goes back to the pool; it must not keep the WATCH.
            let (write, result) = match staged {
                Ok(staged) => staged,
                Err(err) => {
                    unwatch(&mut conn).await;
                    return Err(err.into());
                }
            };

            let mut pipe = redis::pipe();
            pipe.atomic();
            match write {
                StagedWrite::Keep => {
                    unwatch(&mut conn).await;
                    return Ok(result);
                }
                StagedWrite::Put(payload) => {
                    pipe.cmd("SET")
                        .arg(&full_key)
                        .arg(payload)
                        .arg("PX")
                        .arg(ttl_millis(ttl))
                        .ignore();
                }
                StagedWrite::Delete => {
                    pipe.del(&full_key).ignore();
                }
            }

            // EXEC replies nil when a watched key changed underneath us.
            let committed: Option<()> = pipe.query_async(&mut *conn).await.map_err(op_failed)?;
            if committed.is_some() {
                return Ok(result);
            }
            tracing::debug!(key = %full_key, attempt, "optimistic transaction conflicted, retrying");
        }

        Err(StorageError::AtomicConflict.into())
    }
}

/// A mutation with its entry already encoded.
#[derive(Debug, PartialEq)]
enum StagedWrite {
    Keep,
    Put(String),
    Delete,
}

/// Decode the watched value, run `operation` and encode what it wants written.
fn stage<F, T>(raw: Option<String>, operation: &mut F) -> std::result::Result<(StagedWrite, T), StorageError>
where
    F: FnMut(Option<StorageEntry>) -> (Mutation, T),
{
    let (mutation, result) = operation(decode(raw)?);
    let write = match mutation {
        Mutation::Keep => StagedWrite::Keep,
        Mutation::Put(entry) => StagedWrite::Put(encode(&entry)?),
        Mutation::Delete => StagedWrite::Delete,
    };
    Ok((write, result))
}

async fn unwatch(conn: &mut Connection) {
    let reply: redis::RedisResult<()> = cmd("UNWATCH").query_async(&mut **conn).await;
    if let Err(err) = reply {
        tracing::warn!(error = %err, "UNWATCH failed");
    }
}
