//! Shared key-value store trait and implementations.
//!
//! Every piece of state the core shares between orchestrator instances lives
//! behind the `Storage` trait: limiter counters, lock markers, idempotency
//! claims and activity records. Built-in backends are an in-memory map (for a
//! single process and for tests) and Redis (for horizontally scaled
//! deployments).

mod entry;
#[cfg(feature = "memory")]
mod memory_gc;
#[cfg(feature = "redis")]
mod redis_cluster;

pub use entry::StorageEntry;

#[cfg(feature = "memory")]
pub use memory_gc::{GcConfig, GcInterval, MemoryStorage};

// RedisStorage with connection pooling
#[cfg(feature = "redis")]
pub use redis_cluster::{RedisConfig, RedisStorage};

use std::future::Future;
use std::time::Duration;

use crate::error::Result;

/// What an atomic operation wants done with the key it inspected.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// Leave the stored entry (and its expiry) untouched.
    Keep,
    /// Replace the entry, resetting its expiry to the operation's TTL.
    Put(StorageEntry),
    /// Remove the entry.
    Delete,
}

/// Storage backend trait for shared seckill state.
///
/// All storage operations are async to support both local and distributed backends.
/// Implementations must be thread-safe (`Send + Sync`), and every method must be
/// a single indivisible step against the store: a crash between two calls can
/// never leave a half-applied write.
///
/// # Example
///
/// ```ignore
/// use seckill_core::storage::{Mutation, Storage, StorageEntry};
///
/// async fn bump<S: Storage>(storage: &S) -> seckill_core::Result<u64> {
///     storage
///         .execute_atomic("counter", Duration::from_secs(60), |current| {
///             let next = current.map(|e| e.count).unwrap_or(0) + 1;
///             (Mutation::Put(StorageEntry::new(next, 0)), next)
///         })
///         .await
/// }
/// ```
pub trait Storage: Send + Sync + 'static {
    /// Get an entry by key.
    ///
    /// Returns `None` if the key doesn't exist or has expired.
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<StorageEntry>>> + Send;

    /// Set an entry with a TTL.
    ///
    /// The entry will be automatically removed after the TTL expires.
    fn set(
        &self,
        key: &str,
        entry: StorageEntry,
        ttl: Duration,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Delete an entry.
    ///
    /// Returns success even if the key didn't exist.
    fn delete(&self, key: &str) -> impl Future<Output = Result<()>> + Send;

    /// Store `entry` only if no live entry exists for `key`.
    ///
    /// Returns `true` if this call created the entry.
    fn set_if_absent(
        &self,
        key: &str,
        entry: StorageEntry,
        ttl: Duration,
    ) -> impl Future<Output = Result<bool>> + Send;

    /// Delete the entry only if it is held by `owner`.
    ///
    /// Returns `true` if an entry was removed.
    fn compare_and_delete(
        &self,
        key: &str,
        owner: &str,
    ) -> impl Future<Output = Result<bool>> + Send;

    /// Execute an atomic read-modify-write operation.
    ///
    /// The operation receives the current entry (if any) and returns the
    /// [`Mutation`] to apply along with a result value. Backends with
    /// optimistic concurrency may invoke the operation more than once, so it
    /// must be free of side effects.
    fn execute_atomic<F, T>(
        &self,
        key: &str,
        ttl: Duration,
        operation: F,
    ) -> impl Future<Output = Result<T>> + Send
    where
        F: FnMut(Option<StorageEntry>) -> (Mutation, T) + Send,
        T: Send;
}

impl<S: Storage + ?Sized> Storage for std::sync::Arc<S> {
    async fn get(&self, key: &str) -> Result<Option<StorageEntry>> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, entry: StorageEntry, ttl: Duration) -> Result<()> {
        (**self).set(key, entry, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        (**self).delete(key).await
    }

    async fn set_if_absent(&self, key: &str, entry: StorageEntry, ttl: Duration) -> Result<bool> {
        (**self).set_if_absent(key, entry, ttl).await
    }

    async fn compare_and_delete(&self, key: &str, owner: &str) -> Result<bool> {
        (**self).compare_and_delete(key, owner).await
    }

    async fn execute_atomic<F, T>(&self, key: &str, ttl: Duration, operation: F) -> Result<T>
    where
        F: FnMut(Option<StorageEntry>) -> (Mutation, T) + Send,
        T: Send,
    {
        (**self).execute_atomic(key, ttl, operation).await
    }
}

impl<S: Storage + ?Sized> Storage for Box<S> {
    async fn get(&self, key: &str) -> Result<Option<StorageEntry>> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, entry: StorageEntry, ttl: Duration) -> Result<()> {
        (**self).set(key, entry, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        (**self).delete(key).await
    }

    async fn set_if_absent(&self, key: &str, entry: StorageEntry, ttl: Duration) -> Result<bool> {
        (**self).set_if_absent(key, entry, ttl).await
    }

    async fn compare_and_delete(&self, key: &str, owner: &str) -> Result<bool> {
        (**self).compare_and_delete(key, owner).await
    }

    async fn execute_atomic<F, T>(&self, key: &str, ttl: Duration, operation: F) -> Result<T>
    where
        F: FnMut(Option<StorageEntry>) -> (Mutation, T) + Send,
        T: Send,
    {
        (**self).execute_atomic(key, ttl, operation).await
    }
}

/// Get the current timestamp in milliseconds since Unix epoch.
///
/// A clock set before 1970 reads as 0 rather than panicking.
pub fn current_timestamp_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
