//! Distributed mutual-exclusion lock over the shared store.
//!
//! A lock is a marker entry holding a random token, written with
//! `set_if_absent` and an expiry of `lease`. Only the token holder can
//! release it. A holder that crashes is cleared by the lease expiry, so the
//! lease must outlast the critical section it protects.
//!
//! # Example
//!
//! ```ignore
//! use seckill_core::lock::DistributedLock;
//!
//! let lock = DistributedLock::new(storage);
//! let remaining = lock
//!     .with_lock("seckill:stock:7", wait, lease, || ledger.deduct(7, 1))
//!     .await??;
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{Result, SeckillError};
use crate::storage::{Storage, StorageEntry, current_timestamp_ms};

/// Lock client bound to one store.
#[derive(Debug)]
pub struct DistributedLock<S> {
    storage: Arc<S>,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl<S> Clone for DistributedLock<S> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
            initial_backoff: self.initial_backoff,
            max_backoff: self.max_backoff,
        }
    }
}

impl<S: Storage> DistributedLock<S> {
    /// Create a lock client with a 2ms..50ms retry backoff.
    pub fn new(storage: Arc<S>) -> Self {
        Self {
            storage,
            initial_backoff: Duration::from_millis(2),
            max_backoff: Duration::from_millis(50),
        }
    }

    /// Set the retry backoff bounds.
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max.max(initial);
        self
    }

    /// Take the lock if it is free, without waiting.
    pub async fn try_acquire(&self, key: &str, lease: Duration) -> Result<Option<LockGuard<S>>> {
        let token = Uuid::now_v7().to_string();
        let marker = StorageEntry::with_owner(token.clone(), current_timestamp_ms());
        if self.storage.set_if_absent(key, marker, lease).await? {
            tracing::debug!(key, lease_ms = lease.as_millis() as u64, "lock acquired");
            Ok(Some(LockGuard {
                storage: Arc::clone(&self.storage),
                key: key.to_string(),
                token,
                released: false,
            }))
        } else {
            Ok(None)
        }
    }

    /// Take the lock, retrying with exponential backoff for up to `wait`.
    ///
    /// Fails with [`SeckillError::LockTimeout`] once `wait` has elapsed.
    pub async fn acquire(&self, key: &str, wait: Duration, lease: Duration) -> Result<LockGuard<S>> {
        let started = Instant::now();
        let deadline = started + wait;
        let mut backoff = self.initial_backoff;

        loop {
            if let Some(guard) = self.try_acquire(key, lease).await? {
                return Ok(guard);
            }

            let now = Instant::now();
            if now >= deadline {
                let waited = now - started;
                tracing::warn!(key, waited_ms = waited.as_millis() as u64, "lock wait timed out");
                return Err(SeckillError::LockTimeout {
                    key: key.to_string(),
                    waited,
                });
            }

            tokio::time::sleep(backoff.min(deadline - now)).await;
            backoff = (backoff * 2).min(self.max_backoff);
        }
    }

    /// Release the lock at `key` if `token` still holds it.
    pub async fn release(&self, key: &str, token: &str) -> Result<bool> {
        self.storage.compare_and_delete(key, token).await
    }

    /// Whether anyone holds the lock at `key`.
    pub async fn is_locked(&self, key: &str) -> Result<bool> {
        Ok(self.storage.get(key).await?.is_some())
    }

    /// Run `critical` while holding the lock at `key`.
    ///
    /// The lock is released on every exit path. A failed release is logged
    /// as an alert and left to the lease expiry.
    pub async fn with_lock<F, Fut, T>(
        &self,
        key: &str,
        wait: Duration,
        lease: Duration,
        critical: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let guard = self.acquire(key, wait, lease).await?;
        let output = critical().await;
        guard.release_or_alert().await;
        Ok(output)
    }
}

/// A held lock.
///
/// Call [`LockGuard::release`] when done. A guard dropped without being
/// released schedules a best-effort release on the current runtime.
pub struct LockGuard<S: Storage> {
    storage: Arc<S>,
    key: String,
    token: String,
    released: bool,
}

impl<S: Storage> LockGuard<S> {
    /// The locked key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The holder token.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Release the lock. Returns `false` if the lease had already expired.
    pub async fn release(mut self) -> Result<bool> {
        self.released = true;
        let released = self.storage.compare_and_delete(&self.key, &self.token).await?;
        if released {
            tracing::debug!(key = %self.key, "lock released");
        }
        Ok(released)
    }

    /// Release the lock, logging instead of returning any failure.
    pub async fn release_or_alert(self) {
        let key = self.key.clone();
        match self.release().await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(key = %key, "lock lease expired before release");
            }
            Err(err) => {
                tracing::error!(
                    key = %key,
                    error = %err,
                    "lock release failed, lease expiry will clear it"
                );
            }
        }
    }
}

impl<S: Storage> Drop for LockGuard<S> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::error!(key = %self.key, "lock dropped outside a runtime, left to lease expiry");
            return;
        };
        let storage = Arc::clone(&self.storage);
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);
        handle.spawn(async move {
            if let Err(err) = storage.compare_and_delete(&key, &token).await {
                tracing::error!(key = %key, error = %err, "lock release failed, lease expiry will clear it");
            }
        });
    }
}

impl<S: Storage> std::fmt::Debug for LockGuard<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("key", &self.key)
            .field("released", &self.released)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    const LEASE: Duration = Duration::from_secs(10);

    fn lock() -> DistributedLock<MemoryStorage> {
        DistributedLock::new(Arc::new(MemoryStorage::new()))
    }

    #[tokio::test]
    async fn test_exclusive() {
        let lock = lock();

        let guard = lock.try_acquire("stock:1", LEASE).await.unwrap().unwrap();
        assert!(lock.try_acquire("stock:1", LEASE).await.unwrap().is_none());
        assert!(lock.try_acquire("stock:2", LEASE).await.unwrap().is_some());
        assert!(lock.is_locked("stock:1").await.unwrap());

        assert!(guard.release().await.unwrap());
        assert!(!lock.is_locked("stock:1").await.unwrap());
    }

    #[tokio::test]
    async fn test_release_needs_matching_token() {
        let lock = lock();
        let guard = lock.try_acquire("stock:1", LEASE).await.unwrap().unwrap();

        assert!(!lock.release("stock:1", "someone-else").await.unwrap());
        assert!(lock.is_locked("stock:1").await.unwrap());

        let token = guard.token().to_string();
        assert!(lock.release("stock:1", &token).await.unwrap());
        // The guard's own release now finds nothing to remove.
        assert!(!guard.release().await.unwrap());
    }

    #[tokio::test]
    async fn test_acquire_times_out() {
        let lock = lock();
        let _held = lock.try_acquire("stock:1", LEASE).await.unwrap().unwrap();

        let started = std::time::Instant::now();
        let err = lock
            .acquire("stock:1", Duration::from_millis(50), LEASE)
            .await
            .unwrap_err();
        assert!(matches!(err, SeckillError::LockTimeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_acquire_waits_for_release() {
        let lock = lock();
        let held = lock.try_acquire("stock:1", LEASE).await.unwrap().unwrap();

        let waiter = {
            let lock = lock.clone();
            tokio::spawn(async move {
                lock.acquire("stock:1", Duration::from_secs(2), LEASE).await.is_ok()
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        held.release().await.unwrap();

        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_lease_expiry_frees_lock() {
        let lock = lock();
        let stale = lock
            .try_acquire("stock:1", Duration::from_millis(30))
            .await
            .unwrap()
            .unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        let fresh = lock.try_acquire("stock:1", LEASE).await.unwrap().unwrap();

        // The expired holder cannot release the new holder's lock.
        assert!(!stale.release().await.unwrap());
        assert!(lock.is_locked("stock:1").await.unwrap());
        assert!(fresh.release().await.unwrap());
    }

    #[tokio::test]
    async fn test_with_lock_releases() {
        let lock = lock();

        let value = lock
            .with_lock("stock:1", Duration::from_secs(1), LEASE, || async { 42 })
            .await
            .unwrap();
        assert_eq!(value, 42);
        assert!(!lock.is_locked("stock:1").await.unwrap());
    }

    #[tokio::test]
    async fn test_dropped_guard_is_released() {
        let lock = lock();
        drop(lock.try_acquire("stock:1", LEASE).await.unwrap().unwrap());

        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!lock.is_locked("stock:1").await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_mutual_exclusion_under_contention() {
        let lock = lock();
        let inside = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let mut handles = Vec::new();

        for _ in 0..20 {
            let lock = lock.clone();
            let inside = Arc::clone(&inside);
            handles.push(tokio::spawn(async move {
                lock.with_lock("stock:1", Duration::from_secs(10), LEASE, move || async move {
                    let now = inside.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    assert_eq!(now, 0);
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    inside.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
                })
                .await
                .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
