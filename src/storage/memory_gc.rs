//! In-memory storage with automatic garbage collection.
//!
//! This storage backend uses `DashMap` for thread-safe concurrent access.
//! Each key's shard lock is held for the whole of an atomic operation, which
//! gives the same per-key atomicity a Redis script would. Expired entries are
//! hidden lazily on read and swept by a configurable garbage collector.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::Result;
use crate::storage::{Mutation, Storage, StorageEntry, current_timestamp_ms};

/// Garbage collection interval configuration.
#[derive(Debug, Clone)]
pub enum GcInterval {
    /// Run GC every N requests.
    Requests(u64),
    /// Run GC at fixed time intervals.
    Duration(Duration),
    /// Disable automatic GC.
    Manual,
}

impl Default for GcInterval {
    fn default() -> Self {
        Self::Requests(10000)
    }
}

/// Garbage collection configuration.
#[derive(Debug, Clone, Default)]
pub struct GcConfig {
    /// When to trigger GC.
    pub interval: GcInterval,
}

impl GcConfig {
    /// Create config with request-based GC.
    pub fn on_requests(count: u64) -> Self {
        Self {
            interval: GcInterval::Requests(count),
        }
    }

    /// Create config with time-based GC.
    pub fn on_duration(interval: Duration) -> Self {
        Self {
            interval: GcInterval::Duration(interval),
        }
    }

    /// Create config with manual GC only.
    pub fn manual() -> Self {
        Self {
            interval: GcInterval::Manual,
        }
    }
}

#[derive(Debug, Clone)]
struct InternalEntry {
    entry: StorageEntry,
    expires_at: u64,
}

impl InternalEntry {
    fn new(entry: StorageEntry, ttl: Duration) -> Self {
        Self {
            entry,
            expires_at: current_timestamp_ms().saturating_add(ttl.as_millis() as u64),
        }
    }

    fn is_live(&self, now: u64) -> bool {
        self.expires_at > now
    }
}

/// In-memory storage with garbage collection.
///
/// Suitable for a single orchestrator process and for tests. Several
/// orchestrators can share one instance through an `Arc`.
///
/// # Example
///
/// ```ignore
/// use seckill_core::storage::{MemoryStorage, GcConfig};
/// use std::time::Duration;
///
/// // Default GC (every 10000 requests)
/// let storage = MemoryStorage::new();
///
/// // Sweep on a timer (requires a Tokio runtime)
/// let storage = MemoryStorage::with_gc(GcConfig::on_duration(Duration::from_secs(60)));
/// ```
pub struct MemoryStorage {
    data: Arc<DashMap<String, InternalEntry>>,
    gc_config: GcConfig,
    request_count: AtomicU64,
    gc_lock: Mutex<()>,
    shutdown: Arc<Notify>,
}

impl std::fmt::Debug for MemoryStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStorage")
            .field("entries", &self.data.len())
            .field("gc_config", &self.gc_config)
            .finish()
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    /// Create a new memory storage with default GC configuration.
    pub fn new() -> Self {
        Self::with_gc(GcConfig::default())
    }

    /// Create a new memory storage with custom GC configuration.
    pub fn with_gc(gc_config: GcConfig) -> Self {
        let storage = Self {
            data: Arc::new(DashMap::new()),
            gc_config: gc_config.clone(),
            request_count: AtomicU64::new(0),
            gc_lock: Mutex::new(()),
            shutdown: Arc::new(Notify::new()),
        };

        if let GcInterval::Duration(interval) = gc_config.interval {
            storage.start_gc_task(interval);
        }

        storage
    }

    fn start_gc_task(&self, interval: Duration) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("no Tokio runtime, timed storage GC disabled");
            return;
        };
        let data = Arc::clone(&self.data);
        let shutdown = Arc::clone(&self.shutdown);

        handle.spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        sweep_expired(&data);
                    }
                    _ = shutdown.notified() => {
                        break;
                    }
                }
            }
        });
    }

    /// Manually trigger garbage collection, returning the number of entries removed.
    pub fn run_gc(&self) -> usize {
        sweep_expired(&self.data)
    }

    /// Get the number of entries currently stored (including expired, unswept ones).
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if the storage is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Clear all entries.
    pub fn clear(&self) {
        self.data.clear();
    }

    fn maybe_run_gc(&self) {
        if let GcInterval::Requests(threshold) = self.gc_config.interval {
            let count = self.request_count.fetch_add(1, Ordering::Relaxed);
            if threshold > 0 && count % threshold == 0 && count > 0 {
                if let Some(_guard) = self.gc_lock.try_lock() {
                    sweep_expired(&self.data);
                }
            }
        }
    }
}

impl Drop for MemoryStorage {
    fn drop(&mut self) {
        self.shutdown.notify_waiters();
    }
}

fn sweep_expired(data: &DashMap<String, InternalEntry>) -> usize {
    let now = current_timestamp_ms();
    let before = data.len();
    data.retain(|_, entry| entry.is_live(now));
    let removed = before.saturating_sub(data.len());
    if removed > 0 {
        tracing::debug!(removed, "swept expired storage entries");
    }
    removed
}

impl Storage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<StorageEntry>> {
        self.maybe_run_gc();

        let now = current_timestamp_ms();
        if let Some(internal) = self.data.get(key) {
            if internal.is_live(now) {
                return Ok(Some(internal.entry.clone()));
            }
            drop(internal);
            self.data.remove_if(key, |_, internal| !internal.is_live(now));
        }
        Ok(None)
    }

    async fn set(&self, key: &str, entry: StorageEntry, ttl: Duration) -> Result<()> {
        self.maybe_run_gc();
        self.data.insert(key.to_string(), InternalEntry::new(entry, ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.data.remove(key);
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, entry: StorageEntry, ttl: Duration) -> Result<bool> {
        self.maybe_run_gc();

        let now = current_timestamp_ms();
        let created = match self.data.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live(now) {
                    false
                } else {
                    occupied.insert(InternalEntry::new(entry, ttl));
                    true
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(InternalEntry::new(entry, ttl));
                true
            }
        };
        Ok(created)
    }

    async fn compare_and_delete(&self, key: &str, owner: &str) -> Result<bool> {
        let now = current_timestamp_ms();
        let removed = self
            .data
            .remove_if(key, |_, internal| {
                internal.is_live(now) && internal.entry.is_owned_by(owner)
            })
            .is_some();
        Ok(removed)
    }

    async fn execute_atomic<F, T>(&self, key: &str, ttl: Duration, mut operation: F) -> Result<T>
    where
        F: FnMut(Option<StorageEntry>) -> (Mutation, T) + Send,
        T: Send,
    {
        self.maybe_run_gc();

        let now = current_timestamp_ms();

        // The entry guard holds the shard lock until the mutation is applied.
        let result = match self.data.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let current = occupied
                    .get()
                    .is_live(now)
                    .then(|| occupied.get().entry.clone());
                let (mutation, result) = operation(current);
                match mutation {
                    Mutation::Keep => {}
                    Mutation::Put(entry) => {
                        occupied.insert(InternalEntry::new(entry, ttl));
                    }
                    Mutation::Delete => {
                        occupied.remove();
                    }
                }
                result
            }
            Entry::Vacant(vacant) => {
                let (mutation, result) = operation(None);
                if let Mutation::Put(entry) = mutation {
                    vacant.insert(InternalEntry::new(entry, ttl));
                }
                result
            }
        };

        Ok(result)
    }
}
