//! Sliding Window admission limiter.
//!
//! Keeps the timestamp of every admitted request inside the window, so the
//! cap holds exactly over any rolling interval (no fixed-window boundary
//! bursts).

use std::time::Duration;

use crate::algorithm::{Algorithm, current_timestamp_ms};
use crate::decision::{Decision, RateLimitInfo};
use crate::error::{ConfigError, Result};
use crate::quota::Quota;
use crate::storage::{Mutation, Storage, StorageEntry};

/// Sliding Window admission limiter.
///
/// Counts requests whose timestamp falls within `[now - window, now]`,
/// evicting older ones lazily on every call. Rejected requests are not
/// recorded and so never consume window capacity.
#[derive(Debug, Clone, Default)]
pub struct SlidingWindow;

impl SlidingWindow {
    /// Create a new Sliding Window algorithm instance.
    pub fn new() -> Self {
        Self
    }

    /// Admit one request at `key` if fewer than `limit` were admitted in the last `window_secs`.
    pub async fn allow<S: Storage>(
        &self,
        storage: &S,
        key: &str,
        limit: u64,
        window_secs: u64,
    ) -> Result<bool> {
        if limit == 0 || window_secs == 0 {
            return Err(ConfigError::InvalidQuota(format!(
                "sliding window needs a positive limit and window, got {limit}/{window_secs}s"
            ))
            .into());
        }
        let quota = Quota::new(limit, Duration::from_secs(window_secs));
        let decision = self.check_and_record(storage, key, &quota).await?;
        Ok(decision.is_allowed())
    }

    fn prune(timestamps: Vec<u64>, window_start: u64) -> Vec<u64> {
        timestamps.into_iter().filter(|&ts| ts >= window_start).collect()
    }

    fn retry_after(oldest: u64, window_ms: u64, now: u64) -> Duration {
        Duration::from_millis((oldest + window_ms + 1).saturating_sub(now).max(1))
    }
}

impl Algorithm for SlidingWindow {
    fn name(&self) -> &'static str {
        "sliding_window"
    }

    async fn check_and_record_n<S: Storage>(
        &self,
        storage: &S,
        key: &str,
        quota: &Quota,
        permits: u64,
    ) -> Result<Decision> {
        let now = current_timestamp_ms();
        let window_ms = quota.window().as_millis() as u64;
        let window_start = now.saturating_sub(window_ms);
        let ttl = Duration::from_millis(window_ms * 2);
        let limit = quota.max_requests();

        let decision = storage
            .execute_atomic(key, ttl, |entry| {
                let mut timestamps =
                    Self::prune(entry.and_then(|e| e.timestamps).unwrap_or_default(), window_start);
                let current = timestamps.len() as u64;

                if current + permits <= limit {
                    timestamps.extend(std::iter::repeat_n(now, permits as usize));
                    let info = RateLimitInfo::new(limit, limit - current - permits)
                        .with_algorithm("sliding_window");
                    (
                        Mutation::Put(StorageEntry::with_timestamps(timestamps)),
                        Decision::allowed(info),
                    )
                } else {
                    let oldest = timestamps.first().copied().unwrap_or(now);
                    let info = RateLimitInfo::new(limit, limit.saturating_sub(current))
                        .with_algorithm("sliding_window")
                        .with_retry_after(Self::retry_after(oldest, window_ms, now));
                    (
                        Mutation::Put(StorageEntry::with_timestamps(timestamps)),
                        Decision::denied(info),
                    )
                }
            })
            .await?;

        if decision.is_denied() {
            tracing::debug!(key, limit, window_ms, "sliding window full");
        }
        Ok(decision)
    }

    async fn check<S: Storage>(&self, storage: &S, key: &str, quota: &Quota) -> Result<Decision> {
        let now = current_timestamp_ms();
        let window_ms = quota.window().as_millis() as u64;
        let window_start = now.saturating_sub(window_ms);
        let limit = quota.max_requests();

        let timestamps = storage
            .get(key)
            .await?
            .and_then(|e| e.timestamps)
            .map(|ts| Self::prune(ts, window_start))
            .unwrap_or_default();
        let current = timestamps.len() as u64;

        let info = RateLimitInfo::new(limit, limit.saturating_sub(current))
            .with_algorithm("sliding_window");

        Ok(if current < limit {
            Decision::allowed(info)
        } else {
            let oldest = timestamps.first().copied().unwrap_or(now);
            Decision::denied(info.with_retry_after(Self::retry_after(oldest, window_ms, now)))
        })
    }
}
