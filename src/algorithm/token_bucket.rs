//! Token Bucket admission limiter.

use std::time::Duration;

use crate::algorithm::{Algorithm, current_timestamp_ms};
use crate::decision::{Decision, RateLimitInfo};
use crate::error::Result;
use crate::quota::Quota;
use crate::storage::{Mutation, Storage, StorageEntry};

/// Token Bucket admission limiter.
///
/// A bucket refills continuously at the quota's refill rate up to its
/// capacity (the effective burst). The first call for a key finds a full
/// bucket. Refill, check and subtract run as one atomic storage operation.
#[derive(Debug, Clone, Default)]
pub struct TokenBucket;

impl TokenBucket {
    /// Create a new Token Bucket algorithm instance.
    pub fn new() -> Self {
        Self
    }

    /// Acquire `permits` tokens from the bucket at `key`.
    ///
    /// The bucket refills at `rate` tokens per second and holds at most
    /// `capacity` tokens. Returns `true` if the tokens were taken.
    pub async fn try_acquire<S: Storage>(
        &self,
        storage: &S,
        key: &str,
        permits: u64,
        rate: f64,
        capacity: u64,
    ) -> Result<bool> {
        let quota = Quota::bucket(rate, capacity);
        quota.validate()?;
        let decision = self.check_and_record_n(storage, key, &quota, permits).await?;
        Ok(decision.is_allowed())
    }

    fn refill(tokens: f64, last_update: u64, now: u64, rate: f64, capacity: f64) -> f64 {
        if now <= last_update {
            return tokens;
        }
        let elapsed_secs = (now - last_update) as f64 / 1000.0;
        (tokens + elapsed_secs * rate).min(capacity)
    }

    fn build_info(tokens: f64, wanted: f64, quota: &Quota) -> RateLimitInfo {
        let info = RateLimitInfo::new(quota.effective_burst(), tokens.floor() as u64)
            .with_algorithm("token_bucket");

        if tokens < wanted {
            let wait_ms = ((wanted - tokens) / quota.effective_refill_rate() * 1000.0).ceil() as u64;
            info.with_retry_after(Duration::from_millis(wait_ms.max(1)))
        } else {
            info
        }
    }
}

impl Algorithm for TokenBucket {
    fn name(&self) -> &'static str {
        "token_bucket"
    }

    async fn check_and_record_n<S: Storage>(
        &self,
        storage: &S,
        key: &str,
        quota: &Quota,
        permits: u64,
    ) -> Result<Decision> {
        let now = current_timestamp_ms();
        let capacity = quota.effective_burst() as f64;
        let rate = quota.effective_refill_rate();
        let wanted = permits as f64;

        // Long enough for an idle bucket to refill completely.
        let ttl_ms = ((capacity / rate) * 1000.0 * 2.0) as u64;
        let ttl = Duration::from_millis(ttl_ms.max(1000));

        let decision = storage
            .execute_atomic(key, ttl, |entry| {
                let tokens = match entry {
                    Some(e) => Self::refill(e.tokens.unwrap_or(capacity), e.last_update, now, rate, capacity),
                    None => capacity,
                };

                if tokens >= wanted {
                    let left = tokens - wanted;
                    let info = Self::build_info(left, 1.0, quota);
                    (Mutation::Put(StorageEntry::with_tokens(left, now)), Decision::allowed(info))
                } else {
                    let info = Self::build_info(tokens, wanted, quota);
                    (Mutation::Put(StorageEntry::with_tokens(tokens, now)), Decision::denied(info))
                }
            })
            .await?;

        if decision.is_denied() {
            tracing::debug!(key, permits, "token bucket exhausted");
        }
        Ok(decision)
    }

    async fn check<S: Storage>(&self, storage: &S, key: &str, quota: &Quota) -> Result<Decision> {
        let now = current_timestamp_ms();
        let capacity = quota.effective_burst() as f64;
        let rate = quota.effective_refill_rate();

        let tokens = match storage.get(key).await? {
            Some(e) => Self::refill(e.tokens.unwrap_or(capacity), e.last_update, now, rate, capacity),
            None => capacity,
        };

        let info = Self::build_info(tokens, 1.0, quota);
        Ok(if tokens >= 1.0 {
            Decision::allowed(info)
        } else {
            Decision::denied(info)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[tokio::test]
    async fn test_first_call_starts_full() {
        let algorithm = TokenBucket::new();
        let storage = MemoryStorage::new();
        let quota = Quota::bucket(1.0, 5);

        let decision = algorithm.check_and_record(&storage, "activity:1", &quota).await.unwrap();
        assert!(decision.is_allowed());
        assert_eq!(decision.info().remaining, 4);
        assert_eq!(decision.info().algorithm, Some("token_bucket"));
    }

    #[tokio::test]
    async fn test_token_bucket_burst() {
        let algorithm = TokenBucket::new();
        let storage = MemoryStorage::new();
        let quota = Quota::bucket(1.0, 10);

        for i in 1..=10 {
            let decision = algorithm.check_and_record(&storage, "activity:1", &quota).await.unwrap();
            assert!(decision.is_allowed(), "Burst request {} should be allowed", i);
        }

        let decision = algorithm.check_and_record(&storage, "activity:1", &quota).await.unwrap();
        assert!(decision.is_denied());
        assert!(decision.info().retry_after.is_some());
    }

    #[tokio::test]
    async fn test_multiple_permits() {
        let algorithm = TokenBucket::new();
        let storage = MemoryStorage::new();

        assert!(algorithm.try_acquire(&storage, "k", 3, 1.0, 5).await.unwrap());
        // Only 2 left: a request for 3 is refused and consumes nothing.
        assert!(!algorithm.try_acquire(&storage, "k", 3, 1.0, 5).await.unwrap());
        assert!(algorithm.try_acquire(&storage, "k", 2, 1.0, 5).await.unwrap());
    }

    #[tokio::test]
    async fn test_token_bucket_refill() {
        let algorithm = TokenBucket::new();
        let storage = MemoryStorage::new();
        let quota = Quota::bucket(10.0, 1);

        algorithm.check_and_record(&storage, "activity:1", &quota).await.unwrap();

        let decision = algorithm.check_and_record(&storage, "activity:1", &quota).await.unwrap();
        assert!(decision.is_denied());

        tokio::time::sleep(Duration::from_millis(150)).await;

        let decision = algorithm.check_and_record(&storage, "activity:1", &quota).await.unwrap();
        assert!(decision.is_allowed());
    }

    #[test]
    fn test_refill_caps_at_capacity() {
        assert_eq!(TokenBucket::refill(1.0, 0, 60_000, 10.0, 5.0), 5.0);
        assert_eq!(TokenBucket::refill(1.0, 1000, 1500, 2.0, 5.0), 2.0);
        // Clock skew backwards never drains the bucket.
        assert_eq!(TokenBucket::refill(3.0, 2000, 1000, 2.0, 5.0), 3.0);
    }

    #[tokio::test]
    async fn test_check_does_not_consume() {
        let algorithm = TokenBucket::new();
        let storage = MemoryStorage::new();
        let quota = Quota::bucket(1.0, 1);

        for _ in 0..3 {
            assert!(algorithm.check(&storage, "k", &quota).await.unwrap().is_allowed());
        }
        assert!(algorithm.check_and_record(&storage, "k", &quota).await.unwrap().is_allowed());
        assert!(algorithm.check(&storage, "k", &quota).await.unwrap().is_denied());
    }
}
