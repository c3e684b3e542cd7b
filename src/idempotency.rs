//! At-most-one-attempt guard per (activity, user).
//!
//! A claim is written with a `Pending` outcome the moment a user enters the
//! critical section and is later settled to `Won` or `SoldOut`. Any claim,
//! settled or not, turns every later attempt by the same user away.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::storage::{Mutation, Storage, StorageEntry, current_timestamp_ms};

/// What became of a user's claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ClaimOutcome {
    /// Claimed, deduction not settled yet.
    Pending,
    /// Stock was reserved under `token`.
    Won {
        /// Reservation token.
        token: Uuid,
        /// Order number handed to the order service.
        order_no: String,
    },
    /// The user reached the ledger after stock ran out.
    SoldOut,
}

/// Claim records under `{prefix}:order:{activity}:{user}`.
#[derive(Debug)]
pub struct IdempotencyGuard<S> {
    storage: Arc<S>,
    prefix: String,
}

impl<S> Clone for IdempotencyGuard<S> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
            prefix: self.prefix.clone(),
        }
    }
}

impl<S: Storage> IdempotencyGuard<S> {
    /// Create a guard storing claims under `prefix`.
    pub fn new(storage: Arc<S>, prefix: impl Into<String>) -> Self {
        Self {
            storage,
            prefix: prefix.into(),
        }
    }

    /// Store key of a claim.
    pub fn key(&self, activity_id: u64, user_id: u64) -> String {
        format!("{}:order:{}:{}", self.prefix, activity_id, user_id)
    }

    /// Claim the pair. Returns `true` only for the first caller.
    pub async fn try_claim(&self, activity_id: u64, user_id: u64, ttl: Duration) -> Result<bool> {
        let entry = StorageEntry::with_payload(&ClaimOutcome::Pending, current_timestamp_ms())?;
        let claimed = self
            .storage
            .set_if_absent(&self.key(activity_id, user_id), entry, ttl)
            .await?;
        tracing::debug!(activity_id, user_id, claimed, "idempotency claim");
        Ok(claimed)
    }

    /// Settle an existing claim. Returns `false` if no claim exists.
    pub async fn record_outcome(
        &self,
        activity_id: u64,
        user_id: u64,
        outcome: &ClaimOutcome,
        ttl: Duration,
    ) -> Result<bool> {
        let updated = StorageEntry::with_payload(outcome, current_timestamp_ms())?;
        let recorded = self
            .storage
            .execute_atomic(&self.key(activity_id, user_id), ttl, |entry| match entry {
                Some(_) => (Mutation::Put(updated.clone()), true),
                None => (Mutation::Keep, false),
            })
            .await?;
        Ok(recorded)
    }

    /// Drop the claim so the user may try again.
    pub async fn revoke(&self, activity_id: u64, user_id: u64) -> Result<()> {
        self.storage.delete(&self.key(activity_id, user_id)).await?;
        tracing::debug!(activity_id, user_id, "idempotency claim revoked");
        Ok(())
    }

    /// Whether the user holds any claim on the activity.
    pub async fn has_participated(&self, activity_id: u64, user_id: u64) -> Result<bool> {
        Ok(self.storage.get(&self.key(activity_id, user_id)).await?.is_some())
    }

    /// The claim's current outcome, if any.
    pub async fn lookup(&self, activity_id: u64, user_id: u64) -> Result<Option<ClaimOutcome>> {
        match self.storage.get(&self.key(activity_id, user_id)).await? {
            Some(entry) => Ok(entry.decode_payload()?),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    const TTL: Duration = Duration::from_secs(60);

    fn guard() -> IdempotencyGuard<MemoryStorage> {
        IdempotencyGuard::new(Arc::new(MemoryStorage::new()), "test")
    }

    #[tokio::test]
    async fn test_first_claim_wins() {
        let guard = guard();

        assert!(guard.try_claim(1, 7, TTL).await.unwrap());
        assert!(!guard.try_claim(1, 7, TTL).await.unwrap());
        assert!(guard.try_claim(1, 8, TTL).await.unwrap());
        assert!(guard.try_claim(2, 7, TTL).await.unwrap());

        assert_eq!(guard.lookup(1, 7).await.unwrap(), Some(ClaimOutcome::Pending));
    }

    #[tokio::test]
    async fn test_concurrent_claims_single_winner() {
        let guard = guard();
        let mut handles = Vec::new();
        for _ in 0..32 {
            let guard = guard.clone();
            handles.push(tokio::spawn(async move { guard.try_claim(1, 1, TTL).await.unwrap() }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_record_outcome() {
        let guard = guard();
        let outcome = ClaimOutcome::Won {
            token: Uuid::now_v7(),
            order_no: "SK11".into(),
        };

        assert!(!guard.record_outcome(1, 1, &outcome, TTL).await.unwrap());
        assert!(!guard.has_participated(1, 1).await.unwrap());

        guard.try_claim(1, 1, TTL).await.unwrap();
        assert!(guard.record_outcome(1, 1, &outcome, TTL).await.unwrap());
        assert_eq!(guard.lookup(1, 1).await.unwrap(), Some(outcome));
    }

    #[tokio::test]
    async fn test_revoke_allows_new_claim() {
        let guard = guard();
        guard.try_claim(1, 1, TTL).await.unwrap();
        guard.revoke(1, 1).await.unwrap();

        assert!(!guard.has_participated(1, 1).await.unwrap());
        assert!(guard.try_claim(1, 1, TTL).await.unwrap());
    }

    #[test]
    fn test_outcome_encoding() {
        let json = serde_json::to_string(&ClaimOutcome::SoldOut).unwrap();
        assert_eq!(json, r#"{"outcome":"sold_out"}"#);
    }
}
