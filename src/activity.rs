//! Flash-sale activities and their lifecycle.
//!
//! An activity's status is never trusted from storage for admission. The only
//! stored status that matters is the explicit `Cancelled` override; everything
//! else is recomputed from the clock on every request by [`Activity::status_at`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SeckillError};
use crate::storage::{Mutation, Storage, StorageEntry, current_timestamp_ms};

/// Lifecycle state of an activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityStatus {
    /// Before the start time.
    NotStarted,
    /// Between start and end time, inclusive.
    Active,
    /// After the end time.
    Ended,
    /// Cancelled by an operator; terminal.
    Cancelled,
}

impl ActivityStatus {
    /// Numeric status code used by the admin tooling (0..=3).
    pub fn code(&self) -> u8 {
        match self {
            Self::NotStarted => 0,
            Self::Active => 1,
            Self::Ended => 2,
            Self::Cancelled => 3,
        }
    }

    /// Inverse of [`ActivityStatus::code`].
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::NotStarted),
            1 => Some(Self::Active),
            2 => Some(Self::Ended),
            3 => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Compute the status at `now` (Unix milliseconds).
    ///
    /// `Cancelled` overrides the clock; otherwise the window is
    /// `[start_time, end_time]`, both ends inclusive.
    pub fn compute(stored: ActivityStatus, now: u64, start_time: u64, end_time: u64) -> Self {
        if stored == Self::Cancelled {
            Self::Cancelled
        } else if now < start_time {
            Self::NotStarted
        } else if now <= end_time {
            Self::Active
        } else {
            Self::Ended
        }
    }
}

impl fmt::Display for ActivityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NotStarted => "not started",
            Self::Active => "active",
            Self::Ended => "ended",
            Self::Cancelled => "cancelled",
        })
    }
}

/// A time-boxed sale of a fixed amount of stock.
///
/// `sold` and `total_stock` are stored as separate fields so that
/// `sold <= total_stock` can always be checked on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activity {
    /// Activity id.
    pub id: u64,
    /// Display name.
    pub name: String,
    /// Product on sale.
    pub product_id: u64,
    /// Units available for the whole activity; fixed at creation.
    pub total_stock: u64,
    /// Units sold so far; only grows, only inside the stock lock.
    pub sold: u64,
    /// Start, Unix milliseconds.
    pub start_time: u64,
    /// End, Unix milliseconds (inclusive).
    pub end_time: u64,
    /// Stored status; only `Cancelled` overrides the clock.
    pub status: ActivityStatus,
}

impl Activity {
    /// A new, unsold activity.
    pub fn new(id: u64, product_id: u64, total_stock: u64, start_time: u64, end_time: u64) -> Self {
        Self {
            id,
            name: format!("activity-{id}"),
            product_id,
            total_stock,
            sold: 0,
            start_time,
            end_time,
            status: ActivityStatus::NotStarted,
        }
    }

    /// Set the display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Status at `now`.
    pub fn status_at(&self, now: u64) -> ActivityStatus {
        ActivityStatus::compute(self.status, now, self.start_time, self.end_time)
    }

    /// Whether purchases are accepted at `now`.
    pub fn is_active_at(&self, now: u64) -> bool {
        self.status_at(now) == ActivityStatus::Active
    }

    /// Whether at least one unit is unsold.
    pub fn has_stock(&self) -> bool {
        self.sold < self.total_stock
    }

    /// Units left.
    pub fn remaining(&self) -> u64 {
        self.total_stock.saturating_sub(self.sold)
    }

    /// Reject definitions that could never be sold correctly.
    pub fn validate(&self) -> Result<()> {
        if self.end_time < self.start_time {
            return Err(SeckillError::InvalidActivity(format!(
                "activity {} ends before it starts",
                self.id
            )));
        }
        if self.sold > self.total_stock {
            return Err(SeckillError::InvalidActivity(format!(
                "activity {} has sold {} of {} units",
                self.id, self.sold, self.total_stock
            )));
        }
        Ok(())
    }

    /// How long the record must outlive `now`: until the end plus `retention`.
    pub fn ttl(&self, now: u64, retention: Duration) -> Duration {
        Duration::from_millis(self.end_time.saturating_sub(now)) + retention
    }
}

/// Activity records in the shared store.
#[derive(Debug)]
pub struct ActivityRepository<S> {
    storage: Arc<S>,
    prefix: String,
    retention: Duration,
}

impl<S> Clone for ActivityRepository<S> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
            prefix: self.prefix.clone(),
            retention: self.retention,
        }
    }
}

impl<S: Storage> ActivityRepository<S> {
    /// Create a repository storing records under `{prefix}:activity:{id}`.
    pub fn new(storage: Arc<S>, prefix: impl Into<String>, retention: Duration) -> Self {
        Self {
            storage,
            prefix: prefix.into(),
            retention,
        }
    }

    /// Store key of an activity.
    pub fn key(&self, activity_id: u64) -> String {
        format!("{}:activity:{}", self.prefix, activity_id)
    }

    /// How long records are kept past their end time.
    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Store a new activity. Fails if the id is taken.
    pub async fn create(&self, activity: &Activity) -> Result<()> {
        activity.validate()?;
        let now = current_timestamp_ms();
        let entry = StorageEntry::with_payload(activity, now)?;
        let created = self
            .storage
            .set_if_absent(&self.key(activity.id), entry, activity.ttl(now, self.retention))
            .await?;
        if !created {
            return Err(SeckillError::InvalidActivity(format!(
                "activity {} already exists",
                activity.id
            )));
        }
        tracing::info!(
            activity_id = activity.id,
            total_stock = activity.total_stock,
            start_time = activity.start_time,
            end_time = activity.end_time,
            "activity created"
        );
        Ok(())
    }

    /// Load an activity, `None` if unknown.
    pub async fn load(&self, activity_id: u64) -> Result<Option<Activity>> {
        match self.storage.get(&self.key(activity_id)).await? {
            Some(entry) => Ok(entry.decode_payload()?),
            None => Ok(None),
        }
    }

    /// Mark an activity cancelled. Returns `false` if it does not exist.
    pub async fn cancel(&self, activity_id: u64) -> Result<bool> {
        let cancelled = self
            .modify(activity_id, |activity| {
                activity.status = ActivityStatus::Cancelled;
                (true, ())
            })
            .await?
            .is_some();
        if cancelled {
            tracing::info!(activity_id, "activity cancelled");
        }
        Ok(cancelled)
    }

    /// Re-read the record and apply `apply` to it as one atomic store step.
    ///
    /// `apply` returns whether it changed the activity along with its result;
    /// unchanged records are not rewritten. Returns `None` if the activity
    /// does not exist.
    pub(crate) async fn modify<T, F>(&self, activity_id: u64, mut apply: F) -> Result<Option<T>>
    where
        F: FnMut(&mut Activity) -> (bool, T) + Send,
        T: Send,
    {
        // end_time is immutable, so a plain read is enough to size the TTL.
        let Some(current) = self.load(activity_id).await? else {
            return Ok(None);
        };
        let now = current_timestamp_ms();
        let ttl = current.ttl(now, self.retention);

        let outcome = self
            .storage
            .execute_atomic(&self.key(activity_id), ttl, |entry| {
                let decoded = match entry.map(|e| e.decode_payload::<Activity>()) {
                    Some(Ok(Some(activity))) => activity,
                    Some(Err(err)) => return (Mutation::Keep, Err(err)),
                    Some(Ok(None)) | None => return (Mutation::Keep, Ok(None)),
                };
                let mut activity = decoded;
                let (changed, result) = apply(&mut activity);
                if !changed {
                    return (Mutation::Keep, Ok(Some(result)));
                }
                match StorageEntry::with_payload(&activity, now) {
                    Ok(updated) => (Mutation::Put(updated), Ok(Some(result))),
                    Err(err) => (Mutation::Keep, Err(err)),
                }
            })
            .await?;
        Ok(outcome?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    const START: u64 = 1_000_000;
    const END: u64 = 2_000_000;

    #[test]
    fn test_status_follows_clock() {
        let activity = Activity::new(1, 10, 5, START, END);

        assert_eq!(activity.status_at(START - 1), ActivityStatus::NotStarted);
        assert_eq!(activity.status_at(START), ActivityStatus::Active);
        assert_eq!(activity.status_at(END), ActivityStatus::Active);
        assert_eq!(activity.status_at(END + 1), ActivityStatus::Ended);
        assert!(!activity.is_active_at(END + 1000));
    }

    #[test]
    fn test_cancelled_overrides_clock() {
        let mut activity = Activity::new(1, 10, 5, START, END);
        activity.status = ActivityStatus::Cancelled;

        for now in [START - 1, START, END, END + 1] {
            assert_eq!(activity.status_at(now), ActivityStatus::Cancelled);
        }
    }

    #[test]
    fn test_stored_active_is_not_trusted() {
        let mut activity = Activity::new(1, 10, 5, START, END);
        activity.status = ActivityStatus::Active;
        assert_eq!(activity.status_at(END + 1), ActivityStatus::Ended);
    }

    #[test]
    fn test_status_codes() {
        for status in [
            ActivityStatus::NotStarted,
            ActivityStatus::Active,
            ActivityStatus::Ended,
            ActivityStatus::Cancelled,
        ] {
            assert_eq!(ActivityStatus::from_code(status.code()), Some(status));
        }
        assert_eq!(ActivityStatus::from_code(9), None);
    }

    #[test]
    fn test_validate() {
        assert!(Activity::new(1, 1, 0, START, END).validate().is_ok());
        assert!(Activity::new(1, 1, 5, END, START).validate().is_err());

        let mut oversold = Activity::new(1, 1, 5, START, END);
        oversold.sold = 6;
        assert!(oversold.validate().is_err());
    }

    #[tokio::test]
    async fn test_repository_create_load_cancel() {
        let repo = ActivityRepository::new(
            Arc::new(MemoryStorage::new()),
            "test",
            Duration::from_secs(60),
        );
        let now = current_timestamp_ms();
        let activity = Activity::new(3, 99, 10, now, now + 60_000).with_name("spring sale");

        repo.create(&activity).await.unwrap();
        assert!(repo.create(&activity).await.is_err());

        let loaded = repo.load(3).await.unwrap().unwrap();
        assert_eq!(loaded, activity);
        assert!(repo.load(4).await.unwrap().is_none());

        assert!(repo.cancel(3).await.unwrap());
        assert!(!repo.cancel(4).await.unwrap());
        let loaded = repo.load(3).await.unwrap().unwrap();
        assert_eq!(loaded.status_at(now + 1), ActivityStatus::Cancelled);
    }
}
