//! Stock ledger: the critical section.
//!
//! Every mutating call here must run while the caller holds the activity's
//! stock lock. Deduction re-reads `sold` and `total_stock` inside one atomic
//! store step; a value read before the lock was taken is never trusted.

use crate::activity::{ActivityRepository, ActivityStatus};
use crate::error::{Result, SeckillError};
use crate::storage::{Storage, current_timestamp_ms};

/// Result of a deduction attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deduction {
    /// Stock was taken; `remaining` units are left.
    Deducted {
        /// Units left after this deduction.
        remaining: u64,
    },
    /// Not enough stock; nothing was changed.
    Insufficient {
        /// Units left (fewer than requested).
        remaining: u64,
    },
}

impl Deduction {
    /// Check if stock was taken.
    pub fn is_deducted(&self) -> bool {
        matches!(self, Self::Deducted { .. })
    }

    /// Units left after the attempt.
    pub fn remaining(&self) -> u64 {
        match self {
            Self::Deducted { remaining } | Self::Insufficient { remaining } => *remaining,
        }
    }
}

/// Sold/total bookkeeping for activities.
#[derive(Debug)]
pub struct StockLedger<S> {
    activities: ActivityRepository<S>,
}

impl<S> Clone for StockLedger<S> {
    fn clone(&self) -> Self {
        Self {
            activities: self.activities.clone(),
        }
    }
}

impl<S: Storage> StockLedger<S> {
    /// Create a ledger over the given activity records.
    pub fn new(activities: ActivityRepository<S>) -> Self {
        Self { activities }
    }

    /// Whether the activity has at least one unsold unit.
    pub async fn has_stock(&self, activity_id: u64) -> Result<bool> {
        Ok(self.remaining(activity_id).await? > 0)
    }

    /// Units left for the activity.
    pub async fn remaining(&self, activity_id: u64) -> Result<u64> {
        self.activities
            .load(activity_id)
            .await?
            .map(|activity| activity.remaining())
            .ok_or(SeckillError::ActivityNotFound(activity_id))
    }

    /// Take `quantity` units from the activity.
    ///
    /// The check and the increment of `sold` are one atomic store operation,
    /// so `sold` can never pass `total_stock`.
    pub async fn deduct(&self, activity_id: u64, quantity: u64) -> Result<Deduction> {
        if quantity == 0 {
            return Err(SeckillError::InvalidRequest("cannot deduct zero units".into()));
        }

        let deduction = self
            .activities
            .modify(activity_id, |activity| {
                let remaining = activity.remaining();
                if remaining < quantity {
                    return (false, Deduction::Insufficient { remaining });
                }
                activity.sold += quantity;
                (true, Deduction::Deducted { remaining: activity.remaining() })
            })
            .await?
            .ok_or(SeckillError::ActivityNotFound(activity_id))?;

        match deduction {
            Deduction::Deducted { remaining } => {
                tracing::debug!(activity_id, quantity, remaining, "stock deducted");
            }
            Deduction::Insufficient { remaining } => {
                tracing::debug!(activity_id, quantity, remaining, "insufficient stock");
            }
        }
        Ok(deduction)
    }

    /// Set the stock of an activity that has not opened yet.
    ///
    /// Once the sale window opens, or anything is sold, `total_stock` is fixed
    /// and the call fails with `InvalidActivity`.
    pub async fn init_stock(&self, activity_id: u64, total_stock: u64) -> Result<()> {
        if total_stock == 0 {
            return Err(SeckillError::InvalidActivity(format!(
                "activity {activity_id} needs positive stock"
            )));
        }

        let now = current_timestamp_ms();
        self.activities
            .modify(activity_id, |activity| {
                let status = activity.status_at(now);
                if status != ActivityStatus::NotStarted {
                    return (
                        false,
                        Err(SeckillError::InvalidActivity(format!(
                            "activity {activity_id} is {status}, stock is fixed"
                        ))),
                    );
                }
                if activity.sold > 0 {
                    return (
                        false,
                        Err(SeckillError::InvalidActivity(format!(
                            "activity {activity_id} already sold {} units",
                            activity.sold
                        ))),
                    );
                }
                activity.total_stock = total_stock;
                (true, Ok(()))
            })
            .await?
            .ok_or(SeckillError::ActivityNotFound(activity_id))??;

        tracing::info!(activity_id, total_stock, "stock initialised");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::activity::Activity;
    use crate::storage::MemoryStorage;

    async fn ledger_with(total_stock: u64) -> StockLedger<MemoryStorage> {
        let repo = ActivityRepository::new(
            Arc::new(MemoryStorage::new()),
            "test",
            Duration::from_secs(60),
        );
        let now = current_timestamp_ms();
        repo.create(&Activity::new(1, 1, total_stock, now, now + 60_000))
            .await
            .unwrap();
        StockLedger::new(repo)
    }

    #[tokio::test]
    async fn test_deduct_until_empty() {
        let ledger = ledger_with(2).await;

        assert_eq!(ledger.deduct(1, 1).await.unwrap(), Deduction::Deducted { remaining: 1 });
        assert_eq!(ledger.deduct(1, 1).await.unwrap(), Deduction::Deducted { remaining: 0 });
        assert_eq!(ledger.deduct(1, 1).await.unwrap(), Deduction::Insufficient { remaining: 0 });
        assert!(!ledger.has_stock(1).await.unwrap());
    }

    #[tokio::test]
    async fn test_deduct_more_than_left() {
        let ledger = ledger_with(3).await;

        let deduction = ledger.deduct(1, 5).await.unwrap();
        assert_eq!(deduction, Deduction::Insufficient { remaining: 3 });
        assert_eq!(ledger.remaining(1).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_zero_stock_never_deducts() {
        let ledger = ledger_with(0).await;
        assert!(!ledger.has_stock(1).await.unwrap());
        assert!(!ledger.deduct(1, 1).await.unwrap().is_deducted());
    }

    #[test]
    fn test_zero_quantity_is_rejected() {
        let ledger = tokio_test::block_on(ledger_with(3));
        assert!(matches!(
            tokio_test::block_on(ledger.deduct(1, 0)),
            Err(SeckillError::InvalidRequest(_))
        ));
        assert_eq!(tokio_test::block_on(ledger.remaining(1)).unwrap(), 3);
    }

    #[tokio::test]
    async fn test_unknown_activity() {
        let ledger = ledger_with(1).await;
        assert!(matches!(
            ledger.deduct(9, 1).await,
            Err(SeckillError::ActivityNotFound(9))
        ));
        assert!(matches!(
            ledger.remaining(9).await,
            Err(SeckillError::ActivityNotFound(9))
        ));
    }

    #[tokio::test]
    async fn test_init_stock_before_opening() {
        let repo = ActivityRepository::new(
            Arc::new(MemoryStorage::new()),
            "test",
            Duration::from_secs(60),
        );
        let now = current_timestamp_ms();
        repo.create(&Activity::new(1, 1, 2, now + 60_000, now + 120_000))
            .await
            .unwrap();
        let ledger = StockLedger::new(repo);

        ledger.init_stock(1, 5).await.unwrap();
        assert_eq!(ledger.remaining(1).await.unwrap(), 5);
        assert!(matches!(
            ledger.init_stock(1, 0).await,
            Err(SeckillError::InvalidActivity(_))
        ));
        assert!(matches!(
            ledger.init_stock(9, 3).await,
            Err(SeckillError::ActivityNotFound(9))
        ));
    }

    #[tokio::test]
    async fn test_init_stock_never_rewrites_an_open_sale() {
        let ledger = ledger_with(1).await;
        assert!(matches!(
            ledger.init_stock(1, 5).await,
            Err(SeckillError::InvalidActivity(_))
        ));

        ledger.deduct(1, 1).await.unwrap();
        assert!(ledger.init_stock(1, 5).await.is_err());

        let activity = ledger.activities.load(1).await.unwrap().unwrap();
        assert_eq!(activity.sold, 1);
        assert_eq!(activity.total_stock, 1);
    }
}
