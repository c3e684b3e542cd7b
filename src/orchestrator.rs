//! The end-to-end purchase protocol.
//!
//! `attempt_purchase` runs, in order: admission limiters, activity status,
//! pre-lock fast-fail reads, the per-activity stock lock, and inside it a
//! fresh status check, the idempotency claim and the ledger deduction. The
//! lock is released on every exit path before the outcome is returned.

use std::sync::Arc;

use crate::activity::{Activity, ActivityRepository, ActivityStatus};
use crate::admission::{Admission, AdmissionControl};
use crate::config::{ClaimPolicy, SeckillConfig};
use crate::error::{Result, SeckillError};
use crate::idempotency::{ClaimOutcome, IdempotencyGuard};
use crate::ledger::{Deduction, StockLedger};
use crate::lock::DistributedLock;
use crate::reservation::{PurchaseOutcome, PurchaseRequest, RejectionReason, Reservation};
use crate::storage::{Storage, StorageEntry, current_timestamp_ms};

/// Flash-sale admission and stock deduction over one shared store.
///
/// Any number of `Seckill` instances, in any number of processes, may share
/// the store; all coordination goes through it.
///
/// # Example
///
/// ```ignore
/// use seckill_core::{Seckill, SeckillConfig, MemoryStorage, PurchaseOutcome};
///
/// let seckill = Seckill::new(MemoryStorage::new(), SeckillConfig::default())?;
/// match seckill.attempt_purchase(7, 42).await? {
///     PurchaseOutcome::Admitted(reservation) => create_order(reservation).await,
///     PurchaseOutcome::Rejected(reason) => respond_with(reason),
/// }
/// ```
#[derive(Debug)]
pub struct Seckill<S> {
    config: SeckillConfig,
    storage: Arc<S>,
    admission: AdmissionControl<S>,
    activities: ActivityRepository<S>,
    ledger: StockLedger<S>,
    claims: IdempotencyGuard<S>,
    lock: DistributedLock<S>,
}

impl<S: Storage> Seckill<S> {
    /// Create an orchestrator owning `storage`.
    pub fn new(storage: S, config: SeckillConfig) -> Result<Self> {
        Self::with_shared(Arc::new(storage), config)
    }

    /// Create an orchestrator over a store shared with other components.
    pub fn with_shared(storage: Arc<S>, config: SeckillConfig) -> Result<Self> {
        config.validate()?;

        let prefix = config.key_prefix.clone();
        let admission = AdmissionControl::new(Arc::clone(&storage), prefix.clone(), config.admission.clone())
            .fail_open(config.limiter_fail_open);
        let activities = ActivityRepository::new(Arc::clone(&storage), prefix.clone(), config.activity_retention);
        let ledger = StockLedger::new(activities.clone());
        let claims = IdempotencyGuard::new(Arc::clone(&storage), prefix);
        let lock = DistributedLock::new(Arc::clone(&storage))
            .with_backoff(config.lock.initial_backoff, config.lock.max_backoff);

        Ok(Self {
            config,
            storage,
            admission,
            activities,
            ledger,
            claims,
            lock,
        })
    }

    /// The active configuration.
    pub fn config(&self) -> &SeckillConfig {
        &self.config
    }

    /// The shared store.
    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    /// The admission chain, for runtime quota overrides.
    pub fn admission(&self) -> &AdmissionControl<S> {
        &self.admission
    }

    /// Lock key guarding an activity's stock.
    pub fn stock_lock_key(&self, activity_id: u64) -> String {
        format!("{}:stock:{}", self.config.key_prefix, activity_id)
    }

    fn order_detail_key(&self, order_no: &str) -> String {
        format!("{}:order:detail:{}", self.config.key_prefix, order_no)
    }

    /// Try to buy one unit of `activity_id` for `user_id`.
    pub async fn attempt_purchase(&self, activity_id: u64, user_id: u64) -> Result<PurchaseOutcome> {
        self.attempt_purchase_with(PurchaseRequest::new(activity_id, user_id))
            .await
    }

    /// Try to buy for a fully described request.
    ///
    /// Business rejections, including an unreachable store, come back as
    /// [`PurchaseOutcome::Rejected`]. Errors are reserved for unknown
    /// activities and malformed requests.
    #[tracing::instrument(
        skip(self, request),
        fields(activity_id = request.activity_id, user_id = request.user_id)
    )]
    pub async fn attempt_purchase_with(&self, request: PurchaseRequest) -> Result<PurchaseOutcome> {
        if request.quantity == 0 {
            return Err(SeckillError::InvalidRequest("quantity must be positive".into()));
        }

        match self.admission.check(&request).await {
            Ok(Admission::Admitted) => {}
            Ok(Admission::Denied { rule, retry_after }) => {
                return Ok(reject(RejectionReason::RateLimited { rule, retry_after }));
            }
            Err(err) => return storage_failure(err),
        }

        let activity = match self.activities.load(request.activity_id).await {
            Ok(Some(activity)) => activity,
            Ok(None) => return Err(SeckillError::ActivityNotFound(request.activity_id)),
            Err(err) => return storage_failure(err),
        };

        let status = activity.status_at(current_timestamp_ms());
        if status != ActivityStatus::Active {
            tracing::warn!(%status, "activity not active");
            return Ok(reject(RejectionReason::ActivityNotActive { status }));
        }

        // Fast paths off the lock queue; both are re-checked inside the lock.
        match self.claims.has_participated(request.activity_id, request.user_id).await {
            Ok(true) => {
                tracing::warn!("already participated");
                return Ok(reject(RejectionReason::AlreadyParticipated));
            }
            Ok(false) => {}
            Err(err) => return storage_failure(err),
        }
        if activity.remaining() < u64::from(request.quantity) {
            tracing::warn!(remaining = activity.remaining(), "sold out before lock");
            return Ok(reject(RejectionReason::OutOfStock));
        }

        let lock_key = self.stock_lock_key(request.activity_id);
        let guard = match self
            .lock
            .acquire(&lock_key, self.config.lock.wait_time, self.config.lock.lease_time)
            .await
        {
            Ok(guard) => guard,
            Err(SeckillError::LockTimeout { .. }) => {
                return Ok(reject(RejectionReason::SystemBusy));
            }
            Err(err) => return storage_failure(err),
        };

        let result = self.critical_section(&request).await;
        guard.release_or_alert().await;

        match result {
            Ok(PurchaseOutcome::Admitted(reservation)) => {
                self.hand_off(&reservation).await;
                tracing::info!(
                    order_no = %reservation.order_no,
                    remaining = reservation.remaining,
                    "stock reserved"
                );
                Ok(PurchaseOutcome::Admitted(reservation))
            }
            Ok(rejected) => Ok(rejected),
            Err(err) => storage_failure(err),
        }
    }

    /// Runs with the stock lock held. Keep it to store round trips only.
    async fn critical_section(&self, request: &PurchaseRequest) -> Result<PurchaseOutcome> {
        let (activity_id, user_id) = (request.activity_id, request.user_id);

        let Some(activity) = self.activities.load(activity_id).await? else {
            return Err(SeckillError::ActivityNotFound(activity_id));
        };
        let now = current_timestamp_ms();
        let status = activity.status_at(now);
        if status != ActivityStatus::Active {
            tracing::warn!(%status, "activity closed while queued");
            return Ok(reject(RejectionReason::ActivityNotActive { status }));
        }

        let claim_ttl = self.claim_ttl(&activity, now);
        if !self.claims.try_claim(activity_id, user_id, claim_ttl).await? {
            tracing::warn!("already participated");
            return Ok(reject(RejectionReason::AlreadyParticipated));
        }

        let deduction = match self.ledger.deduct(activity_id, u64::from(request.quantity)).await {
            Ok(deduction) => deduction,
            Err(err) => {
                self.revoke_claim(activity_id, user_id).await;
                return Err(err);
            }
        };

        match deduction {
            Deduction::Deducted { remaining } => {
                let reservation = Reservation::new(
                    activity_id,
                    user_id,
                    request.quantity,
                    remaining,
                    current_timestamp_ms(),
                );
                let outcome = ClaimOutcome::Won {
                    token: reservation.token,
                    order_no: reservation.order_no.clone(),
                };
                // The deduction stands either way; a pending claim still blocks repeats.
                if let Err(err) = self
                    .claims
                    .record_outcome(activity_id, user_id, &outcome, claim_ttl)
                    .await
                {
                    tracing::warn!(error = %err, "could not settle claim as won");
                }
                Ok(PurchaseOutcome::Admitted(reservation))
            }
            Deduction::Insufficient { remaining } => {
                tracing::warn!(remaining, "out of stock");
                match self.config.claim_policy {
                    ClaimPolicy::KeepOnSoldOut => {
                        if let Err(err) = self
                            .claims
                            .record_outcome(activity_id, user_id, &ClaimOutcome::SoldOut, claim_ttl)
                            .await
                        {
                            tracing::warn!(error = %err, "could not settle claim as sold out");
                        }
                    }
                    ClaimPolicy::ReleaseOnSoldOut => self.revoke_claim(activity_id, user_id).await,
                }
                Ok(reject(RejectionReason::OutOfStock))
            }
        }
    }

    fn claim_ttl(&self, activity: &Activity, now: u64) -> std::time::Duration {
        activity.ttl(now, self.config.idempotency_grace)
    }

    async fn revoke_claim(&self, activity_id: u64, user_id: u64) {
        if let Err(err) = self.claims.revoke(activity_id, user_id).await {
            tracing::error!(
                activity_id,
                user_id,
                error = %err,
                "claim rollback failed, user stays blocked until the claim expires"
            );
        }
    }

    /// Publish the reservation for the order service. Runs after the lock is released.
    async fn hand_off(&self, reservation: &Reservation) {
        let entry = match StorageEntry::with_payload(reservation, reservation.reserved_at) {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!(error = %err, "could not encode order detail");
                return;
            }
        };
        if let Err(err) = self
            .storage
            .set(
                &self.order_detail_key(&reservation.order_no),
                entry,
                self.config.order_detail_ttl,
            )
            .await
        {
            tracing::warn!(order_no = %reservation.order_no, error = %err, "could not store order detail");
        }
    }

    /// The hand-off record for `order_no`, while it lives.
    pub async fn order_detail(&self, order_no: &str) -> Result<Option<Reservation>> {
        match self.storage.get(&self.order_detail_key(order_no)).await? {
            Some(entry) => Ok(entry.decode_payload()?),
            None => Ok(None),
        }
    }

    /// Units left for the activity.
    pub async fn remaining_stock(&self, activity_id: u64) -> Result<u64> {
        self.ledger.remaining(activity_id).await
    }

    /// Whether the user holds a claim on the activity.
    pub async fn has_participated(&self, activity_id: u64, user_id: u64) -> Result<bool> {
        self.claims.has_participated(activity_id, user_id).await
    }

    /// The user's claim outcome on the activity, if any.
    pub async fn claim_outcome(&self, activity_id: u64, user_id: u64) -> Result<Option<ClaimOutcome>> {
        self.claims.lookup(activity_id, user_id).await
    }

    /// The activity record, if it exists.
    pub async fn activity(&self, activity_id: u64) -> Result<Option<Activity>> {
        self.activities.load(activity_id).await
    }

    /// Register a new activity.
    #[tracing::instrument(skip(self, activity), fields(activity_id = activity.id))]
    pub async fn create_activity(&self, activity: &Activity) -> Result<()> {
        self.activities.create(activity).await
    }

    /// Set the stock of an activity before its sale window opens.
    ///
    /// Takes the stock lock, so it never interleaves with a deduction. Fails
    /// with `InvalidActivity` once the sale has opened or sold anything.
    #[tracing::instrument(skip(self))]
    pub async fn init_stock(&self, activity_id: u64, total_stock: u64) -> Result<()> {
        self.lock
            .with_lock(
                &self.stock_lock_key(activity_id),
                self.config.lock.wait_time,
                self.config.lock.lease_time,
                || self.ledger.init_stock(activity_id, total_stock),
            )
            .await?
    }

    /// Cancel an activity. Returns `false` if it does not exist.
    #[tracing::instrument(skip(self))]
    pub async fn cancel_activity(&self, activity_id: u64) -> Result<bool> {
        self.activities.cancel(activity_id).await
    }
}

fn reject(reason: RejectionReason) -> PurchaseOutcome {
    PurchaseOutcome::Rejected(reason)
}

fn storage_failure(err: SeckillError) -> Result<PurchaseOutcome> {
    if err.is_storage_failure() {
        tracing::error!(error = %err, "store unavailable");
        Ok(reject(RejectionReason::StorageFailure))
    } else {
        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::admission::{AdmissionRule, KeyScope};
    use crate::quota::Quota;
    use crate::storage::MemoryStorage;

    fn open_activity(id: u64, total_stock: u64) -> Activity {
        let now = current_timestamp_ms();
        Activity::new(id, 500, total_stock, now - 1000, now + 60_000)
    }

    async fn seckill_with(total_stock: u64) -> Seckill<MemoryStorage> {
        let seckill = Seckill::new(MemoryStorage::new(), SeckillConfig::default()).unwrap();
        seckill.create_activity(&open_activity(1, total_stock)).await.unwrap();
        seckill
    }

    #[tokio::test]
    async fn test_purchase_reserves_stock() {
        let seckill = seckill_with(2).await;

        let outcome = seckill.attempt_purchase(1, 10).await.unwrap();
        let reservation = outcome.reservation().unwrap().clone();
        assert_eq!(reservation.remaining, 1);
        assert_eq!(reservation.quantity, 1);
        assert!(reservation.order_no.starts_with("SK110"));

        assert_eq!(seckill.remaining_stock(1).await.unwrap(), 1);
        assert!(seckill.has_participated(1, 10).await.unwrap());
        assert_eq!(
            seckill.claim_outcome(1, 10).await.unwrap(),
            Some(ClaimOutcome::Won {
                token: reservation.token,
                order_no: reservation.order_no.clone(),
            })
        );
        assert_eq!(
            seckill.order_detail(&reservation.order_no).await.unwrap(),
            Some(reservation)
        );
        assert!(!seckill.lock.is_locked(&seckill.stock_lock_key(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_second_attempt_already_participated() {
        let seckill = seckill_with(5).await;

        assert!(seckill.attempt_purchase(1, 10).await.unwrap().is_admitted());
        assert_eq!(
            seckill.attempt_purchase(1, 10).await.unwrap(),
            PurchaseOutcome::Rejected(RejectionReason::AlreadyParticipated)
        );
        assert_eq!(seckill.remaining_stock(1).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_unknown_activity_is_an_error() {
        let seckill = seckill_with(1).await;
        assert!(matches!(
            seckill.attempt_purchase(99, 1).await,
            Err(SeckillError::ActivityNotFound(99))
        ));
    }

    #[tokio::test]
    async fn test_zero_quantity_is_an_error() {
        let seckill = seckill_with(1).await;
        let request = PurchaseRequest::new(1, 1).with_quantity(0);
        assert!(matches!(
            seckill.attempt_purchase_with(request).await,
            Err(SeckillError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_not_started_and_cancelled() {
        let seckill = Seckill::new(MemoryStorage::new(), SeckillConfig::default()).unwrap();
        let now = current_timestamp_ms();
        seckill
            .create_activity(&Activity::new(2, 1, 5, now + 60_000, now + 120_000))
            .await
            .unwrap();
        seckill.create_activity(&open_activity(3, 5)).await.unwrap();
        assert!(seckill.cancel_activity(3).await.unwrap());

        assert_eq!(
            seckill.attempt_purchase(2, 1).await.unwrap(),
            PurchaseOutcome::Rejected(RejectionReason::ActivityNotActive {
                status: ActivityStatus::NotStarted
            })
        );
        assert_eq!(
            seckill.attempt_purchase(3, 1).await.unwrap(),
            PurchaseOutcome::Rejected(RejectionReason::ActivityNotActive {
                status: ActivityStatus::Cancelled
            })
        );
        assert!(!seckill.has_participated(3, 1).await.unwrap());
    }

    #[tokio::test]
    async fn test_rate_limited_before_lock() {
        let config = SeckillConfig::default().with_admission(vec![AdmissionRule::sliding_window(
            "user",
            KeyScope::ActivityUser,
            Quota::per_minute(1),
        )]);
        let seckill = Seckill::new(MemoryStorage::new(), config).unwrap();
        seckill.create_activity(&open_activity(1, 0)).await.unwrap();

        assert_eq!(
            seckill.attempt_purchase(1, 1).await.unwrap(),
            PurchaseOutcome::Rejected(RejectionReason::OutOfStock)
        );
        let outcome = seckill.attempt_purchase(1, 1).await.unwrap();
        assert!(matches!(
            outcome.rejection(),
            Some(RejectionReason::RateLimited { rule, .. }) if rule == "user"
        ));
    }

    #[tokio::test]
    async fn test_lock_timeout_is_system_busy() {
        let config = SeckillConfig::default().with_lock_wait(Duration::from_millis(30));
        let seckill = Seckill::new(MemoryStorage::new(), config).unwrap();
        seckill.create_activity(&open_activity(1, 5)).await.unwrap();

        let held = seckill
            .lock
            .try_acquire(&seckill.stock_lock_key(1), Duration::from_secs(10))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(
            seckill.attempt_purchase(1, 1).await.unwrap(),
            PurchaseOutcome::Rejected(RejectionReason::SystemBusy)
        );
        // Nothing was claimed or deducted.
        assert!(!seckill.has_participated(1, 1).await.unwrap());
        assert_eq!(seckill.remaining_stock(1).await.unwrap(), 5);

        held.release().await.unwrap();
        assert!(seckill.attempt_purchase(1, 1).await.unwrap().is_admitted());
    }

    #[tokio::test]
    async fn test_multi_unit_purchase() {
        let seckill = seckill_with(3).await;

        let outcome = seckill
            .attempt_purchase_with(PurchaseRequest::new(1, 1).with_quantity(2))
            .await
            .unwrap();
        assert_eq!(outcome.reservation().map(|r| r.remaining), Some(1));

        let outcome = seckill
            .attempt_purchase_with(PurchaseRequest::new(1, 2).with_quantity(2))
            .await
            .unwrap();
        assert_eq!(outcome, PurchaseOutcome::Rejected(RejectionReason::OutOfStock));
    }

    #[tokio::test]
    async fn test_init_stock_only_before_opening() {
        let seckill = Seckill::new(MemoryStorage::new(), SeckillConfig::default()).unwrap();
        let now = current_timestamp_ms();
        seckill
            .create_activity(&Activity::new(2, 1, 1, now + 60_000, now + 120_000))
            .await
            .unwrap();
        seckill.init_stock(2, 3).await.unwrap();
        assert_eq!(seckill.remaining_stock(2).await.unwrap(), 3);

        seckill.create_activity(&open_activity(1, 1)).await.unwrap();
        assert!(seckill.attempt_purchase(1, 1).await.unwrap().is_admitted());
        assert!(matches!(
            seckill.init_stock(1, 3).await,
            Err(SeckillError::InvalidActivity(_))
        ));
        assert_eq!(seckill.remaining_stock(1).await.unwrap(), 0);
        assert_eq!(
            seckill.attempt_purchase(1, 2).await.unwrap().rejection(),
            Some(&RejectionReason::OutOfStock)
        );
        assert!(!seckill.lock.is_locked(&seckill.stock_lock_key(1)).await.unwrap());

        assert!(matches!(
            seckill.init_stock(9, 3).await,
            Err(SeckillError::ActivityNotFound(9))
        ));
    }
}
