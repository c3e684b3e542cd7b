//! Flash-sale ("seckill") admission and stock deduction core.
//!
//! `seckill_core` decides, for each purchase attempt against a time-boxed
//! sale of strictly limited stock, whether the attempt wins a unit. It never
//! oversells, lets each user win at most once per activity, and sheds load
//! before it reaches the contended stock.
//!
//! - **Admission Limiters**: sliding window per user, token bucket per activity
//! - **Distributed Lock**: token-owned, lease-bounded, released on every exit path
//! - **Activity State Machine**: status recomputed from the clock on every request
//! - **Stock Ledger**: atomic re-read-and-deduct inside the lock
//! - **Idempotency Guard**: one claim per (activity, user)
//! - **Pluggable Storage**: in-memory with GC, Redis with connection pooling
//!
//! # Quick Start
//!
//! ```ignore
//! use seckill_core::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> seckill_core::Result<()> {
//!     let seckill = Seckill::new(MemoryStorage::new(), SeckillConfig::default())?;
//!
//!     let now = current_timestamp_ms();
//!     seckill
//!         .create_activity(&Activity::new(7, 1001, 100, now, now + 3_600_000))
//!         .await?;
//!
//!     match seckill.attempt_purchase(7, 42).await? {
//!         PurchaseOutcome::Admitted(reservation) => {
//!             println!("reserved, order {}", reservation.order_no);
//!         }
//!         PurchaseOutcome::Rejected(reason) => {
//!             println!("rejected: {reason} (retry: {})", reason.is_retryable());
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Protocol
//!
//! | Step | Component | Rejection |
//! |------|-----------|-----------|
//! | 1 | Admission limiters | `RateLimited` |
//! | 2 | Activity status | `ActivityNotActive` |
//! | 3 | Stock lock | `SystemBusy` |
//! | 4 | Idempotency claim (in lock) | `AlreadyParticipated` |
//! | 5 | Ledger deduction (in lock) | `OutOfStock` |
//! | any | Shared store failure | `StorageFailure` |
//!
//! # Feature Flags
//!
//! - `memory` (default): In-memory storage with garbage collection
//! - `redis`: Redis storage backend
//! - `full`: Both backends

pub mod activity;
pub mod admission;
pub mod algorithm;
pub mod config;
pub mod decision;
pub mod error;
pub mod idempotency;
pub mod key;
pub mod ledger;
pub mod lock;
pub mod orchestrator;
pub mod quota;
pub mod reservation;
pub mod storage;

// Re-export main types
pub use activity::{Activity, ActivityRepository, ActivityStatus};
pub use admission::{Admission, AdmissionControl, AdmissionRule, KeyScope};
pub use algorithm::{Algorithm, LimiterKind, SlidingWindow, TokenBucket};
pub use config::{ClaimPolicy, LockConfig, SeckillConfig, SeckillEnv};
pub use decision::{Decision, RateLimitInfo};
pub use error::{ConfigError, ConnectionError, Result, SeckillError, StorageError};
pub use idempotency::{ClaimOutcome, IdempotencyGuard};
pub use key::{ActivityKey, CompositeKey, FnKey, GlobalKey, IpKey, Key, StaticKey, UserKey};
pub use ledger::{Deduction, StockLedger};
pub use lock::{DistributedLock, LockGuard};
pub use orchestrator::Seckill;
pub use quota::{Quota, QuotaBuilder};
pub use reservation::{PurchaseOutcome, PurchaseRequest, RejectionReason, Reservation};
pub use storage::{Mutation, Storage, StorageEntry, current_timestamp_ms};

// Re-export storage types
#[cfg(feature = "memory")]
pub use storage::{GcConfig, GcInterval, MemoryStorage};

#[cfg(feature = "redis")]
pub use storage::{RedisConfig, RedisStorage};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::activity::{Activity, ActivityStatus};
    pub use crate::config::{ClaimPolicy, SeckillConfig};
    pub use crate::error::{Result, SeckillError};
    pub use crate::orchestrator::Seckill;
    pub use crate::reservation::{PurchaseOutcome, PurchaseRequest, RejectionReason, Reservation};
    pub use crate::storage::{Storage, current_timestamp_ms};

    #[cfg(feature = "memory")]
    pub use crate::storage::{GcConfig, GcInterval, MemoryStorage};

    #[cfg(feature = "redis")]
    pub use crate::storage::{RedisConfig, RedisStorage};
}
