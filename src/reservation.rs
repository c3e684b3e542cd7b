//! Purchase requests and their outcomes.

use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::activity::ActivityStatus;
use crate::key::{HasActivityId, HasIpAddr, HasUserId};

/// One participant's attempt to buy from one activity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurchaseRequest {
    /// Target activity.
    pub activity_id: u64,
    /// Buying user.
    pub user_id: u64,
    /// Client address, when the transport knows it.
    pub client_ip: Option<IpAddr>,
    /// Units requested.
    pub quantity: u32,
}

impl PurchaseRequest {
    /// A single-unit request with no client address.
    pub fn new(activity_id: u64, user_id: u64) -> Self {
        Self {
            activity_id,
            user_id,
            client_ip: None,
            quantity: 1,
        }
    }

    /// Attach the client address.
    pub fn with_client_ip(mut self, ip: IpAddr) -> Self {
        self.client_ip = Some(ip);
        self
    }

    /// Request `quantity` units instead of one.
    pub fn with_quantity(mut self, quantity: u32) -> Self {
        self.quantity = quantity;
        self
    }
}

impl HasActivityId for PurchaseRequest {
    fn activity_id(&self) -> u64 {
        self.activity_id
    }
}

impl HasUserId for PurchaseRequest {
    fn user_id(&self) -> u64 {
        self.user_id
    }
}

impl HasIpAddr for PurchaseRequest {
    fn client_ip(&self) -> Option<IpAddr> {
        self.client_ip
    }
}

/// Stock held for one user, handed to the order service by value.
///
/// The core never writes the order itself; the caller persists it under
/// `token` / `order_no`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    /// Activity the stock came from.
    pub activity_id: u64,
    /// Winning user.
    pub user_id: u64,
    /// Units deducted.
    pub quantity: u32,
    /// Correlates the deduction with the eventual order record.
    pub token: Uuid,
    /// Human-readable order number.
    pub order_no: String,
    /// Stock left after this deduction.
    pub remaining: u64,
    /// Unix milliseconds of the deduction.
    pub reserved_at: u64,
}

impl Reservation {
    pub(crate) fn new(
        activity_id: u64,
        user_id: u64,
        quantity: u32,
        remaining: u64,
        reserved_at: u64,
    ) -> Self {
        let token = Uuid::now_v7();
        Self {
            activity_id,
            user_id,
            quantity,
            order_no: order_number(activity_id, user_id, reserved_at),
            token,
            remaining,
            reserved_at,
        }
    }
}

/// `SK{activity}{user}{millis}{first 8 hex digits of a random id, upper case}`.
fn order_number(activity_id: u64, user_id: u64, millis: u64) -> String {
    let nonce = Uuid::new_v4().simple().to_string();
    format!(
        "SK{}{}{}{}",
        activity_id,
        user_id,
        millis,
        nonce[..8].to_ascii_uppercase()
    )
}

/// Why a purchase was turned away.
///
/// Every variant leaves the ledger untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectionReason {
    /// An admission limiter refused the request.
    RateLimited {
        /// Name of the refusing rule.
        rule: String,
        /// Suggested wait before retrying.
        retry_after: Option<Duration>,
    },
    /// The activity is not running right now.
    ActivityNotActive {
        /// Status computed at the time of the request.
        status: ActivityStatus,
    },
    /// The stock lock could not be acquired in time.
    SystemBusy,
    /// This user already holds a claim on the activity.
    AlreadyParticipated,
    /// No stock left.
    OutOfStock,
    /// The shared store failed; nothing was claimed or deducted.
    StorageFailure,
}

impl RejectionReason {
    /// Whether repeating the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::SystemBusy | Self::StorageFailure
        )
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::ActivityNotActive { .. } => "activity_not_active",
            Self::SystemBusy => "system_busy",
            Self::AlreadyParticipated => "already_participated",
            Self::OutOfStock => "out_of_stock",
            Self::StorageFailure => "storage_failure",
        }
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RateLimited { rule, .. } => write!(f, "too many requests ({rule})"),
            Self::ActivityNotActive { status } => write!(f, "activity is {status}"),
            Self::SystemBusy => f.write_str("system busy, try again later"),
            Self::AlreadyParticipated => f.write_str("already participated in this activity"),
            Self::OutOfStock => f.write_str("out of stock"),
            Self::StorageFailure => f.write_str("storage unavailable"),
        }
    }
}

/// Result of [`Seckill::attempt_purchase`](crate::Seckill::attempt_purchase).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PurchaseOutcome {
    /// Stock was deducted for the user.
    Admitted(Reservation),
    /// The request was turned away.
    Rejected(RejectionReason),
}

impl PurchaseOutcome {
    /// Check if stock was reserved.
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted(_))
    }

    /// The reservation, if admitted.
    pub fn reservation(&self) -> Option<&Reservation> {
        match self {
            Self::Admitted(reservation) => Some(reservation),
            Self::Rejected(_) => None,
        }
    }

    /// The rejection reason, if rejected.
    pub fn rejection(&self) -> Option<&RejectionReason> {
        match self {
            Self::Admitted(_) => None,
            Self::Rejected(reason) => Some(reason),
        }
    }
}
