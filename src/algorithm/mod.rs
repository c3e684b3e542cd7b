//! Admission limiter trait and implementations.
//!
//! Limiters shed load before it reaches the contended stock lock. Each key's
//! state is independent: a check never touches any other key, and every
//! check-and-record is a single atomic storage operation.
//!
//! # Available Algorithms
//!
//! - **Token Bucket**: smoothed admission with a shared rate and burst capacity
//! - **Sliding Window**: hard cap on requests within a rolling interval

mod sliding_window;
mod token_bucket;

pub use sliding_window::SlidingWindow;
pub use token_bucket::TokenBucket;

use std::fmt;
use std::future::Future;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::decision::Decision;
use crate::error::{ConfigError, Result, SeckillError};
use crate::quota::Quota;
use crate::storage::Storage;

pub(crate) use crate::storage::current_timestamp_ms;

/// Admission limiter trait.
///
/// Implementations never block: every method returns as soon as its single
/// storage round trip completes.
pub trait Algorithm: Send + Sync + 'static {
    /// Get the algorithm name (for logging/metrics).
    fn name(&self) -> &'static str;

    /// Check whether `permits` units are available AND consume them atomically.
    ///
    /// A denied request consumes nothing.
    fn check_and_record_n<S: Storage>(
        &self,
        storage: &S,
        key: &str,
        quota: &Quota,
        permits: u64,
    ) -> impl Future<Output = Result<Decision>> + Send;

    /// Check and record a single request.
    fn check_and_record<S: Storage>(
        &self,
        storage: &S,
        key: &str,
        quota: &Quota,
    ) -> impl Future<Output = Result<Decision>> + Send {
        self.check_and_record_n(storage, key, quota, 1)
    }

    /// Check without recording (peek at current state).
    fn check<S: Storage>(
        &self,
        storage: &S,
        key: &str,
        quota: &Quota,
    ) -> impl Future<Output = Result<Decision>> + Send;

    /// Reset the limiter state for a key.
    fn reset<S: Storage>(&self, storage: &S, key: &str) -> impl Future<Output = Result<()>> + Send {
        async move { storage.delete(key).await }
    }
}

/// Name-keyed table of the built-in limiter strategies.
///
/// Configuration refers to limiters by name; the name is resolved here,
/// once, into a concrete strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimiterKind {
    /// [`TokenBucket`]
    TokenBucket,
    /// [`SlidingWindow`]
    SlidingWindow,
}

impl LimiterKind {
    /// Every registered strategy.
    pub const ALL: [LimiterKind; 2] = [LimiterKind::TokenBucket, LimiterKind::SlidingWindow];

    /// The name this strategy is registered under.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TokenBucket => "token_bucket",
            Self::SlidingWindow => "sliding_window",
        }
    }
}

impl fmt::Display for LimiterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LimiterKind {
    type Err = SeckillError;

    fn from_str(name: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == name)
            .ok_or_else(|| ConfigError::UnknownAlgorithm(name.to_string()).into())
    }
}

impl Algorithm for LimiterKind {
    fn name(&self) -> &'static str {
        self.as_str()
    }

    async fn check_and_record_n<S: Storage>(
        &self,
        storage: &S,
        key: &str,
        quota: &Quota,
        permits: u64,
    ) -> Result<Decision> {
        match self {
            Self::TokenBucket => TokenBucket.check_and_record_n(storage, key, quota, permits).await,
            Self::SlidingWindow => SlidingWindow.check_and_record_n(storage, key, quota, permits).await,
        }
    }

    async fn check<S: Storage>(&self, storage: &S, key: &str, quota: &Quota) -> Result<Decision> {
        match self {
            Self::TokenBucket => TokenBucket.check(storage, key, quota).await,
            Self::SlidingWindow => SlidingWindow.check(storage, key, quota).await,
        }
    }
}
