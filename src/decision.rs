//! Decision types for limiter results.
//!
//! When a limiter check is performed, the result is a `Decision` that indicates
//! whether the request is admitted or rejected, along with the limiter state
//! that produced it.

use std::time::Duration;

/// The result of a limiter check.
#[derive(Debug, Clone)]
pub struct Decision {
    allowed: bool,
    info: RateLimitInfo,
}

impl Decision {
    /// Create a new "allowed" decision.
    pub fn allowed(info: RateLimitInfo) -> Self {
        Self {
            allowed: true,
            info,
        }
    }

    /// Create a new "denied" decision.
    pub fn denied(info: RateLimitInfo) -> Self {
        Self {
            allowed: false,
            info,
        }
    }

    /// Check if the request is allowed.
    pub fn is_allowed(&self) -> bool {
        self.allowed
    }

    /// Check if the request is denied.
    pub fn is_denied(&self) -> bool {
        !self.allowed
    }

    /// Get the limiter info.
    pub fn info(&self) -> &RateLimitInfo {
        &self.info
    }

    /// Consume the decision and return the info.
    pub fn into_info(self) -> RateLimitInfo {
        self.info
    }
}

/// Limiter state at the moment of a decision.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitInfo {
    /// Maximum requests (or bucket capacity).
    pub limit: u64,
    /// Requests (or whole tokens) still available after this decision.
    pub remaining: u64,
    /// How long to wait before retrying (only set when denied).
    pub retry_after: Option<Duration>,
    /// Name of the algorithm that made this decision.
    pub algorithm: Option<&'static str>,
}

impl RateLimitInfo {
    /// Create a new rate limit info.
    pub fn new(limit: u64, remaining: u64) -> Self {
        Self {
            limit,
            remaining,
            retry_after: None,
            algorithm: None,
        }
    }

    /// Set the retry-after duration.
    pub fn with_retry_after(mut self, duration: Duration) -> Self {
        self.retry_after = Some(duration);
        self
    }

    /// Set the algorithm name.
    pub fn with_algorithm(mut self, name: &'static str) -> Self {
        self.algorithm = Some(name);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_allowed() {
        let decision = Decision::allowed(RateLimitInfo::new(100, 99));

        assert!(decision.is_allowed());
        assert!(!decision.is_denied());
        assert_eq!(decision.info().limit, 100);
        assert_eq!(decision.info().remaining, 99);
    }

    #[test]
    fn test_decision_denied() {
        let info = RateLimitInfo::new(100, 0)
            .with_retry_after(Duration::from_secs(30))
            .with_algorithm("sliding_window");
        let decision = Decision::denied(info);

        assert!(decision.is_denied());
        let info = decision.into_info();
        assert_eq!(info.retry_after, Some(Duration::from_secs(30)));
        assert_eq!(info.algorithm, Some("sliding_window"));
    }
}
