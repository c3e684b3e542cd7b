//! Limiter key extraction.
//!
//! A key decides which requests share one limiter state. For a flash sale
//! the useful groupings are per activity (protect the stock lock from the
//! whole crowd), per user within an activity (stop one client hammering) and
//! per activity and client IP (stop one host with many accounts).
//!
//! # Example
//!
//! ```ignore
//! use seckill_core::key::{ActivityKey, CompositeKey, IpKey, Key};
//!
//! // "activity:7:ip:10.0.0.1"
//! let key = CompositeKey::new(ActivityKey::new(), IpKey::new());
//! ```

mod composite;
mod extractors;

pub use composite::{CompositeKey, OptionalKey};
pub use extractors::*;

/// Trait for extracting limiter keys from requests.
///
/// Return `None` if the key cannot be extracted (e.g., no client IP was
/// supplied); the admission rule using it is then skipped.
pub trait Key<R>: Send + Sync + 'static {
    /// Extract a limiter key from the request.
    fn extract(&self, request: &R) -> Option<String>;

    /// Get the key name for logging.
    fn name(&self) -> &'static str;
}

/// A constant key that applies the same limit to all requests.
#[derive(Debug, Clone, Default)]
pub struct GlobalKey;

impl GlobalKey {
    /// Create a new global key.
    pub fn new() -> Self {
        Self
    }
}

impl<R> Key<R> for GlobalKey {
    fn extract(&self, _request: &R) -> Option<String> {
        Some("global".to_string())
    }

    fn name(&self) -> &'static str {
        "global"
    }
}

/// A key computed by a closure.
#[derive(Clone)]
pub struct FnKey<F> {
    extractor: F,
    name: &'static str,
}

impl<F> std::fmt::Debug for FnKey<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnKey").field("name", &self.name).finish()
    }
}

impl<F> FnKey<F> {
    /// Create a new function-based key extractor.
    pub fn new(name: &'static str, extractor: F) -> Self {
        Self { extractor, name }
    }
}

impl<R, F> Key<R> for FnKey<F>
where
    F: Fn(&R) -> Option<String> + Send + Sync + 'static,
{
    fn extract(&self, request: &R) -> Option<String> {
        (self.extractor)(request)
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

/// A key that always returns a static value.
#[derive(Debug, Clone)]
pub struct StaticKey {
    key: String,
}

impl StaticKey {
    /// Create a new static key.
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

impl<R> Key<R> for StaticKey {
    fn extract(&self, _request: &R) -> Option<String> {
        Some(self.key.clone())
    }

    fn name(&self) -> &'static str {
        "static"
    }
}
