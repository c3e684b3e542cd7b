//! Pre-built key extractors for purchase requests.
//!
//! These extractors are generic and work with any request type that exposes
//! the necessary data through the `Has*` traits.

use std::net::IpAddr;

use crate::key::Key;

/// Trait for requests that target an activity.
pub trait HasActivityId {
    /// Get the activity id.
    fn activity_id(&self) -> u64;
}

/// Trait for requests made by an identified user.
pub trait HasUserId {
    /// Get the user id.
    fn user_id(&self) -> u64;
}

/// Trait for requests that have a client IP address.
pub trait HasIpAddr {
    /// Get the client IP address.
    fn client_ip(&self) -> Option<IpAddr>;
}

/// Extract key from the activity id.
#[derive(Debug, Clone, Default)]
pub struct ActivityKey;

impl ActivityKey {
    /// Create a new activity key extractor.
    pub fn new() -> Self {
        Self
    }
}

impl<R: HasActivityId> Key<R> for ActivityKey {
    fn extract(&self, request: &R) -> Option<String> {
        Some(format!("activity:{}", request.activity_id()))
    }

    fn name(&self) -> &'static str {
        "activity"
    }
}

/// Extract key from the user id.
#[derive(Debug, Clone, Default)]
pub struct UserKey;

impl UserKey {
    /// Create a new user key extractor.
    pub fn new() -> Self {
        Self
    }
}

impl<R: HasUserId> Key<R> for UserKey {
    fn extract(&self, request: &R) -> Option<String> {
        Some(format!("user:{}", request.user_id()))
    }

    fn name(&self) -> &'static str {
        "user"
    }
}

/// Extract key from the client IP address.
#[derive(Debug, Clone, Default)]
pub struct IpKey;

impl IpKey {
    /// Create a new IP key extractor.
    pub fn new() -> Self {
        Self
    }
}

impl<R: HasIpAddr> Key<R> for IpKey {
    fn extract(&self, request: &R) -> Option<String> {
        request.client_ip().map(|ip| format!("ip:{}", ip))
    }

    fn name(&self) -> &'static str {
        "ip"
    }
}
