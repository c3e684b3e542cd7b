//! Admission control in front of the stock lock.
//!
//! An [`AdmissionControl`] runs an ordered list of limiter rules against a
//! purchase request and stops at the first denial. Each rule names its
//! limiter strategy, the scope its key is drawn from, and a quota; a rule's
//! quota can be overridden per activity at runtime.
//!
//! # Example
//!
//! ```ignore
//! use seckill_core::admission::{AdmissionControl, AdmissionRule, KeyScope};
//! use seckill_core::Quota;
//!
//! let rules = vec![
//!     AdmissionRule::sliding_window("user", KeyScope::ActivityUser, Quota::per_minute(10)),
//!     AdmissionRule::token_bucket("activity", KeyScope::Activity, Quota::bucket(1000.0, 1000)),
//! ];
//! let admission = AdmissionControl::new(storage, "seckill", rules);
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::algorithm::{Algorithm, LimiterKind};
use crate::error::{ConfigError, Result};
use crate::key::{ActivityKey, CompositeKey, GlobalKey, IpKey, Key, UserKey};
use crate::quota::Quota;
use crate::reservation::PurchaseRequest;
use crate::storage::Storage;

/// Which part of a request a rule's limiter key is drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyScope {
    /// One limiter per activity.
    Activity,
    /// One limiter per user, across activities.
    User,
    /// One limiter per user within an activity.
    ActivityUser,
    /// One limiter per client IP within an activity; skipped without an IP.
    ActivityIp,
    /// One limiter for everything.
    Global,
}

impl KeyScope {
    /// The limiter key for `request`, `None` if the request lacks the data.
    pub fn key_for(&self, request: &PurchaseRequest) -> Option<String> {
        match self {
            Self::Activity => ActivityKey::new().extract(request),
            Self::User => UserKey::new().extract(request),
            Self::ActivityUser => CompositeKey::new(ActivityKey::new(), UserKey::new()).extract(request),
            Self::ActivityIp => CompositeKey::new(ActivityKey::new(), IpKey::new()).extract(request),
            Self::Global => Key::<PurchaseRequest>::extract(&GlobalKey::new(), request),
        }
    }
}

/// One limiter check in the admission chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdmissionRule {
    /// Rule name, used in store keys and rejections.
    pub name: String,
    /// Limiter strategy.
    pub algorithm: LimiterKind,
    /// Key scope.
    pub scope: KeyScope,
    /// Default quota.
    pub quota: Quota,
}

impl AdmissionRule {
    /// Create a rule.
    pub fn new(name: impl Into<String>, algorithm: LimiterKind, scope: KeyScope, quota: Quota) -> Self {
        Self {
            name: name.into(),
            algorithm,
            scope,
            quota,
        }
    }

    /// A sliding window rule.
    pub fn sliding_window(name: impl Into<String>, scope: KeyScope, quota: Quota) -> Self {
        Self::new(name, LimiterKind::SlidingWindow, scope, quota)
    }

    /// A token bucket rule.
    pub fn token_bucket(name: impl Into<String>, scope: KeyScope, quota: Quota) -> Self {
        Self::new(name, LimiterKind::TokenBucket, scope, quota)
    }

    /// The default chain: 10 attempts per user per activity per minute,
    /// then a shared bucket per activity.
    pub fn defaults() -> Vec<Self> {
        vec![
            Self::sliding_window("user", KeyScope::ActivityUser, Quota::per_minute(10)),
            Self::token_bucket("activity", KeyScope::Activity, Quota::bucket(1000.0, 1000)),
        ]
    }
}

/// Result of running the admission chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Every rule admitted the request.
    Admitted,
    /// A rule denied the request.
    Denied {
        /// The denying rule.
        rule: String,
        /// Suggested wait before retrying.
        retry_after: Option<Duration>,
    },
}

impl Admission {
    /// Check if the request may proceed.
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted)
    }
}

/// Ordered limiter chain over a shared store.
pub struct AdmissionControl<S> {
    storage: Arc<S>,
    prefix: String,
    rules: Vec<AdmissionRule>,
    overrides: RwLock<HashMap<(u64, String), Quota>>,
    fail_open: bool,
}

impl<S> std::fmt::Debug for AdmissionControl<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionControl")
            .field("prefix", &self.prefix)
            .field("rules", &self.rules)
            .field("overrides", &self.overrides.read().len())
            .field("fail_open", &self.fail_open)
            .finish()
    }
}

impl<S: Storage> AdmissionControl<S> {
    /// Create a chain storing limiter state under `{prefix}:rl:`.
    pub fn new(storage: Arc<S>, prefix: impl Into<String>, rules: Vec<AdmissionRule>) -> Self {
        Self {
            storage,
            prefix: prefix.into(),
            rules,
            overrides: RwLock::new(HashMap::new()),
            fail_open: false,
        }
    }

    /// Admit requests when the limiter store fails instead of erroring.
    pub fn fail_open(mut self, fail_open: bool) -> Self {
        self.fail_open = fail_open;
        self
    }

    /// The configured rules, in evaluation order.
    pub fn rules(&self) -> &[AdmissionRule] {
        &self.rules
    }

    /// Replace `rule`'s quota for one activity.
    pub fn override_quota(&self, activity_id: u64, rule: &str, quota: Quota) -> Result<()> {
        quota.validate()?;
        if !self.rules.iter().any(|r| r.name == rule) {
            return Err(ConfigError::InvalidQuota(format!("no admission rule named {rule:?}")).into());
        }
        self.overrides.write().insert((activity_id, rule.to_string()), quota);
        tracing::info!(activity_id, rule, "admission quota overridden");
        Ok(())
    }

    /// Drop an override. Returns `true` if one existed.
    pub fn clear_override(&self, activity_id: u64, rule: &str) -> bool {
        self.overrides
            .write()
            .remove(&(activity_id, rule.to_string()))
            .is_some()
    }

    /// The quota `rule` applies to `activity_id`.
    pub fn quota_for(&self, activity_id: u64, rule: &AdmissionRule) -> Quota {
        self.overrides
            .read()
            .get(&(activity_id, rule.name.clone()))
            .cloned()
            .unwrap_or_else(|| rule.quota.clone())
    }

    fn storage_key(&self, rule: &AdmissionRule, key: &str) -> String {
        format!("{}:rl:{}:{}", self.prefix, rule.name, key)
    }

    /// Run every rule in order, stopping at the first denial.
    pub async fn check(&self, request: &PurchaseRequest) -> Result<Admission> {
        let permits = u64::from(request.quantity.max(1));

        for rule in &self.rules {
            let Some(key) = rule.scope.key_for(request) else {
                tracing::debug!(rule = %rule.name, "no limiter key, rule skipped");
                continue;
            };
            let key = self.storage_key(rule, &key);
            let quota = self.quota_for(request.activity_id, rule);

            let decision = match rule
                .algorithm
                .check_and_record_n(&*self.storage, &key, &quota, permits)
                .await
            {
                Ok(decision) => decision,
                Err(err) if self.fail_open => {
                    tracing::warn!(rule = %rule.name, key, error = %err, "limiter unavailable, admitting");
                    continue;
                }
                Err(err) => return Err(err),
            };

            if decision.is_denied() {
                tracing::warn!(
                    rule = %rule.name,
                    activity_id = request.activity_id,
                    user_id = request.user_id,
                    "rate limited"
                );
                return Ok(Admission::Denied {
                    rule: rule.name.clone(),
                    retry_after: decision.info().retry_after,
                });
            }
        }

        Ok(Admission::Admitted)
    }

    /// Clear the limiter state `rule` keeps for `request`.
    pub async fn reset(&self, rule: &str, request: &PurchaseRequest) -> Result<()> {
        let Some(rule) = self.rules.iter().find(|r| r.name == rule) else {
            return Ok(());
        };
        let Some(key) = rule.scope.key_for(request) else {
            return Ok(());
        };
        rule.algorithm
            .reset(&*self.storage, &self.storage_key(rule, &key))
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;
    use crate::storage::MemoryStorage;

    fn control(rules: Vec<AdmissionRule>) -> AdmissionControl<MemoryStorage> {
        AdmissionControl::new(Arc::new(MemoryStorage::new()), "test", rules)
    }

    #[test]
    fn test_scope_keys() {
        let request = PurchaseRequest::new(7, 42);
        assert_eq!(KeyScope::Activity.key_for(&request).as_deref(), Some("activity:7"));
        assert_eq!(KeyScope::User.key_for(&request).as_deref(), Some("user:42"));
        assert_eq!(
            KeyScope::ActivityUser.key_for(&request).as_deref(),
            Some("activity:7:user:42")
        );
        assert_eq!(KeyScope::ActivityIp.key_for(&request), None);
        assert_eq!(KeyScope::Global.key_for(&request).as_deref(), Some("global"));

        let request = request.with_client_ip(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(
            KeyScope::ActivityIp.key_for(&request).as_deref(),
            Some("activity:7:ip:10.0.0.1")
        );
    }

    #[tokio::test]
    async fn test_first_denial_wins() {
        let admission = control(vec![
            AdmissionRule::sliding_window("user", KeyScope::ActivityUser, Quota::per_minute(2)),
            AdmissionRule::token_bucket("activity", KeyScope::Activity, Quota::bucket(1.0, 100)),
        ]);
        let request = PurchaseRequest::new(1, 1);

        assert!(admission.check(&request).await.unwrap().is_admitted());
        assert!(admission.check(&request).await.unwrap().is_admitted());

        match admission.check(&request).await.unwrap() {
            Admission::Denied { rule, retry_after } => {
                assert_eq!(rule, "user");
                assert!(retry_after.is_some());
            }
            Admission::Admitted => panic!("third attempt should be limited"),
        }

        // Another user is unaffected by the first user's window.
        assert!(admission.check(&PurchaseRequest::new(1, 2)).await.unwrap().is_admitted());
    }

    #[tokio::test]
    async fn test_activity_bucket_is_shared() {
        let admission = control(vec![AdmissionRule::token_bucket(
            "activity",
            KeyScope::Activity,
            Quota::bucket(0.001, 3),
        )]);

        for user in 0..3 {
            assert!(admission.check(&PurchaseRequest::new(1, user)).await.unwrap().is_admitted());
        }
        assert!(!admission.check(&PurchaseRequest::new(1, 99)).await.unwrap().is_admitted());
        assert!(admission.check(&PurchaseRequest::new(2, 99)).await.unwrap().is_admitted());
    }

    #[tokio::test]
    async fn test_ip_rule_skipped_without_ip() {
        let admission = control(vec![AdmissionRule::sliding_window(
            "ip",
            KeyScope::ActivityIp,
            Quota::per_minute(1),
        )]);

        for _ in 0..5 {
            assert!(admission.check(&PurchaseRequest::new(1, 1)).await.unwrap().is_admitted());
        }

        let request = PurchaseRequest::new(1, 1).with_client_ip(IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert!(admission.check(&request).await.unwrap().is_admitted());
        assert!(!admission.check(&request).await.unwrap().is_admitted());
    }

    #[tokio::test]
    async fn test_override_and_reset() {
        let admission = control(vec![AdmissionRule::sliding_window(
            "user",
            KeyScope::ActivityUser,
            Quota::per_minute(1),
        )]);
        let request = PurchaseRequest::new(5, 1);

        admission.override_quota(5, "user", Quota::per_minute(3)).unwrap();
        assert!(admission.override_quota(5, "missing", Quota::per_minute(3)).is_err());

        for _ in 0..3 {
            assert!(admission.check(&request).await.unwrap().is_admitted());
        }
        assert!(!admission.check(&request).await.unwrap().is_admitted());

        admission.reset("user", &request).await.unwrap();
        assert!(admission.check(&request).await.unwrap().is_admitted());

        assert!(admission.clear_override(5, "user"));
        assert_eq!(admission.quota_for(5, &admission.rules()[0]), Quota::per_minute(1));
    }

    #[test]
    fn test_rules_deserialize_by_name() {
        let json = r#"{
            "name": "user",
            "algorithm": "sliding_window",
            "scope": "activity_user",
            "quota": { "max_requests": 10, "window": { "secs": 60, "nanos": 0 } }
        }"#;
        let rule: AdmissionRule = serde_json::from_str(json).unwrap();
        assert_eq!(rule.algorithm, LimiterKind::SlidingWindow);
        assert_eq!(rule.scope, KeyScope::ActivityUser);
        assert_eq!(rule.quota, Quota::per_minute(10));
    }
}
