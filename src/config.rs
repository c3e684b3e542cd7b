//! Runtime configuration for the seckill core.
//!
//! # Example
//!
//! ```ignore
//! use seckill_core::config::{ClaimPolicy, SeckillConfig};
//! use std::time::Duration;
//!
//! let config = SeckillConfig::default()
//!     .with_key_prefix("shop-a")
//!     .with_lock_wait(Duration::from_secs(2))
//!     .with_claim_policy(ClaimPolicy::ReleaseOnSoldOut);
//! config.validate()?;
//! ```

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use envconfig::Envconfig;
use serde::{Deserialize, Serialize};

use crate::admission::AdmissionRule;
use crate::error::{ConfigError, Result, SeckillError};

/// Timing of the per-activity stock lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// How long a request may queue for the lock before `SystemBusy`.
    pub wait_time: Duration,
    /// Lock expiry; must outlast the critical section.
    pub lease_time: Duration,
    /// First retry delay while queueing.
    pub initial_backoff: Duration,
    /// Retry delay cap.
    pub max_backoff: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            wait_time: Duration::from_secs(5),
            lease_time: Duration::from_secs(10),
            initial_backoff: Duration::from_millis(2),
            max_backoff: Duration::from_millis(50),
        }
    }
}

impl LockConfig {
    /// Reject timings the lock cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.lease_time.is_zero() {
            return Err(ConfigError::InvalidLock("lease_time must be non-zero".into()).into());
        }
        if self.initial_backoff.is_zero() {
            return Err(ConfigError::InvalidLock("initial_backoff must be non-zero".into()).into());
        }
        if self.initial_backoff > self.max_backoff {
            return Err(ConfigError::InvalidLock(format!(
                "initial_backoff {:?} exceeds max_backoff {:?}",
                self.initial_backoff, self.max_backoff
            ))
            .into());
        }
        Ok(())
    }
}

/// What happens to a user's claim when they reach the ledger after stock ran out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimPolicy {
    /// Keep the claim: at most one attempt per user, sold out or not.
    #[default]
    KeepOnSoldOut,
    /// Drop the claim; a retry is answered by the stock check instead.
    ReleaseOnSoldOut,
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeckillConfig {
    /// Prefix of every store key.
    pub key_prefix: String,
    /// Stock lock timing.
    pub lock: LockConfig,
    /// Admission rules, evaluated in order.
    pub admission: Vec<AdmissionRule>,
    /// How long activity records outlive their end time.
    pub activity_retention: Duration,
    /// How long claims outlive the activity end.
    pub idempotency_grace: Duration,
    /// Lifetime of the order hand-off record.
    pub order_detail_ttl: Duration,
    /// Claim handling on a sold-out result.
    pub claim_policy: ClaimPolicy,
    /// Admit requests when the limiter store is unreachable.
    pub limiter_fail_open: bool,
}

impl Default for SeckillConfig {
    fn default() -> Self {
        Self {
            key_prefix: "seckill".to_string(),
            lock: LockConfig::default(),
            admission: AdmissionRule::defaults(),
            activity_retention: Duration::from_secs(7 * 24 * 3600),
            idempotency_grace: Duration::from_secs(3600),
            order_detail_ttl: Duration::from_secs(24 * 3600),
            claim_policy: ClaimPolicy::default(),
            limiter_fail_open: false,
        }
    }
}

impl SeckillConfig {
    /// Set the key prefix.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Set the lock wait time.
    pub fn with_lock_wait(mut self, wait: Duration) -> Self {
        self.lock.wait_time = wait;
        self
    }

    /// Set the lock lease time.
    pub fn with_lock_lease(mut self, lease: Duration) -> Self {
        self.lock.lease_time = lease;
        self
    }

    /// Replace the admission rules.
    pub fn with_admission(mut self, rules: Vec<AdmissionRule>) -> Self {
        self.admission = rules;
        self
    }

    /// Set the claim policy.
    pub fn with_claim_policy(mut self, policy: ClaimPolicy) -> Self {
        self.claim_policy = policy;
        self
    }

    /// Set the idempotency grace period.
    pub fn with_idempotency_grace(mut self, grace: Duration) -> Self {
        self.idempotency_grace = grace;
        self
    }

    /// Admit or reject when the limiter store fails.
    pub fn with_limiter_fail_open(mut self, fail_open: bool) -> Self {
        self.limiter_fail_open = fail_open;
        self
    }

    /// Check the configuration as a whole.
    pub fn validate(&self) -> Result<()> {
        if self.key_prefix.is_empty() {
            return Err(ConfigError::MissingRequired("key_prefix".into()).into());
        }
        self.lock.validate()?;

        let mut names = std::collections::HashSet::new();
        for rule in &self.admission {
            if !names.insert(rule.name.as_str()) {
                return Err(ConfigError::InvalidQuota(format!(
                    "duplicate admission rule {:?}",
                    rule.name
                ))
                .into());
            }
            rule.quota.validate()?;
        }

        if self.order_detail_ttl.is_zero() {
            return Err(ConfigError::InvalidStorage("order_detail_ttl must be non-zero".into()).into());
        }
        Ok(())
    }

    /// Defaults overridden by `SECKILL_*` environment variables.
    ///
    /// See [`SeckillEnv`] for the recognised variables.
    pub fn from_env() -> Result<Self> {
        let env = SeckillEnv::init_from_env()
            .map_err(|err| env_error(err, |name| std::env::var(name).ok()))?;
        env.apply(Self::default())
    }

    /// Like [`from_env`](Self::from_env), reading variables from `vars`.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self> {
        let env = SeckillEnv::init_from_hashmap(vars)
            .map_err(|err| env_error(err, |name| vars.get(name).cloned()))?;
        env.apply(Self::default())
    }
}

impl FromStr for ClaimPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "keep_on_sold_out" => Ok(Self::KeepOnSoldOut),
            "release_on_sold_out" => Ok(Self::ReleaseOnSoldOut),
            other => Err(ConfigError::InvalidValue {
                name: "claim_policy".into(),
                value: other.to_string(),
            }),
        }
    }
}

/// Environment overrides; unset variables keep the default.
#[derive(Debug, Envconfig)]
pub struct SeckillEnv {
    #[envconfig(from = "SECKILL_KEY_PREFIX")]
    pub key_prefix: Option<String>,

    #[envconfig(from = "SECKILL_LOCK_WAIT_MS")]
    pub lock_wait_ms: Option<u64>,

    #[envconfig(from = "SECKILL_LOCK_LEASE_MS")]
    pub lock_lease_ms: Option<u64>,

    #[envconfig(from = "SECKILL_IDEMPOTENCY_GRACE_SECS")]
    pub idempotency_grace_secs: Option<u64>,

    #[envconfig(from = "SECKILL_CLAIM_POLICY")]
    pub claim_policy: Option<ClaimPolicy>,

    #[envconfig(from = "SECKILL_LIMITER_FAIL_OPEN")]
    pub limiter_fail_open: Option<bool>,
}

impl SeckillEnv {
    /// Merge the set variables over `config` and validate the result.
    pub fn apply(self, mut config: SeckillConfig) -> Result<SeckillConfig> {
        if let Some(prefix) = self.key_prefix {
            config.key_prefix = prefix;
        }
        if let Some(ms) = self.lock_wait_ms {
            config.lock.wait_time = Duration::from_millis(ms);
        }
        if let Some(ms) = self.lock_lease_ms {
            config.lock.lease_time = Duration::from_millis(ms);
        }
        if let Some(secs) = self.idempotency_grace_secs {
            config.idempotency_grace = Duration::from_secs(secs);
        }
        if let Some(policy) = self.claim_policy {
            config.claim_policy = policy;
        }
        if let Some(fail_open) = self.limiter_fail_open {
            config.limiter_fail_open = fail_open;
        }

        config.validate()?;
        Ok(config)
    }
}

fn env_error(err: envconfig::Error, lookup: impl Fn(&str) -> Option<String>) -> SeckillError {
    match err {
        envconfig::Error::ParseError { name } => ConfigError::InvalidValue {
            name: name.to_string(),
            value: lookup(name).unwrap_or_default(),
        }
        .into(),
        envconfig::Error::EnvVarMissing { name } => ConfigError::MissingRequired(name.to_string()).into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::KeyScope;
    use crate::quota::Quota;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = SeckillConfig::default();
        assert_eq!(config.key_prefix, "seckill");
        assert_eq!(config.lock.wait_time, Duration::from_secs(5));
        assert_eq!(config.lock.lease_time, Duration::from_secs(10));
        assert_eq!(config.idempotency_grace, Duration::from_secs(3600));
        assert_eq!(config.order_detail_ttl, Duration::from_secs(86_400));
        assert_eq!(config.claim_policy, ClaimPolicy::KeepOnSoldOut);
        assert_eq!(config.admission.len(), 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_lock() {
        let config = SeckillConfig::default().with_lock_lease(Duration::ZERO);
        assert!(matches!(
            config.validate(),
            Err(SeckillError::Config(ConfigError::InvalidLock(_)))
        ));

        let mut config = SeckillConfig::default();
        config.lock.initial_backoff = Duration::from_secs(1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_duplicate_rules() {
        let rule = AdmissionRule::sliding_window("user", KeyScope::User, Quota::per_minute(1));
        let config = SeckillConfig::default().with_admission(vec![rule.clone(), rule]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_vars() {
        let config = SeckillConfig::from_vars(&vars(&[
            ("SECKILL_KEY_PREFIX", "flash"),
            ("SECKILL_LOCK_WAIT_MS", "250"),
            ("SECKILL_CLAIM_POLICY", "release_on_sold_out"),
            ("SECKILL_LIMITER_FAIL_OPEN", "true"),
        ]))
        .unwrap();

        assert_eq!(config.key_prefix, "flash");
        assert_eq!(config.lock.wait_time, Duration::from_millis(250));
        assert_eq!(config.lock.lease_time, Duration::from_secs(10));
        assert_eq!(config.claim_policy, ClaimPolicy::ReleaseOnSoldOut);
        assert!(config.limiter_fail_open);
    }

    #[test]
    fn test_from_vars_rejects_garbage() {
        let err = SeckillConfig::from_vars(&vars(&[("SECKILL_LOCK_LEASE_MS", "soon")])).unwrap_err();
        match err {
            SeckillError::Config(ConfigError::InvalidValue { name, value }) => {
                assert_eq!(name, "SECKILL_LOCK_LEASE_MS");
                assert_eq!(value, "soon");
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let err = SeckillConfig::from_vars(&vars(&[("SECKILL_CLAIM_POLICY", "maybe")])).unwrap_err();
        assert!(matches!(
            err,
            SeckillError::Config(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_from_vars_empty_is_default() {
        let config = SeckillConfig::from_vars(&HashMap::new()).unwrap();
        assert_eq!(config, SeckillConfig::default());
    }

    #[test]
    fn test_env_still_validates() {
        let err = SeckillConfig::from_vars(&vars(&[("SECKILL_LOCK_LEASE_MS", "0")])).unwrap_err();
        assert!(matches!(
            err,
            SeckillError::Config(ConfigError::InvalidLock(_))
        ));
    }

    #[test]
    fn test_claim_policy_from_str() {
        assert_eq!("keep_on_sold_out".parse::<ClaimPolicy>().unwrap(), ClaimPolicy::KeepOnSoldOut);
        assert!("release".parse::<ClaimPolicy>().is_err());
    }

    #[test]
    fn test_serde_round_trip_keeps_rules() {
        let config = SeckillConfig::default().with_key_prefix("x");
        let json = serde_json::to_string(&config).unwrap();
        let parsed: SeckillConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);

        let partial: SeckillConfig = serde_json::from_str(r#"{"key_prefix":"y"}"#).unwrap();
        assert_eq!(partial.lock, LockConfig::default());
    }
}
