//! Storage entry type for shared seckill state.

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

use crate::error::StorageError;

/// Entry stored in the storage backend.
///
/// One record shape covers every kind of shared state the core keeps:
/// limiter buckets and logs, lock markers, idempotency claims and activity
/// records (the latter carried as a JSON payload).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StorageEntry {
    /// Generic counter.
    #[serde(default)]
    pub count: u64,

    /// Available tokens (for token bucket algorithm).
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tokens: Option<f64>,

    /// Last update timestamp (Unix milliseconds).
    #[serde(default)]
    pub last_update: u64,

    /// Request timestamps (for the sliding window log).
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub timestamps: Option<Vec<u64>>,

    /// Holder token for lock markers, outcome marker for claims.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub owner: Option<String>,

    /// Encoded record body (activity records, claim outcomes).
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub payload: Option<String>,
}

impl StorageEntry {
    /// Create a counter entry.
    pub fn new(count: u64, last_update: u64) -> Self {
        Self {
            count,
            last_update,
            ..Default::default()
        }
    }

    /// Create a storage entry for token bucket.
    pub fn with_tokens(tokens: f64, last_update: u64) -> Self {
        Self {
            tokens: Some(tokens),
            last_update,
            ..Default::default()
        }
    }

    /// Create a storage entry for the sliding window log.
    pub fn with_timestamps(timestamps: Vec<u64>) -> Self {
        let now = timestamps.last().copied().unwrap_or(0);
        Self {
            count: timestamps.len() as u64,
            last_update: now,
            timestamps: Some(timestamps),
            ..Default::default()
        }
    }

    /// Create a marker entry held by `owner` (lock holders, claims).
    pub fn with_owner(owner: impl Into<String>, last_update: u64) -> Self {
        Self {
            owner: Some(owner.into()),
            last_update,
            ..Default::default()
        }
    }

    /// Create an entry carrying `value` as a JSON payload.
    pub fn with_payload<T: Serialize>(value: &T, last_update: u64) -> Result<Self, StorageError> {
        Ok(Self {
            payload: Some(serde_json::to_string(value)?),
            last_update,
            ..Default::default()
        })
    }

    /// Decode the JSON payload, `None` if the entry has none.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<Option<T>, StorageError> {
        self.payload
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(StorageError::from)
    }

    /// Whether this entry is held by `owner`.
    pub fn is_owned_by(&self, owner: &str) -> bool {
        self.owner.as_deref() == Some(owner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_with_tokens() {
        let entry = StorageEntry::with_tokens(10.5, 2000);
        assert_eq!(entry.tokens, Some(10.5));
        assert_eq!(entry.last_update, 2000);
    }

    #[test]
    fn test_entry_with_timestamps() {
        let timestamps = vec![1000, 2000, 3000];
        let entry = StorageEntry::with_timestamps(timestamps.clone());
        assert_eq!(entry.timestamps, Some(timestamps));
        assert_eq!(entry.count, 3);
        assert_eq!(entry.last_update, 3000);
    }

    #[test]
    fn test_entry_owner() {
        let entry = StorageEntry::with_owner("token-a", 10);
        assert!(entry.is_owned_by("token-a"));
        assert!(!entry.is_owned_by("token-b"));
        assert!(!StorageEntry::default().is_owned_by("token-a"));
    }

    #[test]
    fn test_entry_payload() {
        let entry = StorageEntry::with_payload(&vec![1u32, 2, 3], 5).unwrap();
        let decoded: Option<Vec<u32>> = entry.decode_payload().unwrap();
        assert_eq!(decoded, Some(vec![1, 2, 3]));

        let empty: Option<Vec<u32>> = StorageEntry::default().decode_payload().unwrap();
        assert!(empty.is_none());
    }

    #[test]
    fn test_entry_serialization_skips_empty_fields() {
        let entry = StorageEntry::with_owner("abc", 1000);
        let json = serde_json::to_string(&entry).unwrap();
        assert!(!json.contains("timestamps"));
        let deserialized: StorageEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(entry, deserialized);
    }
}
