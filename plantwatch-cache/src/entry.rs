//! Cache entries and their lifecycle status.

use crate::key::CacheKey;
use plantwatch_core::{SyncError, Timestamp};
use serde::de::DeserializeOwned;
use std::sync::Arc;

/// Where an entry is in its fetch lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryStatus {
    /// Never fetched, or reset.
    Idle,
    /// A fetch is in flight. Any previous value is still present.
    Loading,
    Success,
    /// The last fetch failed. The last good value, if any, is kept.
    Error,
}

/// Snapshot of one cached request result.
///
/// The store hands out clones; the value itself is shared.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub value: Option<Arc<serde_json::Value>>,
    pub fetched_at: Option<Timestamp>,
    pub stale_after: Option<Timestamp>,
    pub status: EntryStatus,
    pub error: Option<SyncError>,
    /// Sequence number of the most recently started fetch.
    pub fetch_seq: u64,
    /// Sequence number of the most recently applied fetch result.
    pub applied_seq: u64,
    pub subscribers: usize,
}

impl CacheEntry {
    pub(crate) fn idle(key: CacheKey) -> Self {
        Self {
            key,
            value: None,
            fetched_at: None,
            stale_after: None,
            status: EntryStatus::Idle,
            error: None,
            fetch_seq: 0,
            applied_seq: 0,
            subscribers: 0,
        }
    }

    pub fn has_value(&self) -> bool {
        self.value.is_some()
    }

    pub fn is_loading(&self) -> bool {
        self.status == EntryStatus::Loading
    }

    /// An entry without a value, or past its freshness window, is stale.
    pub fn is_stale(&self, now: Timestamp) -> bool {
        match (&self.value, self.stale_after) {
            (Some(_), Some(stale_after)) => now >= stale_after,
            _ => true,
        }
    }

    /// Decode the cached JSON into a typed value.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<Option<T>, SyncError> {
        self.value
            .as_deref()
            .map(|v| T::deserialize(v).map_err(SyncError::decode))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use plantwatch_core::TenantId;

    #[test]
    fn test_idle_entry_is_stale() {
        let entry = CacheEntry::idle(CacheKey::new("plants", TenantId::now_v7()));
        assert!(entry.is_stale(Utc::now()));
        assert_eq!(entry.status, EntryStatus::Idle);
        assert_eq!(entry.decode::<Vec<i64>>().expect("decode"), None);
    }

    #[test]
    fn test_freshness_window() {
        let now = Utc::now();
        let mut entry = CacheEntry::idle(CacheKey::global("tenants"));
        entry.value = Some(Arc::new(serde_json::json!([1, 2])));
        entry.fetched_at = Some(now);
        entry.stale_after = Some(now + Duration::seconds(10));
        assert!(!entry.is_stale(now));
        assert!(entry.is_stale(now + Duration::seconds(10)));
        assert_eq!(entry.decode::<Vec<i64>>().expect("decode"), Some(vec![1, 2]));
    }

    #[test]
    fn test_decode_mismatch_is_decode_error() {
        let mut entry = CacheEntry::idle(CacheKey::global("tenants"));
        entry.value = Some(Arc::new(serde_json::json!({"not": "a list"})));
        let err = entry.decode::<Vec<i64>>().expect_err("should fail");
        assert!(matches!(err, SyncError::Decode { .. }));
    }
}
