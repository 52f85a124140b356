//! The cache store.
//!
//! All state lives behind one mutex. Every operation is a short critical
//! section that never awaits, and subscriber notifications are queued
//! inside that section, so each subscriber observes changes to a key in
//! exactly the order they were applied.

use crate::config::CacheConfig;
use crate::entry::{CacheEntry, EntryStatus};
use crate::key::{CacheKey, KeyFilter};
use crate::subscription::Subscription;
use plantwatch_core::{Clock, SyncError, SystemClock, Timestamp};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Reads that found a fresh value.
    pub hits: u64,
    /// Reads that found nothing or a stale value.
    pub misses: u64,
    pub fetches_started: u64,
    /// Fetch results discarded because a newer result was already applied.
    pub superseded: u64,
    /// Entries dropped by `sweep`.
    pub evicted: u64,
    pub entry_count: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// What `complete_fetch` did with a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    Applied,
    /// A newer result was already applied, or the entry was dropped.
    Superseded,
}

#[derive(Debug)]
struct Slot {
    entry: CacheEntry,
    senders: HashMap<u64, mpsc::UnboundedSender<CacheEntry>>,
    /// Last read, write or subscription change.
    touched_at: Timestamp,
}

impl Slot {
    fn new(key: CacheKey, now: Timestamp) -> Self {
        Self {
            entry: CacheEntry::idle(key),
            senders: HashMap::new(),
            touched_at: now,
        }
    }

    fn is_collectable(&self, now: Timestamp, cutoff: Timestamp) -> bool {
        self.senders.is_empty()
            && !self.entry.is_loading()
            && self.entry.is_stale(now)
            && self.touched_at < cutoff
    }

    fn notify(&mut self) {
        let entry = &self.entry;
        self.senders.retain(|_, tx| tx.send(entry.clone()).is_ok());
        self.entry.subscribers = self.senders.len();
    }
}

#[derive(Debug, Default)]
struct StoreInner {
    slots: HashMap<CacheKey, Slot>,
    stats: CacheStats,
    next_subscriber: u64,
}

impl StoreInner {
    fn slot(&mut self, key: &CacheKey, now: Timestamp) -> &mut Slot {
        let slot = self
            .slots
            .entry(key.clone())
            .or_insert_with(|| Slot::new(key.clone(), now));
        slot.touched_at = now;
        slot
    }
}

/// Keyed, TTL-aware store of request results.
#[derive(Debug)]
pub struct CacheStore {
    inner: Mutex<StoreInner>,
    clock: Arc<dyn Clock>,
    config: CacheConfig,
}

impl CacheStore {
    pub fn new(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(StoreInner::default()),
            clock,
            config,
        }
    }

    /// A store on the system clock with default TTLs.
    pub fn with_defaults() -> Self {
        Self::new(CacheConfig::default(), Arc::new(SystemClock))
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn deadline(now: Timestamp, ttl: Duration) -> Timestamp {
        chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(chrono::DateTime::<chrono::Utc>::MAX_UTC)
    }

    /// Current entry for `key`, created idle if absent.
    pub fn get(&self, key: &CacheKey) -> CacheEntry {
        let now = self.clock.now();
        let mut guard = self.lock();
        let inner = &mut *guard;
        let slot = inner
            .slots
            .entry(key.clone())
            .or_insert_with(|| Slot::new(key.clone(), now));
        slot.touched_at = now;
        if slot.entry.is_stale(now) {
            inner.stats.misses += 1;
        } else {
            inner.stats.hits += 1;
        }
        slot.entry.clone()
    }

    /// Current entry for `key` without creating one or counting a read.
    pub fn peek(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.lock().slots.get(key).map(|slot| slot.entry.clone())
    }

    /// Store a value fetched or produced locally.
    ///
    /// Any fetch still in flight for the key is superseded.
    pub fn put(&self, key: &CacheKey, value: serde_json::Value, ttl: Duration) {
        let now = self.clock.now();
        let mut inner = self.lock();
        let slot = inner.slot(key, now);
        let entry = &mut slot.entry;
        entry.value = Some(Arc::new(value));
        entry.fetched_at = Some(now);
        entry.stale_after = Some(Self::deadline(now, ttl));
        entry.status = EntryStatus::Success;
        entry.error = None;
        entry.applied_seq = entry.fetch_seq;
        slot.notify();
        tracing::debug!(key = %key, ttl_ms = ttl.as_millis() as u64, "Cache put");
    }

    /// Record a failed refresh. The last good value is kept.
    pub fn set_error(&self, key: &CacheKey, error: SyncError) {
        let now = self.clock.now();
        let mut inner = self.lock();
        let slot = inner.slot(key, now);
        slot.entry.status = EntryStatus::Error;
        slot.entry.error = Some(error);
        slot.notify();
    }

    /// Mark matching entries stale.
    ///
    /// Returns the keys that currently have subscribers; the caller is
    /// expected to refetch those. Unsubscribed entries refresh on next read.
    pub fn invalidate(&self, filter: &KeyFilter) -> Vec<CacheKey> {
        let now = self.clock.now();
        let mut inner = self.lock();
        let mut marked = 0usize;
        let mut active = Vec::new();
        for (key, slot) in inner.slots.iter_mut() {
            if !filter.matches(key) {
                continue;
            }
            marked += 1;
            if let Some(fetched_at) = slot.entry.fetched_at {
                slot.entry.stale_after = Some(now.max(fetched_at));
            }
            if !slot.senders.is_empty() {
                active.push(key.clone());
            }
        }
        active.sort();
        tracing::debug!(
            filter = %filter,
            marked,
            active = active.len(),
            "Cache invalidated"
        );
        active
    }

    /// Start a fetch for `key` and return its sequence number.
    pub fn begin_fetch(&self, key: &CacheKey) -> u64 {
        let now = self.clock.now();
        let mut guard = self.lock();
        let inner = &mut *guard;
        inner.stats.fetches_started += 1;
        let slot = inner.slot(key, now);
        slot.entry.fetch_seq += 1;
        slot.entry.status = EntryStatus::Loading;
        let seq = slot.entry.fetch_seq;
        slot.notify();
        tracing::trace!(key = %key, seq, "Fetch started");
        seq
    }

    /// Apply the result of fetch `seq`, unless a newer one already landed.
    pub fn complete_fetch(
        &self,
        key: &CacheKey,
        seq: u64,
        result: Result<serde_json::Value, SyncError>,
        ttl: Duration,
    ) -> FetchOutcome {
        let now = self.clock.now();
        let mut guard = self.lock();
        let inner = &mut *guard;
        let Some(slot) = inner.slots.get_mut(key) else {
            inner.stats.superseded += 1;
            tracing::debug!(key = %key, seq, "Discarding fetch result for dropped entry");
            return FetchOutcome::Superseded;
        };
        let entry = &mut slot.entry;
        if seq <= entry.applied_seq || seq > entry.fetch_seq {
            inner.stats.superseded += 1;
            tracing::debug!(
                key = %key,
                seq,
                applied_seq = entry.applied_seq,
                "Discarding superseded fetch result"
            );
            return FetchOutcome::Superseded;
        }

        slot.touched_at = now;
        entry.applied_seq = seq;
        let settled = match result {
            Ok(value) => {
                entry.value = Some(Arc::new(value));
                entry.fetched_at = Some(now);
                entry.stale_after = Some(Self::deadline(now, ttl));
                entry.error = None;
                EntryStatus::Success
            }
            Err(error) => {
                tracing::debug!(key = %key, seq, error = %error, "Fetch failed");
                entry.error = Some(error);
                EntryStatus::Error
            }
        };
        // A newer fetch is still running; stay in loading until it lands.
        entry.status = if seq < entry.fetch_seq {
            EntryStatus::Loading
        } else {
            settled
        };
        slot.notify();
        FetchOutcome::Applied
    }

    /// Subscribe to changes of `key`. The current entry is delivered first.
    pub fn subscribe(self: &Arc<Self>, key: &CacheKey) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let now = self.clock.now();
        let mut guard = self.lock();
        let inner = &mut *guard;
        inner.next_subscriber += 1;
        let id = inner.next_subscriber;
        let slot = inner.slot(key, now);
        slot.entry.subscribers = slot.senders.len() + 1;
        let _ = tx.send(slot.entry.clone());
        slot.senders.insert(id, tx);
        drop(guard);
        Subscription::new(id, key.clone(), rx, Arc::downgrade(self))
    }

    pub(crate) fn unsubscribe(&self, key: &CacheKey, id: u64) {
        let now = self.clock.now();
        let mut inner = self.lock();
        if let Some(slot) = inner.slots.get_mut(key) {
            slot.senders.remove(&id);
            slot.entry.subscribers = slot.senders.len();
            slot.touched_at = now;
        }
    }

    pub fn subscriber_count(&self, key: &CacheKey) -> usize {
        self.lock()
            .slots
            .get(key)
            .map(|slot| slot.senders.len())
            .unwrap_or(0)
    }

    /// Drop matching entries.
    ///
    /// Entries that still have subscribers are reset to idle instead, and
    /// their subscribers are notified; fetches in flight for them are
    /// superseded.
    pub fn remove(&self, filter: &KeyFilter) -> usize {
        let mut inner = self.lock();
        let before = inner.slots.len();
        let mut reset = 0usize;
        inner.slots.retain(|key, slot| {
            if !filter.matches(key) {
                return true;
            }
            if slot.senders.is_empty() {
                return false;
            }
            let fetch_seq = slot.entry.fetch_seq;
            slot.entry = CacheEntry::idle(key.clone());
            slot.entry.fetch_seq = fetch_seq;
            slot.entry.applied_seq = fetch_seq;
            slot.notify();
            reset += 1;
            true
        });
        let removed = before - inner.slots.len() + reset;
        tracing::debug!(filter = %filter, removed, "Cache entries removed");
        removed
    }

    /// Drop every entry.
    pub fn clear(&self) -> usize {
        self.remove(&KeyFilter::All)
    }

    /// Drop entries that are unwatched, stale and untouched for the GC window.
    ///
    /// Entries with subscribers or a fetch in flight are always kept.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let Some(cutoff) = chrono::Duration::from_std(self.config.gc_window)
            .ok()
            .and_then(|window| now.checked_sub_signed(window))
        else {
            return 0;
        };
        let mut inner = self.lock();
        let before = inner.slots.len();
        inner.slots.retain(|_, slot| !slot.is_collectable(now, cutoff));
        let evicted = before - inner.slots.len();
        inner.stats.evicted += evicted as u64;
        if evicted > 0 {
            tracing::debug!(evicted, remaining = inner.slots.len(), "Cache swept");
        }
        evicted
    }

    pub fn keys(&self) -> Vec<CacheKey> {
        let mut keys: Vec<CacheKey> = self.lock().slots.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        CacheStats {
            entry_count: inner.slots.len() as u64,
            ..inner.stats.clone()
        }
    }
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::with_defaults()
    }
}
