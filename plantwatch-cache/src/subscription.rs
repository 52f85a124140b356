//! Live subscriptions to cache entries.

use crate::entry::CacheEntry;
use crate::key::CacheKey;
use crate::store::CacheStore;
use std::sync::Weak;
use tokio::sync::mpsc;

/// A consumer bound to one cache key.
///
/// Receives a snapshot of the entry on subscribe and after every change,
/// in the order the changes were applied. Dropping it decrements the key's
/// subscriber count.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    key: CacheKey,
    rx: mpsc::UnboundedReceiver<CacheEntry>,
    store: Weak<CacheStore>,
}

impl Subscription {
    pub(crate) fn new(
        id: u64,
        key: CacheKey,
        rx: mpsc::UnboundedReceiver<CacheEntry>,
        store: Weak<CacheStore>,
    ) -> Self {
        Self { id, key, rx, store }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Wait for the next snapshot. `None` once the store is gone.
    pub async fn recv(&mut self) -> Option<CacheEntry> {
        self.rx.recv().await
    }

    /// Next snapshot if one is already queued.
    pub fn try_recv(&mut self) -> Option<CacheEntry> {
        self.rx.try_recv().ok()
    }

    /// Discard queued snapshots and return the most recent one.
    pub fn latest(&mut self) -> Option<CacheEntry> {
        let mut last = None;
        while let Ok(entry) = self.rx.try_recv() {
            last = Some(entry);
        }
        last
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(store) = self.store.upgrade() {
            store.unsubscribe(&self.key, self.id);
        }
    }
}
