//! Periodic background refresh.

use crate::query::{Query, QueryClient};
use plantwatch_cache::{CacheKey, CacheStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// A running poll schedule. Dropping it stops the schedule.
#[derive(Debug)]
pub struct PollHandle {
    key: CacheKey,
    task: JoinHandle<()>,
}

impl PollHandle {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn cancel(&self) {
        self.task.abort();
    }

    /// False once the predicate turned false or the handle was cancelled.
    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Refresh `query` every `interval` while `predicate` holds.
///
/// The first refresh happens one interval after scheduling; initial loads
/// are the job of the query that mounted the view. A refresh that is still
/// running when the next tick is due delays that tick, and a refresh always
/// joins a fetch already in flight for the key.
pub(crate) fn spawn_poll<P>(
    queries: QueryClient,
    query: Query,
    interval: Duration,
    predicate: P,
) -> PollHandle
where
    P: Fn() -> bool + Send + Sync + 'static,
{
    let key = query.key.clone();
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::debug!(key = %query.key, interval_ms = interval.as_millis() as u64, "Poll scheduled");
        loop {
            ticker.tick().await;
            if !predicate() {
                tracing::debug!(key = %query.key, "Poll stopped");
                break;
            }
            // Failures are recorded on the entry; the next tick retries.
            if let Err(err) = queries.refresh(&query).await {
                tracing::debug!(key = %query.key, error = %err, "Poll refresh failed");
            }
        }
    });
    PollHandle { key, task }
}

/// Sweep unwatched stale entries out of `store` every `every`.
pub fn spawn_cache_sweep(store: Arc<CacheStore>, every: Duration) -> JoinHandle<()> {
    let store = Arc::downgrade(&store);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(store) = store.upgrade() else {
                break;
            };
            store.sweep();
        }
    })
}

/// Centralized scheduler for live-telemetry refreshes.
#[derive(Debug, Clone)]
pub struct Poller {
    queries: QueryClient,
    telemetry_interval: Duration,
}

impl Poller {
    pub fn new(queries: QueryClient, telemetry_interval: Duration) -> Self {
        Self {
            queries,
            telemetry_interval,
        }
    }

    pub fn telemetry_interval(&self) -> Duration {
        self.telemetry_interval
    }

    pub fn schedule<P>(&self, query: Query, interval: Duration, predicate: P) -> PollHandle
    where
        P: Fn() -> bool + Send + Sync + 'static,
    {
        spawn_poll(self.queries.clone(), query, interval, predicate)
    }

    /// Poll on the configured telemetry cadence.
    pub fn schedule_telemetry<P>(&self, query: Query, predicate: P) -> PollHandle
    where
        P: Fn() -> bool + Send + Sync + 'static,
    {
        self.schedule(query, self.telemetry_interval, predicate)
    }

    /// Poll only while at least one subscriber watches the key.
    pub fn schedule_while_subscribed(&self, query: Query, interval: Duration) -> PollHandle {
        let store = Arc::downgrade(self.queries.store());
        let key = query.key.clone();
        self.schedule(query, interval, move || {
            store
                .upgrade()
                .is_some_and(|store| store.subscriber_count(&key) > 0)
        })
    }
}
