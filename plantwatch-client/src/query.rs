//! Query coordinator.
//!
//! Reads go through the cache store. A miss or a stale entry starts a fetch;
//! concurrent readers of the same key attach to the one fetch already in
//! flight instead of issuing their own request. Each fetch runs on its own
//! task, so a reader that stops waiting never cancels it.

use crate::poller::{spawn_poll, PollHandle};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use plantwatch_cache::{CacheKey, CacheStore, EntryStatus, KeyFilter, Subscription};
use plantwatch_core::{ApiRequest, SyncError, SyncResult, Timestamp, Transport};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

pub type FetchResult = SyncResult<serde_json::Value>;
type SharedFetch = Shared<BoxFuture<'static, FetchResult>>;
type FetchFn = dyn Fn() -> BoxFuture<'static, FetchResult> + Send + Sync;

/// How a query loads its data.
#[derive(Clone)]
pub enum Fetcher {
    /// Send a request through the client's transport.
    Request(ApiRequest),
    /// Run an arbitrary async loader.
    Custom(Arc<FetchFn>),
}

impl Fetcher {
    pub fn from_fn<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FetchResult> + Send + 'static,
    {
        Self::Custom(Arc::new(move || f().boxed()))
    }

    fn run(&self, transport: Arc<dyn Transport>) -> BoxFuture<'static, FetchResult> {
        match self {
            Self::Request(request) => {
                let request = request.clone();
                async move { transport.send(request).await.map_err(SyncError::from) }.boxed()
            }
            Self::Custom(f) => f(),
        }
    }
}

impl fmt::Debug for Fetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Request(request) => f.debug_tuple("Request").field(request).finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Freshness window applied to a query's results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
    /// The store's default TTL.
    Default,
    /// The store's telemetry TTL.
    Telemetry,
    Fixed(Duration),
}

/// A cache key paired with the way to load it.
#[derive(Debug, Clone)]
pub struct Query {
    pub key: CacheKey,
    pub fetcher: Fetcher,
    pub ttl: Ttl,
}

impl Query {
    pub fn new(key: CacheKey, fetcher: Fetcher) -> Self {
        Self {
            key,
            fetcher,
            ttl: Ttl::Default,
        }
    }

    pub fn request(key: CacheKey, request: ApiRequest) -> Self {
        Self::new(key, Fetcher::Request(request))
    }

    pub fn with_ttl(mut self, ttl: Ttl) -> Self {
        self.ttl = ttl;
        self
    }
}

/// Per-handle query behaviour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryOptions {
    /// A disabled query never touches the network.
    pub enabled: bool,
    /// Keep showing the previous key's data while a new key of the same kind
    /// loads.
    pub keep_previous_data: bool,
    /// Overrides the query's own TTL.
    pub stale_time: Option<Duration>,
    /// Poll the key while this handle is alive.
    pub refetch_interval: Option<Duration>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            keep_previous_data: false,
            stale_time: None,
            refetch_interval: None,
        }
    }
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn keep_previous_data(mut self, keep: bool) -> Self {
        self.keep_previous_data = keep;
        self
    }

    pub fn stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = Some(stale_time);
        self
    }

    pub fn refetch_interval(mut self, interval: Duration) -> Self {
        self.refetch_interval = Some(interval);
        self
    }
}

/// What a view renders.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryState<T> {
    pub data: Option<T>,
    pub is_loading: bool,
    pub is_error: bool,
    pub error: Option<SyncError>,
    /// `data` belongs to the previous key.
    pub is_placeholder: bool,
    pub updated_at: Option<Timestamp>,
}

struct InFlight {
    seq: u64,
    future: SharedFetch,
}

struct Registration {
    fetcher: Fetcher,
    ttl: Ttl,
    handles: usize,
}

struct QueryInner {
    store: Arc<CacheStore>,
    transport: Arc<dyn Transport>,
    in_flight: Mutex<HashMap<CacheKey, InFlight>>,
    registry: Mutex<HashMap<CacheKey, Registration>>,
}

impl QueryInner {
    fn lock_in_flight(&self) -> MutexGuard<'_, HashMap<CacheKey, InFlight>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_registry(&self) -> MutexGuard<'_, HashMap<CacheKey, Registration>> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Shared entry point for reads. Cheap to clone.
#[derive(Clone)]
pub struct QueryClient {
    inner: Arc<QueryInner>,
}

impl fmt::Debug for QueryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryClient")
            .field("in_flight", &self.inner.lock_in_flight().len())
            .field("registered", &self.inner.lock_registry().len())
            .finish()
    }
}

impl QueryClient {
    pub fn new(store: Arc<CacheStore>, transport: Arc<dyn Transport>) -> Self {
        Self {
            inner: Arc::new(QueryInner {
                store,
                transport,
                in_flight: Mutex::new(HashMap::new()),
                registry: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.inner.store
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    pub fn ttl_for(&self, ttl: Ttl) -> Duration {
        let config = self.inner.store.config();
        match ttl {
            Ttl::Default => config.default_ttl,
            Ttl::Telemetry => config.telemetry_ttl,
            Ttl::Fixed(ttl) => ttl,
        }
    }

    pub fn is_in_flight(&self, key: &CacheKey) -> bool {
        self.inner.lock_in_flight().contains_key(key)
    }

    /// Start a fetch, or join the one in flight unless `force` is set.
    ///
    /// A forced fetch takes a newer sequence number, so whichever of the two
    /// results lands, the older one can never overwrite the newer.
    fn start_fetch(&self, query: &Query, force: bool) -> SharedFetch {
        let mut in_flight = self.inner.lock_in_flight();
        if !force {
            if let Some(existing) = in_flight.get(&query.key) {
                tracing::trace!(key = %query.key, seq = existing.seq, "Joining in-flight fetch");
                return existing.future.clone();
            }
        }

        let seq = self.inner.store.begin_fetch(&query.key);
        let ttl = self.ttl_for(query.ttl);
        let store = self.inner.store.clone();
        let weak: Weak<QueryInner> = Arc::downgrade(&self.inner);
        let key = query.key.clone();
        let run = query.fetcher.run(self.inner.transport.clone());
        tracing::debug!(key = %key, seq, force, "Fetch dispatched");

        let future = async move {
            let result = run.await;
            store.complete_fetch(&key, seq, result.clone(), ttl);
            if let Some(inner) = weak.upgrade() {
                let mut in_flight = inner.lock_in_flight();
                if in_flight.get(&key).is_some_and(|f| f.seq == seq) {
                    in_flight.remove(&key);
                }
            }
            result
        }
        .boxed()
        .shared();

        in_flight.insert(
            query.key.clone(),
            InFlight {
                seq,
                future: future.clone(),
            },
        );
        drop(in_flight);
        tokio::spawn(future.clone());
        future
    }

    /// Read-through: the cached value if fresh, otherwise the result of a
    /// (possibly shared) fetch.
    pub async fn fetch(&self, query: &Query) -> FetchResult {
        let store = &self.inner.store;
        let entry = store.get(&query.key);
        if !entry.is_stale(store.now()) {
            if let Some(value) = entry.value {
                return Ok((*value).clone());
            }
        }
        self.start_fetch(query, false).await
    }

    pub async fn fetch_typed<T: DeserializeOwned>(&self, query: &Query) -> SyncResult<T> {
        let value = self.fetch(query).await?;
        serde_json::from_value(value).map_err(SyncError::decode)
    }

    /// Refresh regardless of freshness, joining a fetch already in flight.
    pub async fn refresh(&self, query: &Query) -> FetchResult {
        self.start_fetch(query, false).await
    }

    /// Fetch again, superseding any fetch in flight.
    pub async fn refetch(&self, query: &Query) -> FetchResult {
        self.start_fetch(query, true).await
    }

    /// Mark matching entries stale and refetch those a live handle is
    /// watching. Returns the keys that were refetched.
    pub fn invalidate(&self, filter: &KeyFilter) -> Vec<CacheKey> {
        let active = self.inner.store.invalidate(filter);
        let targets: Vec<Query> = {
            let registry = self.inner.lock_registry();
            active
                .into_iter()
                .filter_map(|key| {
                    registry.get(&key).map(|reg| Query {
                        key,
                        fetcher: reg.fetcher.clone(),
                        ttl: reg.ttl,
                    })
                })
                .collect()
        };
        for query in &targets {
            // Completion lands in the store; nobody needs to await it here.
            drop(self.start_fetch(query, true));
        }
        targets.into_iter().map(|q| q.key).collect()
    }

    fn register(&self, query: &Query) {
        let mut registry = self.inner.lock_registry();
        let reg = registry
            .entry(query.key.clone())
            .or_insert_with(|| Registration {
                fetcher: query.fetcher.clone(),
                ttl: query.ttl,
                handles: 0,
            });
        reg.fetcher = query.fetcher.clone();
        reg.ttl = query.ttl;
        reg.handles += 1;
    }

    fn unregister(&self, key: &CacheKey) {
        let mut registry = self.inner.lock_registry();
        if let Some(reg) = registry.get_mut(key) {
            reg.handles = reg.handles.saturating_sub(1);
            if reg.handles == 0 {
                registry.remove(key);
            }
        }
    }

    /// Bind a view to a query.
    pub fn use_result<T: DeserializeOwned>(
        &self,
        query: Query,
        options: QueryOptions,
    ) -> QueryHandle<T> {
        let query = match options.stale_time {
            Some(stale_time) => query.with_ttl(Ttl::Fixed(stale_time)),
            None => query,
        };
        self.register(&query);
        let subscription = self.inner.store.subscribe(&query.key);
        let mut handle = QueryHandle {
            client: self.clone(),
            query,
            options,
            subscription,
            placeholder: None,
            poll: None,
            _marker: PhantomData,
        };
        handle.schedule_poll();
        handle.activate();
        handle
    }
}

/// A view's live binding to one query.
pub struct QueryHandle<T> {
    client: QueryClient,
    query: Query,
    options: QueryOptions,
    subscription: Subscription,
    placeholder: Option<Arc<serde_json::Value>>,
    poll: Option<PollHandle>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> fmt::Debug for QueryHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryHandle")
            .field("key", &self.query.key.to_string())
            .field("options", &self.options)
            .field("has_placeholder", &self.placeholder.is_some())
            .finish()
    }
}

impl<T: DeserializeOwned> QueryHandle<T> {
    pub fn key(&self) -> &CacheKey {
        &self.query.key
    }

    pub fn options(&self) -> &QueryOptions {
        &self.options
    }

    /// Fetch in the background if the entry is missing or stale.
    ///
    /// Failed entries are left alone; they retry on the next poll or an
    /// explicit refetch.
    fn activate(&self) {
        if !self.options.enabled {
            return;
        }
        let store = self.client.store();
        let entry = store.get(&self.query.key);
        let should_fetch = match entry.status {
            EntryStatus::Idle => true,
            EntryStatus::Success => entry.is_stale(store.now()),
            EntryStatus::Loading | EntryStatus::Error => false,
        };
        if should_fetch && !self.client.is_in_flight(&self.query.key) {
            drop(self.client.start_fetch(&self.query, false));
        }
    }

    fn schedule_poll(&mut self) {
        self.poll = match (self.options.enabled, self.options.refetch_interval) {
            (true, Some(interval)) => {
                let store = Arc::downgrade(self.client.store());
                let key = self.query.key.clone();
                Some(spawn_poll(
                    self.client.clone(),
                    self.query.clone(),
                    interval,
                    move || {
                        store
                            .upgrade()
                            .is_some_and(|store| store.subscriber_count(&key) > 0)
                    },
                ))
            }
            _ => None,
        };
    }

    /// Current data, loading and error flags.
    ///
    /// Reading a stale entry triggers a background refresh.
    pub fn state(&self) -> QueryState<T> {
        self.activate();
        let entry = self.client.store().peek(&self.query.key);
        let (status, value, mut error, updated_at) = match entry {
            Some(entry) => (entry.status, entry.value, entry.error, entry.fetched_at),
            None => (EntryStatus::Idle, None, None, None),
        };

        let (value, is_placeholder) = match value {
            Some(value) => (Some(value), false),
            None => (self.placeholder.clone(), self.placeholder.is_some()),
        };
        let mut decode_failed = false;
        let data = value.and_then(|value| match T::deserialize(&*value) {
            Ok(data) => Some(data),
            Err(err) => {
                decode_failed = true;
                error = Some(SyncError::decode(err));
                None
            }
        });

        QueryState {
            data,
            is_loading: status == EntryStatus::Loading
                || (status == EntryStatus::Idle && self.options.enabled),
            is_error: status == EntryStatus::Error || decode_failed,
            error,
            is_placeholder,
            updated_at,
        }
    }

    /// Wait until the entry changes. Returns `false` once the store is gone.
    pub async fn changed(&mut self) -> bool {
        let Some(entry) = self.subscription.recv().await else {
            return false;
        };
        if entry.value.is_some() {
            self.placeholder = None;
        }
        true
    }

    /// Move the handle to another query.
    ///
    /// With `keep_previous_data`, the old value stays visible until the new
    /// key resolves, provided both keys share kind and tenant. A value is
    /// never carried across tenants.
    pub fn set_query(&mut self, query: Query) {
        let query = match self.options.stale_time {
            Some(stale_time) => query.with_ttl(Ttl::Fixed(stale_time)),
            None => query,
        };
        if query.key == self.query.key {
            return;
        }

        self.placeholder = if self.options.keep_previous_data
            && query.key.kind() == self.query.key.kind()
            && query.key.tenant() == self.query.key.tenant()
        {
            self.client
                .store()
                .peek(&self.query.key)
                .and_then(|entry| entry.value)
                .or_else(|| self.placeholder.take())
        } else {
            None
        };

        self.client.register(&query);
        self.subscription = self.client.store().subscribe(&query.key);
        let previous = std::mem::replace(&mut self.query, query);
        self.client.unregister(&previous.key);
        tracing::debug!(from = %previous.key, to = %self.query.key, "Query key changed");
        self.schedule_poll();
        self.activate();
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        if self.options.enabled == enabled {
            return;
        }
        self.options.enabled = enabled;
        self.schedule_poll();
        self.activate();
    }

    /// Fetch again now, superseding any fetch in flight.
    pub async fn refetch(&self) -> FetchResult {
        self.client.refetch(&self.query).await
    }
}

impl<T> Drop for QueryHandle<T> {
    fn drop(&mut self) {
        self.client.unregister(&self.query.key);
    }
}
