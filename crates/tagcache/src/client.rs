// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The query client: executor, invalidation, mutations and subscriptions.

use std::{
    fmt,
    sync::{Arc, Weak},
    time::Duration,
};

use parking_lot::Mutex;
use serde_core::Serialize;
use serde_json::Value;
use tagcache_flight::{Abandoned, InFlight};

use crate::{
    CacheEntry, CacheKey, CacheStore, DataSource, Error, Fallback, FallbackRegistry, Fetch, Method, Provides, Query, QueryStatus,
    Result, Tag, TagIndex,
    builder::QueryClientBuilder,
    handle::{MutationHandle, QueryHandle},
    key::normalize_args,
    runtime::Runtime,
    telemetry::{QueryActivity, QueryOperation, QueryTelemetry, ext::timed},
};

/// How long an entry without subscribers survives before it is evicted.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(60);

/// Data returned by a query.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct QueryOutput {
    /// The cache key the data is stored under.
    pub key: CacheKey,
    /// The response, remote or synthesized.
    pub data: Value,
    /// Where the data came from.
    pub source: DataSource,
    /// `true` if the data was served from the cache without a load.
    pub from_cache: bool,
}

/// Data returned by a mutation.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct MutationOutput {
    /// The response, remote or synthesized.
    pub data: Value,
    /// Where the data came from.
    pub source: DataSource,
    /// Keys marked stale by the mutation's invalidation, in order.
    pub invalidated: Vec<CacheKey>,
}

/// A resilient query cache in front of a remote fetch collaborator.
///
/// Queries are cached by endpoint and arguments, concurrent identical queries share a single
/// fetch, failed fetches fall back to deterministic synthetic data, and mutations invalidate
/// cached queries by tag. Cloning is cheap; all clones share one cache.
///
/// # Examples
///
/// ```
/// use serde_json::json;
/// use tagcache::{FetchFn, FetchRequest, ListFallback, QueryClient, Tag, TransportFailure};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), tagcache::Error> {
/// let offline = FetchFn::new(|_request: FetchRequest| async { Err::<serde_json::Value, _>(TransportFailure::from("offline")) });
///
/// let client = QueryClient::builder(offline)
///     .name("jobs_api")
///     .fallback("jobs", ListFallback::new([json!({"id": "1", "title": "Frontend Engineer"})]))
///     .build();
///
/// let jobs = client.execute("jobs", &json!({"search": "front"}), Tag::new("Job")).await?;
/// assert_eq!(jobs.data, json!([{"id": "1", "title": "Frontend Engineer"}]));
///
/// let again = client.execute("jobs", &json!({"search": "front"}), Tag::new("Job")).await?;
/// assert!(again.from_cache);
/// # Ok(())
/// # }
/// ```
pub struct QueryClient<F> {
    inner: Arc<Inner<F>>,
}

impl<F> Clone for QueryClient<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F> fmt::Debug for QueryClient<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.inner.state.lock().store.len();
        f.debug_struct("QueryClient")
            .field("name", &self.inner.telemetry.name())
            .field("entries", &entries)
            .field("in_flight", &self.inner.flights.len())
            .field("retention", &self.inner.retention)
            .field("fallbacks", &self.inner.fallbacks)
            .finish_non_exhaustive()
    }
}

pub(crate) struct Inner<F> {
    fetcher: F,
    fallbacks: FallbackRegistry,
    state: Mutex<CacheState>,
    flights: InFlight<CacheKey, Result<QueryOutput>>,
    retention: Duration,
    telemetry: QueryTelemetry,
    runtime: Runtime,
}

/// The store and the tag index, guarded together.
#[derive(Debug, Default)]
struct CacheState {
    store: CacheStore,
    index: TagIndex,
}

impl<F: Fetch> QueryClient<F> {
    /// Starts building a client around `fetcher`.
    pub fn builder(fetcher: F) -> QueryClientBuilder<F> {
        QueryClientBuilder::new(fetcher)
    }

    pub(crate) fn from_parts(
        fetcher: F,
        fallbacks: FallbackRegistry,
        retention: Duration,
        telemetry: QueryTelemetry,
        runtime: Runtime,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                fetcher,
                fallbacks,
                state: Mutex::default(),
                flights: InFlight::new(),
                retention,
                telemetry,
                runtime,
            }),
        }
    }

    /// Executes `endpoint` with `args`, serving a fresh cached result when one exists.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] for arguments that are not a JSON object (the cache is
    /// left untouched), [`Error::UnknownEndpoint`] when the fetch fails and no fallback is
    /// registered, and [`Error::Abandoned`] if the shared load was torn down.
    pub async fn execute<A>(&self, endpoint: &str, args: &A, provides: impl Into<Provides>) -> Result<QueryOutput>
    where
        A: Serialize + ?Sized,
    {
        let query = Query::with_args(endpoint, args)?.provides(provides);
        self.execute_query(&query).await
    }

    /// Executes `query`, serving a fresh cached result when one exists.
    ///
    /// # Errors
    ///
    /// See [`execute`](Self::execute).
    pub async fn execute_query(&self, query: &Query) -> Result<QueryOutput> {
        let key = query.key();
        if let Some(output) = self.inner.cached(key) {
            self.inner.telemetry.record(QueryOperation::Query, QueryActivity::Hit, Some(key), None);
            return Ok(output);
        }

        self.inner.telemetry.record(QueryOperation::Query, QueryActivity::Miss, Some(key), None);
        self.load(query.clone()).await
    }

    /// Reloads `query` even if a fresh result is cached. Concurrent loads are still shared.
    ///
    /// # Errors
    ///
    /// See [`execute`](Self::execute).
    pub async fn refetch(&self, query: &Query) -> Result<QueryOutput> {
        self.inner.telemetry.record(QueryOperation::Query, QueryActivity::Refetch, Some(query.key()), None);
        self.load(query.clone()).await
    }

    /// Sends a write to `endpoint`, then invalidates `invalidates`.
    ///
    /// Mutations are never cached and never de-duplicated. A failed fetch falls back to the
    /// generator registered for the endpoint; the invalidation runs after either kind of
    /// success.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] for invalid arguments and [`Error::Mutation`] when the
    /// fetch fails and no fallback is registered. Nothing is invalidated in either case.
    pub async fn mutate<A>(&self, endpoint: &str, args: &A, invalidates: &[Tag]) -> Result<MutationOutput>
    where
        A: Serialize + ?Sized,
    {
        let query = Query::from_parts(endpoint, normalize_args(endpoint, args)?);
        let key = query.key();
        let telemetry = &self.inner.telemetry;

        let timed = timed(self.inner.fetcher.fetch(query.request(Method::Mutate))).await;
        let (data, source) = match timed.result {
            Ok(data) => {
                telemetry.record(QueryOperation::Mutate, QueryActivity::Mutated, Some(key), Some(timed.duration));
                (data, DataSource::Remote)
            }
            Err(transport) => {
                telemetry.record_error(QueryOperation::Mutate, QueryActivity::TransportFailure, key, &transport);
                match self.inner.fallbacks.synthesize(endpoint, query.args()) {
                    Fallback::Data(data) => {
                        telemetry.record(QueryOperation::Mutate, QueryActivity::Fallback, Some(key), Some(timed.duration));
                        (data, DataSource::Fallback)
                    }
                    Fallback::UnknownEndpoint => {
                        let error = Error::Mutation {
                            endpoint: endpoint.to_owned(),
                            transport,
                        };
                        telemetry.record_error(QueryOperation::Mutate, QueryActivity::MutationFailed, key, &error);
                        return Err(error);
                    }
                }
            }
        };

        let invalidated = self.invalidate(invalidates);
        Ok(MutationOutput { data, source, invalidated })
    }

    /// Marks every entry providing a tag matched by `tags` as stale and refetches the ones that
    /// are subscribed. Returns the matched keys in order.
    ///
    /// Consumers keep seeing the old data until the refetch resolves. Entries that are loading
    /// remember the invalidation and are re-checked when their load writes.
    pub fn invalidate(&self, tags: &[Tag]) -> Vec<CacheKey> {
        if tags.is_empty() {
            return Vec::new();
        }

        let (keys, refetch) = {
            let mut state = self.inner.state.lock();
            let CacheState { store, index } = &mut *state;

            let keys = index.invalidate(tags);
            let mut refetch = Vec::new();
            for key in &keys {
                store.update(key, |entry| {
                    entry.invalidate(tags);
                    if entry.subscriber_count() > 0 && entry.status() != QueryStatus::Loading {
                        refetch.push(entry.query().clone());
                    }
                });
            }

            // First loads are not indexed yet; their writes re-check the tags instead.
            for key in store.loading_keys() {
                if keys.binary_search(&key).is_err() {
                    store.update(&key, |entry| entry.defer_invalidation(tags));
                }
            }

            (keys, refetch)
        };

        for key in &keys {
            self.inner.telemetry.record(QueryOperation::Invalidate, QueryActivity::Stale, Some(key), None);
        }
        for query in refetch {
            self.inner.telemetry.record(QueryOperation::Invalidate, QueryActivity::Refetch, Some(query.key()), None);
            self.spawn_load(query);
        }

        keys
    }

    /// Starts observing `query`.
    ///
    /// The entry is created if needed and loaded in the background unless it already holds
    /// fresh data or is loading. Dropping the returned [`Subscription`] unsubscribes.
    pub fn subscribe(&self, query: Query) -> Subscription<F> {
        let (subscription, _state) = self.subscribe_watching(query);
        subscription
    }

    /// Ends `subscription`. Equivalent to dropping it.
    pub fn unsubscribe(&self, subscription: Subscription<F>) {
        drop(subscription);
    }

    pub(crate) fn subscribe_watching(&self, query: Query) -> (Subscription<F>, tokio::sync::watch::Receiver<crate::QueryState>) {
        let (needs_load, state) = {
            let mut guard = self.inner.state.lock();
            let (entry, state) = guard.store.subscribe(&query);
            (!entry.is_fresh() && entry.status() != QueryStatus::Loading, state)
        };

        self.inner
            .telemetry
            .record(QueryOperation::Subscribe, QueryActivity::Subscribed, Some(query.key()), None);

        let subscription = Subscription {
            client: self.clone(),
            key: query.key().clone(),
        };
        if needs_load {
            self.spawn_load(query);
        }
        (subscription, state)
    }

    /// Creates a handle that observes `query` for as long as it lives.
    pub fn query(&self, query: Query) -> QueryHandle<F> {
        QueryHandle::new(self.clone(), query)
    }

    /// Creates a handle that triggers writes to `endpoint` invalidating `invalidates`.
    pub fn mutation(&self, endpoint: impl Into<String>, invalidates: impl IntoIterator<Item = Tag>) -> MutationHandle<F> {
        MutationHandle::new(self.clone(), endpoint.into(), invalidates.into_iter().collect())
    }

    /// Clears the cache and the tag index.
    ///
    /// Subscribed entries survive as idle entries and are reloaded in the background so their
    /// observers recover.
    pub fn reset(&self) {
        let reload: Vec<Query> = {
            let mut state = self.inner.state.lock();
            state.index.clear();
            state.store.reset();
            state.store.subscribed().map(|entry| entry.query().clone()).collect()
        };

        self.inner.telemetry.record(QueryOperation::Reset, QueryActivity::Cleared, None, None);
        for query in reload {
            self.spawn_load(query);
        }
    }

    /// Evicts every unsubscribed entry that was not accessed within the retention window and
    /// returns the evicted keys.
    pub fn sweep(&self) -> Vec<CacheKey> {
        let evicted = {
            let mut state = self.inner.state.lock();
            let evicted = state.store.sweep(self.inner.retention);
            for key in &evicted {
                state.index.remove(key);
            }
            evicted
        };

        for key in &evicted {
            self.inner.telemetry.record(QueryOperation::Evict, QueryActivity::Evicted, Some(key), None);
        }
        evicted
    }

    /// Returns a copy of the entry for `key`, recording the access.
    pub fn entry(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.inner.state.lock().store.get(key)
    }

    /// Returns every entry providing a tag matched by `tag`.
    pub fn entries_by_tag(&self, tag: &Tag) -> Vec<CacheEntry> {
        self.inner.state.lock().store.entries_by_tag(tag)
    }

    /// Returns the cached keys in order.
    pub fn keys(&self) -> Vec<CacheKey> {
        self.inner.state.lock().store.keys()
    }

    /// Returns the number of cached entries.
    pub fn len(&self) -> usize {
        self.inner.state.lock().store.len()
    }

    /// Returns `true` if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.inner.state.lock().store.is_empty()
    }

    /// Returns the number of loads currently in flight.
    pub fn in_flight(&self) -> usize {
        self.inner.flights.len()
    }

    /// The retention window of unsubscribed entries.
    pub fn retention(&self) -> Duration {
        self.inner.retention
    }

    async fn load(&self, query: Query) -> Result<QueryOutput> {
        let key = query.key().clone();

        // Only the caller that starts the shared load numbers it; joiners wait for its result.
        let inner = Arc::clone(&self.inner);
        let start = move || {
            let load = inner.state.lock().store.begin_loading(&query);
            inner.resolve(query, load)
        };
        let outcome = match self.inner.flights.get_or_start(key.clone(), start).await {
            Ok(outcome) => outcome,
            Err(Abandoned) => {
                let error = Error::Abandoned { key: key.clone() };
                self.inner.abandon(&key, &error);
                Err(error)
            }
        };

        self.requeue_if_stale(&key);
        outcome
    }

    /// Reloads `key` if an invalidation arrived while its last load was in flight.
    ///
    /// Runs after the shared load has settled, so the reload starts a new fetch instead of
    /// joining the one that produced the stale data.
    fn requeue_if_stale(&self, key: &CacheKey) {
        let query = {
            let state = self.inner.state.lock();
            state
                .store
                .peek(key)
                .filter(|entry| entry.is_stale() && entry.subscriber_count() > 0 && entry.status() != QueryStatus::Loading)
                .map(|entry| entry.query().clone())
        };

        if let Some(query) = query {
            self.inner
                .telemetry
                .record(QueryOperation::Invalidate, QueryActivity::Requeued, Some(query.key()), None);
            self.spawn_load(query);
        }
    }

    fn spawn_load(&self, query: Query) {
        let client = self.clone();
        let key = query.key().clone();
        let spawned = self.inner.runtime.spawn(async move {
            if client.inner.is_fresh(query.key()) {
                return;
            }
            if let Err(error) = client.load(query).await {
                tracing::debug!(cache.name = client.inner.telemetry.name(), %error, "background load failed");
            }
        });

        if !spawned {
            tracing::debug!(
                cache.name = self.inner.telemetry.name(),
                cache.key = key.as_str(),
                "no runtime available, background load skipped"
            );
        }
    }

    fn release(&self, key: &CacheKey) {
        let last = self.inner.state.lock().store.unsubscribe(key);
        self.inner
            .telemetry
            .record(QueryOperation::Subscribe, QueryActivity::Unsubscribed, Some(key), None);

        let Some(generation) = last else {
            return;
        };

        if self.inner.retention.is_zero() {
            self.inner.evict_if_unused(key, generation);
            return;
        }

        let inner: Weak<Inner<F>> = Arc::downgrade(&self.inner);
        let retention = self.inner.retention;
        let evict_key = key.clone();
        let scheduled = self.inner.runtime.spawn(async move {
            tokio::time::sleep(retention).await;
            if let Some(inner) = inner.upgrade() {
                inner.evict_if_unused(&evict_key, generation);
            }
        });

        if !scheduled {
            tracing::debug!(
                cache.name = self.inner.telemetry.name(),
                cache.key = key.as_str(),
                "no runtime available, eviction left to sweep"
            );
        }
    }
}

impl<F: Fetch> Inner<F> {
    fn cached(&self, key: &CacheKey) -> Option<QueryOutput> {
        let entry = self.state.lock().store.get(key)?;
        if !entry.is_fresh() {
            return None;
        }

        Some(QueryOutput {
            key: key.clone(),
            data: entry.data()?.clone(),
            source: entry.source()?,
            from_cache: true,
        })
    }

    fn is_fresh(&self, key: &CacheKey) -> bool {
        self.state.lock().store.peek(key).is_some_and(CacheEntry::is_fresh)
    }

    /// The body of a shared load: primary fetch, fallback on failure, then the write.
    async fn resolve(self: Arc<Self>, query: Query, load: u64) -> Result<QueryOutput> {
        let key = query.key();
        let timed = timed(self.fetcher.fetch(query.request(Method::Query))).await;

        match timed.result {
            Ok(data) => {
                self.telemetry
                    .record(QueryOperation::Query, QueryActivity::Fetched, Some(key), Some(timed.duration));
                Ok(self.store_success(&query, data, DataSource::Remote, load))
            }
            Err(transport) => {
                self.telemetry
                    .record_error(QueryOperation::Query, QueryActivity::TransportFailure, key, &transport);

                match self.fallbacks.synthesize(query.endpoint(), query.args()) {
                    Fallback::Data(data) => {
                        self.telemetry
                            .record(QueryOperation::Query, QueryActivity::Fallback, Some(key), Some(timed.duration));
                        Ok(self.store_success(&query, data, DataSource::Fallback, load))
                    }
                    Fallback::UnknownEndpoint => {
                        let error = Error::UnknownEndpoint {
                            endpoint: query.endpoint().to_owned(),
                            transport,
                        };
                        self.telemetry
                            .record_error(QueryOperation::Query, QueryActivity::UnknownEndpoint, key, &error);
                        self.store_error(&query, error.clone(), load);
                        Err(error)
                    }
                }
            }
        }
    }

    fn store_success(&self, query: &Query, data: Value, source: DataSource, load: u64) -> QueryOutput {
        let key = query.key().clone();
        let tags = query.tags().resolve(&data, query.args());
        let entry = CacheEntry::success(query.clone(), data.clone(), source, tags.clone());

        let written = {
            let mut state = self.state.lock();
            let written = state.store.complete_load(key.clone(), entry, load);
            if written.is_some() {
                state.index.index(&key, tags);
            }
            written
        };

        match written {
            Some(true) => self
                .telemetry
                .record(QueryOperation::Invalidate, QueryActivity::Stale, Some(&key), None),
            Some(false) => {}
            None => tracing::debug!(
                cache.name = self.telemetry.name(),
                cache.key = key.as_str(),
                "result of a superseded load discarded"
            ),
        }

        QueryOutput {
            key,
            data,
            source,
            from_cache: false,
        }
    }

    fn store_error(&self, query: &Query, error: Error, load: u64) {
        let key = query.key().clone();
        let tags = query.tags().resolve(&Value::Null, query.args());
        let entry = CacheEntry::failed(query.clone(), error, tags.clone());

        let mut state = self.state.lock();
        if state.store.complete_load(key.clone(), entry, load).is_some() {
            state.index.index(&key, tags);
        }
    }

    /// Records a torn-down load as an error so observers stop waiting on it.
    fn abandon(&self, key: &CacheKey, error: &Error) {
        let loading = {
            let state = self.state.lock();
            state
                .store
                .peek(key)
                .filter(|entry| entry.status() == QueryStatus::Loading)
                .map(|entry| (entry.query().clone(), entry.load_sequence()))
        };

        if let Some((query, load)) = loading {
            self.telemetry
                .record_error(QueryOperation::Query, QueryActivity::Abandoned, key, error);
            self.store_error(&query, error.clone(), load);
        }
    }

    fn evict_if_unused(&self, key: &CacheKey, generation: u64) {
        let evicted = {
            let mut state = self.state.lock();
            let unused = state
                .store
                .peek(key)
                .is_some_and(|entry| entry.subscriber_count() == 0 && entry.generation() == generation);
            if unused {
                state.store.delete(key);
                state.index.remove(key);
            }
            unused
        };

        if evicted {
            self.telemetry.record(QueryOperation::Evict, QueryActivity::Evicted, Some(key), None);
        }
    }
}

/// An active observation of a cached query.
///
/// While at least one subscription exists the entry is never evicted and tag invalidations
/// refetch it in the background. Dropping the subscription unsubscribes; once the last one is
/// gone the entry is evicted after the retention window unless a new subscription arrives.
#[must_use = "dropping a subscription unsubscribes immediately"]
pub struct Subscription<F: Fetch> {
    client: QueryClient<F>,
    key: CacheKey,
}

impl<F: Fetch> Subscription<F> {
    /// The key being observed.
    #[must_use]
    pub fn key(&self) -> &CacheKey {
        &self.key
    }
}

impl<F: Fetch> fmt::Debug for Subscription<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("key", &self.key).finish_non_exhaustive()
    }
}

impl<F: Fetch> Drop for Subscription<F> {
    fn drop(&mut self) {
        self.client.release(&self.key);
    }
}
