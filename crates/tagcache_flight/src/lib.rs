// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Collapses concurrent identical async requests into a single execution.
//!
//! This crate provides [`InFlight`], a registry of requests that are currently running.
//! When several callers ask for the same key while a request for it is still pending, only
//! the first caller's executor runs. Every caller, including the first, receives a clone of
//! that single result.
//!
//! # Example
//!
//! ```
//! use tagcache_flight::InFlight;
//!
//! # async fn example() {
//! let flights: InFlight<String, String> = InFlight::new();
//!
//! // Concurrent calls with the same key share one execution.
//! let result = flights
//!     .get_or_start("jobs({})".to_string(), || async { "[]".to_string() })
//!     .await;
//! assert_eq!(result.unwrap(), "[]");
//! # }
//! ```
//!
//! # Settlement
//!
//! A request is removed from the registry the moment it settles, so a call that arrives
//! after settlement starts a fresh request instead of replaying an old result.
//!
//! When a Tokio runtime is available the executor is driven by a spawned task. It then runs
//! to completion even if every caller stops waiting, and stays registered until it settles,
//! so a caller arriving in the meantime joins it instead of starting a second execution.
//! Outside a runtime the executor is driven by the callers themselves; if all of them are
//! dropped the request is discarded and removed.
//!
//! # Panics
//!
//! If the executor panics, every waiter receives [`Abandoned`] and the request is removed, so
//! the next call for the same key starts over.

use std::{
    collections::HashMap,
    fmt::Debug,
    hash::Hash,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};

use futures_util::{
    FutureExt,
    future::{BoxFuture, Shared, WeakShared},
};
use parking_lot::Mutex;

type SharedMapping<K, T> = Arc<Mutex<HashMap<K, Flight<T>>>>;

type FlightFuture<T> = Shared<BoxFuture<'static, Result<T, Abandoned>>>;

type WeakFlightFuture<T> = WeakShared<BoxFuture<'static, Result<T, Abandoned>>>;

/// The shared request for a key stopped before producing a value.
///
/// Returned to every waiter when the executor panicked or the runtime driving it shut down.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("in-flight request was abandoned before it settled")]
pub struct Abandoned;

/// Registry of pending requests with duplicate suppression.
///
/// Cloning an `InFlight` is cheap and yields a handle to the same registry.
pub struct InFlight<K, T> {
    mapping: SharedMapping<K, T>,
    next_id: Arc<AtomicU64>,
}

impl<K, T> Clone for InFlight<K, T> {
    fn clone(&self) -> Self {
        Self {
            mapping: Arc::clone(&self.mapping),
            next_id: Arc::clone(&self.next_id),
        }
    }
}

impl<K, T> Default for InFlight<K, T> {
    fn default() -> Self {
        Self {
            mapping: Arc::default(),
            next_id: Arc::default(),
        }
    }
}

impl<K: Debug, T> Debug for InFlight<K, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mapping = self.mapping.lock();
        f.debug_struct("InFlight").field("keys", &mapping.keys().collect::<Vec<_>>()).finish()
    }
}

struct Flight<T> {
    id: u64,
    future: Driver<T>,
    waiters: Arc<AtomicUsize>,
}

/// How the registry holds on to a flight.
enum Driver<T> {
    /// Driven by a spawned task, which runs to completion whether or not anyone waits. Held
    /// strongly until [`Settle`] removes it.
    Spawned(FlightFuture<T>),
    /// Driven by its waiters and discarded once the last of them is dropped.
    Callers(WeakFlightFuture<T>),
}

impl<T: Clone> Driver<T> {
    fn join(&self) -> Option<FlightFuture<T>> {
        match self {
            Self::Spawned(future) => Some(future.clone()),
            Self::Callers(weak) => weak.upgrade(),
        }
    }
}

/// Removes the flight from the registry when the executor settles, unwinds or is dropped.
struct Settle<K: Hash + Eq, T> {
    mapping: SharedMapping<K, T>,
    key: K,
    id: u64,
}

impl<K: Hash + Eq, T> Drop for Settle<K, T> {
    fn drop(&mut self) {
        let mut mapping = self.mapping.lock();
        if mapping.get(&self.key).is_some_and(|flight| flight.id == self.id) {
            mapping.remove(&self.key);
        }
    }
}

/// Keeps the waiter count of a flight accurate while a caller awaits it.
struct WaiterGuard(Arc<AtomicUsize>);

impl WaiterGuard {
    fn join(waiters: &Arc<AtomicUsize>) -> Self {
        waiters.fetch_add(1, Ordering::AcqRel);
        Self(Arc::clone(waiters))
    }
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl<K, T> InFlight<K, T>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    /// Creates an empty registry.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Joins the pending request for `key`, or starts one by calling `executor`.
    ///
    /// `executor` is only called when no request for `key` is pending; otherwise it is dropped
    /// unused and the caller waits for the pending request's result.
    ///
    /// # Errors
    ///
    /// Returns [`Abandoned`] if the request stopped without producing a value.
    pub fn get_or_start<F, Fut>(&self, key: K, executor: F) -> impl Future<Output = Result<T, Abandoned>> + Send + 'static
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let mut mapping = self.mapping.lock();

        let joined = mapping
            .get(&key)
            .and_then(|flight| Some((flight.future.join()?, WaiterGuard::join(&flight.waiters))));

        let (future, guard) = if let Some(joined) = joined {
            joined
        } else {
            // Either nothing is pending, or a caller-driven flight was dropped by all of its
            // waiters before settling. Both cases start a fresh request.
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let settle = Settle {
                mapping: Arc::clone(&self.mapping),
                key: key.clone(),
                id,
            };
            let work = executor();
            let (future, driver) = Self::drive(async move {
                let value = work.await;
                drop(settle);
                value
            });

            let waiters = Arc::new(AtomicUsize::new(0));
            let guard = WaiterGuard::join(&waiters);
            if let Some(driver) = driver {
                mapping.insert(key, Flight { id, future: driver, waiters });
            }
            (future, guard)
        };
        drop(mapping);

        async move {
            let result = future.await;
            drop(guard);
            result
        }
    }

    /// Returns `true` if a request for `key` is pending.
    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.mapping.lock().contains_key(key)
    }

    /// Returns the number of callers currently waiting on the request for `key`.
    #[must_use]
    pub fn waiters(&self, key: &K) -> Option<usize> {
        self.mapping.lock().get(key).map(|flight| flight.waiters.load(Ordering::Acquire))
    }

    /// Returns the number of pending requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.mapping.lock().len()
    }

    /// Returns `true` if no request is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mapping.lock().is_empty()
    }

    /// Wraps `work` into the shared future handed to waiters, together with the handle the
    /// registry keeps for later joiners.
    fn drive<Fut>(work: Fut) -> (FlightFuture<T>, Option<Driver<T>>)
    where
        Fut: Future<Output = T> + Send + 'static,
    {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let task = handle.spawn(work);
                let future = async move { task.await.map_err(|_join_error| Abandoned) }.boxed().shared();
                let driver = Driver::Spawned(future.clone());
                (future, Some(driver))
            }
            Err(_) => {
                let future = std::panic::AssertUnwindSafe(work)
                    .catch_unwind()
                    .map(|result| result.map_err(|_panic| Abandoned))
                    .boxed()
                    .shared();
                let driver = future.downgrade().map(Driver::Callers);
                (future, driver)
            }
        }
    }
}
