// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Consumer-facing handles over queries and mutations.

use std::fmt;

use parking_lot::Mutex;
use serde_core::Serialize;
use serde_json::Value;
use tokio::sync::watch;

use crate::{CacheKey, Error, Fetch, MutationOutput, Query, QueryClient, QueryOutput, QueryState, Result, Subscription, Tag};

/// Observes one query for as long as the handle lives.
///
/// The handle holds a subscription, so the entry is kept alive, loaded on creation and
/// refetched in the background when one of its tags is invalidated. Every change to the entry
/// is visible through [`changed`](Self::changed).
///
/// # Examples
///
/// ```
/// use serde_json::json;
/// use tagcache::{FetchFn, FetchRequest, Query, QueryClient, QueryStatus, TransportFailure};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let fetcher = FetchFn::new(|_request: FetchRequest| async { Ok::<_, TransportFailure>(json!(["ada"])) });
/// let client = QueryClient::builder(fetcher).build();
///
/// let mut users = client.query(Query::new("users"));
/// while users.state().status != QueryStatus::Success {
///     users.changed().await;
/// }
/// assert_eq!(users.state().data, Some(json!(["ada"])));
/// # }
/// ```
pub struct QueryHandle<F: Fetch> {
    client: QueryClient<F>,
    query: Query,
    subscription: Subscription<F>,
    state: watch::Receiver<QueryState>,
}

impl<F: Fetch> QueryHandle<F> {
    pub(crate) fn new(client: QueryClient<F>, query: Query) -> Self {
        let (subscription, state) = client.subscribe_watching(query.clone());
        Self {
            client,
            query,
            subscription,
            state,
        }
    }

    /// The current snapshot of the entry.
    #[must_use]
    pub fn state(&self) -> QueryState {
        self.state.borrow().clone()
    }

    /// Waits for the entry to change and returns the new snapshot.
    ///
    /// Returns `None` if the entry no longer exists.
    pub async fn changed(&mut self) -> Option<QueryState> {
        self.state.changed().await.ok()?;
        Some(self.state.borrow_and_update().clone())
    }

    /// Reloads the query, bypassing a fresh cached result.
    ///
    /// # Errors
    ///
    /// See [`QueryClient::execute`].
    pub async fn refetch(&self) -> Result<QueryOutput> {
        self.client.refetch(&self.query).await
    }

    /// The observed query.
    #[must_use]
    pub fn query(&self) -> &Query {
        &self.query
    }

    /// The observed cache key.
    #[must_use]
    pub fn key(&self) -> &CacheKey {
        self.query.key()
    }

    /// Switches the handle to `query`.
    ///
    /// The new query is subscribed before the old one is released, so an entry shared by both
    /// keeps its subscriber throughout.
    pub fn set_query(&mut self, query: Query) {
        let (subscription, state) = self.client.subscribe_watching(query.clone());
        self.query = query;
        self.state = state;
        // Dropping the previous subscription releases the old entry.
        self.subscription = subscription;
    }
}

impl<F: Fetch> fmt::Debug for QueryHandle<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryHandle")
            .field("query", &self.query)
            .field("subscription", &self.subscription)
            .finish_non_exhaustive()
    }
}

/// Lifecycle of a [`MutationHandle`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MutationStatus {
    /// Never triggered, or reset.
    Idle,
    /// A trigger is running.
    Loading,
    /// The last trigger succeeded.
    Success,
    /// The last trigger failed.
    Error,
}

/// A snapshot of a [`MutationHandle`].
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct MutationState {
    /// Current lifecycle state.
    pub status: MutationStatus,
    /// Data returned by the last successful trigger.
    pub data: Option<Value>,
    /// The error of the last failed trigger.
    pub error: Option<Error>,
}

impl MutationState {
    const fn idle() -> Self {
        Self {
            status: MutationStatus::Idle,
            data: None,
            error: None,
        }
    }
}

/// Triggers writes to one endpoint and tracks the outcome of the last one.
pub struct MutationHandle<F: Fetch> {
    client: QueryClient<F>,
    endpoint: String,
    invalidates: Vec<Tag>,
    state: Mutex<MutationState>,
}

impl<F: Fetch> MutationHandle<F> {
    pub(crate) fn new(client: QueryClient<F>, endpoint: String, invalidates: Vec<Tag>) -> Self {
        Self {
            client,
            endpoint,
            invalidates,
            state: Mutex::new(MutationState::idle()),
        }
    }

    /// Sends the write with `args` and invalidates the handle's tags on success.
    ///
    /// # Errors
    ///
    /// See [`QueryClient::mutate`]. The error is also kept in [`state`](Self::state).
    pub async fn trigger<A>(&self, args: &A) -> Result<MutationOutput>
    where
        A: Serialize + ?Sized,
    {
        *self.state.lock() = MutationState {
            status: MutationStatus::Loading,
            ..MutationState::idle()
        };

        let outcome = self.client.mutate(&self.endpoint, args, &self.invalidates).await;
        *self.state.lock() = match &outcome {
            Ok(output) => MutationState {
                status: MutationStatus::Success,
                data: Some(output.data.clone()),
                error: None,
            },
            Err(error) => MutationState {
                status: MutationStatus::Error,
                data: None,
                error: Some(error.clone()),
            },
        };
        outcome
    }

    /// The current lifecycle state.
    #[must_use]
    pub fn status(&self) -> MutationStatus {
        self.state.lock().status
    }

    /// A snapshot of the last outcome.
    #[must_use]
    pub fn state(&self) -> MutationState {
        self.state.lock().clone()
    }

    /// Forgets the last outcome.
    pub fn reset(&self) {
        *self.state.lock() = MutationState::idle();
    }

    /// The endpoint written to.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl<F: Fetch> fmt::Debug for MutationHandle<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationHandle")
            .field("endpoint", &self.endpoint)
            .field("invalidates", &self.invalidates)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{QueryStatus, testing::ScriptedFetcher};

    #[tokio::test]
    async fn query_handle_follows_the_entry() {
        let fetcher = ScriptedFetcher::new();
        fetcher.respond("users", json!(["ada"]));
        let client = QueryClient::builder(fetcher).logs(false).build();

        let mut handle = client.query(Query::new("users"));
        assert_eq!(handle.key().as_str(), "users({})");

        let mut state = handle.state();
        while state.status != QueryStatus::Success {
            state = handle.changed().await.unwrap();
        }
        assert_eq!(state.data, Some(json!(["ada"])));
        assert_eq!(client.entry(handle.key()).unwrap().subscriber_count(), 1);
    }

    #[tokio::test]
    async fn set_query_moves_the_subscription() {
        let fetcher = ScriptedFetcher::new();
        fetcher.respond("users", json!([]));
        let client = QueryClient::builder(fetcher).logs(false).build();

        let mut handle = client.query(Query::with_args("users", &json!({"page": 1})).unwrap());
        let first = handle.key().clone();
        handle.set_query(Query::with_args("users", &json!({"page": 2})).unwrap());

        assert_eq!(handle.query().args().get("page"), Some(&json!(2)));
        assert_eq!(client.entry(&first).unwrap().subscriber_count(), 0);
        assert_eq!(client.entry(handle.key()).unwrap().subscriber_count(), 1);
    }

    #[tokio::test]
    async fn mutation_handle_tracks_outcome() {
        let fetcher = ScriptedFetcher::new();
        fetcher.respond("jobs.create", json!({"id": "3"}));
        let client = QueryClient::builder(fetcher.clone()).logs(false).build();

        let create = client.mutation("jobs.create", [Tag::new("Job")]);
        assert_eq!(create.status(), MutationStatus::Idle);

        create.trigger(&json!({"title": "QA"})).await.unwrap();
        assert_eq!(create.status(), MutationStatus::Success);
        assert_eq!(create.state().data, Some(json!({"id": "3"})));

        fetcher.fail("jobs.create", "offline");
        create.trigger(&json!({"title": "QA"})).await.unwrap_err();
        let state = create.state();
        assert_eq!(state.status, MutationStatus::Error);
        assert!(state.data.is_none());
        assert!(matches!(state.error, Some(Error::Mutation { .. })));

        create.reset();
        assert_eq!(create.status(), MutationStatus::Idle);
        assert_eq!(create.endpoint(), "jobs.create");
    }
}
