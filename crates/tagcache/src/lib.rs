// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! A resilient, tag-invalidated query cache.
//!
//! This crate sits between an application and a remote data source and provides:
//! - Caching of query results by endpoint and canonically serialized arguments
//! - De-duplication of concurrent identical queries into a single fetch
//! - Deterministic fallback data when the remote source is unavailable
//! - Tag-based invalidation, with background refetch of subscribed queries
//! - Subscriptions that keep entries alive, with time-based eviction once unobserved
//! - Structured `tracing` events and, with the `metrics` feature, OpenTelemetry metrics
//!
//! # Examples
//!
//! ```
//! use serde_json::json;
//! use tagcache::{FetchFn, FetchRequest, ListFallback, QueryClient, Tag, TransportFailure};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), tagcache::Error> {
//! // A remote source that is down.
//! let fetcher = FetchFn::new(|_request: FetchRequest| async {
//!     Err::<serde_json::Value, _>(TransportFailure::from("connection refused"))
//! });
//!
//! let client = QueryClient::builder(fetcher)
//!     .fallback(
//!         "jobs",
//!         ListFallback::new([
//!             json!({"id": "1", "title": "Frontend Engineer"}),
//!             json!({"id": "2", "title": "Backend Engineer"}),
//!         ]),
//!     )
//!     .build();
//!
//! let jobs = client.execute("jobs", &json!({"search": "backend"}), Tag::new("Job")).await?;
//! assert_eq!(jobs.data, json!([{"id": "2", "title": "Backend Engineer"}]));
//! assert!(!jobs.from_cache);
//!
//! // Invalidating the tag marks the entry stale, so the next execution reloads it.
//! assert_eq!(client.invalidate(&[Tag::new("Job")]), vec![jobs.key.clone()]);
//! assert!(!client.execute("jobs", &json!({"search": "backend"}), Tag::new("Job")).await?.from_cache);
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - `metrics`: records cache activity through an OpenTelemetry `MeterProvider`
//! - `serde`: serialization of tags, statuses and [`ClientOptions`]
//! - `test-util`: the `testing` module with a scripted fetch collaborator

mod builder;
mod client;
mod error;
mod fallback;
mod fetch;
mod handle;
mod index;
mod key;
mod query;
mod runtime;
mod store;
mod tag;
mod telemetry;
#[cfg(any(feature = "test-util", test))]
#[cfg_attr(docsrs, doc(cfg(feature = "test-util")))]
pub mod testing;

#[doc(inline)]
pub use builder::{ClientOptions, QueryClientBuilder};
#[doc(inline)]
pub use client::{DEFAULT_RETENTION, MutationOutput, QueryClient, QueryOutput, Subscription};
#[doc(inline)]
pub use error::{BoxError, Error, Result, TransportFailure};
#[doc(inline)]
pub use fallback::{Fallback, FallbackRegistry, Generator, ListFallback, RecordFallback};
#[doc(inline)]
pub use fetch::{Fetch, FetchFn, FetchRequest, Method};
#[doc(inline)]
pub use handle::{MutationHandle, MutationState, MutationStatus, QueryHandle};
#[doc(inline)]
pub use index::TagIndex;
#[doc(inline)]
pub use key::{Args, CacheKey, serialize};
#[doc(inline)]
pub use query::Query;
#[doc(inline)]
pub use store::{CacheEntry, CacheStore, DataSource, QueryState, QueryStatus};
#[doc(inline)]
pub use tag::{Provides, Tag};
