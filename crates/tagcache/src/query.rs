// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Query descriptions: endpoint, normalized arguments and provided tags.

use std::sync::Arc;

use serde_core::Serialize;

use crate::{Args, CacheKey, FetchRequest, Method, Provides, Result, key::normalize_args};

/// A query definition: an endpoint, its normalized arguments and the tags it provides.
///
/// The cache key is computed once when the query is built. Cloning is cheap enough to hand a
/// copy to every background refetch.
///
/// # Examples
///
/// ```
/// use serde_json::json;
/// use tagcache::{Query, Tag};
///
/// let query = Query::with_args("jobs", &json!({"search": "front", "page": null}))?
///     .provides([Tag::new("Job")]);
///
/// assert_eq!(query.key().as_str(), r#"jobs({"search":"front"})"#);
/// # Ok::<(), tagcache::Error>(())
/// ```
#[derive(Clone, Debug)]
pub struct Query {
    endpoint: Arc<str>,
    args: Arc<Args>,
    provides: Provides,
    key: CacheKey,
}

impl Query {
    /// Creates a query for `endpoint` without arguments.
    #[must_use]
    pub fn new(endpoint: &str) -> Self {
        Self::from_parts(endpoint, Args::new())
    }

    /// Creates a query for `endpoint` called with `args`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`](crate::Error::Serialization) if `args` does not
    /// serialize to a JSON object.
    pub fn with_args<A>(endpoint: &str, args: &A) -> Result<Self>
    where
        A: Serialize + ?Sized,
    {
        normalize_args(endpoint, args).map(|args| Self::from_parts(endpoint, args))
    }

    pub(crate) fn from_parts(endpoint: &str, args: Args) -> Self {
        Self {
            key: CacheKey::from_args(endpoint, &args),
            endpoint: Arc::from(endpoint),
            args: Arc::new(args),
            provides: Provides::Nothing,
        }
    }

    /// Sets the tags this query provides.
    #[must_use]
    pub fn provides(mut self, provides: impl Into<Provides>) -> Self {
        self.provides = provides.into();
        self
    }

    /// The endpoint name.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// The normalized arguments.
    #[must_use]
    pub fn args(&self) -> &Args {
        &self.args
    }

    /// The cache key.
    #[must_use]
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// The tags-provider.
    #[must_use]
    pub fn tags(&self) -> &Provides {
        &self.provides
    }

    pub(crate) fn request(&self, method: Method) -> FetchRequest {
        FetchRequest {
            endpoint: Arc::clone(&self.endpoint),
            args: Arc::clone(&self.args),
            method,
        }
    }
}
