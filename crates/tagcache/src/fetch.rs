// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The fetch collaborator seam and the requests sent through it.

use std::{fmt, sync::Arc};

use serde_json::Value;

use crate::{Args, TransportFailure};

/// Whether a request reads or writes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Method {
    /// A cached, de-duplicated read.
    Query,
    /// An uncached write.
    Mutate,
}

/// A request handed to the remote fetch collaborator.
#[derive(Clone, Debug, PartialEq)]
pub struct FetchRequest {
    /// The endpoint name.
    pub endpoint: Arc<str>,
    /// The normalized arguments.
    pub args: Arc<Args>,
    /// Read or write.
    pub method: Method,
}

/// The remote source queries and mutations are sent to.
///
/// Any error is treated the same way: it is logged and the fallback for the endpoint is used.
/// Authentication, transport security and wire formats are the implementation's concern.
///
/// Closures can be adapted with [`FetchFn`].
pub trait Fetch: Send + Sync + 'static {
    /// Performs the request.
    fn fetch(&self, request: FetchRequest) -> impl Future<Output = Result<Value, TransportFailure>> + Send;
}

/// Adapts an async closure into a [`Fetch`] implementation.
///
/// # Examples
///
/// ```
/// use serde_json::json;
/// use tagcache::{FetchFn, FetchRequest, TransportFailure};
///
/// let fetcher = FetchFn::new(|request: FetchRequest| async move {
///     match &*request.endpoint {
///         "jobs" => Ok(json!([])),
///         _ => Err(TransportFailure::from("not found")),
///     }
/// });
/// # let _ = fetcher;
/// ```
#[derive(Clone)]
pub struct FetchFn<F>(F);

impl<F> FetchFn<F> {
    /// Wraps `f`.
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> fmt::Debug for FetchFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchFn").finish_non_exhaustive()
    }
}

impl<F, Fut> Fetch for FetchFn<F>
where
    F: Fn(FetchRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, TransportFailure>> + Send,
{
    fn fetch(&self, request: FetchRequest) -> impl Future<Output = Result<Value, TransportFailure>> + Send {
        (self.0)(request)
    }
}
