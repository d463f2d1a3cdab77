// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Errors surfaced by the query client.

use std::{fmt, sync::Arc};

use crate::CacheKey;

/// A boxed error produced by a fetch collaborator.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A specialized [`Result`](std::result::Result) for query cache operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The primary fetch for a query or mutation was rejected.
///
/// Every failure of the fetch collaborator is treated the same way: it is logged and the
/// fallback for the endpoint is consulted. A `TransportFailure` only reaches the caller as the
/// source of [`Error::UnknownEndpoint`] or [`Error::Mutation`] when no fallback exists.
#[derive(Clone)]
pub struct TransportFailure(Arc<dyn std::error::Error + Send + Sync + 'static>);

impl TransportFailure {
    /// Wraps any error value returned by a transport.
    pub fn new(error: impl Into<BoxError>) -> Self {
        Self(Arc::from(error.into()))
    }

    /// Returns the wrapped transport error.
    #[must_use]
    pub fn inner(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        &*self.0
    }
}

impl fmt::Debug for TransportFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TransportFailure").field(&self.0).finish()
    }
}

impl fmt::Display for TransportFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transport failure: {}", self.0)
    }
}

impl std::error::Error for TransportFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&*self.0)
    }
}

impl From<&str> for TransportFailure {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for TransportFailure {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

/// Errors surfaced by the query cache.
///
/// The type is [`Clone`] because a single de-duplicated load fans its result out to every
/// caller waiting on the same key.
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The query arguments cannot be represented as a JSON object.
    ///
    /// Fatal to the call that produced it; the cache is left untouched.
    #[error("cannot serialize the arguments of `{endpoint}`: {reason}")]
    Serialization {
        /// The endpoint the arguments were intended for.
        endpoint: String,
        /// Why serialization failed.
        reason: String,
    },

    /// The primary fetch failed and no fallback generator is registered for the endpoint.
    #[error("`{endpoint}` is unavailable and has no registered fallback")]
    UnknownEndpoint {
        /// The endpoint that failed.
        endpoint: String,
        /// The transport error that triggered the fallback.
        #[source]
        transport: TransportFailure,
    },

    /// A mutation failed on both the primary fetch and the fallback path.
    ///
    /// No tags are invalidated when a mutation fails.
    #[error("mutation `{endpoint}` failed")]
    Mutation {
        /// The mutation endpoint.
        endpoint: String,
        /// The transport error that triggered the fallback.
        #[source]
        transport: TransportFailure,
    },

    /// The shared load for a key stopped before producing a result.
    #[error("the load for `{key}` was abandoned before it settled")]
    Abandoned {
        /// The key whose load was abandoned.
        key: CacheKey,
    },
}

impl Error {
    pub(crate) fn serialization(endpoint: &str, reason: impl fmt::Display) -> Self {
        Self::Serialization {
            endpoint: endpoint.to_owned(),
            reason: reason.to_string(),
        }
    }

    /// Returns `true` if the error was caused by arguments that cannot be serialized.
    #[must_use]
    pub fn is_serialization(&self) -> bool {
        matches!(self, Self::Serialization { .. })
    }

    /// Returns `true` if the error was caused by an endpoint without a fallback.
    #[must_use]
    pub fn is_unknown_endpoint(&self) -> bool {
        matches!(self, Self::UnknownEndpoint { .. })
    }
}
