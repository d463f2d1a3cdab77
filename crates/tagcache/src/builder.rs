// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Configuration and construction of a [`QueryClient`].

use std::{borrow::Cow, time::Duration};

#[cfg(any(feature = "metrics", test))]
use opentelemetry::metrics::MeterProvider;
use tokio::runtime::Handle;

use crate::{
    DEFAULT_RETENTION, FallbackRegistry, Fetch, Generator, QueryClient,
    runtime::Runtime,
    telemetry::QueryTelemetry,
};

const DEFAULT_NAME: &str = "tagcache";

/// Plain client settings, loadable from configuration files with the `serde` feature.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use tagcache::ClientOptions;
///
/// let mut options = ClientOptions::default();
/// options.retention = Duration::from_secs(5);
/// assert_eq!(options.name, "tagcache");
/// assert!(options.logs);
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
#[non_exhaustive]
pub struct ClientOptions {
    /// Identifies the client in logs and metrics.
    pub name: Cow<'static, str>,
    /// How long an entry without subscribers survives before eviction.
    pub retention: Duration,
    /// Whether cache activity is emitted as `tracing` events.
    pub logs: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            name: Cow::Borrowed(DEFAULT_NAME),
            retention: DEFAULT_RETENTION,
            logs: true,
        }
    }
}

/// Builds a [`QueryClient`].
///
/// Created by [`QueryClient::builder`].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use serde_json::json;
/// use tagcache::{FetchFn, FetchRequest, ListFallback, QueryClient, TransportFailure};
///
/// let fetcher = FetchFn::new(|_request: FetchRequest| async { Ok::<_, TransportFailure>(json!([])) });
/// let client = QueryClient::builder(fetcher)
///     .name("jobs_api")
///     .retention(Duration::from_secs(30))
///     .fallback("jobs", ListFallback::new([json!({"title": "Frontend Engineer"})]))
///     .build();
///
/// assert_eq!(client.retention(), Duration::from_secs(30));
/// ```
#[derive(Debug)]
pub struct QueryClientBuilder<F> {
    fetcher: F,
    options: ClientOptions,
    fallbacks: FallbackRegistry,
    handle: Option<Handle>,
    #[cfg(any(feature = "metrics", test))]
    meter: Option<opentelemetry::metrics::Meter>,
}

impl<F: Fetch> QueryClientBuilder<F> {
    pub(crate) fn new(fetcher: F) -> Self {
        Self {
            fetcher,
            options: ClientOptions::default(),
            fallbacks: FallbackRegistry::new(),
            handle: None,
            #[cfg(any(feature = "metrics", test))]
            meter: None,
        }
    }

    /// Sets the name reported in logs and metrics.
    #[must_use]
    pub fn name(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.options.name = name.into();
        self
    }

    /// Sets how long unsubscribed entries survive. Zero evicts them as soon as the last
    /// subscriber leaves.
    #[must_use]
    pub fn retention(mut self, retention: Duration) -> Self {
        self.options.retention = retention;
        self
    }

    /// Enables or disables `tracing` events.
    #[must_use]
    pub fn logs(mut self, enabled: bool) -> Self {
        self.options.logs = enabled;
        self
    }

    /// Replaces all plain settings at once.
    #[must_use]
    pub fn options(mut self, options: ClientOptions) -> Self {
        self.options = options;
        self
    }

    /// Replaces the fallback registry.
    #[must_use]
    pub fn fallbacks(mut self, fallbacks: FallbackRegistry) -> Self {
        self.fallbacks = fallbacks;
        self
    }

    /// Registers the fallback generator for `endpoint`.
    #[must_use]
    pub fn fallback(mut self, endpoint: impl Into<String>, generator: impl Generator) -> Self {
        self.fallbacks.insert(endpoint, generator);
        self
    }

    /// Runs background refetches and eviction timers on `handle`.
    ///
    /// Without a handle the runtime current at each call is used. When no runtime is available,
    /// background refetches are skipped and eviction is left to [`QueryClient::sweep`].
    #[must_use]
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.handle = Some(handle);
        self
    }

    /// Records cache activity as OpenTelemetry metrics.
    #[cfg(any(feature = "metrics", test))]
    #[cfg_attr(docsrs, doc(cfg(feature = "metrics")))]
    #[must_use]
    pub fn meter_provider(mut self, meter_provider: &dyn MeterProvider) -> Self {
        self.meter = Some(crate::telemetry::metrics::create_meter(meter_provider));
        self
    }

    /// Builds the client.
    #[must_use]
    pub fn build(self) -> QueryClient<F> {
        let ClientOptions { name, retention, logs } = self.options;
        let telemetry = QueryTelemetry::new(name, logs);
        #[cfg(any(feature = "metrics", test))]
        let telemetry = match &self.meter {
            Some(meter) => telemetry.with_meter(meter),
            None => telemetry,
        };

        QueryClient::from_parts(self.fetcher, self.fallbacks, retention, telemetry, Runtime::new(self.handle))
    }
}
