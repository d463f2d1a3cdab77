// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Query cache telemetry.
//!
//! Every cache activity is emitted as a structured `tracing` event whose level follows the
//! activity. With the `metrics` feature the same activities are counted through OpenTelemetry
//! and load durations are recorded in a histogram.

use std::{borrow::Cow, fmt::Display, time::Duration};

#[cfg(any(feature = "metrics", test))]
use opentelemetry::{KeyValue, metrics::Meter};
use tracing::Level;

use crate::CacheKey;

pub(crate) mod attributes;
pub(crate) mod ext;
#[cfg(any(feature = "metrics", test))]
pub(crate) mod metrics;
#[cfg(test)]
pub(crate) mod testing;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QueryOperation {
    Query,
    Mutate,
    Invalidate,
    Subscribe,
    Evict,
    Reset,
}

impl QueryOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Query => "cache.query",
            Self::Mutate => "cache.mutate",
            Self::Invalidate => "cache.invalidate",
            Self::Subscribe => "cache.subscribe",
            Self::Evict => "cache.evict",
            Self::Reset => "cache.reset",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QueryActivity {
    Hit,
    Miss,
    Fetched,
    Fallback,
    TransportFailure,
    UnknownEndpoint,
    Abandoned,
    Stale,
    Refetch,
    Requeued,
    Subscribed,
    Unsubscribed,
    Evicted,
    Mutated,
    MutationFailed,
    Cleared,
}

impl QueryActivity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hit => "cache.hit",
            Self::Miss => "cache.miss",
            Self::Fetched => "cache.fetched",
            Self::Fallback => "cache.fallback",
            Self::TransportFailure => "cache.transport_failure",
            Self::UnknownEndpoint => "cache.unknown_endpoint",
            Self::Abandoned => "cache.abandoned",
            Self::Stale => "cache.stale",
            Self::Refetch => "cache.refetch",
            Self::Requeued => "cache.requeued",
            Self::Subscribed => "cache.subscribed",
            Self::Unsubscribed => "cache.unsubscribed",
            Self::Evicted => "cache.evicted",
            Self::Mutated => "cache.mutated",
            Self::MutationFailed => "cache.mutation_failed",
            Self::Cleared => "cache.cleared",
        }
    }

    pub fn level(self) -> Level {
        match self {
            Self::Hit | Self::Miss | Self::Fetched | Self::Subscribed | Self::Unsubscribed => Level::DEBUG,
            Self::Fallback
            | Self::Stale
            | Self::Refetch
            | Self::Requeued
            | Self::Evicted
            | Self::Mutated
            | Self::Cleared => Level::INFO,
            Self::TransportFailure => Level::WARN,
            Self::UnknownEndpoint | Self::Abandoned | Self::MutationFailed => Level::ERROR,
        }
    }
}

/// Records query cache activities as logs and, optionally, metrics.
#[derive(Debug)]
pub(crate) struct QueryTelemetry {
    name: Cow<'static, str>,
    logging_enabled: bool,
    #[cfg(any(feature = "metrics", test))]
    instruments: Option<metrics::Instruments>,
}

impl QueryTelemetry {
    pub(crate) fn new(name: Cow<'static, str>, logging_enabled: bool) -> Self {
        Self {
            name,
            logging_enabled,
            #[cfg(any(feature = "metrics", test))]
            instruments: None,
        }
    }

    #[cfg(any(feature = "metrics", test))]
    #[must_use]
    pub(crate) fn with_meter(mut self, meter: &Meter) -> Self {
        self.instruments = Some(metrics::Instruments::new(meter));
        self
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub(crate) fn record(&self, operation: QueryOperation, activity: QueryActivity, key: Option<&CacheKey>, duration: Option<Duration>) {
        self.record_with(operation, activity, key, duration, None);
    }

    /// Records an activity caused by `error`, which is attached to the log event.
    #[inline]
    pub(crate) fn record_error(&self, operation: QueryOperation, activity: QueryActivity, key: &CacheKey, error: &dyn Display) {
        self.record_with(operation, activity, Some(key), None, Some(error));
    }

    fn record_with(
        &self,
        operation: QueryOperation,
        activity: QueryActivity,
        key: Option<&CacheKey>,
        duration: Option<Duration>,
        error: Option<&dyn Display>,
    ) {
        #[cfg(any(feature = "metrics", test))]
        if let Some(instruments) = &self.instruments {
            let attrs = [
                KeyValue::new(attributes::CACHE_NAME, self.name.to_string()),
                KeyValue::new(attributes::CACHE_OPERATION_NAME, operation.as_str()),
                KeyValue::new(attributes::CACHE_ACTIVITY_NAME, activity.as_str()),
            ];
            instruments.record(&attrs, duration);
        }

        if self.logging_enabled {
            Self::emit(&self.name, operation, activity, key, duration, error);
        }
    }

    fn emit(
        cache_name: &str,
        operation: QueryOperation,
        activity: QueryActivity,
        key: Option<&CacheKey>,
        duration: Option<Duration>,
        error: Option<&dyn Display>,
    ) {
        let op = operation.as_str();
        let ev = activity.as_str();
        let key = key.map(CacheKey::as_str);
        let duration_ns = duration.map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX));
        let error = error.map(tracing::field::display);

        // Tracing level must be constant, so a macro selects the appropriate level.
        // Field names must match constants in attributes.rs.
        macro_rules! emit_event {
            ($level:ident) => {
                tracing::$level!(
                    cache.name = cache_name,
                    cache.operation = op,
                    cache.activity = ev,
                    cache.key = key,
                    cache.duration_ns = duration_ns,
                    cache.error = error,
                    "cache.event"
                )
            };
        }

        match activity.level() {
            Level::ERROR => emit_event!(error),
            Level::WARN => emit_event!(warn),
            Level::INFO => emit_event!(info),
            _ => emit_event!(debug),
        }
    }
}

#[cfg(test)]
mod tests {
    use opentelemetry::metrics::MeterProvider;

    use super::*;
    use crate::telemetry::testing::{LogCapture, MetricTester};

    fn key() -> CacheKey {
        crate::serialize("jobs", &()).unwrap()
    }

    #[test]
    fn operation_as_str() {
        assert_eq!(QueryOperation::Query.as_str(), "cache.query");
        assert_eq!(QueryOperation::Mutate.as_str(), "cache.mutate");
        assert_eq!(QueryOperation::Invalidate.as_str(), "cache.invalidate");
        assert_eq!(QueryOperation::Subscribe.as_str(), "cache.subscribe");
        assert_eq!(QueryOperation::Evict.as_str(), "cache.evict");
        assert_eq!(QueryOperation::Reset.as_str(), "cache.reset");
    }

    #[test]
    fn activity_levels() {
        assert_eq!(QueryActivity::Hit.level(), Level::DEBUG);
        assert_eq!(QueryActivity::Fetched.level(), Level::DEBUG);
        assert_eq!(QueryActivity::Fallback.level(), Level::INFO);
        assert_eq!(QueryActivity::Requeued.level(), Level::INFO);
        assert_eq!(QueryActivity::TransportFailure.level(), Level::WARN);
        assert_eq!(QueryActivity::UnknownEndpoint.level(), Level::ERROR);
        assert_eq!(QueryActivity::MutationFailed.level(), Level::ERROR);
    }

    #[test]
    fn logs_contain_all_fields_and_values() {
        let capture = LogCapture::new();
        let _guard = tracing::subscriber::set_default(capture.subscriber());

        QueryTelemetry::emit(
            "jobs_api",
            QueryOperation::Query,
            QueryActivity::Fetched,
            Some(&key()),
            Some(Duration::from_nanos(12345)),
            None,
        );

        capture.assert_contains(attributes::CACHE_NAME);
        capture.assert_contains(attributes::CACHE_OPERATION_NAME);
        capture.assert_contains(attributes::CACHE_ACTIVITY_NAME);
        capture.assert_contains(attributes::CACHE_KEY_NAME);
        capture.assert_contains(attributes::CACHE_DURATION_NAME);
        capture.assert_contains(attributes::CACHE_EVENT_NAME);

        capture.assert_contains("jobs_api");
        capture.assert_contains("cache.fetched");
        capture.assert_contains("jobs({})");
        capture.assert_contains("12345");
    }

    #[test]
    fn transport_failure_is_logged_as_warning_with_error() {
        let capture = LogCapture::new();
        let _guard = tracing::subscriber::set_default(capture.subscriber());

        let telemetry = QueryTelemetry::new("jobs_api".into(), true);
        telemetry.record_error(QueryOperation::Query, QueryActivity::TransportFailure, &key(), &"connection refused");

        capture.assert_contains("WARN");
        capture.assert_contains(attributes::CACHE_ERROR_NAME);
        capture.assert_contains("connection refused");
    }

    #[test]
    fn logs_use_activity_levels() {
        let capture = LogCapture::new();
        let _guard = tracing::subscriber::set_default(capture.subscriber());
        QueryTelemetry::emit("c", QueryOperation::Query, QueryActivity::UnknownEndpoint, None, None, None);
        capture.assert_contains("ERROR");

        let capture = LogCapture::new();
        let _guard = tracing::subscriber::set_default(capture.subscriber());
        QueryTelemetry::emit("c", QueryOperation::Invalidate, QueryActivity::Stale, None, None, None);
        capture.assert_contains("INFO");

        let capture = LogCapture::new();
        let _guard = tracing::subscriber::set_default(capture.subscriber());
        QueryTelemetry::emit("c", QueryOperation::Query, QueryActivity::Hit, None, None, None);
        capture.assert_contains("DEBUG");
    }

    #[test]
    fn disabled_logging_emits_nothing() {
        let capture = LogCapture::new();
        let _guard = tracing::subscriber::set_default(capture.subscriber());

        let telemetry = QueryTelemetry::new("quiet".into(), false);
        telemetry.record(QueryOperation::Query, QueryActivity::Hit, Some(&key()), None);

        assert!(capture.output().is_empty());
        assert_eq!(telemetry.name(), "quiet");
    }

    #[test]
    fn metrics_carry_name_operation_and_activity() {
        let tester = MetricTester::new();
        let meter = tester.meter_provider().meter("tagcache");
        let telemetry = QueryTelemetry::new("jobs_api".into(), false).with_meter(&meter);

        telemetry.record(
            QueryOperation::Query,
            QueryActivity::Fallback,
            Some(&key()),
            Some(Duration::from_millis(3)),
        );

        tester.assert_attributes_contain(&[
            KeyValue::new(attributes::CACHE_NAME, "jobs_api"),
            KeyValue::new(attributes::CACHE_OPERATION_NAME, QueryOperation::Query.as_str()),
            KeyValue::new(attributes::CACHE_ACTIVITY_NAME, QueryActivity::Fallback.as_str()),
        ]);
    }
}
