// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::time::Duration;

use opentelemetry::{
    InstrumentationScope, KeyValue,
    metrics::{Counter, Histogram, Meter, MeterProvider},
};

const METER_NAME: &str = "tagcache";
const VERSION: &str = "v0.1.0";
const SCHEMA_URL: &str = "https://opentelemetry.io/schemas/1.47.0";
const EVENT_COUNT_NAME: &str = "query_cache.event.count";
const OPERATION_DURATION_NAME: &str = "query_cache.operation.duration";

pub(crate) fn create_meter(meter_provider: &dyn MeterProvider) -> Meter {
    meter_provider.meter_with_scope(
        InstrumentationScope::builder(METER_NAME)
            .with_version(VERSION)
            .with_schema_url(SCHEMA_URL)
            .build(),
    )
}

/// The instruments a client records into.
#[derive(Debug)]
pub(crate) struct Instruments {
    events: Counter<u64>,
    operation_duration: Histogram<f64>,
}

impl Instruments {
    pub(crate) fn new(meter: &Meter) -> Self {
        Self {
            events: meter
                .u64_counter(EVENT_COUNT_NAME)
                .with_description("Query cache events")
                .with_unit("{event}")
                .build(),
            operation_duration: meter
                .f64_histogram(OPERATION_DURATION_NAME)
                .with_description("Duration of remote fetches issued by the query cache")
                .with_unit("s")
                .build(),
        }
    }

    pub(crate) fn record(&self, attrs: &[KeyValue], duration: Option<Duration>) {
        self.events.add(1, attrs);
        if let Some(duration) = duration {
            self.operation_duration.record(duration.as_secs_f64(), attrs);
        }
    }
}
