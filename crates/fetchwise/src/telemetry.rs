// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Metric definitions and the per-client reporting handle.

use std::borrow::Cow;

#[cfg(any(feature = "metrics", test))]
use opentelemetry::InstrumentationScope;
#[cfg(any(feature = "metrics", test))]
use opentelemetry::metrics::{Counter, Meter, MeterProvider};

#[cfg(any(feature = "metrics", test))]
const METER_NAME: &str = "fetchwise";
#[cfg(any(feature = "metrics", test))]
const VERSION: &str = "v0.1.0";
#[cfg(any(feature = "metrics", test))]
const SCHEMA_URL: &str = "https://opentelemetry.io/schemas/1.47.0";

/// Key used to annotate the name of the client that emitted an event.
#[cfg(any(feature = "metrics", test))]
pub(crate) const CLIENT_NAME: &str = "fetchwise.client.name";

/// Key used to annotate which coordination event happened.
#[cfg(any(feature = "metrics", test))]
pub(crate) const EVENT_NAME: &str = "fetchwise.event.name";

pub(crate) const CACHE_HIT: &str = "cache_hit";
pub(crate) const CACHE_STALE_HIT: &str = "cache_stale_hit";
pub(crate) const CACHE_MISS: &str = "cache_miss";
pub(crate) const DEDUPLICATED: &str = "deduplicated";
pub(crate) const RETRY: &str = "retry";
pub(crate) const FAILED: &str = "failed";
pub(crate) const REVALIDATED: &str = "revalidated";

#[cfg(any(feature = "metrics", test))]
pub(crate) fn create_meter(meter_provider: &dyn MeterProvider) -> Meter {
    meter_provider.meter_with_scope(
        InstrumentationScope::builder(METER_NAME)
            .with_version(VERSION)
            .with_schema_url(SCHEMA_URL)
            .build(),
    )
}

#[cfg(any(feature = "metrics", test))]
pub(crate) fn create_event_counter(meter: &Meter) -> Counter<u64> {
    meter
        .u64_counter("fetchwise.event")
        .with_description("Emitted when a fetch is served from cache, deduplicated, retried, revalidated or fails.")
        .with_unit("u64")
        .build()
}

/// Carries the client name into logs and reports events to the configured meter.
#[derive(Debug, Clone)]
pub(crate) struct Telemetry {
    client_name: Cow<'static, str>,
    #[cfg(any(feature = "metrics", test))]
    event_reporter: Option<Counter<u64>>,
}

impl Telemetry {
    pub(crate) fn new(client_name: Cow<'static, str>) -> Self {
        Self {
            client_name,
            #[cfg(any(feature = "metrics", test))]
            event_reporter: None,
        }
    }

    pub(crate) fn with_client_name(mut self, client_name: Cow<'static, str>) -> Self {
        self.client_name = client_name;
        self
    }

    #[cfg(any(feature = "metrics", test))]
    pub(crate) fn with_meter_provider(mut self, meter_provider: &dyn MeterProvider) -> Self {
        self.event_reporter = Some(create_event_counter(&create_meter(meter_provider)));
        self
    }

    pub(crate) fn client_name(&self) -> &str {
        &self.client_name
    }

    #[cfg_attr(
        not(any(feature = "metrics", test)),
        expect(unused_variables, clippy::unused_self, reason = "unused when metrics feature not used")
    )]
    pub(crate) fn report(&self, event: &'static str) {
        #[cfg(any(feature = "metrics", test))]
        if let Some(reporter) = &self.event_reporter {
            reporter.add(
                1,
                &[
                    opentelemetry::KeyValue::new(EVENT_NAME, event),
                    opentelemetry::KeyValue::new(CLIENT_NAME, self.client_name.clone()),
                ],
            );
        }
    }
}
