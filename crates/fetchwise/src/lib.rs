// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! Client-side request coordination.
//!
//! Given a stream of logical HTTP-like requests, this crate decides whether to reuse a call that
//! is already running, serve a cached result, retry after a failure or refresh data in the
//! background. The network itself stays outside: requests go through a [`Transport`] and
//! responses are turned into data by a [`Decoder`].
//!
//! # Components
//!
//! - [`cache_key`] derives a deterministic fingerprint from a [`RequestDescriptor`].
//! - [`Timers`] runs keyed, replace-on-schedule callbacks on an injected [`Clock`](tick::Clock).
//! - [`CacheStore`] keeps results with a [`Ttl`] and an optional stale time.
//! - [`InFlightRegistry`] deduplicates identical requests and cancels superseded ones.
//! - [`Revalidators`] refreshes data on demand, after a stale time or on a [`Signal`].
//! - [`RetryPolicy`] and [`PollingPolicy`] drive repeated attempts with exponential backoff.
//! - [`Interceptors`] adjust requests and responses at client, group and call scope.
//! - [`Notifier`] fans settled results out to per-key subscribers.
//!
//! [`Client`] composes all of these around one [`Context`]. Contexts are explicit objects, so
//! several independent clients can live in the same process.
//!
//! # Cache keys
//!
//! ```
//! use fetchwise::{Body, RequestDescriptor, cache_key};
//!
//! let request = RequestDescriptor::post("/search")
//!     .with_header("Content-Type", "application/json")
//!     .with_body(Body::Json(serde_json::json!({ "q": "rust", "page": 1 })));
//!
//! let same = RequestDescriptor::post("/search")
//!     .with_header("content-type", "application/json")
//!     .with_body(Body::Json(serde_json::json!({ "page": 1, "q": "rust" })));
//!
//! assert_eq!(cache_key(&request), cache_key(&same));
//! ```
//!
//! # Features
//!
//! - `logs`: emits `tracing` events named `fetchwise.<component>`.
//! - `metrics`: reports the `fetchwise.event` counter through OpenTelemetry.
//! - `serde`: exposes [`FetchOptions`], a deserializable form of the request options.
//! - `test-util`: exposes [`testing::MockTransport`].

mod cache;
mod cancel;
mod client;
mod config;
mod context;
mod decode;
mod descriptor;
mod error;
mod in_flight;
mod intercept;
mod key;
mod notify;
mod response;
mod retry;
mod revalidate;
mod runtime;
mod telemetry;
mod timers;
mod transport;

#[cfg(any(feature = "test-util", test))]
#[cfg_attr(docsrs, doc(cfg(feature = "test-util")))]
pub mod testing;

pub use cache::{CacheEntry, CacheStore, Cached, Ttl};
pub use cancel::{AbortReason, CancellationToken};
pub use client::{Client, ClientBuilder, Group};
#[cfg(any(feature = "serde", test))]
#[cfg_attr(docsrs, doc(cfg(feature = "serde")))]
pub use config::{FetchOptions, RetryOptions};
pub use config::{CallOptions, ErrorStrategy, RequestConfig};
pub use context::Context;
pub use decode::{BytesDecoder, Decoder, JsonDecoder, TextDecoder};
pub use descriptor::{Body, Credentials, RawResponse, RequestDescriptor};
pub use error::{DecodeError, FetchError, Result, TransportError};
pub use in_flight::{Admission, InFlightOptions, InFlightRegistry, SharedResult};
pub use intercept::Interceptors;
pub use key::{CacheKey, CacheKeySource, cache_key};
pub use notify::{Notifier, Subscription};
pub use response::{FetchResponse, ResponseSource};
pub use retry::{Attempt, AttemptOutcome, DEFAULT_RETRY_STATUSES, PollingPolicy, RetryEvent, RetryPolicy};
pub use revalidate::{
    DEFAULT_SWEEP_INTERVAL, ManualSignals, RevalidateOptions, Revalidator, Revalidators, Signal, SignalHandler, SignalSource,
};
pub use timers::Timers;
pub use transport::Transport;
