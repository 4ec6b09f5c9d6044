// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tick::Clock;

use crate::{AbortReason, CacheStore, FetchResponse, InFlightRegistry, Notifier, Revalidators, SignalSource, Timers};

/// The registries behind one client.
///
/// Contexts share nothing with each other, so several clients can coexist in one process
/// without seeing each other's cache, in-flight requests or revalidators.
pub struct Context<T> {
    timers: Timers,
    cache: CacheStore<FetchResponse<T>>,
    in_flight: InFlightRegistry<FetchResponse<T>>,
    revalidators: Revalidators,
    notifier: Notifier<FetchResponse<T>>,
}

impl<T> Context<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Creates empty registries driven by `clock` and listening to `signals`.
    #[must_use]
    pub fn new(clock: Clock, signals: Arc<dyn SignalSource>, sweep_interval: Duration) -> Self {
        let timers = Timers::new(clock);
        Self {
            cache: CacheStore::new(timers.clone()),
            in_flight: InFlightRegistry::new(timers.clone()),
            revalidators: Revalidators::with_sweep_interval(timers.clone(), signals, sweep_interval),
            notifier: Notifier::new(),
            timers,
        }
    }

    /// The timer facility shared by every registry.
    #[must_use]
    pub fn timers(&self) -> &Timers {
        &self.timers
    }

    /// Settled results by key.
    #[must_use]
    pub fn cache(&self) -> &CacheStore<FetchResponse<T>> {
        &self.cache
    }

    /// Requests currently running.
    #[must_use]
    pub fn in_flight(&self) -> &InFlightRegistry<FetchResponse<T>> {
        &self.in_flight
    }

    /// Refresh callbacks by key.
    #[must_use]
    pub fn revalidators(&self) -> &Revalidators {
        &self.revalidators
    }

    /// Per-key subscribers.
    #[must_use]
    pub fn notifier(&self) -> &Notifier<FetchResponse<T>> {
        &self.notifier
    }

    /// Aborts every running request and empties the cache.
    pub fn reset(&self) {
        self.in_flight.abort_all(&AbortReason::Explicit(Some("context reset".into())));
        self.cache.prune_all();
    }
}

impl<T> Clone for Context<T> {
    fn clone(&self) -> Self {
        Self {
            timers: self.timers.clone(),
            cache: self.cache.clone(),
            in_flight: self.in_flight.clone(),
            revalidators: self.revalidators.clone(),
            notifier: self.notifier.clone(),
        }
    }
}

impl<T> fmt::Debug for Context<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("timers", &self.timers)
            .field("cache", &self.cache)
            .field("in_flight", &self.in_flight)
            .field("revalidators", &self.revalidators)
            .field("notifier", &self.notifier)
            .finish()
    }
}
