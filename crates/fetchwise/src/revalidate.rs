// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tick::PeriodicTimer;

use crate::runtime::TaskHandle;
use crate::{CacheKey, Result, Timers};

/// Refreshes the data behind a key.
pub type Revalidator = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Invoked by a [`SignalSource`] whenever its signal occurs.
pub type SignalHandler = Arc<dyn Fn() + Send + Sync>;

/// How often idle registrations are swept unless configured otherwise.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// External events that make cached data suspicious.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    /// The application regained focus.
    Focus,
    /// Network connectivity came back.
    Reconnect,
}

/// The host's source of [`Signal`]s.
///
/// The registry attaches at most one handler per signal kind, no matter how many keys are
/// interested, and detaches it when the last interested key goes away.
pub trait SignalSource: Send + Sync {
    /// Starts delivering `signal` to `handler`, replacing any previous handler for it.
    fn attach(&self, signal: Signal, handler: SignalHandler);

    /// Stops delivering `signal`.
    fn detach(&self, signal: Signal);
}

/// A [`SignalSource`] driven by explicit [`emit`](Self::emit) calls.
///
/// Hosts wire their platform events to `emit`; tests use it to simulate them.
#[derive(Default)]
pub struct ManualSignals {
    handlers: Mutex<HashMap<Signal, SignalHandler>>,
    attach_counts: Mutex<HashMap<Signal, usize>>,
}

impl ManualSignals {
    /// Creates a source with no handlers attached.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivers `signal` to its handler. Returns `false` if nothing is attached.
    pub fn emit(&self, signal: Signal) -> bool {
        let handler = self.handlers.lock().get(&signal).cloned();
        match handler {
            Some(handler) => {
                handler();
                true
            }
            None => false,
        }
    }

    /// Returns `true` while a handler is attached for `signal`.
    #[must_use]
    pub fn is_attached(&self, signal: Signal) -> bool {
        self.handlers.lock().contains_key(&signal)
    }

    /// How many times a handler has been attached for `signal` so far.
    #[must_use]
    pub fn attach_count(&self, signal: Signal) -> usize {
        self.attach_counts.lock().get(&signal).copied().unwrap_or(0)
    }
}

impl SignalSource for ManualSignals {
    fn attach(&self, signal: Signal, handler: SignalHandler) {
        self.handlers.lock().insert(signal, handler);
        *self.attach_counts.lock().entry(signal).or_default() += 1;
    }

    fn detach(&self, signal: Signal) {
        self.handlers.lock().remove(&signal);
    }
}

impl fmt::Debug for ManualSignals {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let attached: Vec<_> = self.handlers.lock().keys().copied().collect();
        f.debug_struct("ManualSignals").field("attached", &attached).finish()
    }
}

/// How a key is refreshed besides explicit calls.
#[derive(Clone)]
pub struct RevalidateOptions {
    ttl: Duration,
    stale_time: Option<Duration>,
    background: Option<Revalidator>,
    on_focus: bool,
    on_reconnect: bool,
}

impl RevalidateOptions {
    /// An unflagged registration is swept once it has been unused for `ttl`.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            stale_time: None,
            background: None,
            on_focus: false,
            on_reconnect: false,
        }
    }

    /// Runs the background refresh once, `stale_time` after registration.
    #[must_use]
    pub fn stale_time(mut self, stale_time: Option<Duration>) -> Self {
        self.stale_time = stale_time;
        self
    }

    /// The callback used for background refreshes instead of the main one.
    #[must_use]
    pub fn background(mut self, background: Revalidator) -> Self {
        self.background = Some(background);
        self
    }

    /// Refresh in the background whenever [`Signal::Focus`] occurs.
    #[must_use]
    pub fn on_focus(mut self, enabled: bool) -> Self {
        self.on_focus = enabled;
        self
    }

    /// Refresh in the background whenever [`Signal::Reconnect`] occurs.
    #[must_use]
    pub fn on_reconnect(mut self, enabled: bool) -> Self {
        self.on_reconnect = enabled;
        self
    }
}

impl fmt::Debug for RevalidateOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RevalidateOptions")
            .field("ttl", &self.ttl)
            .field("stale_time", &self.stale_time)
            .field("has_background", &self.background.is_some())
            .field("on_focus", &self.on_focus)
            .field("on_reconnect", &self.on_reconnect)
            .finish()
    }
}

struct Record {
    main: Revalidator,
    background: Option<Revalidator>,
    last_used: Instant,
    ttl: Duration,
    on_focus: bool,
    on_reconnect: bool,
}

impl Record {
    fn callback(&self, use_background: bool) -> Revalidator {
        match (&self.background, use_background) {
            (Some(background), true) => Arc::clone(background),
            _ => Arc::clone(&self.main),
        }
    }

    fn listens_to(&self, signal: Signal) -> bool {
        match signal {
            Signal::Focus => self.on_focus,
            Signal::Reconnect => self.on_reconnect,
        }
    }

    fn is_subscribed(&self) -> bool {
        self.on_focus || self.on_reconnect
    }
}

/// Associates keys with refresh callbacks and runs them on demand, on a timer or on a signal.
///
/// Background refreshes never report failures to anyone; they are logged and dropped.
#[derive(Clone)]
pub struct Revalidators {
    inner: Arc<RevalidatorsInner>,
}

struct RevalidatorsInner {
    records: Mutex<HashMap<CacheKey, Record>>,
    attached: Mutex<HashSet<Signal>>,
    sweep: Mutex<Option<TaskHandle>>,
    sweep_interval: Duration,
    signals: Arc<dyn SignalSource>,
    timers: Timers,
}

impl Revalidators {
    /// Creates an empty registry sweeping idle keys every [`DEFAULT_SWEEP_INTERVAL`].
    #[must_use]
    pub fn new(timers: Timers, signals: Arc<dyn SignalSource>) -> Self {
        Self::with_sweep_interval(timers, signals, DEFAULT_SWEEP_INTERVAL)
    }

    /// Creates an empty registry sweeping idle keys every `sweep_interval`.
    #[must_use]
    pub fn with_sweep_interval(timers: Timers, signals: Arc<dyn SignalSource>, sweep_interval: Duration) -> Self {
        Self {
            inner: Arc::new(RevalidatorsInner {
                records: Mutex::new(HashMap::new()),
                attached: Mutex::new(HashSet::new()),
                sweep: Mutex::new(None),
                sweep_interval,
                signals,
                timers,
            }),
        }
    }

    /// Creates or replaces the registration for `key`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn register(&self, key: CacheKey, main: Revalidator, options: RevalidateOptions) {
        let now = self.inner.timers.clock().instant();
        let record = Record {
            main,
            background: options.background,
            last_used: now,
            ttl: options.ttl,
            on_focus: options.on_focus,
            on_reconnect: options.on_reconnect,
        };
        self.inner.records.lock().insert(key.clone(), record);

        let timer_key = stale_timer_key(&key);
        match options.stale_time {
            Some(stale_time) => {
                let registry = Arc::downgrade(&self.inner);
                self.inner.timers.schedule(timer_key, stale_time, move || {
                    if let Some(registry) = registry.upgrade() {
                        registry.spawn_refresh(&key, true);
                    }
                });
            }
            None => {
                self.inner.timers.cancel(&timer_key);
            }
        }

        self.inner.sync_signals();
        self.ensure_sweeping();
    }

    /// Runs the refresh registered for `key` and waits for it.
    ///
    /// Returns `Ok(false)` without doing anything when nothing is registered.
    ///
    /// # Errors
    ///
    /// Returns the error of the refresh callback.
    pub async fn revalidate(&self, key: &CacheKey, use_background: bool) -> Result<bool> {
        let Some(callback) = self.inner.touch(key, use_background) else {
            return Ok(false);
        };

        callback().await?;
        Ok(true)
    }

    /// Starts a background refresh for every key interested in `signal` and returns how many were started.
    pub fn trigger_all(&self, signal: Signal) -> usize {
        self.inner.trigger_all(signal)
    }

    /// Removes the registration for `key`.
    pub fn unregister(&self, key: &CacheKey) -> bool {
        let removed = self.inner.records.lock().remove(key).is_some();
        if removed {
            self.inner.timers.cancel(&stale_timer_key(key));
            self.inner.sync_signals();
        }
        removed
    }

    /// Removes every unflagged registration that has been unused for its TTL, returning how many were removed.
    pub fn sweep_idle(&self) -> usize {
        self.inner.sweep_idle()
    }

    /// Returns `true` if `key` is registered.
    #[must_use]
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.inner.records.lock().contains_key(key)
    }

    /// The number of registered keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.records.lock().len()
    }

    /// Returns `true` if no key is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.records.lock().is_empty()
    }

    fn ensure_sweeping(&self) {
        let mut sweep = self.inner.sweep.lock();
        if sweep.is_some() {
            return;
        }

        let registry = Arc::downgrade(&self.inner);
        let mut ticks = PeriodicTimer::new(self.inner.timers.clock(), self.inner.sweep_interval);
        *sweep = Some(self.inner.timers.runtime().spawn(async move {
            while ticks.next().await.is_some() {
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                registry.sweep_idle();
            }
        }));
    }
}

impl RevalidatorsInner {
    fn touch(&self, key: &CacheKey, use_background: bool) -> Option<Revalidator> {
        let now = self.timers.clock().instant();
        let mut records = self.records.lock();
        let record = records.get_mut(key)?;
        record.last_used = now;
        Some(record.callback(use_background))
    }

    fn spawn_refresh(&self, key: &CacheKey, use_background: bool) {
        if let Some(callback) = self.touch(key, use_background) {
            self.spawn_silently(key.clone(), callback);
        }
    }

    #[cfg_attr(
        not(any(feature = "logs", test)),
        expect(unused_variables, reason = "the key is only used for logging")
    )]
    fn spawn_silently(&self, key: CacheKey, callback: Revalidator) {
        let _detached = self.timers.runtime().spawn(async move {
            let result = callback().await;

            #[cfg(any(feature = "logs", test))]
            if let Err(error) = &result {
                tracing::event!(
                    name: "fetchwise.revalidate",
                    tracing::Level::DEBUG,
                    cache.key = %key,
                    error = %error,
                    "background revalidation failed"
                );
            }

            drop(result);
        });
    }

    fn trigger_all(&self, signal: Signal) -> usize {
        let now = self.timers.clock().instant();
        let callbacks: Vec<_> = {
            let mut records = self.records.lock();
            records
                .iter_mut()
                .filter(|(_, record)| record.listens_to(signal))
                .map(|(key, record)| {
                    record.last_used = now;
                    (key.clone(), record.callback(true))
                })
                .collect()
        };

        #[cfg(any(feature = "logs", test))]
        tracing::event!(
            name: "fetchwise.revalidate",
            tracing::Level::DEBUG,
            signal = ?signal,
            revalidate.count = callbacks.len(),
            "revalidation triggered by signal"
        );

        let count = callbacks.len();
        for (key, callback) in callbacks {
            self.spawn_silently(key, callback);
        }
        count
    }

    fn sweep_idle(&self) -> usize {
        let now = self.timers.clock().instant();
        let swept: Vec<_> = {
            let mut records = self.records.lock();
            let idle: Vec<_> = records
                .iter()
                .filter(|(_, record)| !record.is_subscribed() && now.saturating_duration_since(record.last_used) >= record.ttl)
                .map(|(key, _)| key.clone())
                .collect();
            for key in &idle {
                records.remove(key);
            }
            idle
        };

        for key in &swept {
            self.timers.cancel(&stale_timer_key(key));
        }

        #[cfg(any(feature = "logs", test))]
        if !swept.is_empty() {
            tracing::event!(
                name: "fetchwise.revalidate",
                tracing::Level::DEBUG,
                revalidate.count = swept.len(),
                "idle revalidators swept"
            );
        }

        swept.len()
    }

    /// Attaches one handler per signal that some record wants and detaches the rest.
    fn sync_signals(self: &Arc<Self>) {
        let mut attached = self.attached.lock();
        let wanted: HashSet<Signal> = {
            let records = self.records.lock();
            [Signal::Focus, Signal::Reconnect]
                .into_iter()
                .filter(|signal| records.values().any(|record| record.listens_to(*signal)))
                .collect()
        };

        for signal in wanted.difference(&attached) {
            let registry: Weak<Self> = Arc::downgrade(self);
            let signal = *signal;
            self.signals.attach(
                signal,
                Arc::new(move || {
                    if let Some(registry) = registry.upgrade() {
                        registry.trigger_all(signal);
                    }
                }),
            );
        }

        for signal in attached.difference(&wanted) {
            self.signals.detach(*signal);
        }

        *attached = wanted;
    }
}

impl Drop for RevalidatorsInner {
    fn drop(&mut self) {
        if let Some(sweep) = self.sweep.get_mut().take() {
            sweep.abort();
        }
        for signal in self.attached.get_mut().drain() {
            self.signals.detach(signal);
        }
    }
}

fn stale_timer_key(key: &CacheKey) -> String {
    format!("s:{key}")
}

impl fmt::Debug for Revalidators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Revalidators")
            .field("len", &self.inner.records.lock().len())
            .field("attached", &*self.inner.attached.lock())
            .field("sweep_interval", &self.inner.sweep_interval)
            .finish_non_exhaustive()
    }
}
