// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use parking_lot::Mutex;

use crate::{AbortReason, CacheKey, CancellationToken, Timers};

/// The eventual outcome of an in-flight request, awaitable by every caller that joined it.
pub type SharedResult<R> = Shared<BoxFuture<'static, R>>;

/// How a new request wants to interact with requests already in flight for its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InFlightOptions {
    dedupe_window: Duration,
    cancellable: bool,
    timeout: Option<Duration>,
}

impl InFlightOptions {
    /// Later identical requests join this one while it is younger than `window`.
    #[must_use]
    pub fn dedupe_window(mut self, window: Duration) -> Self {
        self.dedupe_window = window;
        self
    }

    /// A cancellable request is never joined; the next identical request replaces it.
    #[must_use]
    pub fn cancellable(mut self, cancellable: bool) -> Self {
        self.cancellable = cancellable;
        self
    }

    /// Cancels the request with [`AbortReason::Timeout`] once `timeout` elapses.
    #[must_use]
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for InFlightOptions {
    fn default() -> Self {
        Self {
            dedupe_window: Duration::from_secs(1),
            cancellable: false,
            timeout: None,
        }
    }
}

/// The outcome of [`InFlightRegistry::mark_in_flight`].
pub enum Admission<R> {
    /// No joinable request existed; the caller owns a fresh record and must run the request.
    Leader(CancellationToken),
    /// The caller joined a running request and should wait for its result.
    Follower {
        /// The token of the running request.
        token: CancellationToken,
        /// The shared result, if the leader has attached one.
        result: Option<SharedResult<R>>,
    },
}

impl<R> Admission<R> {
    /// The token governing the request the caller ended up with.
    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        match self {
            Self::Leader(token) | Self::Follower { token, .. } => token,
        }
    }

    /// Returns `true` if the caller has to run the request itself.
    #[must_use]
    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leader(_))
    }
}

impl<R> fmt::Debug for Admission<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Leader(token) => f.debug_tuple("Leader").field(token).finish(),
            Self::Follower { token, result } => f
                .debug_struct("Follower")
                .field("token", token)
                .field("has_result", &result.is_some())
                .finish(),
        }
    }
}

struct Record<R> {
    token: CancellationToken,
    started_at: Instant,
    cancellable: bool,
    timeout_enabled: bool,
    result: Option<SharedResult<R>>,
}

/// Tracks at most one running request per key, deduplicating or superseding newcomers.
///
/// A newcomer joins the running request when that request is not cancellable, started within
/// the dedupe window and has not been cancelled. Otherwise the running request is cancelled with
/// [`AbortReason::Superseded`] and the newcomer takes its place.
pub struct InFlightRegistry<R> {
    inner: Arc<RegistryInner<R>>,
}

struct RegistryInner<R> {
    records: Mutex<HashMap<CacheKey, Record<R>>>,
    timers: Timers,
}

impl<R> Clone for InFlightRegistry<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R> InFlightRegistry<R>
where
    R: Clone + Send + Sync + 'static,
{
    /// Creates an empty registry that schedules timeouts on `timers`.
    #[must_use]
    pub fn new(timers: Timers) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                records: Mutex::new(HashMap::new()),
                timers,
            }),
        }
    }

    /// Joins the request running under `key` or registers a new one.
    pub fn mark_in_flight(&self, key: &CacheKey, options: InFlightOptions) -> Admission<R> {
        let mut records = self.inner.records.lock();

        if let Some(existing) = self.joinable(&records, key, options) {
            return existing;
        }

        let token = self.replace(&mut records, key, options, None);
        drop(records);

        self.arm_timeout(key, &token, options);
        Admission::Leader(token)
    }

    /// Like [`mark_in_flight`](Self::mark_in_flight), but starts the request and publishes its
    /// result handle in the same critical section, so a concurrent caller can never observe a
    /// record without a result.
    ///
    /// `start` only builds the future; it is polled by whoever awaits the returned handle.
    pub fn join_or_start(
        &self,
        key: &CacheKey,
        options: InFlightOptions,
        start: impl FnOnce(CancellationToken) -> BoxFuture<'static, R>,
    ) -> (Admission<R>, SharedResult<R>) {
        let mut records = self.inner.records.lock();

        if let Some(Admission::Follower {
            token,
            result: Some(result),
        }) = self.joinable(&records, key, options)
        {
            let admission = Admission::Follower {
                token,
                result: Some(result.clone()),
            };
            return (admission, result);
        }

        let token = CancellationToken::new();
        let result = start(token.clone()).shared();
        let token = self.replace(&mut records, key, options, Some((token, result.clone())));
        drop(records);

        self.arm_timeout(key, &token, options);
        (Admission::Leader(token), result)
    }

    /// Publishes the shared result of the request owned by `token`.
    ///
    /// Returns `false` if the record was superseded or removed meanwhile.
    pub fn attach(&self, key: &CacheKey, token: &CancellationToken, result: SharedResult<R>) -> bool {
        let mut records = self.inner.records.lock();
        match records.get_mut(key) {
            Some(record) if record.token.same_as(token) => {
                record.result = Some(result);
                true
            }
            _ => false,
        }
    }

    /// Removes the record of a finished request, provided it still belongs to `token`.
    pub fn settle(&self, key: &CacheKey, token: &CancellationToken) -> bool {
        let removed = {
            let mut records = self.inner.records.lock();
            if records.get(key).is_some_and(|record| record.token.same_as(token)) {
                records.remove(key)
            } else {
                None
            }
        };

        match removed {
            Some(record) => {
                if record.timeout_enabled {
                    self.inner.timers.cancel(&timeout_timer_key(key));
                }
                true
            }
            None => false,
        }
    }

    /// Cancels and removes the request running under `key`.
    pub fn abort(&self, key: &CacheKey, reason: AbortReason) -> bool {
        let removed = self.inner.records.lock().remove(key);
        let Some(record) = removed else {
            return false;
        };

        self.inner.timers.cancel(&timeout_timer_key(key));
        record.token.cancel(reason);
        true
    }

    /// Cancels and removes every running request, returning how many there were.
    pub fn abort_all(&self, reason: &AbortReason) -> usize {
        let drained: Vec<_> = self.inner.records.lock().drain().collect();
        for (key, record) in &drained {
            self.inner.timers.cancel(&timeout_timer_key(key));
            record.token.cancel(reason.clone());
        }
        drained.len()
    }

    /// The token of the request running under `key`.
    #[must_use]
    pub fn get_token(&self, key: &CacheKey) -> Option<CancellationToken> {
        self.inner.records.lock().get(key).map(|record| record.token.clone())
    }

    /// Returns `true` if a request is running under `key`.
    #[must_use]
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.inner.records.lock().contains_key(key)
    }

    /// The number of running requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.records.lock().len()
    }

    /// Returns `true` if nothing is running.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.records.lock().is_empty()
    }

    fn joinable(&self, records: &HashMap<CacheKey, Record<R>>, key: &CacheKey, options: InFlightOptions) -> Option<Admission<R>> {
        let existing = records.get(key)?;
        let now = self.inner.timers.clock().instant();
        let age = now.saturating_duration_since(existing.started_at);

        if existing.cancellable || age >= options.dedupe_window || existing.token.is_cancelled() {
            return None;
        }

        #[cfg(any(feature = "logs", test))]
        tracing::event!(name: "fetchwise.in_flight", tracing::Level::DEBUG, cache.key = %key, "joined in-flight request");

        Some(Admission::Follower {
            token: existing.token.clone(),
            result: existing.result.clone(),
        })
    }

    fn replace(
        &self,
        records: &mut HashMap<CacheKey, Record<R>>,
        key: &CacheKey,
        options: InFlightOptions,
        started: Option<(CancellationToken, SharedResult<R>)>,
    ) -> CancellationToken {
        if let Some(previous) = records.remove(key)
            && previous.token.cancel(AbortReason::Superseded)
        {
            #[cfg(any(feature = "logs", test))]
            tracing::event!(name: "fetchwise.in_flight", tracing::Level::DEBUG, cache.key = %key, "superseded in-flight request");
        }

        let (token, result) = match started {
            Some((token, result)) => (token, Some(result)),
            None => (CancellationToken::new(), None),
        };

        records.insert(
            key.clone(),
            Record {
                token: token.clone(),
                started_at: self.inner.timers.clock().instant(),
                cancellable: options.cancellable,
                timeout_enabled: options.timeout.is_some(),
                result,
            },
        );

        token
    }

    fn arm_timeout(&self, key: &CacheKey, token: &CancellationToken, options: InFlightOptions) {
        let timer_key = timeout_timer_key(key);
        let Some(after) = options.timeout else {
            self.inner.timers.cancel(&timer_key);
            return;
        };

        let registry = Arc::downgrade(&self.inner);
        let key = key.clone();
        let token = token.clone();
        self.inner
            .timers
            .schedule(timer_key, after, move || expire(&registry, &key, &token, after));
    }
}

fn expire<R>(registry: &Weak<RegistryInner<R>>, key: &CacheKey, token: &CancellationToken, after: Duration) {
    let Some(registry) = registry.upgrade() else {
        return;
    };

    let owns_record = registry
        .records
        .lock()
        .get(key)
        .is_some_and(|record| record.token.same_as(token));

    if owns_record && token.cancel(AbortReason::Timeout(after)) {
        #[cfg(any(feature = "logs", test))]
        tracing::event!(
            name: "fetchwise.in_flight",
            tracing::Level::WARN,
            cache.key = %key,
            timeout = ?after,
            "in-flight request timed out"
        );
    }
}

fn timeout_timer_key(key: &CacheKey) -> String {
    format!("i:{key}")
}

impl<R> fmt::Debug for InFlightRegistry<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InFlightRegistry")
            .field("len", &self.inner.records.lock().len())
            .finish_non_exhaustive()
    }
}
