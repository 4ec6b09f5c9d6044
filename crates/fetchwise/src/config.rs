// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::time::Duration;

use crate::{CacheKeySource, InFlightOptions, Interceptors, PollingPolicy, RetryPolicy, Ttl};

/// What a fetch resolves to when it fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(any(feature = "serde", test), derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(any(feature = "serde", test), serde(rename_all = "lowercase"))]
pub enum ErrorStrategy {
    /// The fetch returns `Err`.
    #[default]
    Reject,
    /// The fetch returns `Ok` with the error and the fallback data attached.
    Soft,
    /// The fetch never resolves. Subscribers still see the failure.
    Silent,
}

/// Settings that control how one request is cached, deduplicated, retried and revalidated.
///
/// A client carries a default configuration that groups and single calls can replace.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use fetchwise::{ErrorStrategy, RequestConfig, RetryPolicy, Ttl};
///
/// let config = RequestConfig::default()
///     .ttl(Ttl::Expires(Duration::from_secs(60)))
///     .stale_time(Some(Duration::from_secs(10)))
///     .timeout(Some(Duration::from_secs(5)))
///     .retry(RetryPolicy::default().max_retry_attempts(2))
///     .strategy(ErrorStrategy::Soft);
/// # let _ = config;
/// ```
#[derive(Debug, Clone)]
pub struct RequestConfig {
    pub(crate) ttl: Ttl,
    pub(crate) stale_time: Option<Duration>,
    pub(crate) dedupe_time: Duration,
    pub(crate) timeout: Option<Duration>,
    pub(crate) cancellable: bool,
    pub(crate) retry: RetryPolicy,
    pub(crate) revalidate_on_focus: bool,
    pub(crate) revalidate_on_reconnect: bool,
    pub(crate) cache_key: CacheKeySource,
    pub(crate) strategy: ErrorStrategy,
    pub(crate) reject_cancelled: bool,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            ttl: Ttl::default(),
            stale_time: None,
            dedupe_time: Duration::from_secs(1),
            timeout: None,
            cancellable: false,
            retry: RetryPolicy::default(),
            revalidate_on_focus: false,
            revalidate_on_reconnect: false,
            cache_key: CacheKeySource::default(),
            strategy: ErrorStrategy::default(),
            reject_cancelled: false,
        }
    }
}

impl RequestConfig {
    /// How long successful results stay in the cache.
    #[must_use]
    pub fn ttl(mut self, ttl: Ttl) -> Self {
        self.ttl = ttl;
        self
    }

    /// How long after storing a result it counts as stale and is refreshed in the background.
    #[must_use]
    pub fn stale_time(mut self, stale_time: Option<Duration>) -> Self {
        self.stale_time = stale_time;
        self
    }

    /// How long identical requests join a running one.
    #[must_use]
    pub fn dedupe_time(mut self, dedupe_time: Duration) -> Self {
        self.dedupe_time = dedupe_time;
        self
    }

    /// The deadline for the whole fetch, or for each attempt if the retry policy resets timeouts.
    #[must_use]
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Makes the next identical request cancel this one instead of joining it.
    #[must_use]
    pub fn cancellable(mut self, cancellable: bool) -> Self {
        self.cancellable = cancellable;
        self
    }

    /// How failed attempts are repeated.
    #[must_use]
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Refreshes the result when the application regains focus.
    #[must_use]
    pub fn revalidate_on_focus(mut self, enabled: bool) -> Self {
        self.revalidate_on_focus = enabled;
        self
    }

    /// Refreshes the result when connectivity comes back.
    #[must_use]
    pub fn revalidate_on_reconnect(mut self, enabled: bool) -> Self {
        self.revalidate_on_reconnect = enabled;
        self
    }

    /// How the cache key is derived from the request.
    #[must_use]
    pub fn cache_key(mut self, cache_key: CacheKeySource) -> Self {
        self.cache_key = cache_key;
        self
    }

    /// What a failed fetch resolves to.
    #[must_use]
    pub fn strategy(mut self, strategy: ErrorStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// With `true`, cancelled fetches follow the error strategy. By default they resolve softly.
    #[must_use]
    pub fn reject_cancelled(mut self, reject_cancelled: bool) -> Self {
        self.reject_cancelled = reject_cancelled;
        self
    }

    /// The retry policy in effect.
    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub(crate) fn in_flight_options(&self) -> InFlightOptions {
        let overall_timeout = if self.retry.resets_timeout() { None } else { self.timeout };
        InFlightOptions::default()
            .dedupe_window(self.dedupe_time)
            .cancellable(self.cancellable)
            .timeout(overall_timeout)
    }

    pub(crate) fn attempt_timeout(&self) -> Option<Duration> {
        self.timeout.filter(|_| self.retry.resets_timeout())
    }

    /// How long an unused revalidation registration survives the idle sweep.
    pub(crate) fn idle_ttl(&self) -> Duration {
        match self.ttl {
            Ttl::Disabled => Duration::ZERO,
            Ttl::Infinite => Duration::MAX,
            Ttl::Expires(ttl) => ttl,
        }
    }
}

/// Per-call settings for [`Client::fetch`](crate::Client::fetch).
pub struct CallOptions<T> {
    pub(crate) config: Option<RequestConfig>,
    pub(crate) fallback: Option<T>,
    pub(crate) interceptors: Interceptors,
    pub(crate) polling: Option<PollingPolicy<T>>,
}

impl<T> Default for CallOptions<T> {
    fn default() -> Self {
        Self {
            config: None,
            fallback: None,
            interceptors: Interceptors::default(),
            polling: None,
        }
    }
}

impl<T> CallOptions<T> {
    /// Options that change nothing.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the client's (or group's) configuration for this call.
    #[must_use]
    pub fn config(mut self, config: RequestConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// The data handed out when the fetch fails softly.
    #[must_use]
    pub fn fallback(mut self, fallback: T) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Interceptors that apply to this call only, inside the client and group scopes.
    #[must_use]
    pub fn interceptors(mut self, interceptors: Interceptors) -> Self {
        self.interceptors = interceptors;
        self
    }

    /// Repeats the fetch on an interval after it succeeds.
    #[must_use]
    pub fn polling(mut self, polling: PollingPolicy<T>) -> Self {
        self.polling = Some(polling);
        self
    }
}

impl<T> std::fmt::Debug for CallOptions<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallOptions")
            .field("config", &self.config)
            .field("has_fallback", &self.fallback.is_some())
            .field("interceptors", &self.interceptors)
            .field("polling", &self.polling)
            .finish()
    }
}

#[cfg(any(feature = "serde", test))]
pub use self::options::{FetchOptions, RetryOptions};

#[cfg(any(feature = "serde", test))]
mod options {
    use std::borrow::Cow;
    use std::time::Duration;

    use http::StatusCode;
    use serde::{Deserialize, Serialize};

    use super::{ErrorStrategy, RequestConfig};
    use crate::{CacheKeySource, FetchError, Result, Ttl};

    /// The recognized request options in their plain form: `ttl` and `staleTime` in seconds
    /// (`ttl` 0 disables caching, -1 caches forever), `dedupeTime`, `timeout` and all retry
    /// delays in milliseconds.
    ///
    /// Absent fields keep the value of the configuration they are applied to.
    #[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
    #[serde(rename_all = "camelCase", default)]
    pub struct FetchOptions {
        /// Cache lifetime in seconds.
        #[serde(skip_serializing_if = "Option::is_none")]
        pub ttl: Option<i64>,
        /// Seconds until a cached result is refreshed in the background. Zero disables it.
        #[serde(skip_serializing_if = "Option::is_none")]
        pub stale_time: Option<u64>,
        /// Milliseconds during which identical requests are joined.
        #[serde(skip_serializing_if = "Option::is_none")]
        pub dedupe_time: Option<u64>,
        /// Deadline in milliseconds. Zero disables it.
        #[serde(skip_serializing_if = "Option::is_none")]
        pub timeout: Option<u64>,
        /// Whether the next identical request supersedes this one.
        #[serde(skip_serializing_if = "Option::is_none")]
        pub is_cancellable: Option<bool>,
        /// Retry settings.
        #[serde(skip_serializing_if = "Option::is_none")]
        pub retry: Option<RetryOptions>,
        /// Refresh when the application regains focus.
        #[serde(skip_serializing_if = "Option::is_none")]
        pub revalidate_on_focus: Option<bool>,
        /// Refresh when connectivity comes back.
        #[serde(skip_serializing_if = "Option::is_none")]
        pub revalidate_on_reconnect: Option<bool>,
        /// A fixed cache key for the request.
        #[serde(skip_serializing_if = "Option::is_none")]
        pub cache_key: Option<String>,
        /// How failures are reported.
        #[serde(skip_serializing_if = "Option::is_none")]
        pub strategy: Option<ErrorStrategy>,
        /// Whether cancelled fetches follow the error strategy.
        #[serde(skip_serializing_if = "Option::is_none")]
        pub reject_cancelled: Option<bool>,
    }

    /// The plain form of a [`RetryPolicy`](crate::RetryPolicy).
    #[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
    #[serde(rename_all = "camelCase", default)]
    pub struct RetryOptions {
        /// Retries after the initial call.
        #[serde(skip_serializing_if = "Option::is_none")]
        pub retries: Option<u32>,
        /// Delay before the first retry, in milliseconds.
        #[serde(skip_serializing_if = "Option::is_none")]
        pub delay: Option<u64>,
        /// Delay multiplier for every further retry.
        #[serde(skip_serializing_if = "Option::is_none")]
        pub backoff: Option<f64>,
        /// Delay ceiling in milliseconds.
        #[serde(skip_serializing_if = "Option::is_none")]
        pub max_delay: Option<u64>,
        /// Statuses eligible for retry.
        #[serde(skip_serializing_if = "Option::is_none")]
        pub retry_on: Option<Vec<u16>>,
        /// Whether each attempt gets its own deadline.
        #[serde(skip_serializing_if = "Option::is_none")]
        pub reset_timeout: Option<bool>,
    }

    impl FetchOptions {
        /// Overrides the fields of `config` that are present here.
        ///
        /// # Errors
        ///
        /// Returns [`FetchError::Validation`] if `retryOn` lists a number that is not an HTTP status.
        pub fn apply(self, mut config: RequestConfig) -> Result<RequestConfig> {
            if let Some(ttl) = self.ttl {
                config.ttl = Ttl::from_secs(ttl);
            }
            if let Some(stale_time) = self.stale_time {
                config.stale_time = (stale_time > 0).then(|| Duration::from_secs(stale_time));
            }
            if let Some(dedupe_time) = self.dedupe_time {
                config.dedupe_time = Duration::from_millis(dedupe_time);
            }
            if let Some(timeout) = self.timeout {
                config.timeout = (timeout > 0).then(|| Duration::from_millis(timeout));
            }
            if let Some(cancellable) = self.is_cancellable {
                config.cancellable = cancellable;
            }
            if let Some(retry) = self.retry {
                config.retry = retry.apply(config.retry)?;
            }
            if let Some(enabled) = self.revalidate_on_focus {
                config.revalidate_on_focus = enabled;
            }
            if let Some(enabled) = self.revalidate_on_reconnect {
                config.revalidate_on_reconnect = enabled;
            }
            if let Some(cache_key) = self.cache_key {
                config.cache_key = CacheKeySource::Explicit(cache_key);
            }
            if let Some(strategy) = self.strategy {
                config.strategy = strategy;
            }
            if let Some(reject_cancelled) = self.reject_cancelled {
                config.reject_cancelled = reject_cancelled;
            }
            Ok(config)
        }
    }

    impl RetryOptions {
        fn apply(self, mut policy: crate::RetryPolicy) -> Result<crate::RetryPolicy> {
            if let Some(retries) = self.retries {
                policy = policy.max_retry_attempts(retries);
            }
            if let Some(delay) = self.delay {
                policy = policy.delay(Duration::from_millis(delay));
            }
            if let Some(backoff) = self.backoff {
                policy = policy.backoff_factor(backoff);
            }
            if let Some(max_delay) = self.max_delay {
                policy = policy.max_delay(Duration::from_millis(max_delay));
            }
            if let Some(retry_on) = self.retry_on {
                let statuses = retry_on
                    .into_iter()
                    .map(|code| {
                        StatusCode::from_u16(code).map_err(|error| FetchError::Validation {
                            message: Cow::Owned(format!("retryOn entry {code} is invalid: {error}")),
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                policy = policy.retry_on(statuses);
            }
            if let Some(reset_timeout) = self.reset_timeout {
                policy = policy.reset_timeout(reset_timeout);
            }
            Ok(policy)
        }
    }
}
