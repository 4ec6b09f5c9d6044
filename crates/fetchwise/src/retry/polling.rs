// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::FetchResponse;

type StopPolling<T> = Arc<dyn Fn(&FetchResponse<T>, u32) -> bool + Send + Sync>;

/// Repeats a successful fetch on a fixed interval.
///
/// Each poll runs the full attempt sequence, retries included, and writes its result to the cache
/// like any other fetch. Polling ends at the first failure, after [`max_attempts`](Self::max_attempts)
/// polls, or when [`should_stop`](Self::should_stop) returns `true` for the latest response.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use fetchwise::PollingPolicy;
///
/// let polling = PollingPolicy::<String>::new(Duration::from_secs(5))
///     .max_attempts(10)
///     .should_stop(|response, _poll| response.data().is_some_and(|job| job.as_str() == "done"));
/// # let _ = polling;
/// ```
pub struct PollingPolicy<T> {
    pub(crate) interval: Duration,
    pub(crate) delay: Duration,
    max_attempts: Option<u32>,
    should_stop: Option<StopPolling<T>>,
}

impl<T> PollingPolicy<T> {
    /// Polls every `interval`. A zero interval disables polling.
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            delay: Duration::ZERO,
            max_attempts: None,
            should_stop: None,
        }
    }

    /// Waits `delay` before the first request.
    #[must_use]
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Stops after `max_attempts` polls, the first request included.
    #[must_use]
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Stops once `should_stop` returns `true` for the latest response and the number of polls so far.
    #[must_use]
    pub fn should_stop(mut self, should_stop: impl Fn(&FetchResponse<T>, u32) -> bool + Send + Sync + 'static) -> Self {
        self.should_stop = Some(Arc::new(should_stop));
        self
    }

    /// Decides whether to poll again after `completed` successful polls.
    pub(crate) fn should_continue(&self, latest: &FetchResponse<T>, completed: u32) -> bool {
        if self.interval.is_zero() {
            return false;
        }

        if self.max_attempts.is_some_and(|max| completed >= max) {
            return false;
        }

        !self.should_stop.as_ref().is_some_and(|should_stop| should_stop(latest, completed))
    }
}

impl<T> Clone for PollingPolicy<T> {
    fn clone(&self) -> Self {
        Self {
            interval: self.interval,
            delay: self.delay,
            max_attempts: self.max_attempts,
            should_stop: self.should_stop.clone(),
        }
    }
}

impl<T> fmt::Debug for PollingPolicy<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollingPolicy")
            .field("interval", &self.interval)
            .field("delay", &self.delay)
            .field("max_attempts", &self.max_attempts)
            .field("has_should_stop", &self.should_stop.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_attempts_bounds_polls() {
        let polling = PollingPolicy::new(Duration::from_secs(1)).max_attempts(3);
        let latest = FetchResponse::from_data(1);

        assert!(polling.should_continue(&latest, 1));
        assert!(polling.should_continue(&latest, 2));
        assert!(!polling.should_continue(&latest, 3));
    }

    #[test]
    fn should_stop_sees_latest_response() {
        let polling = PollingPolicy::new(Duration::from_secs(1)).should_stop(|response, _| response.data() == Some(&"done"));

        assert!(polling.should_continue(&FetchResponse::from_data("pending"), 1));
        assert!(!polling.should_continue(&FetchResponse::from_data("done"), 2));
    }

    #[test]
    fn zero_interval_disables_polling() {
        let polling = PollingPolicy::new(Duration::ZERO);

        assert!(!polling.should_continue(&FetchResponse::from_data(()), 1));
    }

    #[test]
    fn unbounded_policy_keeps_going() {
        let polling = PollingPolicy::new(Duration::from_millis(10)).delay(Duration::from_millis(5));

        assert!(polling.should_continue(&FetchResponse::from_data(()), 1_000));
        assert_eq!(polling.clone().delay, Duration::from_millis(5));
    }
}
