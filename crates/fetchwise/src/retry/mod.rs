// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Retry, backoff and polling.
//!
//! A fetch runs as a sequence of attempts. After each attempt the [`RetryPolicy`] decides whether
//! the sequence is finished or another attempt follows after a backoff delay:
//!
//! - A failure is retried when attempts remain, its status is in the allowlist (or the allowlist
//!   is empty) and the [`should_retry`](RetryPolicy::should_retry) predicate, if any, agrees.
//!   Transport failures have no status and always pass the allowlist; timeouts count as `408`.
//! - A success is retried only when the predicate asks for it. If no attempts remain, the fetch
//!   fails with [`FetchError::Validation`].
//! - Cancellation ends the sequence immediately.
//!
//! The delay before retry `n` is `min(max_delay, delay * backoff_factor^n)`, unless the failed
//! response carries a `Retry-After` header in seconds, which is used instead (still capped).

mod backoff;
mod polling;

use std::fmt;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{Either, select};
use http::StatusCode;
use tick::Clock;
use tick::FutureExt as _;

pub(crate) use self::backoff::Backoff;
pub use self::polling::PollingPolicy;
use crate::telemetry::{self, Telemetry};
use crate::{CacheKey, CancellationToken, FetchError, RawResponse};

/// Statuses retried by default.
pub const DEFAULT_RETRY_STATUSES: [StatusCode; 8] = [
    StatusCode::REQUEST_TIMEOUT,
    StatusCode::CONFLICT,
    StatusCode::TOO_EARLY,
    StatusCode::TOO_MANY_REQUESTS,
    StatusCode::INTERNAL_SERVER_ERROR,
    StatusCode::BAD_GATEWAY,
    StatusCode::SERVICE_UNAVAILABLE,
    StatusCode::GATEWAY_TIMEOUT,
];

/// Identifies one attempt within a retry sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    index: u32,
    is_last: bool,
}

impl Attempt {
    pub(crate) fn first(max_retry_attempts: u32) -> Self {
        Self {
            index: 0,
            is_last: max_retry_attempts == 0,
        }
    }

    pub(crate) fn next(self, max_retry_attempts: u32) -> Option<Self> {
        if self.is_last {
            return None;
        }

        let index = self.index.saturating_add(1);
        Some(Self {
            index,
            is_last: index >= max_retry_attempts,
        })
    }

    /// Zero for the initial call, one for the first retry and so on.
    #[must_use]
    pub fn index(self) -> u32 {
        self.index
    }

    /// Returns `true` for the initial call.
    #[must_use]
    pub fn is_first(self) -> bool {
        self.index == 0
    }

    /// Returns `true` if no retry may follow this attempt.
    #[must_use]
    pub fn is_last(self) -> bool {
        self.is_last
    }
}

/// What an attempt produced, as seen by a [`should_retry`](RetryPolicy::should_retry) predicate.
#[derive(Debug, Clone, Copy)]
pub enum AttemptOutcome<'a> {
    /// A successful response.
    Response(&'a RawResponse),
    /// A failure, including non-success statuses.
    Error(&'a FetchError),
}

/// Describes an upcoming retry to an [`on_retry`](RetryPolicy::on_retry) observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryEvent {
    attempt: Attempt,
    delay: Duration,
    status: Option<StatusCode>,
}

impl RetryEvent {
    /// The attempt that is about to be retried.
    #[must_use]
    pub fn attempt(&self) -> Attempt {
        self.attempt
    }

    /// How long the executor waits before the next attempt.
    #[must_use]
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// The status of the failed attempt, if it received a response.
    #[must_use]
    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }
}

type ShouldRetry = Arc<dyn Fn(AttemptOutcome<'_>, Attempt) -> bool + Send + Sync>;
type OnRetry = Arc<dyn Fn(&RetryEvent) + Send + Sync>;

/// Controls how failed (or unsatisfying) attempts are repeated.
///
/// The default policy makes a single attempt; set [`max_retry_attempts`](Self::max_retry_attempts)
/// to enable retries.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use fetchwise::RetryPolicy;
///
/// let retry = RetryPolicy::default()
///     .max_retry_attempts(3)
///     .delay(Duration::from_millis(200))
///     .backoff_factor(2.0)
///     .max_delay(Duration::from_secs(5));
/// # let _ = retry;
/// ```
#[derive(Clone)]
pub struct RetryPolicy {
    max_retry_attempts: u32,
    delay: Duration,
    backoff_factor: f64,
    max_delay: Duration,
    retry_on: Vec<StatusCode>,
    should_retry: Option<ShouldRetry>,
    reset_timeout: bool,
    on_retry: Option<OnRetry>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retry_attempts: 0,
            delay: Duration::from_secs(1),
            backoff_factor: 1.5,
            max_delay: Duration::from_secs(30),
            retry_on: DEFAULT_RETRY_STATUSES.to_vec(),
            should_retry: None,
            reset_timeout: false,
            on_retry: None,
        }
    }
}

impl RetryPolicy {
    /// How many times a request may be repeated after the initial call.
    #[must_use]
    pub fn max_retry_attempts(mut self, max_retry_attempts: u32) -> Self {
        self.max_retry_attempts = max_retry_attempts;
        self
    }

    /// The delay before the first retry.
    #[must_use]
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// The multiplier applied to the delay for every further retry.
    #[must_use]
    pub fn backoff_factor(mut self, backoff_factor: f64) -> Self {
        self.backoff_factor = backoff_factor;
        self
    }

    /// The longest delay between two attempts.
    #[must_use]
    pub fn max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Replaces the statuses eligible for retry. An empty list makes every status eligible.
    #[must_use]
    pub fn retry_on(mut self, statuses: impl IntoIterator<Item = StatusCode>) -> Self {
        self.retry_on = statuses.into_iter().collect();
        self
    }

    /// A predicate consulted after every attempt.
    ///
    /// For failures it must return `true` for a retry to happen. For successes, returning `true`
    /// asks for another attempt.
    #[must_use]
    pub fn should_retry(mut self, should_retry: impl Fn(AttemptOutcome<'_>, Attempt) -> bool + Send + Sync + 'static) -> Self {
        self.should_retry = Some(Arc::new(should_retry));
        self
    }

    /// With `true`, the request timeout applies to each attempt and a timed-out attempt may be
    /// retried. With `false`, one deadline covers the whole sequence.
    #[must_use]
    pub fn reset_timeout(mut self, reset_timeout: bool) -> Self {
        self.reset_timeout = reset_timeout;
        self
    }

    /// Observes every retry before its delay starts.
    #[must_use]
    pub fn on_retry(mut self, on_retry: impl Fn(&RetryEvent) + Send + Sync + 'static) -> Self {
        self.on_retry = Some(Arc::new(on_retry));
        self
    }

    /// Returns `true` if each attempt gets its own deadline.
    #[must_use]
    pub fn resets_timeout(&self) -> bool {
        self.reset_timeout
    }

    pub(crate) fn backoff(&self) -> Backoff {
        Backoff::new(self.delay, self.backoff_factor, self.max_delay)
    }

    fn evaluate(&self, attempt: Attempt, outcome: AttemptOutcome<'_>) -> Verdict {
        let asks_for_retry = self.should_retry.as_ref().map(|should_retry| should_retry(outcome, attempt));

        match outcome {
            AttemptOutcome::Response(_) => match asks_for_retry {
                Some(true) if attempt.is_last() => Verdict::Rejected,
                Some(true) => Verdict::Retry,
                _ => Verdict::Finish,
            },
            AttemptOutcome::Error(error) => {
                if attempt.is_last() || !self.is_status_eligible(error) || asks_for_retry == Some(false) {
                    Verdict::Finish
                } else {
                    Verdict::Retry
                }
            }
        }
    }

    fn is_status_eligible(&self, error: &FetchError) -> bool {
        let status = match error {
            FetchError::Transport(_) => return true,
            FetchError::Timeout { .. } => StatusCode::REQUEST_TIMEOUT,
            FetchError::Status { status, .. } => *status,
            _ => return false,
        };

        self.retry_on.is_empty() || self.retry_on.contains(&status)
    }

    fn retry_delay(&self, attempt: Attempt, failed: Option<&RawResponse>) -> Duration {
        let backoff = self.backoff();
        failed
            .and_then(retry_after)
            .map_or_else(|| backoff.delay(attempt.index()), |delay| backoff.clamp(delay))
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retry_attempts", &self.max_retry_attempts)
            .field("delay", &self.delay)
            .field("backoff_factor", &self.backoff_factor)
            .field("max_delay", &self.max_delay)
            .field("retry_on", &self.retry_on)
            .field("has_should_retry", &self.should_retry.is_some())
            .field("reset_timeout", &self.reset_timeout)
            .field("has_on_retry", &self.on_retry.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Finish,
    Retry,
    Rejected,
}

fn retry_after(response: &RawResponse) -> Option<Duration> {
    response
        .header("retry-after")
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Drives the attempts of one fetch until it succeeds, fails for good or is cancelled.
pub(crate) struct Attempts<'a> {
    pub(crate) policy: &'a RetryPolicy,
    pub(crate) clock: &'a Clock,
    pub(crate) token: &'a CancellationToken,
    pub(crate) attempt_timeout: Option<Duration>,
    pub(crate) telemetry: &'a Telemetry,
    #[cfg_attr(not(any(feature = "logs", test)), expect(dead_code, reason = "the key is only used for logging"))]
    pub(crate) key: &'a CacheKey,
}

impl Attempts<'_> {
    /// Runs `send` once per attempt. Non-success statuses are turned into [`FetchError::Status`].
    pub(crate) async fn run<F, Fut>(&self, mut send: F) -> Result<RawResponse, FetchError>
    where
        F: FnMut(Attempt) -> Fut,
        Fut: Future<Output = Result<RawResponse, FetchError>>,
    {
        let mut attempt = Attempt::first(self.policy.max_retry_attempts);

        loop {
            if let Some(reason) = self.token.reason() {
                return Err(FetchError::from_abort(reason));
            }

            let mut failed = None;
            let result = match self.guarded(send(attempt)).await {
                Ok(response) if !response.is_success() => {
                    let error = FetchError::Status {
                        status: response.status(),
                        body: response.body().clone(),
                    };
                    failed = Some(response);
                    Err(error)
                }
                other => other,
            };

            let outcome = match &result {
                Ok(response) => AttemptOutcome::Response(response),
                Err(error) => AttemptOutcome::Error(error),
            };

            match self.policy.evaluate(attempt, outcome) {
                Verdict::Finish => return result,
                Verdict::Rejected => {
                    return Err(FetchError::Validation {
                        message: format!("response rejected after {} attempts", attempt.index().saturating_add(1)).into(),
                    });
                }
                Verdict::Retry => {
                    let Some(next) = attempt.next(self.policy.max_retry_attempts) else {
                        return result;
                    };

                    let event = RetryEvent {
                        attempt,
                        delay: self.policy.retry_delay(attempt, failed.as_ref()),
                        status: result.as_ref().err().and_then(FetchError::status),
                    };
                    self.emit_retry(&event);
                    if let Some(on_retry) = &self.policy.on_retry {
                        on_retry(&event);
                    }

                    self.wait(event.delay).await?;
                    attempt = next;
                }
            }
        }
    }

    /// Runs one attempt, bounded by the per-attempt deadline and the cancellation token.
    async fn guarded<Fut>(&self, attempt: Fut) -> Result<RawResponse, FetchError>
    where
        Fut: Future<Output = Result<RawResponse, FetchError>>,
    {
        let bounded = async {
            match self.attempt_timeout {
                Some(after) => attempt
                    .timeout(self.clock, after)
                    .await
                    .unwrap_or(Err(FetchError::Timeout { after })),
                None => attempt.await,
            }
        };

        let result = match select(pin!(bounded), pin!(self.token.cancelled())).await {
            Either::Left((result, _)) => result,
            Either::Right((reason, _)) => return Err(FetchError::from_abort(reason)),
        };

        // A transport that honours the token fails on its own once cancelled; the reason is what counts.
        match self.token.reason() {
            Some(reason) => Err(FetchError::from_abort(reason)),
            None => result,
        }
    }

    async fn wait(&self, delay: Duration) -> Result<(), FetchError> {
        match select(pin!(self.clock.delay(delay)), pin!(self.token.cancelled())).await {
            Either::Left(((), _)) => Ok(()),
            Either::Right((reason, _)) => Err(FetchError::from_abort(reason)),
        }
    }

    #[cfg_attr(
        not(any(feature = "logs", test)),
        expect(unused_variables, reason = "the event is only used for logging")
    )]
    fn emit_retry(&self, event: &RetryEvent) {
        #[cfg(any(feature = "logs", test))]
        tracing::event!(
            name: "fetchwise.retry",
            tracing::Level::WARN,
            client.name = %self.telemetry.client_name(),
            cache.key = %self.key,
            retry.attempt.index = event.attempt.index(),
            retry.attempt.is_last = event.attempt.is_last(),
            retry.delay = event.delay.as_secs_f32(),
            retry.status = event.status.map(|status| status.as_u16()),
            "retrying request"
        );

        self.telemetry.report(telemetry::RETRY);
    }
}
