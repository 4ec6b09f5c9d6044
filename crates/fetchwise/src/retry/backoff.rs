// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::time::Duration;

/// Exponential backoff: the `n`-th retry waits `min(max_delay, base * factor^n)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Backoff {
    base: Duration,
    factor: f64,
    max_delay: Duration,
}

impl Backoff {
    pub(crate) fn new(base: Duration, factor: f64, max_delay: Duration) -> Self {
        Self { base, factor, max_delay }
    }

    /// The delay before retry number `retry`, counting from zero.
    pub(crate) fn delay(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let secs = self.base.as_secs_f64() * self.factor.powi(exponent);
        self.clamp(secs_to_duration_saturating(secs))
    }

    /// Caps a delay that came from somewhere else, such as a `Retry-After` header.
    pub(crate) fn clamp(&self, delay: Duration) -> Duration {
        delay.min(self.max_delay)
    }

    #[cfg(test)]
    pub(crate) fn delays(&self) -> impl Iterator<Item = Duration> {
        let backoff = *self;
        (0..).map(move |retry| backoff.delay(retry))
    }
}

fn secs_to_duration_saturating(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }

    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_sequence_is_capped() {
        let backoff = Backoff::new(Duration::from_millis(1000), 1.5, Duration::from_millis(5000));

        let delays: Vec<_> = backoff.delays().take(6).map(|delay| delay.as_millis()).collect();

        assert_eq!(delays, [1000, 1500, 2250, 3375, 5000, 5000]);
    }

    #[test]
    fn factor_one_is_constant() {
        let backoff = Backoff::new(Duration::from_millis(200), 1.0, Duration::from_secs(30));

        assert!(backoff.delays().take(4).all(|delay| delay == Duration::from_millis(200)));
    }

    #[test]
    fn huge_retry_counts_saturate_at_ceiling() {
        let backoff = Backoff::new(Duration::from_secs(1), 2.0, Duration::from_secs(30));

        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn zero_base_never_waits() {
        let backoff = Backoff::new(Duration::ZERO, 2.0, Duration::from_secs(30));

        assert_eq!(backoff.delay(10), Duration::ZERO);
    }

    #[test]
    fn clamp_caps_external_delays() {
        let backoff = Backoff::new(Duration::from_secs(1), 2.0, Duration::from_secs(5));

        assert_eq!(backoff.clamp(Duration::from_secs(120)), Duration::from_secs(5));
        assert_eq!(backoff.clamp(Duration::from_secs(2)), Duration::from_secs(2));
    }

    #[test]
    fn saturating_conversion() {
        assert_eq!(secs_to_duration_saturating(-1.0), Duration::ZERO);
        assert_eq!(secs_to_duration_saturating(f64::NAN), Duration::ZERO);
        assert_eq!(secs_to_duration_saturating(f64::INFINITY), Duration::MAX);
        assert_eq!(secs_to_duration_saturating(1.5), Duration::from_millis(1500));
    }
}
