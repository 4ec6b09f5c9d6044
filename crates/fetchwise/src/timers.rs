// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tick::Clock;

use crate::runtime::{Runtime, TaskHandle};

type Callback = Box<dyn FnOnce() + Send + 'static>;

/// A keyed, replace-on-schedule timer facility.
///
/// At most one timer is live per key: scheduling under a key that already has a pending timer
/// discards the previous one, and its callback is dropped without running. Timers are driven by
/// the [`Clock`] the facility was created with, so a frozen clock controls when they fire.
///
/// Cloning is cheap; clones share the same timers. When the last clone is dropped every pending
/// timer is cancelled.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use fetchwise::Timers;
/// use tick::Clock;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let timers = Timers::new(Clock::new_tokio());
///
/// timers.schedule("refresh", Duration::from_secs(1), || println!("first"));
/// timers.schedule("refresh", Duration::from_millis(500), || println!("replaces the first"));
///
/// assert_eq!(timers.len(), 1);
/// # }
/// ```
#[derive(Clone)]
pub struct Timers {
    inner: Arc<TimersInner>,
}

struct TimersInner {
    runtime: Runtime,
    slots: Mutex<HashMap<String, Slot>>,
    next_generation: AtomicU64,
}

struct Slot {
    generation: u64,
    fires_at: Option<Instant>,
    callback: Callback,
    task: TaskHandle,
}

impl Timers {
    /// Creates an empty facility driven by `clock`.
    #[must_use]
    pub fn new(clock: Clock) -> Self {
        Self {
            inner: Arc::new(TimersInner {
                runtime: Runtime::new(clock),
                slots: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
            }),
        }
    }

    /// Runs `callback` once `delay` has elapsed, replacing any timer pending under `key`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn schedule(&self, key: impl Into<String>, delay: Duration, callback: impl FnOnce() + Send + 'static) {
        let key = key.into();
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let clock = self.inner.runtime.clock().clone();
        let fires_at = clock.instant().checked_add(delay);

        let weak = Arc::downgrade(&self.inner);
        let task_key = key.clone();

        // The slot is inserted while the lock is held, so the task cannot look for it too early.
        let mut slots = self.inner.slots.lock();
        let task = self.inner.runtime.spawn(async move {
            match fires_at {
                Some(deadline) => clock.delay(deadline.saturating_duration_since(clock.instant())).await,
                None => std::future::pending::<()>().await,
            }

            fire(&weak, &task_key, generation);
        });

        let previous = slots.insert(
            key,
            Slot {
                generation,
                fires_at,
                callback: Box::new(callback),
                task,
            },
        );
        drop(slots);

        if let Some(previous) = previous {
            previous.task.abort();
        }
    }

    /// Cancels the timer pending under `key`, returning `false` if there was none.
    pub fn cancel(&self, key: &str) -> bool {
        let removed = self.inner.slots.lock().remove(key);
        match removed {
            Some(slot) => {
                slot.task.abort();
                true
            }
            None => false,
        }
    }

    /// Cancels every pending timer and returns how many there were.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<_> = self.inner.slots.lock().drain().collect();
        for (_, slot) in &drained {
            slot.task.abort();
        }
        drained.len()
    }

    /// Returns `true` if a timer is pending under `key`.
    #[must_use]
    pub fn is_scheduled(&self, key: &str) -> bool {
        self.inner.slots.lock().contains_key(key)
    }

    /// When the timer under `key` is due, if one is pending and its deadline is representable.
    #[must_use]
    pub fn fires_at(&self, key: &str) -> Option<Instant> {
        self.inner.slots.lock().get(key).and_then(|slot| slot.fires_at)
    }

    /// The number of pending timers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.slots.lock().len()
    }

    /// Returns `true` if no timer is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.slots.lock().is_empty()
    }

    pub(crate) fn clock(&self) -> &Clock {
        self.inner.runtime.clock()
    }

    pub(crate) fn runtime(&self) -> &Runtime {
        &self.inner.runtime
    }
}

fn fire(inner: &Weak<TimersInner>, key: &str, generation: u64) {
    let Some(inner) = inner.upgrade() else {
        return;
    };

    let slot = {
        let mut slots = inner.slots.lock();
        if slots.get(key).is_some_and(|slot| slot.generation == generation) {
            slots.remove(key)
        } else {
            None
        }
    };

    // The lock is released first so the callback may schedule or cancel timers itself.
    if let Some(slot) = slot {
        #[cfg(any(feature = "logs", test))]
        tracing::event!(name: "fetchwise.timer", tracing::Level::TRACE, timer.key = %key, "timer fired");

        (slot.callback)();
    }
}

impl Drop for TimersInner {
    fn drop(&mut self) {
        for slot in self.slots.get_mut().values() {
            slot.task.abort();
        }
    }
}

impl fmt::Debug for Timers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots = self.inner.slots.lock();
        let mut keys: Vec<_> = slots.keys().collect();
        keys.sort();
        f.debug_struct("Timers").field("pending", &keys).finish()
    }
}

#[cfg(test)]
mod tests {
    use testing_aids::{CallLog, LogCapture, settle};
    use tick::ClockControl;

    use super::*;

    fn recorder(log: &CallLog, label: &'static str) -> impl FnOnce() + Send + 'static {
        let log = log.clone();
        move || log.push(label)
    }

    #[tokio::test]
    async fn replacing_timer_discards_previous_callback() {
        let control = ClockControl::new();
        let timers = Timers::new(control.to_clock());
        let log = CallLog::new();

        timers.schedule("x", Duration::from_millis(1000), recorder(&log, "a"));
        timers.schedule("x", Duration::from_millis(500), recorder(&log, "b"));
        assert_eq!(timers.len(), 1);
        settle().await;

        control.advance(Duration::from_millis(499));
        settle().await;
        assert!(log.is_empty());

        control.advance(Duration::from_millis(1));
        settle().await;
        assert_eq!(log.entries(), ["b"]);

        control.advance(Duration::from_millis(1000));
        settle().await;
        assert_eq!(log.entries(), ["b"]);
        assert!(timers.is_empty());
    }

    #[tokio::test]
    async fn cancelled_timer_never_fires() {
        let control = ClockControl::new();
        let timers = Timers::new(control.to_clock());
        let log = CallLog::new();

        timers.schedule("x", Duration::from_millis(10), recorder(&log, "x"));
        assert!(timers.is_scheduled("x"));
        assert!(timers.cancel("x"));
        assert!(!timers.cancel("x"));

        control.advance(Duration::from_millis(20));
        settle().await;

        assert!(log.is_empty());
        assert!(!timers.is_scheduled("x"));
    }

    #[tokio::test]
    async fn cancel_all_clears_every_key() {
        let control = ClockControl::new();
        let timers = Timers::new(control.to_clock());
        let log = CallLog::new();

        timers.schedule("a", Duration::from_millis(10), recorder(&log, "a"));
        timers.schedule("b", Duration::from_millis(20), recorder(&log, "b"));

        assert_eq!(timers.cancel_all(), 2);
        control.advance(Duration::from_millis(30));
        settle().await;

        assert!(log.is_empty());
        assert!(timers.is_empty());
    }

    #[tokio::test]
    async fn independent_keys_fire_in_deadline_order() {
        let control = ClockControl::new();
        let timers = Timers::new(control.to_clock());
        let log = CallLog::new();

        timers.schedule("late", Duration::from_millis(200), recorder(&log, "late"));
        timers.schedule("early", Duration::from_millis(100), recorder(&log, "early"));
        settle().await;

        control.advance(Duration::from_millis(100));
        settle().await;
        control.advance(Duration::from_millis(100));
        settle().await;

        assert_eq!(log.entries(), ["early", "late"]);
    }

    #[tokio::test]
    async fn callback_can_reschedule_same_key() {
        let control = ClockControl::new();
        let timers = Timers::new(control.to_clock());
        let log = CallLog::new();

        let again = timers.clone();
        let inner_log = log.clone();
        timers.schedule("tick", Duration::from_millis(10), move || {
            inner_log.push("first");
            again.schedule("tick", Duration::from_millis(10), recorder(&inner_log, "second"));
        });
        settle().await;

        control.advance(Duration::from_millis(10));
        settle().await;
        assert!(timers.is_scheduled("tick"));

        control.advance(Duration::from_millis(10));
        settle().await;
        assert_eq!(log.entries(), ["first", "second"]);
    }

    #[tokio::test]
    async fn fire_time_is_fixed_at_schedule() {
        let control = ClockControl::new();
        let timers = Timers::new(control.to_clock());
        let log = CallLog::new();
        let start = control.to_clock().instant();

        timers.schedule("x", Duration::from_millis(100), recorder(&log, "x"));
        assert_eq!(timers.fires_at("x"), Some(start + Duration::from_millis(100)));

        // The clock moves before the timer task is first polled.
        control.advance(Duration::from_millis(100));
        settle().await;

        assert_eq!(log.entries(), ["x"]);
    }

    #[tokio::test]
    async fn dropping_facility_cancels_timers() {
        let control = ClockControl::new();
        let log = CallLog::new();

        {
            let timers = Timers::new(control.to_clock());
            timers.schedule("x", Duration::from_millis(10), recorder(&log, "x"));
            settle().await;
        }

        control.advance(Duration::from_millis(10));
        settle().await;

        assert!(log.is_empty());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn firing_is_logged() {
        let capture = LogCapture::new();
        let _guard = tracing::subscriber::set_default(capture.subscriber());
        let control = ClockControl::new();
        let timers = Timers::new(control.to_clock());

        timers.schedule("c:GET|/a", Duration::from_millis(1), || {});
        settle().await;
        control.advance(Duration::from_millis(1));
        settle().await;

        capture.assert_contains("timer fired");
        capture.assert_contains("timer.key=c:GET|/a");
    }
}
