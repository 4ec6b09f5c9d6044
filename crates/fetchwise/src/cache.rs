// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::{CacheKey, Timers};

/// How long a cached value stays valid.
///
/// Defaults to five minutes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
    /// Do not cache; storing removes any existing entry instead.
    Disabled,
    /// Keep the entry until it is deleted explicitly.
    Infinite,
    /// Drop the entry once the duration has elapsed.
    Expires(Duration),
}

impl Ttl {
    /// Converts the integer-seconds form: `0` disables caching, negative values never expire.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::time::Duration;
    ///
    /// use fetchwise::Ttl;
    ///
    /// assert_eq!(Ttl::from_secs(0), Ttl::Disabled);
    /// assert_eq!(Ttl::from_secs(-1), Ttl::Infinite);
    /// assert_eq!(Ttl::from_secs(300), Ttl::Expires(Duration::from_secs(300)));
    /// ```
    #[must_use]
    pub fn from_secs(secs: i64) -> Self {
        match u64::try_from(secs) {
            Ok(0) => Self::Disabled,
            Ok(secs) => Self::Expires(Duration::from_secs(secs)),
            Err(_) => Self::Infinite,
        }
    }
}

impl Default for Ttl {
    fn default() -> Self {
        Self::Expires(Duration::from_secs(300))
    }
}

/// A stored value with its timestamps.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    value: V,
    created_at: Instant,
    expires_at: Option<Instant>,
    stale_at: Option<Instant>,
}

impl<V> CacheEntry<V> {
    /// The stored value.
    #[must_use]
    pub fn value(&self) -> &V {
        &self.value
    }

    /// Consumes the entry, returning the stored value.
    #[must_use]
    pub fn into_value(self) -> V {
        self.value
    }

    /// When the entry was stored.
    #[must_use]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// When the entry stops being served, or `None` if it never expires.
    #[must_use]
    pub fn expires_at(&self) -> Option<Instant> {
        self.expires_at
    }

    /// When the entry starts being reported as stale, if a stale time was given.
    #[must_use]
    pub fn stale_at(&self) -> Option<Instant> {
        self.stale_at
    }

    /// Returns `true` if the entry has expired at `now`. At its expiry instant it is still served.
    #[must_use]
    pub fn is_expired_at(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|expires_at| now > expires_at)
    }

    fn has_reached_expiry(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|expires_at| now >= expires_at)
    }

    /// Returns `true` if the entry is past its stale time at `now`.
    #[must_use]
    pub fn is_stale_at(&self, now: Instant) -> bool {
        self.stale_at.is_some_and(|stale_at| now > stale_at)
    }
}

/// The result of a successful [`CacheStore::get`].
#[derive(Debug, Clone)]
pub struct Cached<V> {
    entry: CacheEntry<V>,
    stale: bool,
}

impl<V> Cached<V> {
    /// The cached value.
    #[must_use]
    pub fn value(&self) -> &V {
        &self.entry.value
    }

    /// Consumes the read, returning the cached value.
    #[must_use]
    pub fn into_value(self) -> V {
        self.entry.value
    }

    /// The entry with its timestamps.
    #[must_use]
    pub fn entry(&self) -> &CacheEntry<V> {
        &self.entry
    }

    /// Returns `true` if the entry was past its stale time when it was read.
    ///
    /// Refreshing stale entries is up to the caller; the store never does it on its own.
    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.stale
    }
}

/// Key-value storage with time-to-live and stale-while-revalidate semantics.
///
/// Entries with a finite [`Ttl`] are removed by a timer when they expire, and reads never report
/// an expired entry even if that timer has not run yet. Staleness is only evaluated on read.
pub struct CacheStore<V> {
    inner: Arc<StoreInner<V>>,
}

struct StoreInner<V> {
    entries: Mutex<HashMap<CacheKey, CacheEntry<V>>>,
    timers: Timers,
}

impl<V> Clone for CacheStore<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> CacheStore<V>
where
    V: Clone + Send + 'static,
{
    /// Creates an empty store that schedules expiry on `timers`.
    #[must_use]
    pub fn new(timers: Timers) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                entries: Mutex::new(HashMap::new()),
                timers,
            }),
        }
    }

    /// Reads the entry under `key`, flagging it if stale. Expired entries are removed and reported as absent.
    #[must_use]
    pub fn get(&self, key: &CacheKey) -> Option<Cached<V>> {
        let now = self.inner.timers.clock().instant();
        let mut entries = self.inner.entries.lock();

        let entry = entries.get(key)?;
        if entry.is_expired_at(now) {
            entries.remove(key);
            drop(entries);
            self.inner.timers.cancel(&expiry_timer_key(key));
            return None;
        }

        Some(Cached {
            entry: entry.clone(),
            stale: entry.is_stale_at(now),
        })
    }

    /// Stores `value` under `key`, replacing any existing entry.
    ///
    /// [`Ttl::Disabled`] removes the existing entry and stores nothing. `stale` is measured from now.
    pub fn set(&self, key: CacheKey, value: V, ttl: Ttl, stale: Option<Duration>) {
        let ttl_duration = match ttl {
            Ttl::Disabled => {
                self.delete(&key, false);
                return;
            }
            Ttl::Infinite => None,
            Ttl::Expires(duration) => Some(duration),
        };

        let now = self.inner.timers.clock().instant();
        let entry = CacheEntry {
            value,
            created_at: now,
            expires_at: ttl_duration.and_then(|duration| now.checked_add(duration)),
            stale_at: stale.and_then(|stale| now.checked_add(stale)),
        };

        self.inner.entries.lock().insert(key.clone(), entry);

        #[cfg(any(feature = "logs", test))]
        tracing::event!(
            name: "fetchwise.cache",
            tracing::Level::DEBUG,
            cache.key = %key,
            cache.ttl = ?ttl,
            "cache entry stored"
        );

        let timer_key = expiry_timer_key(&key);
        match ttl_duration {
            Some(duration) => {
                let store = Arc::downgrade(&self.inner);
                self.inner
                    .timers
                    .schedule(timer_key, duration, move || remove_expired(&store, &key));
            }
            None => {
                self.inner.timers.cancel(&timer_key);
            }
        }
    }

    /// Removes the entry under `key`. With `only_if_expired`, a live entry is left alone.
    ///
    /// Returns `true` if an entry was removed.
    pub fn delete(&self, key: &CacheKey, only_if_expired: bool) -> bool {
        let now = self.inner.timers.clock().instant();
        let removed = {
            let mut entries = self.inner.entries.lock();
            let eligible = entries
                .get(key)
                .is_some_and(|entry| !only_if_expired || entry.is_expired_at(now));
            eligible && entries.remove(key).is_some()
        };

        if removed {
            self.inner.timers.cancel(&expiry_timer_key(key));
        }

        removed
    }

    /// Removes every entry and cancels their expiry timers, returning how many were removed.
    pub fn prune_all(&self) -> usize {
        let drained: Vec<_> = self.inner.entries.lock().drain().map(|(key, _)| key).collect();
        for key in &drained {
            self.inner.timers.cancel(&expiry_timer_key(key));
        }
        drained.len()
    }

    /// Returns `true` if an unexpired entry exists under `key`.
    #[must_use]
    pub fn contains(&self, key: &CacheKey) -> bool {
        let now = self.inner.timers.clock().instant();
        self.inner
            .entries
            .lock()
            .get(key)
            .is_some_and(|entry| !entry.is_expired_at(now))
    }

    /// Changes the value under `key` in place, keeping its timestamps.
    ///
    /// Returns `false` if there is no unexpired entry to change.
    pub fn mutate(&self, key: &CacheKey, mutate: impl FnOnce(&mut V)) -> bool {
        let now = self.inner.timers.clock().instant();
        let mut entries = self.inner.entries.lock();
        match entries.get_mut(key) {
            Some(entry) if !entry.is_expired_at(now) => {
                mutate(&mut entry.value);
                true
            }
            _ => false,
        }
    }

    /// The number of stored entries, including expired ones whose timer has not run yet.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    /// Returns `true` if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.entries.lock().is_empty()
    }

    /// A snapshot of the stored keys.
    #[must_use]
    pub fn keys(&self) -> Vec<CacheKey> {
        self.inner.entries.lock().keys().cloned().collect()
    }
}

fn remove_expired<V>(store: &Weak<StoreInner<V>>, key: &CacheKey) {
    let Some(store) = store.upgrade() else {
        return;
    };

    // The timer fires at the expiry instant itself, when reads would still serve the entry.
    let now = store.timers.clock().instant();
    let mut entries = store.entries.lock();
    if entries.get(key).is_some_and(|entry| entry.has_reached_expiry(now)) {
        entries.remove(key);

        #[cfg(any(feature = "logs", test))]
        tracing::event!(name: "fetchwise.cache", tracing::Level::DEBUG, cache.key = %key, "cache entry expired");
    }
}

fn expiry_timer_key(key: &CacheKey) -> String {
    format!("c:{key}")
}

impl<V> fmt::Debug for CacheStore<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheStore")
            .field("len", &self.inner.entries.lock().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use testing_aids::{LogCapture, settle};
    use tick::ClockControl;

    use super::*;

    fn store() -> (ClockControl, Timers, CacheStore<&'static str>) {
        let control = ClockControl::new();
        let timers = Timers::new(control.to_clock());
        let store = CacheStore::new(timers.clone());
        (control, timers, store)
    }

    fn key(raw: &str) -> CacheKey {
        CacheKey::new(raw)
    }

    #[tokio::test]
    async fn infinite_entries_never_expire() {
        let (control, timers, store) = store();

        store.set(key("a"), "value", Ttl::Infinite, None);
        assert!(!timers.is_scheduled("c:a"));

        control.advance(Duration::from_secs(10 * 365 * 24 * 60 * 60));
        settle().await;

        let cached = store.get(&key("a")).unwrap();
        assert_eq!(*cached.value(), "value");
        assert_eq!(cached.entry().expires_at(), None);
    }

    #[tokio::test]
    async fn disabled_ttl_stores_nothing_and_removes_existing() {
        let (_control, _timers, store) = store();

        store.set(key("a"), "old", Ttl::Infinite, None);
        store.set(key("a"), "new", Ttl::Disabled, None);

        assert!(store.get(&key("a")).is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn stale_then_expired_scenario() {
        let (control, timers, store) = store();

        store.set(key("a"), "value", Ttl::Expires(Duration::from_secs(5)), Some(Duration::from_secs(2)));
        settle().await;

        control.advance(Duration::from_secs(1));
        assert!(!store.get(&key("a")).unwrap().is_stale());

        control.advance(Duration::from_secs(2));
        let cached = store.get(&key("a")).unwrap();
        assert_eq!(*cached.value(), "value");
        assert!(cached.is_stale());

        control.advance(Duration::from_secs(3));
        settle().await;
        assert!(store.get(&key("a")).is_none());
        assert!(!store.contains(&key("a")));
        assert_eq!(store.len(), 0);
        assert!(!timers.is_scheduled("c:a"));
    }

    #[tokio::test]
    async fn entry_is_served_at_its_expiry_instant_then_purged() {
        let (control, timers, store) = store();

        store.set(key("a"), "value", Ttl::Expires(Duration::from_secs(5)), Some(Duration::from_secs(2)));
        let expires_at = store.get(&key("a")).unwrap().entry().expires_at().unwrap();
        settle().await;

        control.advance(Duration::from_secs(5));
        // No settle: the read happens at exactly the expiry instant.
        let cached = store.get(&key("a")).unwrap();
        assert!(cached.is_stale());
        assert!(!cached.entry().is_expired_at(expires_at));
        assert!(cached.entry().is_expired_at(expires_at + Duration::from_nanos(1)));

        settle().await;
        assert!(store.is_empty());
        assert!(!timers.is_scheduled("c:a"));
    }

    #[tokio::test]
    async fn read_hides_expired_entry_before_timer_runs() {
        let (control, _timers, store) = store();

        store.set(key("a"), "value", Ttl::Expires(Duration::from_secs(1)), None);
        control.advance(Duration::from_secs(2));

        // No settle: the expiry timer has not had a chance to run.
        assert_eq!(store.len(), 1);
        assert!(store.get(&key("a")).is_none());
        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn resetting_with_infinite_ttl_cancels_expiry() {
        let (control, timers, store) = store();

        store.set(key("a"), "short", Ttl::Expires(Duration::from_secs(1)), None);
        assert!(timers.is_scheduled("c:a"));
        store.set(key("a"), "forever", Ttl::Infinite, None);
        assert!(!timers.is_scheduled("c:a"));

        control.advance(Duration::from_secs(5));
        settle().await;

        assert_eq!(*store.get(&key("a")).unwrap().value(), "forever");
    }

    #[tokio::test]
    async fn delete_only_if_expired_keeps_live_entries() {
        let (control, _timers, store) = store();

        store.set(key("a"), "value", Ttl::Expires(Duration::from_secs(10)), None);
        assert!(!store.delete(&key("a"), true));
        assert!(store.contains(&key("a")));

        control.advance(Duration::from_secs(11));
        assert!(store.delete(&key("a"), true));
        assert!(!store.delete(&key("a"), false));
    }

    #[tokio::test]
    async fn prune_all_clears_entries_and_timers() {
        let (_control, timers, store) = store();

        store.set(key("a"), "1", Ttl::Expires(Duration::from_secs(10)), None);
        store.set(key("b"), "2", Ttl::Infinite, None);

        assert_eq!(store.prune_all(), 2);
        assert!(store.is_empty());
        assert!(timers.is_empty());
    }

    #[tokio::test]
    async fn mutate_keeps_expiry() {
        let (control, _timers, store) = store();

        store.set(key("a"), "before", Ttl::Expires(Duration::from_secs(10)), None);
        let expires_at = store.get(&key("a")).unwrap().entry().expires_at();

        control.advance(Duration::from_secs(4));
        assert!(store.mutate(&key("a"), |value| *value = "after"));
        assert!(!store.mutate(&key("missing"), |value| *value = "nope"));

        let cached = store.get(&key("a")).unwrap();
        assert_eq!(*cached.value(), "after");
        assert_eq!(cached.entry().expires_at(), expires_at);
    }

    #[tokio::test]
    async fn keys_returns_snapshot() {
        let (_control, _timers, store) = store();

        store.set(key("a"), "1", Ttl::Infinite, None);
        store.set(key("b"), "2", Ttl::Infinite, None);

        let mut keys = store.keys();
        keys.sort();
        assert_eq!(keys, [key("a"), key("b")]);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn storing_and_expiring_is_logged() {
        let capture = LogCapture::new();
        let _guard = tracing::subscriber::set_default(capture.subscriber());
        let (control, _timers, store) = store();

        store.set(key("GET|/a"), "value", Ttl::Expires(Duration::from_millis(5)), None);
        settle().await;
        control.advance(Duration::from_millis(5));
        settle().await;

        capture.assert_contains("cache entry stored");
        capture.assert_contains("cache.key=GET|/a");
        capture.assert_contains("cache entry expired");
    }

    #[test]
    fn ttl_from_secs_handles_sentinels() {
        assert_eq!(Ttl::from_secs(0), Ttl::Disabled);
        assert_eq!(Ttl::from_secs(-1), Ttl::Infinite);
        assert_eq!(Ttl::from_secs(-20), Ttl::Infinite);
        assert_eq!(Ttl::from_secs(5), Ttl::Expires(Duration::from_secs(5)));
    }
}
