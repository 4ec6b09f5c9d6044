// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::CacheKey;

type Listener<V> = Arc<dyn Fn(&V) + Send + Sync>;

/// Per-key publish/subscribe channel for settled results.
///
/// Listeners run synchronously on the publishing task, after the notifier's lock is released,
/// so a listener may subscribe or unsubscribe without deadlocking.
pub struct Notifier<V> {
    inner: Arc<NotifierInner<V>>,
}

struct NotifierInner<V> {
    listeners: Mutex<HashMap<CacheKey, Vec<(u64, Listener<V>)>>>,
    next_id: AtomicU64,
}

impl<V> Clone for Notifier<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> Default for Notifier<V> {
    fn default() -> Self {
        Self {
            inner: Arc::new(NotifierInner {
                listeners: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }
}

impl<V: 'static> Notifier<V> {
    /// Creates a notifier without subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Calls `listener` with every value published under `key` until the subscription is dropped.
    pub fn subscribe(&self, key: CacheKey, listener: impl Fn(&V) + Send + Sync + 'static) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .lock()
            .entry(key.clone())
            .or_default()
            .push((id, Arc::new(listener)));

        let notifier = Arc::downgrade(&self.inner);
        Subscription {
            unsubscribe: Some(Box::new(move || unsubscribe(&notifier, &key, id))),
        }
    }

    /// Delivers `value` to every listener of `key` and returns how many were called.
    pub fn publish(&self, key: &CacheKey, value: &V) -> usize {
        let listeners: Vec<_> = self
            .inner
            .listeners
            .lock()
            .get(key)
            .map(|listeners| listeners.iter().map(|(_, listener)| Arc::clone(listener)).collect())
            .unwrap_or_default();

        for listener in &listeners {
            listener(value);
        }

        listeners.len()
    }

    /// How many listeners are subscribed to `key`.
    #[must_use]
    pub fn subscriber_count(&self, key: &CacheKey) -> usize {
        self.inner.listeners.lock().get(key).map_or(0, Vec::len)
    }
}

fn unsubscribe<V>(notifier: &Weak<NotifierInner<V>>, key: &CacheKey, id: u64) {
    let Some(notifier) = notifier.upgrade() else {
        return;
    };

    let mut listeners = notifier.listeners.lock();
    if let Some(for_key) = listeners.get_mut(key) {
        for_key.retain(|(existing, _)| *existing != id);
        if for_key.is_empty() {
            listeners.remove(key);
        }
    }
}

impl<V> fmt::Debug for Notifier<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifier")
            .field("keys", &self.inner.listeners.lock().len())
            .finish_non_exhaustive()
    }
}

/// Keeps a listener registered; dropping it unsubscribes.
#[must_use = "dropping a subscription unsubscribes the listener immediately"]
pub struct Subscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Keeps the listener registered for the lifetime of the notifier.
    pub fn detach(mut self) {
        self.unsubscribe = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.unsubscribe.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use testing_aids::CallLog;

    use super::*;

    #[test]
    fn publish_reaches_only_listeners_of_key() {
        let notifier = Notifier::<u32>::new();
        let log = CallLog::new();

        let _a = notifier.subscribe(CacheKey::new("a"), {
            let log = log.clone();
            move |value| log.push(format!("a:{value}"))
        });
        let _b = notifier.subscribe(CacheKey::new("b"), {
            let log = log.clone();
            move |value| log.push(format!("b:{value}"))
        });

        assert_eq!(notifier.publish(&CacheKey::new("a"), &1), 1);
        assert_eq!(notifier.publish(&CacheKey::new("c"), &2), 0);

        assert_eq!(log.entries(), ["a:1"]);
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let notifier = Notifier::<u32>::new();
        let key = CacheKey::new("a");

        let first = notifier.subscribe(key.clone(), |_| {});
        let second = notifier.subscribe(key.clone(), |_| {});
        assert_eq!(notifier.subscriber_count(&key), 2);

        drop(first);
        assert_eq!(notifier.subscriber_count(&key), 1);

        drop(second);
        assert_eq!(notifier.subscriber_count(&key), 0);
    }

    #[test]
    fn detached_subscription_stays() {
        let notifier = Notifier::<u32>::new();
        let key = CacheKey::new("a");

        notifier.subscribe(key.clone(), |_| {}).detach();

        assert_eq!(notifier.subscriber_count(&key), 1);
    }

    #[test]
    fn listener_may_subscribe_during_publish() {
        let notifier = Notifier::<u32>::new();
        let key = CacheKey::new("a");
        let nested = Arc::new(Mutex::new(Vec::new()));

        let _outer = notifier.subscribe(key.clone(), {
            let notifier = notifier.clone();
            let key = key.clone();
            let nested = Arc::clone(&nested);
            move |_| nested.lock().push(notifier.subscribe(key.clone(), |_| {}))
        });

        notifier.publish(&key, &1);

        assert_eq!(notifier.subscriber_count(&key), 2);
    }

    #[test]
    fn subscription_outliving_notifier_is_harmless() {
        let notifier = Notifier::<u32>::new();
        let subscription = notifier.subscribe(CacheKey::new("a"), |_| {});

        drop(notifier);
        drop(subscription);
    }
}
