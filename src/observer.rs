//! Callback registries with explicit unsubscribe tokens

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_SUBSCRIPTION: AtomicU64 = AtomicU64::new(1);

/// Token returned by every registration; pass it back to unsubscribe.
///
/// Dropping the token does not remove the callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[must_use]
pub struct Subscription(u64);

impl Subscription {
    pub(crate) fn next() -> Self {
        Self(NEXT_SUBSCRIPTION.fetch_add(1, Ordering::Relaxed))
    }
}

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Ordered list of callbacks for one kind of value.
///
/// `notify` snapshots the list before calling out, so callbacks may
/// subscribe or unsubscribe while being notified.
pub struct Subscribers<T> {
    callbacks: Mutex<Vec<(Subscription, Callback<T>)>>,
}

impl<T> Subscribers<T> {
    pub fn new() -> Self {
        Self {
            callbacks: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let subscription = Subscription::next();
        self.callbacks.lock().push((subscription, Arc::new(callback)));
        subscription
    }

    /// Returns false if the token was not registered here
    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        let mut callbacks = self.callbacks.lock();
        let before = callbacks.len();
        callbacks.retain(|(id, _)| *id != subscription);
        callbacks.len() != before
    }

    pub fn notify(&self, value: &T) {
        let snapshot: Vec<Callback<T>> = self
            .callbacks
            .lock()
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();

        for callback in snapshot {
            callback(value);
        }
    }

    pub fn len(&self) -> usize {
        self.callbacks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.lock().is_empty()
    }
}

impl<T> Default for Subscribers<T> {
    fn default() -> Self {
        Self::new()
    }
}
