use std::{
    fmt,
    sync::{Arc, Weak},
};

use aulos_platform::Mutex;

type Subscriber<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Inner<T> {
    value: T,
    next_key: u64,
    subscribers: Vec<(u64, Subscriber<T>)>,
}

/// Latest value of something, with synchronous subscribers.
///
/// [`publish`](Self::publish) replaces the value and then calls every
/// subscriber in registration order. Subscribers run outside the internal
/// lock, so a subscriber may read, publish or subscribe again.
///
/// Cloning is cheap and yields a handle to the same value.
pub struct Observable<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Observable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Observable")
            .field("value", &inner.value)
            .field("subscribers", &inner.subscribers.len())
            .finish()
    }
}

impl<T: Clone + Send + 'static> Observable<T> {
    pub fn new(initial: T) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                value: initial,
                next_key: 0,
                subscribers: Vec::new(),
            })),
        }
    }

    pub fn get(&self) -> T {
        self.inner.lock().value.clone()
    }

    /// Replace the value and notify subscribers.
    pub fn publish(&self, value: T) {
        let subscribers: Vec<Subscriber<T>> = {
            let mut inner = self.inner.lock();
            inner.value = value.clone();
            inner
                .subscribers
                .iter()
                .map(|(_, s)| Arc::clone(s))
                .collect()
        };
        for subscriber in subscribers {
            subscriber(&value);
        }
    }

    /// Register `subscriber` for future publications.
    ///
    /// The current value is not replayed.
    pub fn subscribe<F>(&self, subscriber: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let key = {
            let mut inner = self.inner.lock();
            let key = inner.next_key;
            inner.next_key += 1;
            inner.subscribers.push((key, Arc::new(subscriber)));
            key
        };

        let weak: Weak<Mutex<Inner<T>>> = Arc::downgrade(&self.inner);
        Subscription {
            unsubscribe: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.lock().subscribers.retain(|(k, _)| *k != key);
                }
            })),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }
}

/// Registration handle returned by [`Observable::subscribe`].
///
/// Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Remove the subscriber. Equivalent to dropping the handle.
    pub fn unsubscribe(mut self) {
        self.run();
    }

    fn run(&mut self) {
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

impl Drop for Subscription {
    fn drop(&mut self) {
        self.run();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use aulos_platform::Mutex;

    use super::*;

    #[test]
    fn get_returns_initial_then_published() {
        let value = Observable::new(500_000_u64);
        assert_eq!(value.get(), 500_000);

        value.publish(1_200_000);
        assert_eq!(value.get(), 1_200_000);
    }

    #[test]
    fn subscribers_run_in_registration_order() {
        let value = Observable::new(0_u32);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let _first = value.subscribe({
            let seen = Arc::clone(&seen);
            move |v| seen.lock().push(("first", *v))
        });
        let _second = value.subscribe({
            let seen = Arc::clone(&seen);
            move |v| seen.lock().push(("second", *v))
        });

        value.publish(7);
        value.publish(8);

        assert_eq!(
            *seen.lock(),
            vec![("first", 7), ("second", 7), ("first", 8), ("second", 8)]
        );
    }

    #[test]
    fn subscribe_does_not_replay_current_value() {
        let value = Observable::new(3_u8);
        let calls = Arc::new(AtomicUsize::new(0));
        let _sub = value.subscribe({
            let calls = Arc::clone(&calls);
            move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            }
        });
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unsubscribe_removes_only_that_subscriber() {
        let value = Observable::new(0_i32);
        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));

        let sub_a = value.subscribe({
            let a = Arc::clone(&a);
            move |_| {
                a.fetch_add(1, Ordering::SeqCst);
            }
        });
        let _sub_b = value.subscribe({
            let b = Arc::clone(&b);
            move |_| {
                b.fetch_add(1, Ordering::SeqCst);
            }
        });

        value.publish(1);
        sub_a.unsubscribe();
        value.publish(2);

        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 2);
        assert_eq!(value.subscriber_count(), 1);
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let value = Observable::new(0_i32);
        {
            let _sub = value.subscribe(|_| {});
            assert_eq!(value.subscriber_count(), 1);
        }
        assert_eq!(value.subscriber_count(), 0);
    }

    #[test]
    fn subscription_outliving_observable_is_harmless() {
        let value = Observable::new(0_i32);
        let sub = value.subscribe(|_| {});
        drop(value);
        sub.unsubscribe();
    }

    #[test]
    fn subscriber_may_publish_reentrantly() {
        let value = Observable::new(0_i32);
        let echo = value.clone();
        let _sub = value.subscribe(move |v| {
            if *v < 3 {
                echo.publish(v + 1);
            }
        });

        value.publish(1);
        assert_eq!(value.get(), 3);
    }
}
