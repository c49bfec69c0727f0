//! Typed subscription lists.
//!
//! A [`Signal`] delivers each emitted value to its subscribers synchronously,
//! in subscription order. Subscribers are removed when their
//! [`Subscription`] is dropped or cancelled.

use std::sync::{Arc, Mutex as StdMutex, Weak};

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Slots<T> {
    next_id: u64,
    listeners: Vec<(u64, Listener<T>)>,
}

pub struct Signal<T> {
    slots: Arc<StdMutex<Slots<T>>>,
}

impl<T: 'static> Signal<T> {
    pub fn new() -> Self {
        Self {
            slots: Arc::new(StdMutex::new(Slots {
                next_id: 0,
                listeners: Vec::new(),
            })),
        }
    }

    pub fn subscribe(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        let id = {
            let mut slots = lock(&self.slots);
            let id = slots.next_id;
            slots.next_id += 1;
            slots.listeners.push((id, Arc::new(listener)));
            id
        };

        let weak: Weak<StdMutex<Slots<T>>> = Arc::downgrade(&self.slots);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(slots) = weak.upgrade() {
                    lock(&slots).listeners.retain(|(i, _)| *i != id);
                }
            })),
        }
    }

    /// Deliver `value` to every current subscriber.
    ///
    /// The listener list is snapshotted first, so listeners may subscribe or
    /// cancel from inside a callback.
    pub fn emit(&self, value: &T) {
        let listeners: Vec<Listener<T>> = lock(&self.slots)
            .listeners
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in listeners {
            listener(value);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.slots).listeners.len()
    }
}

impl<T: 'static> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(slots: &StdMutex<Slots<T>>) -> std::sync::MutexGuard<'_, Slots<T>> {
    slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Handle for one subscriber. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    /// Keep the subscriber registered for the lifetime of the signal.
    pub fn detach(mut self) {
        self.cancel = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_order() {
        let signal = Signal::<u32>::new();
        let seen = Arc::new(StdMutex::new(Vec::new()));

        let a = {
            let seen = seen.clone();
            signal.subscribe(move |v| seen.lock().unwrap().push(("a", *v)))
        };
        let b = {
            let seen = seen.clone();
            signal.subscribe(move |v| seen.lock().unwrap().push(("b", *v)))
        };

        signal.emit(&1);
        signal.emit(&2);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![("a", 1), ("b", 1), ("a", 2), ("b", 2)]
        );
        drop((a, b));
    }

    #[test]
    fn test_drop_unsubscribes() {
        let signal = Signal::<u32>::new();
        let sub = signal.subscribe(|_| {});
        assert_eq!(signal.subscriber_count(), 1);
        drop(sub);
        assert_eq!(signal.subscriber_count(), 0);
    }

    #[test]
    fn test_detach_keeps_listener() {
        let signal = Signal::<u32>::new();
        signal.subscribe(|_| {}).detach();
        assert_eq!(signal.subscriber_count(), 1);
    }

    #[test]
    fn test_cancel_from_inside_callback() {
        let signal = Arc::new(Signal::<u32>::new());
        let slot: Arc<StdMutex<Option<Subscription>>> = Arc::new(StdMutex::new(None));
        let count = Arc::new(StdMutex::new(0));

        let sub = {
            let slot = slot.clone();
            let count = count.clone();
            signal.subscribe(move |_| {
                *count.lock().unwrap() += 1;
                if let Some(sub) = slot.lock().unwrap().take() {
                    sub.cancel();
                }
            })
        };
        *slot.lock().unwrap() = Some(sub);

        signal.emit(&1);
        signal.emit(&2);
        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[test]
    fn test_subscription_outlives_signal() {
        let signal = Signal::<u32>::new();
        let sub = signal.subscribe(|_| {});
        drop(signal);
        drop(sub);
    }
}
