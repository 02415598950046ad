//! Dynamic event signals re-architected as typed broadcast lists (see
//! spec.md §9): `Broadcaster` is the multi-shot `onError` fan-out, `OnceHook`
//! is the single-shot `onResponse` subscription a driver uses to mutate the
//! outgoing headers once the controller has a final response.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

type Listener<T> = Box<dyn Fn(&T) + Send + Sync>;

struct Inner<T> {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(u64, Listener<T>)>>,
}

/// A multi-shot fan-out broadcaster. Every subscriber is informed of every
/// event; subscribers never affect control flow.
#[derive(Clone)]
pub struct Broadcaster<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Default for Broadcaster<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Inner {
                next_id: AtomicU64::new(0),
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }
}

impl<T> Broadcaster<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `listener`; dropping the returned handle unsubscribes it.
    /// Dropping the handle twice (or after the broadcaster itself is gone)
    /// is a no-op.
    pub fn subscribe(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> Subscription<T> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.lock().push((id, Box::new(listener)));
        Subscription {
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Notifies every live subscriber. Never fails: listener panics aren't
    /// caught here, matching the "listeners are informed but don't affect
    /// flow" contract — callers that need isolation should catch inside
    /// their own listener.
    pub fn notify(&self, event: &T) {
        for (_, listener) in self.inner.listeners.lock().iter() {
            listener(event);
        }
    }
}

pub struct Subscription<T> {
    id: u64,
    inner: Weak<Inner<T>>,
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.listeners.lock().retain(|(id, _)| *id != self.id);
        }
    }
}

/// A single-shot hook: at most one callback may be registered, and it fires
/// exactly once when [`OnceHook::fire`] is called (subsequent calls are
/// no-ops). Used for the driver's `onResponse` mutation of outgoing headers.
///
/// Unlike [`Broadcaster`], a failing callback here is not swallowed: per
/// spec.md §7, observer-callback failures are fatal to the request, so
/// `fire` returns the callback's error for the caller to wrap as a
/// `DispatchFailure` and propagate to the host.
pub struct OnceHook<T> {
    callback: Mutex<Option<Box<dyn FnOnce(&mut T) -> Result<(), anyhow::Error> + Send>>>,
}

impl<T> Default for OnceHook<T> {
    fn default() -> Self {
        Self {
            callback: Mutex::new(None),
        }
    }
}

impl<T> OnceHook<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the one callback this hook will ever invoke. A second
    /// `subscribe` call replaces the first, matching "one-shot observable"
    /// semantics (last writer wins rather than stacking).
    pub fn subscribe(&self, callback: impl FnOnce(&mut T) -> Result<(), anyhow::Error> + Send + 'static) {
        *self.callback.lock() = Some(Box::new(callback));
    }

    /// Fires the registered callback, if any, exactly once. Returns the
    /// callback's error, if it raised one; a never-subscribed hook always
    /// succeeds.
    pub fn fire(&self, value: &mut T) -> Result<(), anyhow::Error> {
        match self.callback.lock().take() {
            Some(callback) => callback(value),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn broadcaster_notifies_all_subscribers() {
        let broadcaster: Broadcaster<u32> = Broadcaster::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c1 = count.clone();
        let _sub1 = broadcaster.subscribe(move |_| {
            c1.fetch_add(1, Ordering::SeqCst);
        });
        let c2 = count.clone();
        let _sub2 = broadcaster.subscribe(move |_| {
            c2.fetch_add(10, Ordering::SeqCst);
        });

        broadcaster.notify(&42);
        assert_eq!(count.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn dropping_subscription_stops_notifications() {
        let broadcaster: Broadcaster<u32> = Broadcaster::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c1 = count.clone();
        let sub = broadcaster.subscribe(move |_| {
            c1.fetch_add(1, Ordering::SeqCst);
        });
        drop(sub);
        broadcaster.notify(&1);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn once_hook_fires_exactly_once() {
        let hook: OnceHook<u32> = OnceHook::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c1 = count.clone();
        hook.subscribe(move |v| {
            *v += 1;
            c1.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let mut value = 0u32;
        hook.fire(&mut value).unwrap();
        hook.fire(&mut value).unwrap();

        assert_eq!(value, 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn once_hook_propagates_callback_failure() {
        let hook: OnceHook<u32> = OnceHook::new();
        hook.subscribe(|_| Err(anyhow::anyhow!("boom")));

        let mut value = 0u32;
        let err = hook.fire(&mut value).unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn once_hook_with_no_subscriber_fires_ok() {
        let hook: OnceHook<u32> = OnceHook::new();
        let mut value = 0u32;
        assert!(hook.fire(&mut value).is_ok());
    }
}
