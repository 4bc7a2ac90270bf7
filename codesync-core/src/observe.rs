//! Observer registry with drop-to-unsubscribe handles.
//!
//! Listeners are invoked synchronously, in subscription order, on the
//! thread that calls [`Observers::emit`]. A listener must not subscribe to
//! or emit on the same registry it is being called from.

use std::sync::{Arc, Mutex, Weak};

type Listener<E> = Box<dyn FnMut(&E) + Send>;

struct Registry<E: ?Sized> {
    next_id: u64,
    listeners: Vec<(u64, Listener<E>)>,
}

/// A set of listeners for events of type `E`.
pub struct Observers<E: ?Sized> {
    registry: Arc<Mutex<Registry<E>>>,
}

impl<E: ?Sized + 'static> Observers<E> {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                listeners: Vec::new(),
            })),
        }
    }

    /// Register a listener. It stays registered until the returned
    /// [`Subscription`] is dropped.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: FnMut(&E) + Send + 'static,
    {
        let id = {
            let mut reg = self.registry.lock().unwrap_or_else(|e| e.into_inner());
            let id = reg.next_id;
            reg.next_id += 1;
            reg.listeners.push((id, Box::new(listener)));
            id
        };

        let weak: Weak<Mutex<Registry<E>>> = Arc::downgrade(&self.registry);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(registry) = weak.upgrade() {
                    let mut reg = registry.lock().unwrap_or_else(|e| e.into_inner());
                    reg.listeners.retain(|(lid, _)| *lid != id);
                }
            })),
        }
    }

    /// Call every listener with `event`.
    pub fn emit(&self, event: &E) {
        let mut reg = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        for (_, listener) in reg.listeners.iter_mut() {
            listener(event);
        }
    }

    /// Number of live listeners.
    pub fn len(&self) -> usize {
        self.registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .listeners
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E: ?Sized + 'static> Default for Observers<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle returned by [`Observers::subscribe`]. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes the listener immediately"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Unsubscribe now. Equivalent to dropping the handle.
    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
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
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_emit_reaches_all_listeners() {
        let observers: Observers<u32> = Observers::new();
        let total = Arc::new(AtomicUsize::new(0));

        let t1 = total.clone();
        let _a = observers.subscribe(move |v| {
            t1.fetch_add(*v as usize, Ordering::SeqCst);
        });
        let t2 = total.clone();
        let _b = observers.subscribe(move |v| {
            t2.fetch_add(*v as usize * 10, Ordering::SeqCst);
        });

        observers.emit(&2);
        assert_eq!(total.load(Ordering::SeqCst), 22);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let observers: Observers<u32> = Observers::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        let sub = observers.subscribe(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        observers.emit(&1);
        drop(sub);
        observers.emit(&1);

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(observers.is_empty());
    }

    #[test]
    fn test_subscription_outlives_registry() {
        let observers: Observers<str> = Observers::new();
        let sub = observers.subscribe(|_| {});
        drop(observers);
        // Cancelling after the registry is gone is a no-op.
        sub.cancel();
    }
}
