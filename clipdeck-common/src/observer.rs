//! Observer registry
//!
//! Callback-style notification for quality changes, performance warnings,
//! acquisition progress and memory evictions. `subscribe` hands back a
//! [`Subscription`] that removes the callback when `unsubscribe` is called.
//!
//! Callbacks are invoked outside the registry lock, so a callback may
//! subscribe or unsubscribe without deadlocking.

use std::sync::{Arc, Mutex, Weak};

/// Shared callback type
pub type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct RegistryInner<T> {
    next_id: u64,
    observers: Vec<(u64, Callback<T>)>,
}

/// Registry of callbacks for events of type `T`
pub struct ObserverRegistry<T> {
    inner: Arc<Mutex<RegistryInner<T>>>,
}

impl<T: 'static> ObserverRegistry<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryInner {
                next_id: 0,
                observers: Vec::new(),
            })),
        }
    }

    /// Register a callback
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.subscribe_arc(Arc::new(callback))
    }

    /// Register an already shared callback
    pub fn subscribe_arc(&self, callback: Callback<T>) -> Subscription {
        let id = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let id = inner.next_id;
            inner.next_id += 1;
            inner.observers.push((id, callback));
            id
        };

        let weak: Weak<Mutex<RegistryInner<T>>> = Arc::downgrade(&self.inner);
        Subscription {
            id,
            remover: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    let mut inner = inner.lock().unwrap_or_else(|e| e.into_inner());
                    inner.observers.retain(|(observer_id, _)| *observer_id != id);
                }
            })),
        }
    }

    /// Deliver an event to every registered callback
    pub fn notify(&self, event: &T) {
        let callbacks: Vec<Callback<T>> = {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.observers.iter().map(|(_, cb)| Arc::clone(cb)).collect()
        };

        for callback in callbacks {
            callback(event);
        }
    }

    /// Number of registered callbacks
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .observers
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: 'static> Default for ObserverRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for ObserverRegistry<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Handle returned by [`ObserverRegistry::subscribe`]
///
/// Dropping the handle keeps the callback registered; call
/// [`Subscription::unsubscribe`] to remove it.
pub struct Subscription {
    id: u64,
    remover: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remove the callback from its registry
    pub fn unsubscribe(mut self) {
        if let Some(remove) = self.remover.take() {
            remove();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
