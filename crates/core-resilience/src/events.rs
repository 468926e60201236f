//! Synchronous observer primitives shared by every policy.
//!
//! An [`EventEmitter`] holds a table of subscriber callbacks invoked
//! synchronously, in subscription order, relative to the state transition
//! that triggered them. Cloning an emitter shares the underlying table, which
//! is how derived policies forward their emissions to the policy they were
//! derived from: both hold the same table, so a listener attached at the
//! outermost policy observes every inner attempt.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct EmitterInner<T> {
    listeners: Mutex<Vec<(u64, Listener<T>)>>,
    next_id: AtomicU64,
}

/// A subscribe function target. `subscribe` returns a [`Subscription`] that
/// can be used to remove the listener again; dropping the handle without
/// calling [`Subscription::unsubscribe`] leaves the listener attached for the
/// lifetime of the emitter.
pub struct EventEmitter<T> {
    inner: Arc<EmitterInner<T>>,
}

/// Alias kept for signatures that only need the subscribe side.
pub type Event<T> = EventEmitter<T>;

impl<T> Clone for EventEmitter<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for EventEmitter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> EventEmitter<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(EmitterInner {
                listeners: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Attaches a listener, returning a handle that removes it again.
    pub fn subscribe(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> Subscription<T> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.lock().push((id, Arc::new(listener)));
        Subscription {
            id,
            emitter: Arc::downgrade(&self.inner),
        }
    }

    /// Emits event data to every listener, synchronously.
    pub fn emit(&self, value: &T) {
        // Snapshot so listeners may subscribe/unsubscribe re-entrantly.
        let listeners: Vec<Listener<T>> = self
            .inner
            .listeners
            .lock()
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in listeners {
            listener(value);
        }
    }

    /// Number of attached listeners.
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().len()
    }
}

/// Unsubscribe handle returned from [`EventEmitter::subscribe`].
pub struct Subscription<T> {
    id: u64,
    emitter: Weak<EmitterInner<T>>,
}

impl<T> Subscription<T> {
    /// Removes the listener this handle was created for.
    pub fn unsubscribe(self) {
        if let Some(inner) = self.emitter.upgrade() {
            inner.listeners.lock().retain(|(id, _)| *id != self.id);
        }
    }
}
