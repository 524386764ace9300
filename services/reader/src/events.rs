//! services/reader/src/events.rs
//!
//! A small typed publish/subscribe registry used by the channel, the streaming
//! buffer and the session orchestrator to fan events out to listeners.

use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::error;

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Registry<T> {
    next_id: AtomicU64,
    handlers: Mutex<Vec<(u64, Handler<T>)>>,
}

/// A set of handlers for events of type `T`.
///
/// Handlers run synchronously, in registration order, on the task that emits.
/// A panicking handler is logged and skipped; the remaining handlers still run.
pub struct Subscribers<T> {
    registry: Arc<Registry<T>>,
}

impl<T: 'static> Subscribers<T> {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Registry {
                next_id: AtomicU64::new(0),
                handlers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Registers a handler. It stays registered until the returned
    /// [`Subscription`] is explicitly unsubscribed.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry.handlers.lock().push((id, Arc::new(handler)));

        let registry: Weak<Registry<T>> = Arc::downgrade(&self.registry);
        Subscription::new(move || {
            if let Some(registry) = registry.upgrade() {
                registry.handlers.lock().retain(|(handler_id, _)| *handler_id != id);
            }
        })
    }

    /// Delivers `event` to every handler registered at the time of the call.
    pub fn emit(&self, event: &T) {
        // Snapshot first so handlers may (un)subscribe without deadlocking.
        let handlers: Vec<Handler<T>> = self
            .registry
            .handlers
            .lock()
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();

        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                error!("Event handler panicked; continuing with remaining handlers.");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.registry.handlers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Clone for Subscribers<T> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
        }
    }
}

impl<T: 'static> Default for Subscribers<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle returned by every registration.
pub struct Subscription {
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    fn new(remove: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            remove: Some(Box::new(remove)),
        }
    }

    pub fn unsubscribe(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.remove.is_some())
            .finish()
    }
}
