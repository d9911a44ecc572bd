//! Ordered, fault-isolated event fan-out.

use std::{
    fmt,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, Mutex, PoisonError, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::sync::broadcast;

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;
type Filter<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

struct Entry<E> {
    id: u64,
    filter: Option<Filter<E>>,
    handler: Handler<E>,
}

type Entries<E> = Mutex<Vec<Entry<E>>>;

/// A subscriber failure reported on the side channel.
#[derive(Debug, Clone)]
pub struct DispatchFault {
    /// Dispatcher scope, e.g. a session id or `"connection"`.
    pub scope: String,
    pub subscriber: u64,
    pub message: String,
}

impl fmt::Display for DispatchFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "subscriber {} in {} failed: {}",
            self.subscriber, self.scope, self.message
        )
    }
}

/// Delivers each event to every subscriber in subscription order.
///
/// A panicking handler is caught, reported through [`EventDispatcher::faults`]
/// and logged; delivery continues with the next handler.
pub struct EventDispatcher<E> {
    scope: String,
    entries: Arc<Entries<E>>,
    next_id: AtomicU64,
    faults: broadcast::Sender<DispatchFault>,
}

impl<E: 'static> EventDispatcher<E> {
    /// Create a dispatcher labelled with `scope` for fault reports.
    #[must_use]
    pub fn new(scope: impl Into<String>) -> Self {
        let (faults, _) = broadcast::channel(64);
        Self {
            scope: scope.into(),
            entries: Arc::new(Mutex::new(Vec::new())),
            next_id: AtomicU64::new(1),
            faults,
        }
    }

    /// Subscribe to every event.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.insert(None, Arc::new(handler))
    }

    /// Subscribe to events accepted by `filter`.
    pub fn subscribe_filtered<P, F>(&self, filter: P, handler: F) -> Subscription
    where
        P: Fn(&E) -> bool + Send + Sync + 'static,
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.insert(Some(Arc::new(filter)), Arc::new(handler))
    }

    fn insert(&self, filter: Option<Filter<E>>, handler: Handler<E>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Entry {
                id,
                filter,
                handler,
            });

        let entries = Arc::downgrade(&self.entries);
        Subscription {
            id,
            remove: Some(Box::new(move || {
                if let Some(entries) = Weak::upgrade(&entries) {
                    entries
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .retain(|e| e.id != id);
                }
            })),
        }
    }

    /// Deliver `event` to the current subscribers.
    ///
    /// The subscriber list is snapshotted first: handlers added or removed
    /// during delivery take effect on the next call.
    pub fn dispatch(&self, event: &E) {
        let snapshot: Vec<(u64, Option<Filter<E>>, Handler<E>)> = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|e| (e.id, e.filter.clone(), Arc::clone(&e.handler)))
            .collect();

        for (id, filter, handler) in snapshot {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                if filter.as_ref().is_none_or(|accept| accept(event)) {
                    handler(event);
                }
            }));
            if let Err(panic) = outcome {
                let fault = DispatchFault {
                    scope: self.scope.clone(),
                    subscriber: id,
                    message: panic_message(panic.as_ref()),
                };
                tracing::warn!(scope = %fault.scope, subscriber = id, "Event handler panicked: {}", fault.message);
                let _ = self.faults.send(fault);
            }
        }
    }

    /// Receiver for subscriber failures.
    #[must_use]
    pub fn faults(&self) -> broadcast::Receiver<DispatchFault> {
        self.faults.subscribe()
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Drop every subscriber.
    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// Handle returned by `subscribe`. Dropping it does not unsubscribe.
pub struct Subscription {
    id: u64,
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Remove the handler. Calling this more than once is a no-op.
    pub fn unsubscribe(&mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.remove.is_some())
            .finish()
    }
}

/// Best-effort text of a panic payload.
#[must_use]
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}
