//! One-to-many event dispatch with a lookup-only listener registry.
//!
//! Registration never keeps a listener alive: callers hold the only strong
//! [`Arc`] and the registry keeps a [`Weak`]. A listener whose last `Arc` is
//! dropped silently stops receiving events and is pruned on the next dispatch.
//! [`ListenerRegistry::unregister`] removes an entry immediately; delivery
//! re-checks registration before every call so nothing reaches a listener
//! after it has been unregistered.

use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{trace, warn};

/// Registry of weakly-held listeners
pub struct ListenerRegistry<L: ?Sized> {
    entries: Mutex<Vec<Weak<L>>>,
}

impl<L: ?Sized> Default for ListenerRegistry<L> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }
}

impl<L: ?Sized> ListenerRegistry<L> {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener; registering the same listener twice has no effect
    pub fn register(&self, listener: &Arc<L>) {
        let weak = Arc::downgrade(listener);
        let mut entries = self.lock();
        if !entries.iter().any(|entry| Weak::ptr_eq(entry, &weak)) {
            entries.push(weak);
        }
    }

    /// Remove a listener. Returns `false` if it was not registered.
    pub fn unregister(&self, listener: &Arc<L>) -> bool {
        let weak = Arc::downgrade(listener);
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|entry| !Weak::ptr_eq(entry, &weak));
        entries.len() != before
    }

    /// Drop every registration
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Number of registered listeners that are still alive
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock()
            .iter()
            .filter(|entry| entry.strong_count() > 0)
            .count()
    }

    /// True if no live listener is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke `call` for every live, still-registered listener.
    ///
    /// Panics raised by a listener are caught and logged so they reach neither
    /// the caller nor the other listeners. Returns the number of listeners called.
    pub fn notify(&self, mut call: impl FnMut(&L)) -> usize {
        let snapshot: Vec<Weak<L>> = {
            let mut entries = self.lock();
            entries.retain(|entry| entry.strong_count() > 0);
            entries.clone()
        };

        let mut delivered = 0;
        for weak in snapshot {
            if !self.is_registered(&weak) {
                continue;
            }
            let Some(listener) = weak.upgrade() else {
                continue;
            };
            if catch_unwind(AssertUnwindSafe(|| call(&listener))).is_err() {
                warn!("Listener panicked during dispatch; continuing with the rest");
            }
            delivered += 1;
        }
        delivered
    }

    fn is_registered(&self, weak: &Weak<L>) -> bool {
        self.lock().iter().any(|entry| Weak::ptr_eq(entry, weak))
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Weak<L>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Listener signature accepted by [`BroadcastMessenger`]
pub type EventListener<T> = dyn Fn(&T) + Send + Sync;

/// Publish/subscribe dispatcher with its own delivery task
///
/// [`publish`](Self::publish) only enqueues; a dedicated Tokio task drains the
/// queue in order and calls every registered listener, so a slow or panicking
/// subscriber never blocks or unwinds into the publisher.
pub struct BroadcastMessenger<T: Send + 'static> {
    name: &'static str,
    listeners: Arc<ListenerRegistry<EventListener<T>>>,
    queue: mpsc::UnboundedSender<T>,
    worker: JoinHandle<()>,
}

impl<T: Send + 'static> BroadcastMessenger<T> {
    /// Create a messenger and spawn its delivery task.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        let listeners: Arc<ListenerRegistry<EventListener<T>>> = Arc::new(ListenerRegistry::new());
        let (queue, mut events) = mpsc::unbounded_channel::<T>();

        let registry = listeners.clone();
        let worker = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let delivered = registry.notify(|listener| listener(&event));
                trace!("{} delivered event to {} listener(s)", name, delivered);
            }
        });

        Self {
            name,
            listeners,
            queue,
            worker,
        }
    }

    /// Register a listener (lookup-only; the caller keeps it alive)
    pub fn add_listener(&self, listener: &Arc<EventListener<T>>) {
        self.listeners.register(listener);
    }

    /// Unregister a listener; idempotent
    pub fn remove_listener(&self, listener: &Arc<EventListener<T>>) -> bool {
        self.listeners.unregister(listener)
    }

    /// Number of live listeners
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Queue an event for delivery to every registered listener
    pub fn publish(&self, event: T) {
        if self.queue.send(event).is_err() {
            warn!("{} delivery task has stopped; event dropped", self.name);
        }
    }
}

impl<T: Send + 'static> Drop for BroadcastMessenger<T> {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_listener(counter: &Arc<AtomicUsize>) -> Arc<EventListener<u32>> {
        let counter = counter.clone();
        Arc::new(move |_: &u32| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn signalling_listener(tx: mpsc::UnboundedSender<u32>) -> Arc<EventListener<u32>> {
        Arc::new(move |event: &u32| {
            let _ = tx.send(*event);
        })
    }

    #[test]
    fn test_registry_is_lookup_only() {
        let registry: ListenerRegistry<EventListener<u32>> = ListenerRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let listener = counting_listener(&counter);

        registry.register(&listener);
        registry.register(&listener);
        assert_eq!(registry.len(), 1);
        assert_eq!(Arc::strong_count(&listener), 1);

        assert_eq!(registry.notify(|l| l(&1)), 1);
        drop(listener);
        assert_eq!(registry.notify(|l| l(&2)), 0);
        assert!(registry.is_empty());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let registry: ListenerRegistry<EventListener<u32>> = ListenerRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let listener = counting_listener(&counter);

        registry.register(&listener);
        assert!(registry.unregister(&listener));
        assert!(!registry.unregister(&listener));
        assert_eq!(registry.notify(|l| l(&1)), 0);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let registry: ListenerRegistry<EventListener<u32>> = ListenerRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let bad: Arc<EventListener<u32>> = Arc::new(|_: &u32| panic!("boom"));
        let good = counting_listener(&counter);

        registry.register(&bad);
        registry.register(&good);
        assert_eq!(registry.notify(|l| l(&1)), 2);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_publish_reaches_listeners_in_order() {
        let messenger = BroadcastMessenger::new("test");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let listener = signalling_listener(tx);
        messenger.add_listener(&listener);

        for value in 1..=3 {
            messenger.publish(value);
        }
        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));
        assert_eq!(rx.recv().await, Some(3));
    }

    #[tokio::test]
    async fn test_dropped_listener_not_invoked() {
        let messenger = BroadcastMessenger::new("test");
        let counter = Arc::new(AtomicUsize::new(0));
        let transient = counting_listener(&counter);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sentinel = signalling_listener(tx);

        messenger.add_listener(&transient);
        messenger.add_listener(&sentinel);
        messenger.publish(1);
        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        drop(transient);
        messenger.publish(2);
        assert_eq!(rx.recv().await, Some(2));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(messenger.listener_count(), 1);
    }

    #[tokio::test]
    async fn test_unregister_stops_queued_delivery() {
        let messenger = BroadcastMessenger::new("test");
        let counter = Arc::new(AtomicUsize::new(0));
        let listener = counting_listener(&counter);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sentinel = signalling_listener(tx);

        messenger.add_listener(&listener);
        messenger.add_listener(&sentinel);
        messenger.publish(1);
        assert!(messenger.remove_listener(&listener));

        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_publish_does_not_wait_for_blocked_listener() {
        let messenger = BroadcastMessenger::new("test");
        let (gate_tx, gate_rx) = std::sync::mpsc::channel::<()>();
        let gate = Mutex::new(gate_rx);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let listener: Arc<EventListener<u32>> = Arc::new(move |event: &u32| {
            let _ = tx.send(*event);
            let _ = gate.lock().unwrap_or_else(PoisonError::into_inner).recv();
        });
        messenger.add_listener(&listener);

        messenger.publish(1);
        assert_eq!(rx.recv().await, Some(1));

        // The delivery task is parked inside the listener
        for value in 2..=50 {
            messenger.publish(value);
        }
        assert!(rx.try_recv().is_err());

        drop(gate_tx);
        for value in 2..=50 {
            assert_eq!(rx.recv().await, Some(value));
        }
    }
}
