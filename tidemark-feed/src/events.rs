//! Typed publish/subscribe points decoupling producers from consumer count.
//!
//! Delivery is synchronous, in registration order; a listener that blocks
//! stalls every later listener, so handlers must stay short.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tidemark_core::{BookEvent, ExecutionEvent, OrderEvent, TradeEvent};

/// Opaque handle identifying one registered listener.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ListenerId(u64);

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// A single named event stream with multiple independent subscribers.
pub struct EventChannel<T> {
    listeners: Mutex<Vec<(ListenerId, Listener<T>)>>,
    next_id: AtomicU64,
}

impl<T> Default for EventChannel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> EventChannel<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a listener; it stays active until removed by its id.
    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(listener)));
        id
    }

    /// Remove one listener; returns whether it was registered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    /// Deliver `event` to every listener, in registration order.
    pub fn publish(&self, event: &T) {
        let snapshot: Vec<Listener<T>> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in snapshot {
            listener(event);
        }
    }

    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// The named consumer-facing streams exposed by every feed session.
#[derive(Default)]
pub struct FeedEvents {
    /// Order creations and in-place updates.
    pub creations_updates: EventChannel<OrderEvent>,
    /// Fills.
    pub executions: EventChannel<ExecutionEvent>,
    /// Order cancelations.
    pub cancelations: EventChannel<OrderEvent>,
    /// Book replica change notifications.
    pub update: EventChannel<BookEvent>,
    /// Public trades.
    pub trades: EventChannel<TradeEvent>,
}

impl FeedEvents {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn delivery_preserves_registration_order() {
        let channel: EventChannel<u32> = EventChannel::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = order.clone();
        channel.subscribe(move |value: &u32| first.lock().unwrap().push(("first", *value)));
        let second = order.clone();
        channel.subscribe(move |value: &u32| second.lock().unwrap().push(("second", *value)));

        channel.publish(&7);
        let seen = order.lock().unwrap().clone();
        assert_eq!(seen, vec![("first", 7), ("second", 7)]);
    }

    #[test]
    fn unsubscribe_removes_only_the_target() {
        let channel: EventChannel<()> = EventChannel::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let keep = hits.clone();
        let kept = channel.subscribe(move |_| {
            keep.fetch_add(1, Ordering::SeqCst);
        });
        let drop_hits = hits.clone();
        let dropped = channel.subscribe(move |_| {
            drop_hits.fetch_add(10, Ordering::SeqCst);
        });

        assert!(channel.unsubscribe(dropped));
        assert!(!channel.unsubscribe(dropped));
        channel.publish(&());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(channel.listener_count(), 1);
        assert!(channel.unsubscribe(kept));
    }
}
