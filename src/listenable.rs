//! Listener registry for lifecycle events
//!
//! Fan-out is synchronous over a snapshot of the listeners registered when
//! `notify()` starts, so a listener may add or delete listeners (itself
//! included) while being called. A panicking listener is logged and does
//! not stop the remaining listeners.

use std::collections::HashMap;
use std::hash::Hash;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::error;

/// Handle returned by `add_listener`, used to delete that listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Callback<A> = Arc<dyn Fn(&A) + Send + Sync>;

pub struct Listenable<K, A> {
    next_id: AtomicU64,
    listeners: Mutex<HashMap<K, Vec<(ListenerId, Callback<A>)>>>,
}

impl<K, A> Default for Listenable<K, A>
where
    K: Eq + Hash + Copy + std::fmt::Debug,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, A> Listenable<K, A>
where
    K: Eq + Hash + Copy + std::fmt::Debug,
{
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            listeners: Mutex::new(HashMap::new()),
        }
    }

    pub fn add_listener<F>(&self, event: K, callback: F) -> ListenerId
    where
        F: Fn(&A) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock()
            .entry(event)
            .or_default()
            .push((id, Arc::new(callback)));
        id
    }

    /// Returns false when no such listener was registered for `event`.
    pub fn delete_listener(&self, event: K, id: ListenerId) -> bool {
        let mut listeners = self.lock();
        let Some(callbacks) = listeners.get_mut(&event) else {
            return false;
        };
        let before = callbacks.len();
        callbacks.retain(|(listener, _)| *listener != id);
        let removed = callbacks.len() != before;
        if callbacks.is_empty() {
            listeners.remove(&event);
        }
        removed
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn listener_count(&self, event: K) -> usize {
        self.lock().get(&event).map(Vec::len).unwrap_or(0)
    }

    pub fn notify(&self, event: K, args: &A) {
        let snapshot: Vec<Callback<A>> = match self.lock().get(&event) {
            Some(callbacks) => callbacks.iter().map(|(_, cb)| Arc::clone(cb)).collect(),
            None => return,
        };

        for callback in snapshot {
            if catch_unwind(AssertUnwindSafe(|| callback(args))).is_err() {
                error!(event = ?event, "Failed to notify: listener panicked");
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, Vec<(ListenerId, Callback<A>)>>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Topic {
        Up,
        Down,
    }

    #[test]
    fn test_notify_reaches_only_matching_event() {
        let bus: Listenable<Topic, u32> = Listenable::new();
        let total = Arc::new(AtomicUsize::new(0));

        let seen = Arc::clone(&total);
        bus.add_listener(Topic::Up, move |value| {
            seen.fetch_add(*value as usize, Ordering::SeqCst);
        });

        bus.notify(Topic::Up, &5);
        bus.notify(Topic::Down, &7);
        assert_eq!(total.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_delete_listener() {
        let bus: Listenable<Topic, ()> = Listenable::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let seen = Arc::clone(&calls);
        let id = bus.add_listener(Topic::Up, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(bus.listener_count(Topic::Up), 1);

        assert!(bus.delete_listener(Topic::Up, id));
        assert!(!bus.delete_listener(Topic::Up, id));
        assert_eq!(bus.listener_count(Topic::Up), 0);

        bus.notify(Topic::Up, &());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_panicking_listener_does_not_stop_others() {
        let bus: Listenable<Topic, ()> = Listenable::new();
        let calls = Arc::new(AtomicUsize::new(0));

        bus.add_listener(Topic::Down, |_| panic!("listener failure"));
        let seen = Arc::clone(&calls);
        bus.add_listener(Topic::Down, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        bus.notify(Topic::Down, &());
        bus.notify(Topic::Down, &());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_listener_added_during_notify_waits_for_next_round() {
        let bus: Arc<Listenable<Topic, ()>> = Arc::new(Listenable::new());
        let late_calls = Arc::new(AtomicUsize::new(0));

        let registry = Arc::clone(&bus);
        let late = Arc::clone(&late_calls);
        bus.add_listener(Topic::Up, move |_| {
            let late = Arc::clone(&late);
            registry.add_listener(Topic::Up, move |_| {
                late.fetch_add(1, Ordering::SeqCst);
            });
        });

        bus.notify(Topic::Up, &());
        assert_eq!(late_calls.load(Ordering::SeqCst), 0);
        assert_eq!(bus.listener_count(Topic::Up), 2);

        bus.clear();
        assert_eq!(bus.listener_count(Topic::Up), 0);
    }
}
