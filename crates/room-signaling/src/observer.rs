use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct ListenerSet<T> {
    next_id: AtomicU64,
    entries: RwLock<Vec<(u64, Callback<T>)>>,
}

impl<T> ListenerSet<T> {
    fn remove(&self, id: u64) -> bool {
        let mut guard = self.entries.write();
        let before = guard.len();
        guard.retain(|(entry_id, _)| *entry_id != id);
        guard.len() != before
    }
}

trait Detach: Send + Sync {
    fn detach(&self, id: u64) -> bool;
}

impl<T: 'static> Detach for ListenerSet<T> {
    fn detach(&self, id: u64) -> bool {
        self.remove(id)
    }
}

/// Typed fan-out of events to registered callbacks.
///
/// Delivery iterates a snapshot of the listeners, so callbacks may register or
/// unregister listeners re-entrantly. A panicking callback is logged and does
/// not stop delivery to the remaining listeners.
pub struct Listeners<T> {
    inner: Arc<ListenerSet<T>>,
}

impl<T> Clone for Listeners<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for Listeners<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(ListenerSet {
                next_id: AtomicU64::new(0),
                entries: RwLock::new(Vec::new()),
            }),
        }
    }
}

impl<T: 'static> Listeners<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, callback: F) -> ListenerHandle
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.entries.write().push((id, Arc::new(callback)));
        let set: Arc<dyn Detach> = self.inner.clone();
        ListenerHandle {
            id,
            set: Arc::downgrade(&set),
        }
    }

    pub fn emit(&self, event: &T) {
        let snapshot: Vec<(u64, Callback<T>)> = self.inner.entries.read().clone();
        for (id, callback) in snapshot {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                tracing::warn!(listener = id, "listener panicked; continuing delivery");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Registration returned by [`Listeners::subscribe`].
///
/// Dropping the handle leaves the listener registered; call
/// [`ListenerHandle::unsubscribe`] to remove it.
pub struct ListenerHandle {
    id: u64,
    set: Weak<dyn Detach>,
}

impl ListenerHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns `false` if the listener was already gone.
    pub fn unsubscribe(self) -> bool {
        match self.set.upgrade() {
            Some(set) => set.detach(self.id),
            None => false,
        }
    }
}

impl std::fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerHandle").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn delivers_to_every_listener_until_unsubscribed() {
        let listeners: Listeners<u32> = Listeners::new();
        let total = Arc::new(AtomicUsize::new(0));
        let first_total = total.clone();
        let first = listeners.subscribe(move |value| {
            first_total.fetch_add(*value as usize, Ordering::SeqCst);
        });
        let second_total = total.clone();
        let _second = listeners.subscribe(move |value| {
            second_total.fetch_add(*value as usize, Ordering::SeqCst);
        });

        listeners.emit(&2);
        assert_eq!(total.load(Ordering::SeqCst), 4);

        assert!(first.unsubscribe());
        listeners.emit(&2);
        assert_eq!(total.load(Ordering::SeqCst), 6);
        assert_eq!(listeners.len(), 1);
    }

    #[test]
    fn panicking_listener_does_not_block_others() {
        let listeners: Listeners<&'static str> = Listeners::new();
        let _bad = listeners.subscribe(|_| panic!("observer bug"));
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        let _good = listeners.subscribe(move |_| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
        });

        listeners.emit(&"event");
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_after_drop_of_set_is_harmless() {
        let listeners: Listeners<u8> = Listeners::new();
        let handle = listeners.subscribe(|_| {});
        drop(listeners);
        assert!(!handle.unsubscribe());
    }
}
