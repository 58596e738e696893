// Session event subscriptions

use parking_lot::Mutex;
use std::sync::{Arc, Weak};

use crate::error::RefreshError;
use crate::session::UserProfile;

/// Lifecycle changes the UI reacts to
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Login or signup succeeded
    LoggedIn { user: UserProfile },

    /// A 401 was recovered by a refresh exchange
    Refreshed,

    /// Explicit logout
    LoggedOut,

    /// Refresh failed and the session was cleared; show the login view
    Expired { reason: RefreshError },
}

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Registry<E> {
    next_id: u64,
    entries: Vec<(u64, Callback<E>)>,
}

/// Observer list with snapshot delivery
///
/// `emit` copies the current subscribers before calling any of them, so a
/// callback may subscribe or unsubscribe (itself included) during delivery.
pub struct Subscribers<E> {
    registry: Arc<Mutex<Registry<E>>>,
}

impl<E: 'static> Subscribers<E> {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                entries: Vec::new(),
            })),
        }
    }

    /// Register a callback; dropping the returned handle unregisters it
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = {
            let mut registry = self.registry.lock();
            let id = registry.next_id;
            registry.next_id += 1;
            registry.entries.push((id, Arc::new(callback)));
            id
        };

        let weak: Weak<Mutex<Registry<E>>> = Arc::downgrade(&self.registry);
        Subscription {
            dispose: Some(Box::new(move || {
                if let Some(registry) = weak.upgrade() {
                    registry.lock().entries.retain(|(entry_id, _)| *entry_id != id);
                }
            })),
        }
    }

    /// Deliver `event` to every subscriber registered at call time
    pub fn emit(&self, event: &E) {
        let snapshot: Vec<Callback<E>> = self
            .registry
            .lock()
            .entries
            .iter()
            .map(|(_, callback)| callback.clone())
            .collect();

        for callback in snapshot {
            callback(event);
        }
    }

    pub fn len(&self) -> usize {
        self.registry.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E: 'static> Default for Subscribers<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Disposer returned by [`Subscribers::subscribe`]
#[must_use = "dropping a Subscription unregisters the callback"]
pub struct Subscription {
    dispose: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Unregister now
    pub fn unsubscribe(mut self) {
        self.run();
    }

    /// Keep the callback registered for the life of the subscriber list
    pub fn detach(mut self) {
        self.dispose = None;
    }

    fn run(&mut self) {
        if let Some(dispose) = self.dispose.take() {
            dispose();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.run();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_emit_reaches_all_subscribers() {
        let subscribers: Subscribers<u32> = Subscribers::new();
        let total = Arc::new(AtomicUsize::new(0));

        let t1 = total.clone();
        let _a = subscribers.subscribe(move |n| {
            t1.fetch_add(*n as usize, Ordering::SeqCst);
        });
        let t2 = total.clone();
        let _b = subscribers.subscribe(move |n| {
            t2.fetch_add(*n as usize * 10, Ordering::SeqCst);
        });

        subscribers.emit(&2);
        assert_eq!(total.load(Ordering::SeqCst), 22);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let subscribers: Subscribers<()> = Subscribers::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        let sub = subscribers.subscribe(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        subscribers.emit(&());
        drop(sub);
        subscribers.emit(&());

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(subscribers.is_empty());
    }

    #[test]
    fn test_unsubscribe_during_delivery() {
        let subscribers: Arc<Subscribers<()>> = Arc::new(Subscribers::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let h = hits.clone();
        let s = slot.clone();
        let sub = subscribers.subscribe(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            // Unsubscribes itself mid-delivery
            if let Some(sub) = s.lock().take() {
                sub.unsubscribe();
            }
        });
        *slot.lock() = Some(sub);

        let h2 = hits.clone();
        let _other = subscribers.subscribe(move |_| {
            h2.fetch_add(100, Ordering::SeqCst);
        });

        subscribers.emit(&());
        assert_eq!(hits.load(Ordering::SeqCst), 101);
        assert_eq!(subscribers.len(), 1);

        subscribers.emit(&());
        assert_eq!(hits.load(Ordering::SeqCst), 201);
    }

    #[test]
    fn test_detach_keeps_callback() {
        let subscribers: Subscribers<()> = Subscribers::new();
        subscribers.subscribe(|_| {}).detach();
        assert_eq!(subscribers.len(), 1);
    }

    #[test]
    fn test_subscription_outliving_registry() {
        let subscribers: Subscribers<()> = Subscribers::new();
        let sub = subscribers.subscribe(|_| {});
        drop(subscribers);
        sub.unsubscribe();
    }
}
