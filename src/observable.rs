//! Publish/subscribe primitives
//!
//! [`Observable`] holds the last known value of something and synchronously
//! notifies subscribers whenever that value changes. [`EventSignal`] carries
//! one-shot events and retains nothing. Both hand out [`Subscription`] guards
//! that unsubscribe when dropped.
//!
//! Callbacks run on the thread that published the change, while the publisher
//! holds the observable's publish lock. A callback must not publish to the same
//! observable it was invoked for.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Subscriber list shared by observables and signals
struct Registry<T> {
    next_id: u64,
    entries: Vec<(u64, Callback<T>)>,
}

impl<T> Registry<T> {
    fn new() -> Self {
        Self {
            next_id: 0,
            entries: Vec::new(),
        }
    }
}

fn register<T: 'static>(
    registry: &Arc<Mutex<Registry<T>>>,
    callback: Callback<T>,
) -> Subscription {
    let id = {
        let mut guard = lock(registry);
        let id = guard.next_id;
        guard.next_id += 1;
        guard.entries.push((id, callback));
        id
    };

    let weak: Weak<Mutex<Registry<T>>> = Arc::downgrade(registry);
    Subscription {
        cancel: Some(Box::new(move || {
            if let Some(registry) = weak.upgrade() {
                lock(&registry).entries.retain(|(entry_id, _)| *entry_id != id);
            }
        })),
    }
}

fn dispatch<T>(registry: &Mutex<Registry<T>>, value: &T) {
    // Snapshot so callbacks may subscribe or unsubscribe while we iterate
    let callbacks: Vec<Callback<T>> = lock(registry)
        .entries
        .iter()
        .map(|(_, cb)| Arc::clone(cb))
        .collect();

    for callback in callbacks {
        callback(value);
    }
}

/// Guard for a registered callback. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Unsubscribe now
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    /// Keep the callback registered for the lifetime of the source
    pub fn detach(mut self) {
        self.cancel = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

struct ObservableInner<T> {
    value: RwLock<T>,
    /// Serializes publishers so notifications arrive in write order
    publish: Mutex<()>,
    subscribers: Arc<Mutex<Registry<T>>>,
}

/// A typed value cell that notifies subscribers on change.
///
/// Cloning yields another handle to the same cell.
pub struct Observable<T> {
    inner: Arc<ObservableInner<T>>,
}

impl<T> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Observable<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Create an observable holding `initial`
    pub fn new(initial: T) -> Self {
        Self {
            inner: Arc::new(ObservableInner {
                value: RwLock::new(initial),
                publish: Mutex::new(()),
                subscribers: Arc::new(Mutex::new(Registry::new())),
            }),
        }
    }

    /// Clone out the last published value
    pub fn get(&self) -> T {
        self.inner
            .value
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Borrow the last published value
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let guard = self.inner.value.read().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    /// Store `value` and notify subscribers if it differs from the current value.
    ///
    /// Returns whether subscribers were notified.
    pub fn set(&self, value: T) -> bool {
        let _publishing = lock(&self.inner.publish);
        {
            let mut guard = self
                .inner
                .value
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if *guard == value {
                return false;
            }
            *guard = value.clone();
        }
        dispatch(&self.inner.subscribers, &value);
        true
    }

    /// Register a callback invoked with every subsequent change.
    ///
    /// The current value is not replayed; read it with [`Observable::get`].
    pub fn subscribe(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        register(&self.inner.subscribers, Arc::new(callback))
    }

    /// Number of live subscriptions
    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner.subscribers).entries.len()
    }

    /// Whether two handles refer to the same cell
    pub fn same_as(&self, other: &Observable<T>) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T: Default + Clone + PartialEq + Send + Sync + 'static> Default for Observable<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: fmt::Debug> fmt::Debug for Observable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = self.inner.value.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_tuple("Observable").field(&*value).finish()
    }
}

/// A single-fire event source. Each `fire` reaches the subscribers present at
/// that moment; nothing is retained for later subscribers.
pub struct EventSignal<T> {
    subscribers: Arc<Mutex<Registry<T>>>,
}

impl<T> Clone for EventSignal<T> {
    fn clone(&self) -> Self {
        Self {
            subscribers: Arc::clone(&self.subscribers),
        }
    }
}

impl<T: Send + Sync + 'static> EventSignal<T> {
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Registry::new())),
        }
    }

    /// Deliver `event` to every current subscriber
    pub fn fire(&self, event: T) {
        dispatch(&self.subscribers, &event);
    }

    pub fn subscribe(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        register(&self.subscribers, Arc::new(callback))
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).entries.len()
    }
}

impl<T: Send + Sync + 'static> Default for EventSignal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for EventSignal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSignal").finish_non_exhaustive()
    }
}
