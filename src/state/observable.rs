//! A value with snapshot reads and change notification.
//!
//! Observers are plain callbacks invoked once per distinct new value; async
//! consumers can wait on a `watch` receiver instead.

use crate::utils::lock;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

pub type Observer<T> = Arc<dyn Fn(&T) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

struct Registry<T> {
    next_id: u64,
    observers: Vec<(ObserverId, Observer<T>)>,
}

pub struct Observable<T> {
    value: watch::Sender<T>,
    registry: Mutex<Registry<T>>,
}

impl<T: Clone + PartialEq + Send + Sync + 'static> Observable<T> {
    pub fn new(initial: T) -> Self {
        let (value, _) = watch::channel(initial);
        Self {
            value,
            registry: Mutex::new(Registry {
                next_id: 0,
                observers: Vec::new(),
            }),
        }
    }

    /// Current value.
    pub fn get(&self) -> T {
        self.value.borrow().clone()
    }

    /// Replace the value; observers fire only when it actually changed.
    pub fn set(&self, next: T) -> bool {
        let changed = self.value.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next.clone();
                true
            }
        });
        if changed {
            self.notify(&next);
        }
        changed
    }

    /// Mutate in place; observers fire only when the result differs.
    pub fn update<F>(&self, mutate: F) -> bool
    where
        F: FnOnce(&mut T),
    {
        let changed = self.value.send_if_modified(|current| {
            let before = current.clone();
            mutate(current);
            *current != before
        });
        if changed {
            let snapshot = self.get();
            self.notify(&snapshot);
        }
        changed
    }

    pub fn subscribe<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let mut registry = lock(&self.registry);
        let id = ObserverId(registry.next_id);
        registry.next_id += 1;
        registry.observers.push((id, Arc::new(observer)));
        id
    }

    /// Remove an observer. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        let mut registry = lock(&self.registry);
        let before = registry.observers.len();
        registry.observers.retain(|(existing, _)| *existing != id);
        registry.observers.len() != before
    }

    pub fn clear_observers(&self) {
        let mut registry = lock(&self.registry);
        registry.observers.clear();
    }

    /// Receiver for async waiting (`changed()` / `wait_for`).
    pub fn watch(&self) -> watch::Receiver<T> {
        self.value.subscribe()
    }

    fn notify(&self, value: &T) {
        // Snapshot the list so observers may (un)subscribe re-entrantly.
        let observers: Vec<Observer<T>> = {
            let registry = lock(&self.registry);
            registry.observers.iter().map(|(_, o)| Arc::clone(o)).collect()
        };
        for observer in observers {
            observer(value);
        }
    }
}

impl<T: Clone + PartialEq + Send + Sync + Default + 'static> Default for Observable<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}
