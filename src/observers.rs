//! Non-owning observer lists.
//!
//! Subscribers are held through `Weak` references so a registry never keeps an
//! observer alive; dropped observers are pruned on every notification pass.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

/// Handle returned by [`ObserverRegistry::register`], used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

pub struct ObserverRegistry<T: ?Sized> {
    entries: Mutex<Entries<T>>,
}

struct Entries<T: ?Sized> {
    next_id: u64,
    observers: Vec<(ObserverId, Weak<T>)>,
}

impl<T: ?Sized> Default for ObserverRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized> ObserverRegistry<T> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Entries {
                next_id: 0,
                observers: Vec::new(),
            }),
        }
    }

    pub fn register(&self, observer: &Arc<T>) -> ObserverId {
        let mut entries = self.entries.lock();
        let id = ObserverId(entries.next_id);
        entries.next_id += 1;
        entries.observers.push((id, Arc::downgrade(observer)));
        id
    }

    pub fn unregister(&self, id: ObserverId) {
        self.entries.lock().observers.retain(|(other, _)| *other != id);
    }

    /// Live observers, after dropping the ones that no longer exist.
    ///
    /// The list is copied out so callbacks run without the registry lock held
    /// and may register or unregister freely.
    pub fn live(&self) -> Vec<Arc<T>> {
        let mut entries = self.entries.lock();
        entries.observers.retain(|(_, weak)| weak.strong_count() > 0);
        entries
            .observers
            .iter()
            .filter_map(|(_, weak)| weak.upgrade())
            .collect()
    }

    pub fn for_each(&self, mut f: impl FnMut(&T)) {
        for observer in self.live() {
            f(&observer);
        }
    }

    pub fn len(&self) -> usize {
        self.live().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    trait Ping: Send + Sync {
        fn ping(&self);
    }

    #[derive(Default)]
    struct Counter(AtomicUsize);

    impl Ping for Counter {
        fn ping(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_notifies_live_observers() {
        let registry: ObserverRegistry<dyn Ping> = ObserverRegistry::new();
        let counter = Arc::new(Counter::default());
        let as_dyn: Arc<dyn Ping> = counter.clone();
        registry.register(&as_dyn);
        registry.for_each(|o| o.ping());
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_prunes_dropped_observers() {
        let registry: ObserverRegistry<Counter> = ObserverRegistry::new();
        let kept = Arc::new(Counter::default());
        let dropped = Arc::new(Counter::default());
        registry.register(&kept);
        registry.register(&dropped);
        drop(dropped);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unregister() {
        let registry: ObserverRegistry<Counter> = ObserverRegistry::new();
        let counter = Arc::new(Counter::default());
        let id = registry.register(&counter);
        registry.unregister(id);
        assert!(registry.is_empty());
    }
}
