use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// Hands out process-unique driver handle names and tracks which are live.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    counter: AtomicU64,
    live: Mutex<BTreeSet<String>>,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self) -> String {
        let id = self.counter.fetch_add(1, Ordering::Relaxed);
        let name = format!("connection_{id}");
        self.live.lock().insert(name.clone());
        name
    }

    pub fn release(&self, name: &str) -> bool {
        self.live.lock().remove(name)
    }

    #[must_use]
    pub fn is_live(&self, name: &str) -> bool {
        self.live.lock().contains(name)
    }

    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Arc;

    use super::ConnectionRegistry;

    #[test]
    fn names_are_unique_across_threads() {
        let registry = Arc::new(ConnectionRegistry::new());
        let handles = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || (0..50).map(|_| registry.register()).collect::<Vec<_>>())
            })
            .collect::<Vec<_>>();

        let mut names = BTreeSet::new();
        for handle in handles {
            for name in handle.join().expect("registering thread panicked") {
                assert!(names.insert(name), "duplicate handle name");
            }
        }
        assert_eq!(names.len(), 400);
        assert_eq!(registry.live_count(), 400);
    }

    #[test]
    fn release_forgets_name_once() {
        let registry = ConnectionRegistry::new();
        let name = registry.register();
        assert!(registry.is_live(&name));
        assert!(registry.release(&name));
        assert!(!registry.release(&name));
        assert_eq!(registry.live_count(), 0);
    }
}
