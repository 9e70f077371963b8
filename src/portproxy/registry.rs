//! Mutex-guarded map of live resources keyed by port

use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;

/// Owned, synchronized map of live resources.
///
/// Only map operations happen under the lock; closing what comes out of
/// [`Registry::add`], [`Registry::remove`] or [`Registry::drain_all`] is the
/// caller's job.
#[derive(Debug)]
pub struct Registry<K, V> {
    entries: Mutex<HashMap<K, V>>,
}

impl<K: Eq + Hash + Clone, V> Registry<K, V> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Insert `value`, handing back whatever it replaced
    pub fn add(&self, key: K, value: V) -> Option<V> {
        self.entries.lock().insert(key, value)
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.entries.lock().remove(key)
    }

    /// Take every entry out of the registry
    pub fn drain_all(&self) -> Vec<(K, V)> {
        self.entries.lock().drain().collect()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn keys(&self) -> Vec<K> {
        self.entries.lock().keys().cloned().collect()
    }
}

impl<K: Eq + Hash + Clone, V> Default for Registry<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_replaces_instead_of_doubling() {
        let registry = Registry::new();
        assert!(registry.add(8080u16, "first").is_none());
        assert_eq!(registry.add(8080, "second"), Some("first"));
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(&8080));
    }

    #[test]
    fn test_remove_and_drain() {
        let registry = Registry::new();
        registry.add(1u16, 'a');
        registry.add(2, 'b');

        assert_eq!(registry.remove(&1), Some('a'));
        assert_eq!(registry.remove(&1), None);

        let mut drained = registry.drain_all();
        drained.sort();
        assert_eq!(drained, vec![(2, 'b')]);
        assert!(registry.is_empty());
        assert!(registry.keys().is_empty());
    }
}
