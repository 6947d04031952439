use std::hash::Hash;
use std::sync::{Arc, PoisonError, RwLock};
use rustc_hash::FxHashMap;

/// A read-mostly map: readers grab an immutable snapshot, writers clone the current map, modify
///  the copy and publish it. Lookups and iteration never contend with each other, and they
///  contend with writers only for the duration of an `Arc` clone.
///
/// This fits the connection table, which is looked up for every received datagram and iterated
///  on every tick, but changes only when circuits are established or torn down.
pub struct AtomicMap<K,V> {
    map: RwLock<Arc<FxHashMap<K,V>>>,
}
impl <K: Hash+Eq+Clone+Sync+Send,V:Clone+Sync+Send> Default for AtomicMap<K,V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Hash+Eq+Clone+Sync+Send, V:Clone+Sync+Send> AtomicMap<K,V> {
    pub fn new() -> AtomicMap<K,V> {
        AtomicMap {
            map: RwLock::new(Arc::new(FxHashMap::default())),
        }
    }

    /// returns a consistent snapshot of the map - later updates are not reflected in it
    pub fn load(&self) -> Arc<FxHashMap<K,V>> {
        self.map.read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.load()
            .get(key)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.load().is_empty()
    }

    /// Applies `f` to a copy of the current map and publishes the result, returning whatever
    ///  `f` returns. Concurrent updates are serialized.
    pub fn update<R>(&self, f: impl FnOnce(&mut FxHashMap<K,V>) -> R) -> R {
        let mut guard = self.map.write()
            .unwrap_or_else(PoisonError::into_inner);

        let mut map: FxHashMap<K,V> = (**guard).clone();
        let result = f(&mut map);
        *guard = Arc::new(map);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_drop() {
        let _ = AtomicMap::<u32, u32>::new();
    }

    #[test]
    fn test_update() {
        let map = AtomicMap::<u32, u32>::new();

        map.update(|m| {
            m.insert(1, 2);
        });
        assert_eq!(Some(2), map.get(&1));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_update_returns_value() {
        let map = AtomicMap::<u32, u32>::new();
        map.update(|m| { m.insert(1, 2); });

        let removed = map.update(|m| m.remove(&1));
        assert_eq!(removed, Some(2));
        assert!(map.is_empty());
    }

    #[test]
    fn test_snapshot_is_stable() {
        let map = AtomicMap::<u32, u32>::new();
        map.update(|m| { m.insert(1, 1); });

        let snapshot = map.load();
        map.update(|m| { m.insert(2, 2); });

        assert_eq!(snapshot.len(), 1);
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_concurrent_updates() {
        let map = Arc::new(AtomicMap::<u32, u32>::new());

        let handles = (0..8u32)
            .map(|t| {
                let map = map.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        map.update(|m| { m.insert(t * 1000 + i, i); });
                    }
                })
            })
            .collect::<Vec<_>>();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(map.len(), 800);
    }
}
