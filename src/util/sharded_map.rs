use std::hash::{BuildHasher, Hash};
use std::sync::{Mutex, MutexGuard, PoisonError};
use rustc_hash::{FxBuildHasher, FxHashMap};

/// A map split into a fixed number of independently locked shards. Two keys contend only if
///  they hash to the same shard, which keeps per-datagram bookkeeping cheap during connection
///  storms.
pub struct ShardedMap<K, V> {
    shards: Vec<Mutex<FxHashMap<K, V>>>,
    hasher: FxBuildHasher,
}

impl<K: Hash + Eq, V> ShardedMap<K, V> {
    pub fn new(num_shards: usize) -> ShardedMap<K, V> {
        assert!(num_shards > 0);
        ShardedMap {
            shards: (0..num_shards)
                .map(|_| Mutex::new(FxHashMap::default()))
                .collect(),
            hasher: FxBuildHasher,
        }
    }

    fn shard(&self, key: &K) -> MutexGuard<'_, FxHashMap<K, V>> {
        let idx = (self.hasher.hash_one(key) as usize) % self.shards.len();
        self.shards[idx].lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// runs `f` with exclusive access to the entry's shard
    pub fn with_shard<R>(&self, key: &K, f: impl FnOnce(&mut FxHashMap<K, V>) -> R) -> R {
        f(&mut self.shard(key))
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.shard(key).contains_key(key)
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.shard(key).remove(key)
    }

    pub fn len(&self) -> usize {
        self.shards.iter()
            .map(|s| s.lock().unwrap_or_else(PoisonError::into_inner).len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::single_shard(1)]
    #[case::several_shards(16)]
    fn test_insert_remove(#[case] num_shards: usize) {
        let map = ShardedMap::<u32, String>::new(num_shards);
        for i in 0..100 {
            map.with_shard(&i, |m| m.insert(i, format!("{}", i)));
        }
        assert_eq!(map.len(), 100);
        assert!(map.contains_key(&42));

        assert_eq!(map.remove(&42), Some("42".to_string()));
        assert!(!map.contains_key(&42));
        assert_eq!(map.len(), 99);
    }

    #[test]
    fn test_with_shard_entry() {
        let map = ShardedMap::<u32, Vec<u8>>::new(4);
        map.with_shard(&7, |m| m.entry(7).or_default().push(1));
        map.with_shard(&7, |m| m.entry(7).or_default().push(2));

        assert_eq!(map.remove(&7), Some(vec![1, 2]));
        assert!(map.is_empty());
    }
}
