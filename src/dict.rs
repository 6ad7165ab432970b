use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::RwLock;
use rand::seq::IteratorRandom;
use rand::Rng;
use tracing::{debug, error};

use crate::hash::{compute_capacity, fnv32, spread, MIN_CAPACITY};

struct Shard<V> {
    data: HashMap<String, V>,
}

impl<V> Shard<V> {
    fn new() -> Self {
        Self {
            data: Default::default(),
        }
    }
}

/// Thread safe string-keyed map split into independently locked shards.
///
/// The shard count is fixed at construction. A live-key counter is kept beside the
/// shards and bumped atomically right after each insert or delete, so [`len`] never
/// touches a shard lock.
///
/// The dictionary gives per-key consistency only. Sequences of calls spanning several
/// keys are made atomic by holding the matching slots of a
/// [`LockTable`](crate::lock::LockTable) around them.
///
/// [`len`]: ConcurrentDict::len
pub struct ConcurrentDict<V> {
    table: Vec<RwLock<Shard<V>>>,
    count: AtomicI64,
}

impl<V> ConcurrentDict<V> {
    /// Creates a dictionary with `shard_count` rounded up to a power of two (at least 16).
    pub fn new(shard_count: usize) -> Self {
        let shard_count = compute_capacity(shard_count);
        debug!(shard_count, "concurrent dict created");
        Self {
            table: vec_no_clone![RwLock::new(Shard::new()); shard_count],
            count: AtomicI64::new(0),
        }
    }

    #[inline]
    fn table(&self) -> &[RwLock<Shard<V>>] {
        if self.table.is_empty() {
            error!("operation on uninitialized concurrent dict");
            panic!("dict table is not initialized");
        }
        &self.table
    }

    #[inline]
    fn shard_index(&self, key: &str) -> usize {
        spread(fnv32(key), self.table().len()) as usize
    }

    #[inline]
    fn shard(&self, key: &str) -> &RwLock<Shard<V>> {
        &self.table()[self.shard_index(key)]
    }

    pub fn shard_count(&self) -> usize {
        self.table().len()
    }

    /// Number of live keys. Lock free, so it may lag writers that are still in flight.
    pub fn len(&self) -> usize {
        self.table();
        self.count.load(Ordering::Acquire).max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs `f` on the value bound to `key` while its shard is read locked.
    ///
    /// `f` must not call back into this dictionary for a key on the same shard: a write
    /// deadlocks on the held read lock, and a nested read can deadlock behind a queued
    /// writer since shard read locks are not recursive.
    pub fn get_with<F, R>(&self, key: &str, f: F) -> Option<R>
    where
        F: FnOnce(&V) -> R,
    {
        let shard = self.shard(key).read();
        shard.data.get(key).map(f)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.shard(key).read().data.contains_key(key)
    }

    /// Binds `key` to `val`, replacing any previous value.
    ///
    /// Returns 1 when a new key was created and 0 when an existing one was overwritten.
    pub fn put(&self, key: &str, val: V) -> usize {
        let mut shard = self.shard(key).write();
        if let Some(slot) = shard.data.get_mut(key) {
            *slot = val;
            return 0;
        }
        shard.data.insert(key.to_owned(), val);
        self.count.fetch_add(1, Ordering::AcqRel);
        1
    }

    /// Binds `key` only if it is absent. Returns the number of keys created.
    pub fn put_if_absent(&self, key: &str, val: V) -> usize {
        let mut shard = self.shard(key).write();
        if shard.data.contains_key(key) {
            return 0;
        }
        shard.data.insert(key.to_owned(), val);
        self.count.fetch_add(1, Ordering::AcqRel);
        1
    }

    /// Overwrites `key` only if it is present. Returns the number of keys updated.
    pub fn put_if_exists(&self, key: &str, val: V) -> usize {
        let mut shard = self.shard(key).write();
        match shard.data.get_mut(key) {
            Some(slot) => {
                *slot = val;
                1
            }
            None => 0,
        }
    }

    /// Deletes `key`. Returns the number of keys removed.
    pub fn remove(&self, key: &str) -> usize {
        let mut shard = self.shard(key).write();
        if shard.data.remove(key).is_some() {
            self.count.fetch_sub(1, Ordering::AcqRel);
            return 1;
        }
        0
    }

    /// Visits every binding, one shard at a time under that shard's read lock.
    ///
    /// Stops as soon as `f` returns `false`. Shards are locked one after another, so the
    /// walk is not a point-in-time snapshot of the whole dictionary.
    ///
    /// As with [`get_with`](ConcurrentDict::get_with), `f` runs under a shard read lock
    /// and must not call back into this dictionary.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&str, &V) -> bool,
    {
        for shard in self.table() {
            let shard = shard.read();
            for (k, v) in shard.data.iter() {
                if !f(k, v) {
                    return;
                }
            }
        }
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys = Vec::with_capacity(self.len());
        self.for_each(|k, _| {
            keys.push(k.to_owned());
            true
        });
        keys
    }

    fn random_key<R: Rng>(&self, rng: &mut R) -> Option<String> {
        let table = self.table();
        let shard = table[rng.gen_range(0..table.len())].read();
        shard.data.keys().choose(rng).cloned()
    }

    /// Samples up to `limit` keys, possibly repeating some.
    pub fn random_keys(&self, limit: usize) -> Vec<String> {
        let mut rng = rand::thread_rng();
        let mut result = Vec::with_capacity(limit);
        while result.len() < limit && !self.is_empty() {
            if let Some(key) = self.random_key(&mut rng) {
                result.push(key);
            }
        }
        result
    }

    /// Samples up to `limit` keys with no repeats.
    pub fn random_distinct_keys(&self, limit: usize) -> Vec<String> {
        if limit >= self.len() {
            let mut keys = self.keys();
            keys.truncate(limit);
            return keys;
        }
        let mut rng = rand::thread_rng();
        let mut result = HashSet::with_capacity(limit);
        while result.len() < limit.min(self.len()) {
            if let Some(key) = self.random_key(&mut rng) {
                result.insert(key);
            }
        }
        result.into_iter().collect()
    }

    /// Drops every binding.
    pub fn clear(&self) {
        for shard in self.table() {
            let mut shard = shard.write();
            let removed = shard.data.len() as i64;
            shard.data.clear();
            self.count.fetch_sub(removed, Ordering::AcqRel);
        }
    }
}

impl<V: Clone> ConcurrentDict<V> {
    /// Returns a copy of the value bound to `key`.
    pub fn get(&self, key: &str) -> Option<V> {
        self.get_with(key, V::clone)
    }
}

impl<V> Default for ConcurrentDict<V> {
    fn default() -> Self {
        Self::new(MIN_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::thread;

    fn uninitialized() -> ConcurrentDict<i32> {
        ConcurrentDict {
            table: Vec::new(),
            count: AtomicI64::new(0),
        }
    }

    fn live_keys<V>(dict: &ConcurrentDict<V>) -> usize {
        dict.table.iter().map(|s| s.read().data.len()).sum()
    }

    #[test]
    fn put_get_remove_scenario() {
        let dict = ConcurrentDict::new(4);
        assert_eq!(dict.shard_count(), 16);

        assert_eq!(dict.put("a", 1), 1);
        assert_eq!(dict.len(), 1);

        assert_eq!(dict.put("a", 2), 0);
        assert_eq!(dict.get("a"), Some(2));
        assert_eq!(dict.len(), 1);

        assert_eq!(dict.remove("a"), 1);
        assert_eq!(dict.len(), 0);
        assert_eq!(dict.remove("a"), 0);
        assert_eq!(dict.get("a"), None);
    }

    #[test]
    fn shard_count_follows_capacity() {
        for (hint, expected) in [(0, 16), (1, 16), (16, 16), (17, 32), (1000, 1024)] {
            assert_eq!(ConcurrentDict::<()>::new(hint).shard_count(), expected);
        }
    }

    #[test]
    fn same_key_same_shard_across_dicts() {
        let a = ConcurrentDict::<()>::new(100);
        let b = ConcurrentDict::<()>::new(100);
        for key in ["x", "y", "hello", "", "a much longer key"] {
            assert_eq!(a.shard_index(key), b.shard_index(key));
            assert_eq!(a.shard_index(key), a.shard_index(key));
            assert!(a.shard_index(key) < a.shard_count());
        }
    }

    #[test]
    fn put_if_exists_only_updates() {
        let dict = ConcurrentDict::new(0);
        assert_eq!(dict.put_if_exists("k", 1), 0);
        assert_eq!(dict.get("k"), None);
        assert_eq!(dict.len(), 0);

        dict.put("k", 1);
        assert_eq!(dict.put_if_exists("k", 7), 1);
        assert_eq!(dict.get("k"), Some(7));
        assert_eq!(dict.len(), 1);
    }

    #[test]
    fn put_if_absent_keeps_existing() {
        let dict = ConcurrentDict::new(0);
        assert_eq!(dict.put_if_absent("k", 1), 1);
        assert_eq!(dict.put_if_absent("k", 2), 0);
        assert_eq!(dict.get("k"), Some(1));
        assert_eq!(dict.len(), 1);
    }

    #[test]
    fn get_with_borrows() {
        let dict = ConcurrentDict::new(0);
        dict.put("list", vec![1, 2, 3]);
        assert_eq!(dict.get_with("list", |v| v.len()), Some(3));
        assert!(dict.contains_key("list"));
        assert!(!dict.contains_key("other"));
    }

    #[test]
    fn for_each_stops_early() {
        let dict = ConcurrentDict::new(0);
        for i in 0..50 {
            dict.put(&format!("k{}", i), i);
        }
        let mut seen = 0;
        dict.for_each(|_, _| {
            seen += 1;
            seen < 10
        });
        assert_eq!(seen, 10);

        let mut keys = dict.keys();
        keys.sort();
        assert_eq!(keys.len(), 50);
        keys.dedup();
        assert_eq!(keys.len(), 50);
    }

    #[test]
    fn random_keys() {
        let dict = ConcurrentDict::new(0);
        assert!(dict.random_keys(5).is_empty());
        assert!(dict.random_distinct_keys(5).is_empty());

        for i in 0..20 {
            dict.put(&format!("k{}", i), i);
        }

        let sampled = dict.random_keys(100);
        assert_eq!(sampled.len(), 100);
        assert!(sampled.iter().all(|k| dict.contains_key(k)));

        let mut distinct = dict.random_distinct_keys(8);
        assert_eq!(distinct.len(), 8);
        distinct.sort();
        distinct.dedup();
        assert_eq!(distinct.len(), 8);

        assert_eq!(dict.random_distinct_keys(100).len(), 20);
    }

    #[test]
    fn clear_resets_counter() {
        let dict = ConcurrentDict::new(0);
        for i in 0..100 {
            dict.put(&i.to_string(), i);
        }
        dict.clear();
        assert_eq!(dict.len(), 0);
        assert_eq!(live_keys(&dict), 0);
        assert_eq!(dict.put("again", 1), 1);
        assert_eq!(dict.len(), 1);
    }

    #[test]
    fn concurrent_put() {
        let dict = Arc::new(ConcurrentDict::new(0));
        let mut handles = vec![];

        for i in 0..100 {
            let dict = dict.clone();
            handles.push(thread::spawn(move || {
                let key = format!("k{}", i);
                assert_eq!(dict.put(&key, i), 1);
                assert_eq!(dict.get(&key), Some(i));
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(dict.len(), 100);
        assert_eq!(live_keys(&dict), 100);
    }

    #[test]
    fn concurrent_put_remove_same_keys() {
        let dict = Arc::new(ConcurrentDict::new(0));
        let mut handles = vec![];

        for t in 0..8 {
            let dict = dict.clone();
            handles.push(thread::spawn(move || {
                for j in 0..2000 {
                    let key = format!("k{}", j % 64);
                    if (j + t) % 3 == 0 {
                        dict.remove(&key);
                    } else {
                        dict.put(&key, j);
                    }
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(dict.len(), live_keys(&dict));
    }

    #[test]
    #[should_panic(expected = "dict table is not initialized")]
    fn uninitialized_get_panics() {
        uninitialized().get("a");
    }

    #[test]
    #[should_panic(expected = "dict table is not initialized")]
    fn uninitialized_put_panics() {
        uninitialized().put("a", 1);
    }

    #[test]
    #[should_panic(expected = "dict table is not initialized")]
    fn uninitialized_len_panics() {
        uninitialized().len();
    }

    #[derive(Debug, Clone)]
    enum Op {
        Put(u8, i32),
        PutIfExists(u8, i32),
        PutIfAbsent(u8, i32),
        Remove(u8),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (any::<u8>(), any::<i32>()).prop_map(|(k, v)| Op::Put(k, v)),
            (any::<u8>(), any::<i32>()).prop_map(|(k, v)| Op::PutIfExists(k, v)),
            (any::<u8>(), any::<i32>()).prop_map(|(k, v)| Op::PutIfAbsent(k, v)),
            any::<u8>().prop_map(Op::Remove),
        ]
    }

    proptest! {
        #[test]
        fn matches_hashmap_model(ops in prop::collection::vec(op(), 0..200)) {
            let dict = ConcurrentDict::new(0);
            let mut model = HashMap::new();

            for op in ops {
                match op {
                    Op::Put(k, v) => {
                        let key = k.to_string();
                        let created = model.insert(key.clone(), v).is_none() as usize;
                        prop_assert_eq!(dict.put(&key, v), created);
                    }
                    Op::PutIfExists(k, v) => {
                        let key = k.to_string();
                        let updated = match model.get_mut(&key) {
                            Some(slot) => { *slot = v; 1 }
                            None => 0,
                        };
                        prop_assert_eq!(dict.put_if_exists(&key, v), updated);
                    }
                    Op::PutIfAbsent(k, v) => {
                        let key = k.to_string();
                        let created = if model.contains_key(&key) { 0 } else { model.insert(key.clone(), v); 1 };
                        prop_assert_eq!(dict.put_if_absent(&key, v), created);
                    }
                    Op::Remove(k) => {
                        let key = k.to_string();
                        let removed = model.remove(&key).is_some() as usize;
                        prop_assert_eq!(dict.remove(&key), removed);
                    }
                }
                prop_assert_eq!(dict.len(), model.len());
            }

            for (k, v) in &model {
                prop_assert_eq!(dict.get(k), Some(*v));
            }
        }
    }
}
