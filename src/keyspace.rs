use tracing::debug;

use crate::config::{self, Config};
use crate::dict::ConcurrentDict;
use crate::lock::LockTable;

/// A dictionary paired with the lock table that makes multi-key sequences atomic.
pub struct Keyspace<V> {
    dict: ConcurrentDict<V>,
    locks: LockTable,
}

impl<V> Keyspace<V> {
    pub fn new(config: Config) -> config::Result<Self> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: Config) -> Self {
        let keyspace = Self {
            dict: ConcurrentDict::new(config.shard_count),
            locks: LockTable::new(config.lock_slots),
        };
        debug!(
            shards = keyspace.dict.shard_count(),
            lock_slots = keyspace.locks.len(),
            "keyspace ready"
        );
        keyspace
    }

    pub fn dict(&self) -> &ConcurrentDict<V> {
        &self.dict
    }

    pub fn locks(&self) -> &LockTable {
        &self.locks
    }

    /// Runs `f` while holding write slots for `write_keys` and read slots for `read_keys`.
    ///
    /// Other callers going through the lock table observe the whole of `f` or none of it.
    pub fn atomically<W, R, K1, K2, F, T>(&self, write_keys: W, read_keys: R, f: F) -> T
    where
        W: IntoIterator<Item = K1>,
        R: IntoIterator<Item = K2>,
        K1: AsRef<str>,
        K2: AsRef<str>,
        F: FnOnce(&ConcurrentDict<V>) -> T,
    {
        let _guard = self.locks.rw_guard(write_keys, read_keys);
        f(&self.dict)
    }
}

impl<V> Default for Keyspace<V> {
    fn default() -> Self {
        Self::build(Config::default())
    }
}
