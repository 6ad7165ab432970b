use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::lock_api::RawRwLock as _;
use parking_lot::RawRwLock;
use tracing::{debug, error, trace};

use crate::hash::{fnv32, spread, MAX_CAPACITY};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Shared,
    Exclusive,
}

/// Slots to take for one multi-key call, in ascending index order.
type Plan = Vec<(u32, Mode)>;

/// One lock of the table plus a count of its current shared holders.
///
/// The count goes up after a shared acquire returns and down before the shared
/// release, so a non-zero count always means the slot is read locked.
struct Slot {
    lock: RawRwLock,
    readers: AtomicUsize,
}

impl Slot {
    fn new() -> Self {
        Self {
            lock: RawRwLock::INIT,
            readers: AtomicUsize::new(0),
        }
    }

    fn acquire(&self, mode: Mode) {
        match mode {
            Mode::Exclusive => self.lock.lock_exclusive(),
            Mode::Shared => {
                self.lock.lock_shared();
                self.readers.fetch_add(1, Ordering::AcqRel);
            }
        }
    }

    fn release(&self, mode: Mode) {
        match mode {
            Mode::Exclusive => {
                if !self.lock.is_locked_exclusive() || self.readers.load(Ordering::Acquire) != 0 {
                    error!("exclusive unlock of a slot not held exclusively");
                    panic!("unlock of a lock slot that is not exclusively locked");
                }
                // SAFETY: the raw lock is write locked, so the release cannot underflow its
                // state. The table guards no data; releasing a slot another thread took only
                // breaks the logical exclusion of its callers.
                unsafe { self.lock.unlock_exclusive() }
            }
            Mode::Shared => {
                let held = self
                    .readers
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
                if held.is_err() {
                    error!("shared unlock of a slot with no shared holder");
                    panic!("runlock of a lock slot that is not read locked");
                }
                // SAFETY: a shared holder was counted, so the raw lock is read locked. The
                // table guards no data; releasing a read lock another thread took only breaks
                // the logical exclusion of its callers.
                unsafe { self.lock.unlock_shared() }
            }
        }
    }

    fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }

    fn is_locked_exclusive(&self) -> bool {
        self.lock.is_locked_exclusive() && self.readers.load(Ordering::Acquire) == 0
    }
}

/// Fixed table of reader/writer locks addressed by key hash.
///
/// Keys that hash to the same slot share a lock. Multi-key calls deduplicate the
/// slots their keys touch and acquire them in ascending index order, which is what
/// keeps two overlapping multi-key calls from deadlocking each other. Releases go in
/// descending order.
///
/// Slots are not re-entrant: taking a slot the calling thread already holds, directly
/// or through an overlapping multi-key call, blocks forever.
///
/// # Example
///
/// ```
/// use shard_dict::LockTable;
///
/// let locks = LockTable::new(1024);
/// locks.locks(&["src", "dst"]);
/// // ... move a value from "src" to "dst" ...
/// locks.unlocks(&["src", "dst"]);
///
/// let _guard = locks.rw_guard(&["dst"], &["src"]);
/// ```
pub struct LockTable {
    table: Vec<Slot>,
}

impl LockTable {
    /// Creates a table with `table_size` rounded up to a power of two (at least 1).
    pub fn new(table_size: usize) -> Self {
        let table_size = table_size.clamp(1, MAX_CAPACITY).next_power_of_two();
        debug!(table_size, "lock table created");
        Self {
            table: vec_no_clone![Slot::new(); table_size],
        }
    }

    #[inline]
    fn table(&self) -> &[Slot] {
        if self.table.is_empty() {
            error!("operation on uninitialized lock table");
            panic!("lock table is not initialized");
        }
        &self.table
    }

    pub fn len(&self) -> usize {
        self.table().len()
    }

    /// Slot guarding `key`.
    #[inline]
    pub fn slot_index(&self, key: &str) -> u32 {
        spread(fnv32(key), self.table().len())
    }

    #[inline]
    fn slot(&self, key: &str) -> &Slot {
        &self.table()[self.slot_index(key) as usize]
    }

    /// Distinct slots touched by `keys`, ascending.
    pub fn lock_indices<I, K>(&self, keys: I) -> Vec<u32>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        self.index_set(keys).into_iter().collect()
    }

    fn index_set<I, K>(&self, keys: I) -> BTreeSet<u32>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        keys.into_iter()
            .map(|key| self.slot_index(key.as_ref()))
            .collect()
    }

    fn plan<W, R, K1, K2>(&self, write_keys: W, read_keys: R) -> Plan
    where
        W: IntoIterator<Item = K1>,
        R: IntoIterator<Item = K2>,
        K1: AsRef<str>,
        K2: AsRef<str>,
    {
        let writes = self.index_set(write_keys);
        let mut all = self.index_set(read_keys);
        all.extend(writes.iter().copied());
        all.into_iter()
            .map(|idx| {
                if writes.contains(&idx) {
                    (idx, Mode::Exclusive)
                } else {
                    (idx, Mode::Shared)
                }
            })
            .collect()
    }

    fn acquire(&self, plan: &[(u32, Mode)]) {
        trace!(slots = plan.len(), "acquiring lock slots");
        let table = self.table();
        for &(idx, mode) in plan {
            table[idx as usize].acquire(mode);
        }
    }

    fn release(&self, plan: &[(u32, Mode)]) {
        trace!(slots = plan.len(), "releasing lock slots");
        let table = self.table();
        for &(idx, mode) in plan.iter().rev() {
            table[idx as usize].release(mode);
        }
    }

    /// Takes the exclusive lock of the slot guarding `key`.
    pub fn lock(&self, key: &str) {
        self.slot(key).acquire(Mode::Exclusive);
    }

    /// Takes the shared lock of the slot guarding `key`.
    pub fn rlock(&self, key: &str) {
        self.slot(key).acquire(Mode::Shared);
    }

    /// Releases an exclusive lock taken by [`lock`](LockTable::lock).
    ///
    /// # Panics
    ///
    /// If the slot is not currently locked exclusively.
    pub fn unlock(&self, key: &str) {
        self.slot(key).release(Mode::Exclusive);
    }

    /// Releases a shared lock taken by [`rlock`](LockTable::rlock).
    ///
    /// # Panics
    ///
    /// If the slot has no shared holder, which includes a slot that is write locked.
    pub fn runlock(&self, key: &str) {
        self.slot(key).release(Mode::Shared);
    }

    /// Exclusively locks every slot touched by `keys`.
    ///
    /// Calling [`lock`](LockTable::lock) in a loop instead may deadlock.
    pub fn locks<I, K>(&self, keys: I)
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        self.acquire(&self.plan(keys, None::<&str>));
    }

    /// Shared-locks every slot touched by `keys`.
    pub fn rlocks<I, K>(&self, keys: I)
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        self.acquire(&self.plan(None::<&str>, keys));
    }

    pub fn unlocks<I, K>(&self, keys: I)
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        self.release(&self.plan(keys, None::<&str>));
    }

    pub fn runlocks<I, K>(&self, keys: I)
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        self.release(&self.plan(None::<&str>, keys));
    }

    /// Locks write keys and read keys in a single ordered pass. Duplicates are allowed.
    ///
    /// A slot touched by any write key is locked exclusively, every other slot shared.
    pub fn rw_locks<W, R, K1, K2>(&self, write_keys: W, read_keys: R)
    where
        W: IntoIterator<Item = K1>,
        R: IntoIterator<Item = K2>,
        K1: AsRef<str>,
        K2: AsRef<str>,
    {
        self.acquire(&self.plan(write_keys, read_keys));
    }

    /// Releases what [`rw_locks`](LockTable::rw_locks) took for the same key sets.
    pub fn rw_unlocks<W, R, K1, K2>(&self, write_keys: W, read_keys: R)
    where
        W: IntoIterator<Item = K1>,
        R: IntoIterator<Item = K2>,
        K1: AsRef<str>,
        K2: AsRef<str>,
    {
        self.release(&self.plan(write_keys, read_keys));
    }

    /// Scoped form of [`locks`](LockTable::locks).
    pub fn write_guard<I, K>(&self, keys: I) -> TableGuard<'_>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        self.guard(self.plan(keys, None::<&str>))
    }

    /// Scoped form of [`rlocks`](LockTable::rlocks).
    pub fn read_guard<I, K>(&self, keys: I) -> TableGuard<'_>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        self.guard(self.plan(None::<&str>, keys))
    }

    /// Scoped form of [`rw_locks`](LockTable::rw_locks).
    pub fn rw_guard<W, R, K1, K2>(&self, write_keys: W, read_keys: R) -> TableGuard<'_>
    where
        W: IntoIterator<Item = K1>,
        R: IntoIterator<Item = K2>,
        K1: AsRef<str>,
        K2: AsRef<str>,
    {
        self.guard(self.plan(write_keys, read_keys))
    }

    fn guard(&self, plan: Plan) -> TableGuard<'_> {
        self.acquire(&plan);
        TableGuard { table: self, plan }
    }
}

/// Slots held by a scoped multi-key call. Released in descending order on drop.
#[must_use = "the slots are released as soon as the guard is dropped"]
pub struct TableGuard<'a> {
    table: &'a LockTable,
    plan: Plan,
}

impl TableGuard<'_> {
    /// Number of distinct slots held.
    pub fn slots(&self) -> usize {
        self.plan.len()
    }
}

impl Drop for TableGuard<'_> {
    fn drop(&mut self) {
        self.table.release(&self.plan);
    }
}
