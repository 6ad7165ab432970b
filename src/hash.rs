//! Key hashing and table sizing shared by the dictionary and the lock table.
//!
//! Both structures route a key with `fnv32(key) & (len - 1)`, so a dictionary and a
//! lock table of the same size always agree on where a key lives.

const OFFSET_BASIS32: u32 = 2_166_136_261;
const PRIME32: u32 = 16_777_619;

/// Smallest shard count a dictionary is ever built with.
pub const MIN_CAPACITY: usize = 16;

/// Largest power of two that still fits a positive 32-bit signed size.
pub const MAX_CAPACITY: usize = 1 << 30;

/// 32-bit FNV-1a over the key bytes.
#[inline]
pub fn fnv32(key: &str) -> u32 {
    let mut hash = OFFSET_BASIS32;
    for &b in key.as_bytes() {
        hash ^= u32::from(b);
        hash = hash.wrapping_mul(PRIME32);
    }
    hash
}

/// Maps a hash onto a table of `table_len` entries.
///
/// `table_len` must be a power of two.
#[inline]
pub fn spread(hash: u32, table_len: usize) -> u32 {
    debug_assert!(table_len.is_power_of_two());
    hash & (table_len as u32).wrapping_sub(1)
}

/// Rounds a requested shard count up to the next power of two within
/// `[MIN_CAPACITY, MAX_CAPACITY]`.
pub fn compute_capacity(hint: usize) -> usize {
    if hint <= MIN_CAPACITY {
        return MIN_CAPACITY;
    }
    match hint.checked_next_power_of_two() {
        Some(n) if n <= MAX_CAPACITY => n,
        _ => MAX_CAPACITY,
    }
}
