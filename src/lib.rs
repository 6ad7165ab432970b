//! Concurrency core of an in-memory key-value store: a sharded dictionary and a
//! keyed lock table that share one hash routing scheme.
//!
//! [`ConcurrentDict`] keeps every key consistent on its own. [`LockTable`] lets a
//! caller make a sequence of dictionary calls over several keys atomic by taking
//! the keys' slots first, always in ascending slot order.

macro_rules! vec_no_clone {
    ( $val:expr; $n:expr ) => {{
        let result: Vec<_> = std::iter::repeat_with(|| $val).take($n).collect();
        result
    }};
}

pub mod config;
pub mod dict;
pub mod hash;
pub mod keyspace;
pub mod lock;

pub use config::{Config, ConfigError};
pub use dict::ConcurrentDict;
pub use keyspace::Keyspace;
pub use lock::{LockTable, TableGuard};
