use std::env;
use std::str::FromStr;

use thiserror::Error;

use crate::hash::MIN_CAPACITY;

pub const SHARDS_ENV: &str = "SHARD_DICT_SHARDS";
pub const LOCK_SLOTS_ENV: &str = "SHARD_DICT_LOCK_SLOTS";

const DEFAULT_LOCK_SLOTS: usize = 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}")]
    InvalidValue { var: &'static str, value: String },

    #[error("lock table needs at least one slot")]
    ZeroLockSlots,
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Sizing for a [`Keyspace`](crate::Keyspace).
///
/// The dictionary and the lock table are sized independently. Both counts are
/// rounded up to a power of two when the structures are built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    pub shard_count: usize,
    pub lock_slots: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            shard_count: MIN_CAPACITY,
            lock_slots: DEFAULT_LOCK_SLOTS,
        }
    }
}

impl Config {
    pub fn with_shard_count(mut self, shard_count: usize) -> Self {
        self.shard_count = shard_count;
        self
    }

    pub fn with_lock_slots(mut self, lock_slots: usize) -> Self {
        self.lock_slots = lock_slots;
        self
    }

    /// Defaults overridden by `SHARD_DICT_SHARDS` and `SHARD_DICT_LOCK_SLOTS`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(shards) = parse_var(&lookup, SHARDS_ENV)? {
            config.shard_count = shards;
        }
        if let Some(slots) = parse_var(&lookup, LOCK_SLOTS_ENV)? {
            config.lock_slots = slots;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.lock_slots == 0 {
            return Err(ConfigError::ZeroLockSlots);
        }
        Ok(())
    }
}

fn parse_var<F, T>(lookup: &F, var: &'static str) -> Result<Option<T>>
where
    F: Fn(&'static str) -> Option<String>,
    T: FromStr,
{
    match lookup(var) {
        None => Ok(None),
        Some(raw) => match raw.trim().parse() {
            Ok(value) => Ok(Some(value)),
            Err(_) => Err(ConfigError::InvalidValue { var, value: raw }),
        },
    }
}
