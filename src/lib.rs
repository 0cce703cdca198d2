//! An in-process MapReduce (lite) engine.
//!
//! Users supply a [`Mapper`] and a [`Reducer`]; the engine fans the map work
//! out over a bounded pool of workers, groups the emitted pairs by key, fans
//! the reduce work out again and hands back one output value per key.

use std::fmt::Debug;
use std::hash::Hash;

pub mod config;
pub mod error;
pub mod standalone;
pub mod utils;
pub mod workload;

pub use config::EngineConfig;
pub use error::{MapReduceError, MapReduceResult, TaskFailure, TaskId};
pub use standalone::orchestrator::Engine;
pub use standalone::phase::Phase;

/////////////////////////////////////////////////////////////////////////////
// MapReduce application types
/////////////////////////////////////////////////////////////////////////////

/// The output of an application map function: every pair emitted for one
/// record, or the reason the record could not be mapped.
pub type MapOutput<K, V> = anyhow::Result<Vec<KeyValue<K, V>>>;

/// The final result of a run: one reduced value per distinct key.
pub type FinalResult<K, O> = std::collections::HashMap<K, O>;

/// Maps one input record to zero or more key-value pairs.
///
/// Implementations must be pure with respect to sibling records; the engine
/// calls `map` from many threads at once and in no particular order.
pub trait Mapper: Send + Sync + 'static {
    /// A single input record.
    type Record: Send + 'static;
    /// The intermediate key pairs are grouped by.
    type Key: Eq + Hash + Debug + Send + 'static;
    /// The intermediate value.
    type Value: Send + 'static;

    fn map(&self, record: Self::Record) -> MapOutput<Self::Key, Self::Value>;
}

/// Reduces one key and all of the values mapped to it into a single value.
///
/// The order of `values` is unspecified; treat it as a multiset.
pub trait Reducer<K, V>: Send + Sync + 'static {
    type Output: Send + 'static;

    fn reduce(&self, key: &K, values: Vec<V>) -> anyhow::Result<Self::Output>;
}

/////////////////////////////////////////////////////////////////////////////
// Key-value pairs
/////////////////////////////////////////////////////////////////////////////

/// A single key-value pair.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct KeyValue<K, V> {
    /// The key.
    pub key: K,
    /// The value.
    pub value: V,
}

impl<K, V> KeyValue<K, V> {
    /// Construct a new key-value pair from the given key and value.
    pub fn new(key: K, value: V) -> Self {
        Self { key, value }
    }

    /// Get the key of this key-value pair.
    #[inline]
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Get the value of this key-value pair.
    #[inline]
    pub fn value(&self) -> &V {
        &self.value
    }

    /// Consumes the key-value pair and returns the key.
    #[inline]
    pub fn into_key(self) -> K {
        self.key
    }

    /// Consumes the key-value pair and returns the value.
    #[inline]
    pub fn into_value(self) -> V {
        self.value
    }
}
