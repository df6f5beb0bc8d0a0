use crate::key::{CompositeKey, ShuffleService};
use crate::parse::LogValidation;
use crate::row::ResultRow;
use crate::stats::{StageReport, ValidationCounters};
use anyhow::Result;
use serde::{de::DeserializeOwned, Serialize};
use std::marker::PhantomData;
use std::path::PathBuf;
use tracing::warn;

// ========== Core MapReduce traits ==========

pub trait Mapper: Send + Sync {
    type Key: CompositeKey;
    type Value: Send + Sync + Serialize + DeserializeOwned + 'static;

    fn do_map<I, F>(&self, input: I, ctx: &mut MapContext, emit: &mut F)
    where
        I: IntoIterator<Item = String>,
        F: FnMut(Self::Key, Self::Value);
}

/// Optional map-side pre-aggregation. It sees the values of one group of one map
/// task's output and may emit any number of pairs in their place; it must be
/// associative and commutative so running it (or not) leaves the result unchanged.
pub trait Combiner: Send + Sync {
    type Key: CompositeKey;
    type Value: Send + Sync + Serialize + DeserializeOwned + 'static;

    fn combine<I, F>(&self, key: &Self::Key, values: I, emit: &mut F)
    where
        I: Iterator<Item = Self::Value>,
        F: FnMut(Self::Key, Self::Value);
}

/// Reducer produces output rows for one group.
///
/// `key` is the first key of the group; `values` yields the group's values in
/// total key order, lazily, and may be consumed partially.
pub trait Reducer: Send + Sync {
    type Key: CompositeKey;
    type ValueIn: Send + Sync + Serialize + DeserializeOwned + 'static;

    fn do_reduce<I, F>(&self, key: &Self::Key, values: I, ctx: &mut ReduceContext, emit: &mut F)
    where
        I: Iterator<Item = Self::ValueIn>,
        F: FnMut(ResultRow);
}

/// Stand-in for "no combiner".
pub struct NoCombiner<K, V>(PhantomData<fn() -> (K, V)>);

impl<K, V> Default for NoCombiner<K, V> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<K, V> Combiner for NoCombiner<K, V>
where
    K: CompositeKey,
    V: Send + Sync + Serialize + DeserializeOwned + 'static,
{
    type Key = K;
    type Value = V;

    fn combine<I, F>(&self, key: &K, values: I, emit: &mut F)
    where
        I: Iterator<Item = V>,
        F: FnMut(K, V),
    {
        for v in values {
            emit(key.clone(), v);
        }
    }
}

// ========== Per-task contexts ==========

/// Map-side state a mapper may touch: skip diagnostics and severity counters.
#[derive(Debug, Default)]
pub struct MapContext {
    verbose: bool,
    counting: bool,
    counters: ValidationCounters,
}

impl MapContext {
    pub fn new(verbose: bool, counting: bool) -> Self {
        Self { verbose, counting, counters: ValidationCounters::new() }
    }

    /// Counts a line under `level` when counting is on.
    pub fn record(&mut self, level: LogValidation) {
        if self.counting {
            self.counters.increment(level);
        }
    }

    /// A line that contributes nothing. Echoed when verbose, counted when counting.
    pub fn skip(&mut self, line: &str, level: LogValidation) {
        if self.verbose {
            warn!(level = %level, line, "Ignoring corrupt input");
        }
        self.record(level);
    }

    pub fn counters(&self) -> &ValidationCounters {
        &self.counters
    }

    pub fn into_counters(self) -> ValidationCounters {
        self.counters
    }
}

/// Reduce-side bookkeeping.
#[derive(Debug, Default)]
pub struct ReduceContext {
    dropped_groups: u64,
}

impl ReduceContext {
    /// Marks the current group as deliberately producing no row.
    pub fn drop_group(&mut self) {
        self.dropped_groups += 1;
    }

    pub fn dropped_groups(&self) -> u64 {
        self.dropped_groups
    }
}

// ========== Executable pipeline interface ==========

pub trait ExecutablePipeline {
    fn add_input(&mut self, input_path: impl Into<PathBuf>);
    fn add_output(&mut self, output_path: impl Into<PathBuf>);

    fn map_reduce<M, R, S>(&mut self, mapper: M, reducer: R, shuffle: S) -> Result<StageReport>
    where
        M: Mapper,
        R: Reducer<Key = M::Key, ValueIn = M::Value>,
        S: ShuffleService<M::Key>;

    fn map_combine_reduce<M, C, R, S>(&mut self, mapper: M, combiner: C, reducer: R, shuffle: S) -> Result<StageReport>
    where
        M: Mapper,
        C: Combiner<Key = M::Key, Value = M::Value>,
        R: Reducer<Key = M::Key, ValueIn = M::Value>,
        S: ShuffleService<M::Key>;
}
