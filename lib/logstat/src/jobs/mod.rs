//! The analytics jobs: country distribution and session length.

pub mod country;
pub mod session_length;

use crate::key::KeyShuffle;
use crate::partition::PartitionScheme;

/// Shuffle whose partitioner is picked from the stage options.
pub type ConfiguredShuffle = KeyShuffle<PartitionScheme>;

/// Distinct count over a sorted sequence: a value counts when it differs from
/// the one before it. Only correct when equal values are adjacent.
#[derive(Debug)]
pub struct DistinctRuns<T> {
    previous: Option<T>,
    distinct: u64,
}

impl<T> Default for DistinctRuns<T> {
    fn default() -> Self {
        Self { previous: None, distinct: 0 }
    }
}

impl<T: PartialEq> DistinctRuns<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, value: T) {
        if self.previous.as_ref() != Some(&value) {
            self.distinct += 1;
        }
        self.previous = Some(value);
    }

    pub fn count(&self) -> u64 {
        self.distinct
    }
}

/// Runs a mapper and reducer over in-memory lines with a sort in between,
/// the way the runtime does over spill files.
#[cfg(test)]
pub(crate) mod testing {
    use crate::api::{MapContext, Mapper, ReduceContext, Reducer};
    use crate::group::for_each_group;
    use crate::key::{KeyShuffle, ShuffleService};
    use crate::partition::StablePartitioner;
    use crate::row::ResultRow;

    pub(crate) struct LocalRun {
        pub rows: Vec<ResultRow>,
        pub map_ctx: MapContext,
        pub reduce_ctx: ReduceContext,
    }

    pub(crate) fn run_local<M, R>(mapper: &M, reducer: &R, lines: &[&str]) -> LocalRun
    where
        M: Mapper,
        R: Reducer<Key = M::Key, ValueIn = M::Value>,
    {
        let shuffle = KeyShuffle::<StablePartitioner>::default();
        let mut map_ctx = MapContext::new(false, true);
        let mut pairs = Vec::new();
        mapper.do_map(lines.iter().map(|l| l.to_string()), &mut map_ctx, &mut |k, v| pairs.push((k, v)));
        pairs.sort_by(|a, b| shuffle.compare_total(&a.0, &b.0));

        let mut reduce_ctx = ReduceContext::default();
        let mut rows = Vec::new();
        for_each_group(pairs.into_iter().map(Ok), &shuffle, |key, values| {
            reducer.do_reduce(key, values, &mut reduce_ctx, &mut |row| rows.push(row));
            Ok(())
        })
        .unwrap();
        LocalRun { rows, map_ctx, reduce_ctx }
    }
}
