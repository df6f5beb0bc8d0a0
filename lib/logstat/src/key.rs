//! Composite keys and the shuffle contract built on them.
//!
//! A composite key is an ordered tuple of fields. The shuffle needs three things
//! from it, bundled in [`ShuffleService`]:
//!
//! * `compare_total` orders keys lexicographically over *all* fields, so it is a
//!   strict total order and values inside one group arrive sorted by the trailing
//!   fields (secondary sort);
//! * `group_equals` compares only the leading `GROUP_ARITY` fields;
//! * `partition` hashes only those same leading fields.
//!
//! Because the group prefix is a prefix of the sort fields, every group is one
//! contiguous run in a sorted partition, and every record of a group lands in
//! the same partition regardless of its trailing fields.

use crate::partition::{Partitioner, StablePartitioner};
use serde::{de::DeserializeOwned, Serialize};
use std::cmp::Ordering;
use std::fmt::Debug;

/// One field of a composite key, borrowed from the key.
///
/// Fields at the same position of two keys of one type always share a variant,
/// so the derived ordering (variant first, then payload) is the field ordering.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KeyField<'a> {
    Text(&'a str),
    Int(i64),
}

impl std::fmt::Display for KeyField<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyField::Text(s) => f.write_str(s),
            KeyField::Int(i) => write!(f, "{}", i),
        }
    }
}

pub trait CompositeKey: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {
    /// Number of fields, in sort priority order.
    const ARITY: usize;
    /// Number of leading fields that decide group membership and partitioning.
    /// Must be at least 1 and at most `ARITY`.
    const GROUP_ARITY: usize;

    /// Field `idx`, for `idx < ARITY`.
    fn field(&self, idx: usize) -> KeyField<'_>;

    fn group_prefix(&self) -> impl Iterator<Item = KeyField<'_>> {
        (0..Self::GROUP_ARITY).map(move |i| self.field(i))
    }
}

/// Lexicographic comparison of the first `arity` fields.
pub fn compare_prefix<K: CompositeKey>(a: &K, b: &K, arity: usize) -> Ordering {
    for idx in 0..arity {
        match a.field(idx).cmp(&b.field(idx)) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// The capability the aggregation logic needs from whatever moves records
/// between the map and reduce sides.
pub trait ShuffleService<K>: Send + Sync {
    /// Partition index in `0..num_partitions`.
    fn partition(&self, key: &K, num_partitions: usize) -> usize;
    fn compare_total(&self, a: &K, b: &K) -> Ordering;
    fn group_equals(&self, a: &K, b: &K) -> bool;
}

/// [`ShuffleService`] derived from a key's declared fields and group prefix.
#[derive(Clone, Debug, Default)]
pub struct KeyShuffle<P = StablePartitioner> {
    partitioner: P,
}

impl<P: Partitioner> KeyShuffle<P> {
    pub fn new(partitioner: P) -> Self {
        Self { partitioner }
    }
}

impl<K: CompositeKey, P: Partitioner> ShuffleService<K> for KeyShuffle<P> {
    fn partition(&self, key: &K, num_partitions: usize) -> usize {
        debug_assert!(K::GROUP_ARITY >= 1 && K::GROUP_ARITY <= K::ARITY);
        self.partitioner.partition(key.group_prefix(), num_partitions)
    }

    fn compare_total(&self, a: &K, b: &K) -> Ordering {
        compare_prefix(a, b, K::ARITY)
    }

    fn group_equals(&self, a: &K, b: &K) -> bool {
        compare_prefix(a, b, K::GROUP_ARITY) == Ordering::Equal
    }
}
