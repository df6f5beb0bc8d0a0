//! Partition functions over a key's group prefix.

use crate::key::KeyField;
use xxhash_rust::xxh3::Xxh3;

pub trait Partitioner: Send + Sync {
    /// Maps the group-prefix fields to a partition in `0..num_partitions`.
    fn partition<'a, I>(&self, prefix: I, num_partitions: usize) -> usize
    where
        I: IntoIterator<Item = KeyField<'a>>;
}

/// xxh3 over the prefix fields. Placement is the same in every process and
/// on every toolchain, which `DefaultHasher` does not promise.
#[derive(Clone, Copy, Debug, Default)]
pub struct StablePartitioner;

impl Partitioner for StablePartitioner {
    fn partition<'a, I>(&self, prefix: I, num_partitions: usize) -> usize
    where
        I: IntoIterator<Item = KeyField<'a>>,
    {
        if num_partitions <= 1 {
            return 0;
        }
        let mut hasher = Xxh3::new();
        for field in prefix {
            match field {
                KeyField::Text(s) => {
                    hasher.update(&[0x01]);
                    hasher.update(s.as_bytes());
                    hasher.update(&[0x1f]);
                }
                KeyField::Int(i) => {
                    hasher.update(&[0x02]);
                    hasher.update(&i.to_le_bytes());
                }
            }
        }
        (hasher.digest() % num_partitions as u64) as usize
    }
}

/// Which historical hash the [`LegacyPartitioner`] reproduces.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LegacyHash {
    /// UTF-16 string hash of the prefix fields concatenated without a separator.
    JavaString,
    /// Signed-byte hash of the prefix fields joined by `separator`, as a text key is hashed.
    HadoopText { separator: String },
}

/// Bit-for-bit reproduction of `abs(hash(prefix) * 127) % n`.
///
/// The historical `abs` overflows to a negative number for `i32::MIN`; here the
/// magnitude is taken unsigned, so the index is always in range.
#[derive(Clone, Debug)]
pub struct LegacyPartitioner {
    hash: LegacyHash,
}

impl LegacyPartitioner {
    pub fn java_string() -> Self {
        Self { hash: LegacyHash::JavaString }
    }

    pub fn hadoop_text(separator: impl Into<String>) -> Self {
        Self { hash: LegacyHash::HadoopText { separator: separator.into() } }
    }

    pub fn hash_prefix<'a, I>(&self, prefix: I) -> i32
    where
        I: IntoIterator<Item = KeyField<'a>>,
    {
        let mut h: i32;
        match &self.hash {
            LegacyHash::JavaString => {
                h = 0;
                for field in prefix {
                    for unit in field.to_string().encode_utf16() {
                        h = h.wrapping_mul(31).wrapping_add(unit as i32);
                    }
                }
            }
            LegacyHash::HadoopText { separator } => {
                h = 1;
                let mut mix = |bytes: &[u8]| {
                    for &b in bytes {
                        h = h.wrapping_mul(31).wrapping_add(b as i8 as i32);
                    }
                };
                for (idx, field) in prefix.into_iter().enumerate() {
                    if idx > 0 {
                        mix(separator.as_bytes());
                    }
                    mix(field.to_string().as_bytes());
                }
            }
        }
        h
    }
}

impl Partitioner for LegacyPartitioner {
    fn partition<'a, I>(&self, prefix: I, num_partitions: usize) -> usize
    where
        I: IntoIterator<Item = KeyField<'a>>,
    {
        if num_partitions <= 1 {
            return 0;
        }
        let mixed = self.hash_prefix(prefix).wrapping_mul(127);
        (mixed.unsigned_abs() as usize) % num_partitions
    }
}

/// Partitioner picked at run time from configuration.
#[derive(Clone, Debug)]
pub enum PartitionScheme {
    Stable(StablePartitioner),
    Legacy(LegacyPartitioner),
}

impl Default for PartitionScheme {
    fn default() -> Self {
        PartitionScheme::Stable(StablePartitioner)
    }
}

impl Partitioner for PartitionScheme {
    fn partition<'a, I>(&self, prefix: I, num_partitions: usize) -> usize
    where
        I: IntoIterator<Item = KeyField<'a>>,
    {
        match self {
            PartitionScheme::Stable(p) => p.partition(prefix, num_partitions),
            PartitionScheme::Legacy(p) => p.partition(prefix, num_partitions),
        }
    }
}
