//! Splits a totally sorted record stream into groups and hands each group to a
//! callback as a lazy iterator, so reducers never buffer a group.

use crate::key::ShuffleService;
use anyhow::{bail, Result};
use std::cmp::Ordering;
use std::iter::Peekable;

/// Counts from one pass over a sorted run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GroupScan {
    pub groups: u64,
    pub records: u64,
}

/// Values of the current group. Stops at the first record that is not
/// group-equal to `head`, leaving it in the underlying stream.
struct GroupValues<'a, K, V, I, S>
where
    I: Iterator<Item = Result<(K, V)>>,
{
    records: &'a mut Peekable<I>,
    head: &'a K,
    shuffle: &'a S,
    pending: Option<V>,
    failure: &'a mut Option<anyhow::Error>,
    taken: u64,
    done: bool,
}

impl<K, V, I, S> Iterator for GroupValues<'_, K, V, I, S>
where
    I: Iterator<Item = Result<(K, V)>>,
    S: ShuffleService<K>,
{
    type Item = V;

    fn next(&mut self) -> Option<V> {
        if self.done {
            return None;
        }
        if let Some(first) = self.pending.take() {
            self.taken += 1;
            return Some(first);
        }
        let same_group = match self.records.peek() {
            Some(Ok((key, _))) => self.shuffle.group_equals(self.head, key),
            Some(Err(_)) => true,
            None => false,
        };
        if !same_group {
            self.done = true;
            return None;
        }
        match self.records.next() {
            Some(Ok((_, value))) => {
                self.taken += 1;
                Some(value)
            }
            Some(Err(e)) => {
                *self.failure = Some(e);
                self.done = true;
                None
            }
            None => {
                self.done = true;
                None
            }
        }
    }
}

/// Drives `on_group` once per group of a stream sorted by `compare_total`.
///
/// Values not consumed by the callback are skipped before the next group starts.
/// A stream that goes backwards between groups breaks the contiguity the
/// reducers rely on, so it fails the pass instead of producing split groups.
pub fn for_each_group<K, V, I, S, G>(records: I, shuffle: &S, mut on_group: G) -> Result<GroupScan>
where
    K: Clone,
    I: Iterator<Item = Result<(K, V)>>,
    S: ShuffleService<K>,
    G: FnMut(&K, &mut dyn Iterator<Item = V>) -> Result<()>,
{
    let mut records = records.peekable();
    let mut scan = GroupScan::default();
    let mut failure: Option<anyhow::Error> = None;
    let mut previous: Option<K> = None;

    while let Some(next) = records.next() {
        let (head, first) = next?;
        if let Some(prev) = &previous {
            if shuffle.compare_total(prev, &head) == Ordering::Greater {
                bail!("sorted run out of order: group starts below the previous group");
            }
        }
        let taken = {
            let mut values = GroupValues {
                records: &mut records,
                head: &head,
                shuffle,
                pending: Some(first),
                failure: &mut failure,
                taken: 0,
                done: false,
            };
            on_group(&head, &mut values)?;
            values.by_ref().for_each(drop);
            values.taken
        };
        if let Some(e) = failure.take() {
            return Err(e);
        }
        scan.groups += 1;
        scan.records += taken;
        previous = Some(head);
    }
    Ok(scan)
}
