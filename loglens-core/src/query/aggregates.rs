//! Aggregate function implementations

use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet};

/// Accumulator for computing a group's value incrementally
///
/// Merging must be commutative and associative: partition partials are
/// combined in whatever order the scans finish.
pub trait Accumulator: Default + Send + 'static {
    /// Add one matching record
    fn add(&mut self, value: &str);

    /// Get the current result
    fn result(&self) -> u64;

    /// Reset the accumulator
    fn reset(&mut self);

    /// Merge another accumulator into this one
    fn merge(&mut self, other: Self);
}

/// Count accumulator
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CountAccumulator {
    count: u64,
}

impl Accumulator for CountAccumulator {
    fn add(&mut self, _value: &str) {
        self.count += 1;
    }

    fn result(&self) -> u64 {
        self.count
    }

    fn reset(&mut self) {
        self.count = 0;
    }

    fn merge(&mut self, other: Self) {
        self.count += other.count;
    }
}

/// Distinct-value accumulator
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DistinctAccumulator {
    seen: HashSet<String>,
}

impl Accumulator for DistinctAccumulator {
    fn add(&mut self, value: &str) {
        if !self.seen.contains(value) {
            self.seen.insert(value.to_string());
        }
    }

    fn result(&self) -> u64 {
        self.seen.len() as u64
    }

    fn reset(&mut self) {
        self.seen.clear();
    }

    fn merge(&mut self, other: Self) {
        if other.seen.len() > self.seen.len() {
            let mine = std::mem::replace(&mut self.seen, other.seen);
            self.seen.extend(mine);
        } else {
            self.seen.extend(other.seen);
        }
    }
}

/// Group key to accumulator, for one partition or a merged set
#[derive(Debug, Clone)]
pub struct GroupState<A> {
    groups: HashMap<String, A>,
    scanned: u64,
    matched: u64,
}

impl<A> Default for GroupState<A> {
    fn default() -> Self {
        Self {
            groups: HashMap::new(),
            scanned: 0,
            matched: 0,
        }
    }
}

impl<A: Accumulator> GroupState<A> {
    /// Count a record that did not pass the filter
    pub fn skip(&mut self) {
        self.scanned += 1;
    }

    /// Fold one matching record into its group
    pub fn add(&mut self, key: &str, value: &str) {
        self.scanned += 1;
        self.matched += 1;
        match self.groups.get_mut(key) {
            Some(acc) => acc.add(value),
            None => {
                let mut acc = A::default();
                acc.add(value);
                self.groups.insert(key.to_string(), acc);
            }
        }
    }

    /// Ensure a group exists even when nothing matched
    pub fn touch(&mut self, key: &str) {
        if !self.groups.contains_key(key) {
            self.groups.insert(key.to_string(), A::default());
        }
    }

    pub fn merge(&mut self, other: GroupState<A>) {
        self.scanned += other.scanned;
        self.matched += other.matched;
        for (key, acc) in other.groups {
            match self.groups.get_mut(&key) {
                Some(existing) => existing.merge(acc),
                None => {
                    self.groups.insert(key, acc);
                }
            }
        }
    }

    pub fn scanned(&self) -> u64 {
        self.scanned
    }

    pub fn matched(&self) -> u64 {
        self.matched
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Final values in key order
    pub fn finish(self) -> BTreeMap<String, u64> {
        self.groups
            .into_iter()
            .map(|(key, acc)| (key, acc.result()))
            .collect()
    }
}

/// Rank of a group: higher value first, then lexicographically smaller key
#[derive(Debug, PartialEq, Eq)]
struct Ranked {
    value: u64,
    key: String,
}

impl Ord for Ranked {
    fn cmp(&self, other: &Self) -> Ordering {
        self.value
            .cmp(&other.value)
            .then_with(|| other.key.cmp(&self.key))
    }
}

impl PartialOrd for Ranked {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// The `k` best groups, best first, using a heap bounded at `k`
pub fn select_top_k(groups: impl IntoIterator<Item = (String, u64)>, k: usize) -> Vec<(String, u64)> {
    if k == 0 {
        return Vec::new();
    }
    let mut heap: BinaryHeap<Reverse<Ranked>> = BinaryHeap::with_capacity(k + 1);
    for (key, value) in groups {
        heap.push(Reverse(Ranked { value, key }));
        if heap.len() > k {
            heap.pop();
        }
    }
    // Ascending Reverse order is descending rank
    heap.into_sorted_vec()
        .into_iter()
        .map(|Reverse(r)| (r.key, r.value))
        .collect()
}
