//! Non-overlapping interval map over half-open ranges.
//!
//! Backs the journal index: each entry maps `[low, high)` in user-file byte
//! space to the journal-file position of the record header. Callers resolve
//! overlaps before inserting, so the map stays pairwise disjoint; ordered
//! iteration drives replay in ascending user-file offset.
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
struct Node<V> {
    high: u64,
    value: V,
}

#[derive(Debug, Clone)]
pub struct IntervalTree<V> {
    map: BTreeMap<u64, Node<V>>,
}

/// One interval as returned by queries and iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span<V> {
    pub low: u64,
    pub high: u64,
    pub value: V,
}

impl<V> Default for IntervalTree<V> {
    fn default() -> Self {
        Self {
            map: BTreeMap::new(),
        }
    }
}

impl<V: Clone> IntervalTree<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `[low, high) -> value`.
    ///
    /// The interval must not overlap any stored interval; the journal write
    /// path guarantees this by carving out intersections first.
    pub fn insert(&mut self, low: u64, high: u64, value: V) {
        assert!(low < high, "empty or inverted interval");
        debug_assert!(
            !self.overlaps(low, high),
            "overlapping journal entries [{},{})",
            low,
            high
        );
        self.map.insert(low, Node { high, value });
    }

    /// Remove the interval with exactly these bounds, returning its value.
    pub fn erase(&mut self, low: u64, high: u64) -> Option<V> {
        match self.map.get(&low) {
            Some(node) if node.high == high => self.map.remove(&low).map(|n| n.value),
            _ => None,
        }
    }

    pub fn overlaps(&self, low: u64, high: u64) -> bool {
        self.query(low, high).next().is_some()
    }

    /// All intervals overlapping `[low, high)`, in ascending order. An
    /// empty range overlaps nothing.
    pub fn query(&self, low: u64, high: u64) -> impl Iterator<Item = Span<&V>> {
        let (start, high) = if low >= high {
            (low, low)
        } else {
            // The predecessor may reach into the queried range.
            let start = self
                .map
                .range(..low)
                .next_back()
                .filter(|(_, n)| n.high > low)
                .map(|(l, _)| *l)
                .unwrap_or(low);
            (start, high)
        };
        self.map
            .range(start..high)
            .filter(move |(l, n)| **l < high && n.high > low)
            .map(|(l, n)| Span {
                low: *l,
                high: n.high,
                value: &n.value,
            })
    }

    /// Owned copies of the overlapping intervals; convenient when the tree
    /// lock must be released before acting on the result.
    pub fn query_owned(&self, low: u64, high: u64) -> Vec<Span<V>> {
        self.query(low, high)
            .map(|s| Span {
                low: s.low,
                high: s.high,
                value: s.value.clone(),
            })
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = Span<&V>> {
        self.map.iter().map(|(l, n)| Span {
            low: *l,
            high: n.high,
            value: &n.value,
        })
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Highest covered offset, 0 for an empty tree.
    pub fn max_high(&self) -> u64 {
        self.map.values().map(|n| n.high).max().unwrap_or(0)
    }
}
