//! Ordered set of disjoint `u64` ranges.
//!
//! Backs both the per-space record of received packet numbers (ACK
//! generation and duplicate detection) and the byte-range bookkeeping of
//! stream and crypto buffers. Stored ranges are half-open, sorted and never
//! overlapping or adjacent: every insert merges with its neighbours.

use alloc::vec::Vec;
use core::ops::Range;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeSet {
    ranges: Vec<Range<u64>>,
    /// Oldest ranges are evicted once this many are stored.
    limit: usize,
}

impl Default for RangeSet {
    fn default() -> Self {
        Self::new()
    }
}

impl RangeSet {
    pub fn new() -> Self {
        Self {
            ranges: Vec::new(),
            limit: usize::MAX,
        }
    }

    /// A set that keeps at most `limit` ranges, dropping the lowest first.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            ranges: Vec::new(),
            limit: limit.max(1),
        }
    }

    /// Add `range` to the set. Returns `false` if every value was already present.
    pub fn insert(&mut self, range: Range<u64>) -> bool {
        if range.start >= range.end || self.contains_range(&range) {
            return false;
        }
        // First stored range that touches or follows `range`.
        let lo = self.ranges.partition_point(|r| r.end < range.start);
        // First stored range strictly after `range` (not even adjacent).
        let hi = self.ranges.partition_point(|r| r.start <= range.end);

        let mut merged = range;
        if lo < hi {
            merged.start = merged.start.min(self.ranges[lo].start);
            merged.end = merged.end.max(self.ranges[hi - 1].end);
        }
        self.ranges.splice(lo..hi, core::iter::once(merged));

        if self.ranges.len() > self.limit {
            self.ranges.remove(0);
        }
        true
    }

    pub fn insert_one(&mut self, value: u64) -> bool {
        self.insert(value..value + 1)
    }

    /// Remove every value in `range` from the set.
    pub fn remove(&mut self, range: Range<u64>) {
        if range.start >= range.end {
            return;
        }
        let lo = self.ranges.partition_point(|r| r.end <= range.start);
        let hi = self.ranges.partition_point(|r| r.start < range.end);
        if lo >= hi {
            return;
        }
        let first = self.ranges[lo].clone();
        let last = self.ranges[hi - 1].clone();
        let mut keep = Vec::with_capacity(2);
        if first.start < range.start {
            keep.push(first.start..range.start);
        }
        if last.end > range.end {
            keep.push(range.end..last.end);
        }
        self.ranges.splice(lo..hi, keep);
    }

    /// Drop every value below `end`.
    pub fn remove_below(&mut self, end: u64) {
        self.remove(0..end);
    }

    pub fn contains(&self, value: u64) -> bool {
        self.contains_range(&(value..value + 1))
    }

    /// Whether every value of `range` is present.
    pub fn contains_range(&self, range: &Range<u64>) -> bool {
        let idx = self.ranges.partition_point(|r| r.end < range.end);
        self.ranges
            .get(idx)
            .is_some_and(|r| r.start <= range.start && r.end >= range.end)
    }

    /// Parts of `range` not covered by the set, in ascending order.
    pub fn gaps_in(&self, range: Range<u64>) -> Vec<Range<u64>> {
        let mut gaps = Vec::new();
        let mut cursor = range.start;
        for r in &self.ranges {
            if r.end <= cursor {
                continue;
            }
            if r.start >= range.end {
                break;
            }
            if r.start > cursor {
                gaps.push(cursor..r.start);
            }
            cursor = cursor.max(r.end);
        }
        if cursor < range.end {
            gaps.push(cursor..range.end);
        }
        gaps
    }

    pub fn first(&self) -> Option<Range<u64>> {
        self.ranges.first().cloned()
    }

    pub fn last(&self) -> Option<Range<u64>> {
        self.ranges.last().cloned()
    }

    /// Largest value in the set.
    pub fn max(&self) -> Option<u64> {
        self.ranges.last().map(|r| r.end - 1)
    }

    /// Remove and return the lowest range.
    pub fn pop_first(&mut self) -> Option<Range<u64>> {
        if self.ranges.is_empty() {
            None
        } else {
            Some(self.ranges.remove(0))
        }
    }

    /// Number of disjoint ranges stored.
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn iter(&self) -> core::slice::Iter<'_, Range<u64>> {
        self.ranges.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn ranges(set: &RangeSet) -> Vec<Range<u64>> {
        set.iter().cloned().collect()
    }

    #[test]
    fn adjacent_ranges_merge() {
        let mut set = RangeSet::new();
        assert!(set.insert(0..2));
        assert!(set.insert(4..6));
        assert!(set.insert(2..4));
        assert_eq!(ranges(&set), vec![0..6]);
    }

    #[test]
    fn overlapping_insert_spans_several_ranges() {
        let mut set = RangeSet::new();
        set.insert(1..2);
        set.insert(4..5);
        set.insert(8..9);
        set.insert(0..6);
        assert_eq!(ranges(&set), vec![0..6, 8..9]);
    }

    #[test]
    fn duplicate_insert_reports_nothing_new() {
        let mut set = RangeSet::new();
        set.insert(3..10);
        let before = set.clone();
        assert!(!set.insert_one(5));
        assert!(!set.insert(3..10));
        assert_eq!(set, before);
    }

    #[test]
    fn remove_splits_ranges() {
        let mut set = RangeSet::new();
        set.insert(0..10);
        set.remove(3..5);
        assert_eq!(ranges(&set), vec![0..3, 5..10]);
        set.remove_below(6);
        assert_eq!(ranges(&set), vec![6..10]);
    }

    #[test]
    fn gaps_report_uncovered_parts() {
        let mut set = RangeSet::new();
        set.insert(2..4);
        set.insert(6..8);
        assert_eq!(set.gaps_in(0..10), vec![0..2, 4..6, 8..10]);
        assert_eq!(set.gaps_in(2..4), vec![]);
        assert_eq!(set.gaps_in(3..7), vec![4..6]);
    }

    #[test]
    fn limit_evicts_lowest_range() {
        let mut set = RangeSet::with_limit(2);
        set.insert_one(1);
        set.insert_one(3);
        set.insert_one(5);
        assert_eq!(ranges(&set), vec![3..4, 5..6]);
        assert_eq!(set.max(), Some(5));
    }

    #[test]
    fn contains_checks_whole_range() {
        let mut set = RangeSet::new();
        set.insert(10..20);
        assert!(set.contains(10));
        assert!(set.contains(19));
        assert!(!set.contains(20));
        assert!(!set.contains_range(&(15..25)));
    }
}
