//! Sorted set of disjoint, half-open `u64` intervals.
//!
//! [`RangeSet`] records which byte ranges of a backing file are known to hold valid content.
//! Intervals are coalesced on insert, so two stored spans never overlap or touch.

use std::collections::BTreeMap;
use std::ops::Range;

/// A set of byte offsets stored as disjoint `[start, end)` spans.
///
/// Empty ranges (`start >= end`) are ignored by every mutating operation and are trivially
/// contained by any set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeSet {
    /// `start -> end`. Invariant: for consecutive spans `a` and `b`, `a.end < b.start`.
    spans: BTreeMap<u64, u64>,
}

impl RangeSet {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if no offsets are covered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    /// Number of disjoint spans currently stored.
    #[must_use]
    pub fn span_count(&self) -> usize {
        self.spans.len()
    }

    /// Total number of offsets covered across all spans.
    #[must_use]
    pub fn covered_len(&self) -> u64 {
        self.spans.iter().map(|(start, end)| end - start).sum()
    }

    /// Iterate the stored spans in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = Range<u64>> + '_ {
        self.spans.iter().map(|(&start, &end)| start..end)
    }

    /// The start of the span that could cover `offset`, or `offset` itself if none starts before it.
    fn scan_origin(&self, offset: u64) -> u64 {
        self.spans
            .range(..=offset)
            .next_back()
            .map_or(offset, |(&start, _)| start)
    }

    /// Merge `range` into the set, coalescing with any overlapping or adjacent spans.
    pub fn add(&mut self, range: Range<u64>) {
        if range.is_empty() {
            return;
        }

        let mut start = range.start;
        let mut end = range.end;

        if let Some((&prev_start, &prev_end)) = self.spans.range(..=start).next_back()
            && prev_end >= start
        {
            start = prev_start;
            end = end.max(prev_end);
        }

        let absorbed: Vec<u64> = self.spans.range(start..=end).map(|(&s, _)| s).collect();
        for span_start in absorbed {
            if let Some(span_end) = self.spans.remove(&span_start) {
                end = end.max(span_end);
            }
        }

        self.spans.insert(start, end);
    }

    /// Remove every offset in `range` from the set, splitting spans that straddle its bounds.
    pub fn remove(&mut self, range: Range<u64>) {
        if range.is_empty() {
            return;
        }

        let overlapping: Vec<(u64, u64)> = self
            .spans
            .range(self.scan_origin(range.start)..range.end)
            .filter(|&(_, &end)| end > range.start)
            .map(|(&start, &end)| (start, end))
            .collect();

        for (start, end) in overlapping {
            self.spans.remove(&start);
            if start < range.start {
                self.spans.insert(start, range.start);
            }
            if end > range.end {
                self.spans.insert(range.end, end);
            }
        }
    }

    /// Returns the disjoint sub-ranges of `range` that are not covered, in ascending order.
    #[must_use]
    pub fn difference(&self, range: Range<u64>) -> Vec<Range<u64>> {
        let mut gaps = Vec::new();
        if range.is_empty() {
            return gaps;
        }

        let mut cursor = range.start;
        for (&start, &end) in self.spans.range(self.scan_origin(range.start)..range.end) {
            if end <= cursor {
                continue;
            }
            if start > cursor {
                gaps.push(cursor..start);
            }
            cursor = end;
            if cursor >= range.end {
                return gaps;
            }
        }

        gaps.push(cursor..range.end);
        gaps
    }

    /// Returns `true` iff every offset in `range` is covered.
    #[must_use]
    pub fn contains(&self, range: Range<u64>) -> bool {
        if range.is_empty() {
            return true;
        }
        self.spans
            .range(..=range.start)
            .next_back()
            .is_some_and(|(_, &end)| end >= range.end)
    }
}
