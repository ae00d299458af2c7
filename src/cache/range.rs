use std::fmt;

/// Half-open interval `[lower, upper)` over decimated-sample indices.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DecimatedRange {
    pub lower: usize,
    pub upper: usize,
}

impl DecimatedRange {
    pub fn new(lower: usize, upper: usize) -> Self {
        Self {
            lower,
            upper: upper.max(lower),
        }
    }

    pub fn len(&self) -> usize {
        self.upper - self.lower
    }

    pub fn is_empty(&self) -> bool {
        self.upper <= self.lower
    }

    pub fn contains(&self, index: usize) -> bool {
        self.lower <= index && index < self.upper
    }

    pub fn overlaps(&self, other: &DecimatedRange) -> bool {
        self.lower < other.upper && other.lower < self.upper
    }

    pub fn intersection(&self, other: &DecimatedRange) -> Option<DecimatedRange> {
        let lower = self.lower.max(other.lower);
        let upper = self.upper.min(other.upper);
        (lower < upper).then_some(DecimatedRange { lower, upper })
    }

    pub fn as_range(&self) -> std::ops::Range<usize> {
        self.lower..self.upper
    }
}

impl From<std::ops::Range<usize>> for DecimatedRange {
    fn from(r: std::ops::Range<usize>) -> Self {
        DecimatedRange::new(r.start, r.end)
    }
}

impl fmt::Display for DecimatedRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..<{}", self.lower, self.upper)
    }
}

/// Minimal set of disjoint, non-adjacent ranges sorted by `lower`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SparseRanges {
    ranges: Vec<DecimatedRange>,
}

impl SparseRanges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_ranges<I: IntoIterator<Item = DecimatedRange>>(ranges: I) -> Self {
        let mut set = Self::new();
        for r in ranges {
            set.add(r);
        }
        set
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DecimatedRange> {
        self.ranges.iter()
    }

    pub fn as_slice(&self) -> &[DecimatedRange] {
        &self.ranges
    }

    /// Total number of indices covered.
    pub fn covered(&self) -> usize {
        self.ranges.iter().map(|r| r.len()).sum()
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    /// Merge `range` in, coalescing with overlapping or touching entries.
    pub fn add(&mut self, range: DecimatedRange) {
        if range.is_empty() {
            return;
        }
        // first entry that ends at or after range.lower can merge
        let start = self.ranges.partition_point(|r| r.upper < range.lower);
        // first entry that starts strictly after range.upper cannot
        let end = self.ranges.partition_point(|r| r.lower <= range.upper);

        if start == end {
            self.ranges.insert(start, range);
            return;
        }
        let lower = range.lower.min(self.ranges[start].lower);
        let upper = range.upper.max(self.ranges[end - 1].upper);
        self.ranges.splice(start..end, std::iter::once(DecimatedRange { lower, upper }));
    }

    /// Drop `range` from the set, splitting entries that straddle it.
    pub fn remove(&mut self, range: DecimatedRange) {
        if range.is_empty() {
            return;
        }
        let start = self.ranges.partition_point(|r| r.upper <= range.lower);
        let end = self.ranges.partition_point(|r| r.lower < range.upper);
        if start >= end {
            return;
        }
        let mut kept = Vec::with_capacity(2);
        let first = self.ranges[start];
        let last = self.ranges[end - 1];
        if first.lower < range.lower {
            kept.push(DecimatedRange::new(first.lower, range.lower));
        }
        if last.upper > range.upper {
            kept.push(DecimatedRange::new(range.upper, last.upper));
        }
        self.ranges.splice(start..end, kept);
    }

    /// True when every index of `range` is in the set.
    pub fn contains(&self, range: &DecimatedRange) -> bool {
        if range.is_empty() {
            return true;
        }
        let idx = self.ranges.partition_point(|r| r.upper <= range.lower);
        self.ranges
            .get(idx)
            .is_some_and(|r| r.lower <= range.lower && range.upper <= r.upper)
    }

    /// Parts of `range` already in the set, or `None` if there are none.
    pub fn intersect(&self, range: &DecimatedRange) -> Option<SparseRanges> {
        if range.is_empty() {
            return None;
        }
        let start = self.ranges.partition_point(|r| r.upper <= range.lower);
        let parts: Vec<DecimatedRange> = self.ranges[start..]
            .iter()
            .take_while(|r| r.lower < range.upper)
            .filter_map(|r| r.intersection(range))
            .collect();
        (!parts.is_empty()).then_some(SparseRanges { ranges: parts })
    }

    /// Parts of `range` missing from the set, or `None` if fully covered.
    pub fn diff(&self, range: &DecimatedRange) -> Option<SparseRanges> {
        if range.is_empty() {
            return None;
        }
        let mut gaps = Vec::new();
        let mut cursor = range.lower;
        let start = self.ranges.partition_point(|r| r.upper <= range.lower);
        for r in self.ranges[start..].iter().take_while(|r| r.lower < range.upper) {
            if r.lower > cursor {
                gaps.push(DecimatedRange::new(cursor, r.lower));
            }
            cursor = cursor.max(r.upper);
        }
        if cursor < range.upper {
            gaps.push(DecimatedRange::new(cursor, range.upper));
        }
        (!gaps.is_empty()).then_some(SparseRanges { ranges: gaps })
    }
}

impl<'a> IntoIterator for &'a SparseRanges {
    type Item = &'a DecimatedRange;
    type IntoIter = std::slice::Iter<'a, DecimatedRange>;

    fn into_iter(self) -> Self::IntoIter {
        self.ranges.iter()
    }
}
