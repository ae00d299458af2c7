use super::range::{DecimatedRange, SparseRanges};

/// Decimated values for one rate, plus the record of which indices are final.
///
/// Storage grows on demand; slots that were never written hold the floor.
#[derive(Clone, Debug)]
pub struct RangeCache {
    handled: SparseRanges,
    values: Vec<f32>,
    floor: f32,
}

impl RangeCache {
    pub fn new(floor: f32) -> Self {
        Self {
            handled: SparseRanges::new(),
            values: Vec::new(),
            floor,
        }
    }

    pub fn with_capacity(floor: f32, len: usize) -> Self {
        Self {
            handled: SparseRanges::new(),
            values: vec![floor; len],
            floor,
        }
    }

    pub fn add(&mut self, range: DecimatedRange) {
        self.handled.add(range);
    }

    pub fn intersect(&self, range: &DecimatedRange) -> Option<SparseRanges> {
        self.handled.intersect(range)
    }

    pub fn diff(&self, range: &DecimatedRange) -> Option<SparseRanges> {
        self.handled.diff(range)
    }

    pub fn contains(&self, range: &DecimatedRange) -> bool {
        self.handled.contains(range)
    }

    pub fn handled(&self) -> &SparseRanges {
        &self.handled
    }

    /// Forget every handled range. Stored values are left in place but are no
    /// longer considered final.
    pub fn remove_all(&mut self) {
        self.handled.clear();
    }

    /// Write `values` at `range.lower`, growing storage if needed.
    pub fn store(&mut self, range: DecimatedRange, values: &[f32]) {
        let upper = range.lower + values.len();
        if upper > self.values.len() {
            self.values.resize(upper, self.floor);
        }
        self.values[range.lower..upper].copy_from_slice(values);
    }

    /// Store and mark handled in one step.
    pub fn insert(&mut self, range: DecimatedRange, values: &[f32]) {
        self.store(range, values);
        self.add(DecimatedRange::new(range.lower, range.lower + values.len()));
    }

    /// Trim storage (and handled ranges) to the true final length.
    pub fn truncate(&mut self, len: usize) {
        if len < self.values.len() {
            self.values.truncate(len);
            self.handled.remove(DecimatedRange::new(len, usize::MAX));
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn all_values(&self) -> &[f32] {
        &self.values
    }

    /// The slice for `range`, only if every index in it is handled.
    pub fn values(&self, range: &DecimatedRange) -> Option<&[f32]> {
        if range.upper > self.values.len() || !self.handled.contains(range) {
            return None;
        }
        Some(&self.values[range.as_range()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_grows_with_floor() {
        let mut cache = RangeCache::new(-50.0);
        cache.store(DecimatedRange::new(4, 6), &[-1.0, -2.0]);
        assert_eq!(cache.all_values(), &[-50.0, -50.0, -50.0, -50.0, -1.0, -2.0]);
        assert!(cache.handled().is_empty());
    }

    #[test]
    fn values_require_handled_range() {
        let mut cache = RangeCache::new(-50.0);
        cache.insert(DecimatedRange::new(0, 3), &[-3.0, -4.0, -5.0]);
        assert_eq!(cache.values(&DecimatedRange::new(1, 3)), Some(&[-4.0, -5.0][..]));
        cache.store(DecimatedRange::new(3, 4), &[-6.0]);
        assert!(cache.values(&DecimatedRange::new(0, 4)).is_none());
    }

    #[test]
    fn diff_and_intersect_follow_handled_set() {
        let mut cache = RangeCache::with_capacity(-50.0, 100);
        cache.add(DecimatedRange::new(10, 20));
        cache.add(DecimatedRange::new(30, 40));
        let query = DecimatedRange::new(0, 50);
        let gaps = cache.diff(&query).unwrap();
        assert_eq!(gaps.len(), 3);
        let hits = cache.intersect(&query).unwrap();
        assert_eq!(hits.covered(), 20);
        cache.remove_all();
        assert!(cache.intersect(&query).is_none());
        assert_eq!(cache.len(), 100);
    }

    #[test]
    fn truncate_drops_overallocation() {
        let mut cache = RangeCache::with_capacity(-50.0, 10);
        cache.insert(DecimatedRange::new(0, 10), &[-1.0; 10]);
        cache.truncate(7);
        assert_eq!(cache.len(), 7);
        assert!(cache.contains(&DecimatedRange::new(0, 7)));
        assert!(!cache.contains(&DecimatedRange::new(0, 8)));
        cache.truncate(20);
        assert_eq!(cache.len(), 7);
    }
}
