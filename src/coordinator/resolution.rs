use std::collections::BTreeMap;

use crate::cache::DecimatedRange;

/// Receives `(range, values)` as a resolution fills in.
pub type Subscriber = Box<dyn FnMut(DecimatedRange, &[f32])>;

/// Identifies one registration with the coordinator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResolutionToken {
    pub rate: usize,
    pub id: u64,
}

/// Decimated values for one rate and the subscribers interested in them.
pub struct ResolutionHandler {
    rate: usize,
    floor: f32,
    values: Vec<f32>,
    next_pos: usize,
    /// End of the primary window consumed so far.
    ref_upper: usize,
    subscribers: BTreeMap<u64, Subscriber>,
}

impl ResolutionHandler {
    pub fn new(rate: usize, len: usize, floor: f32) -> Self {
        Self {
            rate,
            floor,
            values: vec![floor; len],
            next_pos: 0,
            ref_upper: 0,
            subscribers: BTreeMap::new(),
        }
    }

    pub fn rate(&self) -> usize {
        self.rate
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Values `[0, next_pos)` are final.
    pub fn next_pos(&self) -> usize {
        self.next_pos
    }

    pub fn is_complete(&self) -> bool {
        self.next_pos >= self.values.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub(crate) fn subscribe(&mut self, id: u64, mut subscriber: Subscriber) {
        if self.next_pos > 0 {
            subscriber(DecimatedRange::new(0, self.next_pos), &self.values[..self.next_pos]);
        }
        self.subscribers.insert(id, subscriber);
    }

    pub(crate) fn unsubscribe(&mut self, id: u64) -> bool {
        self.subscribers.remove(&id).is_some()
    }

    /// Back to an empty array of `len` floor values.
    pub(crate) fn reset(&mut self, len: usize) {
        self.values.clear();
        self.values.resize(len, self.floor);
        self.next_pos = 0;
        self.ref_upper = 0;
    }

    /// Drop slots past the cursor once the true length is known.
    pub(crate) fn finish(&mut self) {
        self.values.truncate(self.next_pos);
    }

    /// Write a chunk read straight from the audio, advancing the cursor.
    pub(crate) fn store(&mut self, range: DecimatedRange, values: &[f32]) -> DecimatedRange {
        let upper = range.lower + values.len();
        if upper > self.values.len() {
            self.values.resize(upper, self.floor);
        }
        self.values[range.lower..upper].copy_from_slice(values);
        self.next_pos = self.next_pos.max(upper);
        DecimatedRange::new(range.lower, upper)
    }

    /// Average as many values as `primary` now allows.
    ///
    /// `available` is how much of `primary` is final. Each value covers the
    /// primary window from the end of the previous one up to
    /// `ceil((next_pos + 1) * rate / primary_rate)`. Until `last` is set a
    /// value is only produced once its whole window is available; after that
    /// a short trailing window is averaged as is.
    pub(crate) fn derive_from(
        &mut self,
        primary: &[f32],
        primary_rate: usize,
        available: usize,
        last: bool,
    ) -> Option<DecimatedRange> {
        if primary_rate == 0 {
            return None;
        }
        let available = available.min(primary.len());
        let start = self.next_pos;

        while self.next_pos < self.values.len() {
            let mut upper = ((self.next_pos + 1) * self.rate)
                .div_ceil(primary_rate)
                .min(primary.len());
            if upper > available {
                if !last {
                    break;
                }
                upper = available;
            }
            let lower = self.ref_upper;
            if lower >= upper {
                break;
            }
            let window = &primary[lower..upper];
            self.values[self.next_pos] = window.iter().sum::<f32>() / window.len() as f32;
            self.next_pos += 1;
            self.ref_upper = upper;
        }

        (self.next_pos > start).then(|| DecimatedRange::new(start, self.next_pos))
    }

    pub(crate) fn notify(&mut self, range: DecimatedRange) {
        if range.is_empty() || range.upper > self.values.len() {
            return;
        }
        let slice = &self.values[range.as_range()];
        for subscriber in self.subscribers.values_mut() {
            subscriber(range, slice);
        }
    }
}

impl std::fmt::Debug for ResolutionHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolutionHandler")
            .field("rate", &self.rate)
            .field("len", &self.values.len())
            .field("next_pos", &self.next_pos)
            .field("ref_upper", &self.ref_upper)
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn primary(n: usize) -> Vec<f32> {
        (0..n).map(|i| -(i as f32)).collect()
    }

    #[test]
    fn exact_multiple_averages_k_values() {
        let p = primary(100);
        let mut h = ResolutionHandler::new(40, 25, -50.0);
        let range = h.derive_from(&p, 10, 100, false).unwrap();
        assert_eq!(range, DecimatedRange::new(0, 25));
        for (i, v) in h.values().iter().enumerate() {
            let expected = p[i * 4..i * 4 + 4].iter().sum::<f32>() / 4.0;
            assert!((v - expected).abs() < 1e-5);
        }
    }

    #[test]
    fn waits_for_full_window_until_last() {
        let p = primary(10);
        let mut h = ResolutionHandler::new(4, 3, -50.0);
        assert_eq!(h.derive_from(&p, 1, 3, false), None);
        assert_eq!(h.derive_from(&p, 1, 9, false), Some(DecimatedRange::new(0, 2)));
        assert_eq!(h.next_pos(), 2);
        // trailing window [8, 10) is short but allowed once the primary is done
        assert_eq!(h.derive_from(&p, 1, 10, true), Some(DecimatedRange::new(2, 3)));
        assert!((h.values()[2] - (-8.5)).abs() < 1e-6);
        assert!(h.is_complete());
    }

    #[test]
    fn uneven_ratio_windows_are_contiguous() {
        // rate 3 over primary rate 2: windows end at ceil(3/2)=2, ceil(6/2)=3, ceil(9/2)=5...
        let p = primary(9);
        let mut h = ResolutionHandler::new(3, 6, -50.0);
        h.derive_from(&p, 2, 9, true);
        assert_eq!(h.next_pos(), 6);
        assert!((h.values()[0] - (-0.5)).abs() < 1e-6);
        assert!((h.values()[1] - (-2.0)).abs() < 1e-6);
        assert!((h.values()[2] - (-3.5)).abs() < 1e-6);
    }

    #[test]
    fn store_grows_and_advances() {
        let mut h = ResolutionHandler::new(10, 2, -50.0);
        h.store(DecimatedRange::new(0, 2), &[-1.0, -2.0]);
        h.store(DecimatedRange::new(2, 4), &[-3.0, -4.0]);
        assert_eq!(h.values(), &[-1.0, -2.0, -3.0, -4.0]);
        assert_eq!(h.next_pos(), 4);
        h.reset(3);
        assert_eq!(h.values(), &[-50.0; 3]);
        assert_eq!(h.next_pos(), 0);
    }

    #[test]
    fn late_subscriber_gets_existing_values() {
        let mut h = ResolutionHandler::new(10, 4, -50.0);
        h.store(DecimatedRange::new(0, 2), &[-1.0, -2.0]);
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        h.subscribe(7, Box::new(move |r, v| sink.borrow_mut().push((r, v.to_vec()))));
        let r = h.store(DecimatedRange::new(2, 3), &[-3.0]);
        h.notify(r);
        assert_eq!(
            *seen.borrow(),
            vec![
                (DecimatedRange::new(0, 2), vec![-1.0, -2.0]),
                (DecimatedRange::new(2, 3), vec![-3.0]),
            ]
        );
        assert!(h.unsubscribe(7));
        assert!(!h.unsubscribe(7));
    }
}
