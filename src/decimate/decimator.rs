use rayon::prelude::*;

/// Full-scale reference for 16-bit PCM.
const FULL_SCALE: f32 = 32768.0;

/// Blocks with at least this many units are decimated on the rayon pool.
const PARALLEL_MIN_UNITS: usize = 32;

/// Usable clipping floor: never above 0 dB.
#[inline]
fn sane_floor(floor: f32) -> f32 {
    if floor.is_nan() {
        return 0.0;
    }
    floor.min(0.0)
}

/// Clipped decibel level of one sample relative to full scale.
#[inline]
pub fn sample_db(sample: i16, floor: f32) -> f32 {
    let floor = sane_floor(floor);
    let magnitude = (sample as f32).abs();
    if magnitude == 0.0 {
        return floor;
    }
    (20.0 * (magnitude / FULL_SCALE).log10()).clamp(floor, 0.0)
}

/// Mean clipped level of one unit. Empty units yield the floor.
fn unit_level(unit: &[i16], floor: f32) -> f32 {
    let floor = sane_floor(floor);
    if unit.is_empty() {
        return floor;
    }
    let sum: f32 = unit.iter().map(|&s| sample_db(s, floor)).sum();
    (sum / unit.len() as f32).clamp(floor, 0.0)
}

/// One averaged level per `unit_size` samples; a shorter tail still yields
/// one value, averaged over its own length.
pub fn decimate(samples: &[i16], unit_size: usize, floor: f32) -> Vec<f32> {
    if unit_size == 0 || samples.is_empty() {
        return Vec::new();
    }
    if samples.len() / unit_size >= PARALLEL_MIN_UNITS {
        samples
            .par_chunks(unit_size)
            .map(|unit| unit_level(unit, floor))
            .collect()
    } else {
        samples
            .chunks(unit_size)
            .map(|unit| unit_level(unit, floor))
            .collect()
    }
}

/// Stateful decimator carrying the running ceiling across blocks.
#[derive(Clone, Debug)]
pub struct SampleDecimator {
    unit_size: usize,
    floor: f32,
    decibel_max: f32,
}

impl SampleDecimator {
    /// `unit_size` is `channels * downsample_rate` samples.
    /// A floor above 0 dB is lowered to 0.
    pub fn new(unit_size: usize, floor: f32, decibel_max: f32) -> Self {
        let floor = sane_floor(floor);
        let decibel_max = if decibel_max.is_nan() { floor } else { decibel_max };
        Self {
            unit_size,
            floor,
            decibel_max: decibel_max.clamp(floor, 0.0),
        }
    }

    pub fn unit_size(&self) -> usize {
        self.unit_size
    }

    pub fn floor(&self) -> f32 {
        self.floor
    }

    pub fn decibel_max(&self) -> f32 {
        self.decibel_max
    }

    /// Decimate a block and raise the ceiling over the produced values.
    pub fn process(&mut self, samples: &[i16]) -> Vec<f32> {
        let values = decimate(samples, self.unit_size, self.floor);
        for &v in &values {
            if v > self.decibel_max {
                self.decibel_max = v;
            }
        }
        values
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silence_sits_on_floor() {
        assert_eq!(decimate(&[0; 8], 4, -50.0), vec![-50.0, -50.0]);
    }

    #[test]
    fn full_scale_is_zero_db() {
        let v = decimate(&[i16::MIN, i16::MIN, i16::MIN, i16::MIN], 2, -50.0);
        assert_eq!(v, vec![0.0, 0.0]);
        // 32767 is just under full scale
        let v = decimate(&[i16::MAX, -i16::MAX], 2, -50.0);
        assert!(v[0] < 0.0 && v[0] > -0.001);
    }

    #[test]
    fn averages_clipped_levels() {
        // half scale is about -6.02 dB, silence clips to the floor
        let half = 16384i16;
        let v = decimate(&[half, 0], 2, -50.0);
        let expected = (20.0 * 0.5f32.log10() + -50.0) / 2.0;
        assert!((v[0] - expected).abs() < 1e-4);
    }

    #[test]
    fn quiet_samples_clip_to_floor() {
        // 1/32768 is about -90 dB
        assert_eq!(sample_db(1, -50.0), -50.0);
        assert_eq!(sample_db(-1, -80.0), -80.0);
    }

    #[test]
    fn tail_unit_yields_one_value() {
        let samples = vec![16384i16; 10];
        let v = decimate(&samples, 4, -50.0);
        assert_eq!(v.len(), 3);
        assert!((v[2] - v[0]).abs() < 1e-6);
    }

    #[test]
    fn count_matches_ceil_of_units() {
        for (len, unit) in [(1000, 7), (4096, 64), (100, 100), (101, 100)] {
            let samples = vec![1000i16; len];
            assert_eq!(decimate(&samples, unit, -50.0).len(), len.div_ceil(unit));
        }
    }

    #[test]
    fn parallel_and_sequential_paths_agree() {
        let samples: Vec<i16> = (0..64 * 100).map(|i| ((i * 37) % 30000) as i16).collect();
        let parallel = decimate(&samples, 64, -50.0);
        let sequential: Vec<f32> = samples.chunks(64).map(|u| unit_level(u, -50.0)).collect();
        assert_eq!(parallel, sequential);
    }

    #[test]
    fn positive_floor_is_lowered_to_zero() {
        assert_eq!(sample_db(100, 6.0), 0.0);
        assert_eq!(decimate(&[0, 16384], 2, 3.0), vec![0.0]);
        let mut d = SampleDecimator::new(2, 10.0, 20.0);
        assert_eq!(d.floor(), 0.0);
        assert_eq!(d.process(&[8000, 8000]), vec![0.0]);
        assert_eq!(d.decibel_max(), 0.0);
    }

    #[test]
    fn ceiling_never_drops() {
        let mut d = SampleDecimator::new(2, -50.0, -50.0);
        d.process(&[8000, 8000]);
        let first = d.decibel_max();
        assert!(first > -50.0);
        d.process(&[10, 10]);
        assert_eq!(d.decibel_max(), first);
        d.process(&[30000, 30000]);
        assert!(d.decibel_max() > first);
        assert!(d.decibel_max() <= 0.0);
    }
}
