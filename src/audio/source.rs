use crate::error::Result;

/// Bytes per 16-bit PCM sample.
pub const BYTES_PER_SAMPLE: usize = 2;

/// Slack for seconds-to-frames conversions, so a duration derived from a
/// frame count maps back to the same count.
const FRAME_EPSILON: f64 = 1e-6;

/// An opened track, as reported by an [`AudioSource`].
///
/// Immutable once opened. Tasks hold it behind an `Arc` for the duration of a
/// read.
#[derive(Clone, Debug, PartialEq)]
pub struct TrackInfo {
    pub id: String,
    pub sample_rate: u32,
    pub channels: u16,
    /// Frames per channel.
    pub total_samples: u64,
    /// Seconds.
    pub duration: f64,
    /// Identity hash used to key persisted waveforms.
    pub fingerprint: u64,
}

impl TrackInfo {
    /// Number of decimated values a full-track run at `rate` produces.
    pub fn decimated_len(&self, rate: usize) -> usize {
        if rate == 0 {
            return 0;
        }
        (self.total_samples as usize).div_ceil(rate)
    }

    pub fn full_range(&self) -> TimeRange {
        TimeRange::new(0.0, self.duration)
    }
}

/// Half-open time interval in seconds.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TimeRange {
    pub start: f64,
    pub end: f64,
}

impl TimeRange {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn duration(&self) -> f64 {
        (self.end - self.start).max(0.0)
    }

    pub fn is_empty(&self) -> bool {
        self.duration() <= 0.0
    }

    /// Clamp into `[0, limit]`. Non-finite bounds give an empty range.
    pub fn clamp_to(&self, limit: f64) -> TimeRange {
        if !self.start.is_finite() || !self.end.is_finite() || !limit.is_finite() {
            return TimeRange { start: 0.0, end: 0.0 };
        }
        let limit = limit.max(0.0);
        let start = self.start.clamp(0.0, limit);
        let end = self.end.clamp(start, limit);
        TimeRange { start, end }
    }

    pub fn start_frame(&self, sample_rate: u32) -> u64 {
        (self.start * sample_rate as f64).round() as u64
    }

    /// Frames covered by the range, rounded up.
    pub fn frame_count(&self, sample_rate: u32) -> u64 {
        (self.duration() * sample_rate as f64 - FRAME_EPSILON).ceil().max(0.0) as u64
    }
}

/// Lazy, finite stream of interleaved 16-bit PCM bytes.
///
/// Chunk sizes are whatever the decoder yields. An `Err` item ends the
/// session; it cannot be resumed.
pub type PcmChunks = Box<dyn Iterator<Item = Result<Vec<u8>>> + Send>;

/// The collaborator that opens tracks and produces raw PCM for a time range.
pub trait AudioSource: Send + Sync + 'static {
    fn open(&self, id: &str) -> Result<TrackInfo>;

    /// Start a new reading session constrained to `range`. Each call opens an
    /// independent session.
    fn read_pcm(&self, track: &TrackInfo, range: TimeRange) -> Result<PcmChunks>;
}
