pub mod decimator;
pub mod reader;
pub mod task;

pub use decimator::{decimate, SampleDecimator};
pub use reader::{ChunkedPcmReader, ReadEnd, ReadSummary};
pub use task::{ChunkCallback, CompletionCallback, DecimationTask, TaskHandle, TaskOutcome, TaskState};

use crate::audio::{TimeRange, TrackInfo};
use crate::cache::DecimatedRange;

/// Decimated indices at `rate` covering `range`, clamped to the track.
pub fn to_decimated(track: &TrackInfo, range: &TimeRange, rate: usize) -> DecimatedRange {
    if rate == 0 {
        return DecimatedRange::default();
    }
    let range = range.clamp_to(track.duration);
    let start = range.start_frame(track.sample_rate);
    let end = start + range.frame_count(track.sample_rate);
    let limit = track.decimated_len(rate);
    DecimatedRange::new(
        (start as usize / rate).min(limit),
        (end as usize).div_ceil(rate).min(limit),
    )
}

/// Time span of decimated indices at `rate`, clamped to the track.
pub fn to_time(track: &TrackInfo, range: &DecimatedRange, rate: usize) -> TimeRange {
    let sr = track.sample_rate as f64;
    TimeRange::new(
        range.lower as f64 * rate as f64 / sr,
        range.upper as f64 * rate as f64 / sr,
    )
    .clamp_to(track.duration)
}
