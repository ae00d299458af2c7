//! Incremental, cancelable waveform decimation for audio tracks.
//!
//! Interleaved 16-bit PCM is turned into clipped log-scale amplitude values,
//! one per block of frames, at any number of resolutions. A
//! [`MultiResolutionCoordinator`] loads a track once at its finest rate and
//! derives the coarser ones; an [`AdhocDownsampler`] serves bounded ranges on
//! demand.

pub mod audio;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod decimate;
pub mod error;

pub use audio::{AudioSource, SymphoniaSource, TimeRange, TrackInfo};
pub use cache::{CacheStore, DecimatedRange, DirCacheStore, RangeCache, SparseRanges};
pub use coordinator::{
    AdhocDownsampler, LoadStatus, LoaderOptions, MultiResolutionCoordinator, RequestOutcome, ResolutionToken,
};
pub use decimate::{ChunkedPcmReader, DecimationTask, SampleDecimator, TaskOutcome};
pub use error::{Result, WaveError};
